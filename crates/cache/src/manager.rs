//! Frame cache façade
//!
//! [`CacheManager`] combines the segment pool and the directory into the
//! interface the renderer sees: `get`, `add` and the clear operations. It owns
//! two tiers of entries:
//!
//! - the in-memory portion, bounded by the capacity budget and evicted LRU;
//! - dormant entries, whose bytes are on disk but which do not count toward the
//!   capacity. Entries restored from the table of contents and entries moved out
//!   by [`CacheManager::clear_in_memory_portion`] live here until a `get`
//!   promotes them.
//!
//! Every failure on the read path is reported as a miss; the caller re-renders.

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fs;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::CacheConfig;
use crate::entry::CacheEntry;
use crate::error::{CacheError, CacheResult, ProducerError};
use crate::fingerprint::{params_digest, Fingerprint};
use crate::index::{CacheIndex, Lookup};
use crate::params::{FrameKey, ValidationParams};
use crate::segment::{FrameBytes, RangeWriter, SegmentStore};
use crate::stats::{CacheStats, Counters};
use crate::toc::TableOfContents;

/// Something that can render a frame into a byte range.
pub trait FrameProducer {
    /// Fills `target` for `params` and returns the number of bytes written.
    ///
    /// Anything other than `target.len()` is treated as a failed write.
    fn fill(&mut self, params: &ValidationParams, target: &mut [u8]) -> Result<usize, ProducerError>;
}

impl<F> FrameProducer for F
where
    F: FnMut(&ValidationParams, &mut [u8]) -> Result<usize, ProducerError>,
{
    fn fill(&mut self, params: &ValidationParams, target: &mut [u8]) -> Result<usize, ProducerError> {
        self(params, target)
    }
}

/// A cache hit: the entry plus a pin on its bytes.
///
/// The bytes stay valid for as long as this value lives, even if the entry is
/// evicted meanwhile.
#[derive(Debug, Clone)]
pub struct CachedFrame {
    entry: CacheEntry,
    bytes: FrameBytes,
}

impl CachedFrame {
    pub fn entry(&self) -> &CacheEntry {
        &self.entry
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.entry.fingerprint
    }

    pub fn params(&self) -> &ValidationParams {
        &self.entry.params
    }

    pub fn pixels(&self) -> &[u8] {
        self.bytes.as_slice()
    }
}

impl Deref for CachedFrame {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.pixels()
    }
}

/// Marker for a build in progress
#[derive(Default)]
struct InFlight {
    done: Mutex<bool>,
    cond: Condvar,
    waiters: AtomicUsize,
}

impl InFlight {
    fn wait(&self) {
        self.waiters.fetch_add(1, Ordering::SeqCst);
        let mut done = self.done.lock();
        while !*done {
            self.cond.wait(&mut done);
        }
        drop(done);
        self.waiters.fetch_sub(1, Ordering::SeqCst);
    }

    fn finish(&self) {
        *self.done.lock() = true;
        self.cond.notify_all();
    }
}

/// Clears the in-flight marker however the build ends
struct BuildGuard<'a> {
    in_flight: &'a Mutex<HashMap<Fingerprint, Arc<InFlight>>>,
    fingerprint: Fingerprint,
    flight: Arc<InFlight>,
}

impl Drop for BuildGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.fingerprint);
        self.flight.finish();
    }
}

/// Frame cache instance. Construct one per cache and share it by reference.
pub struct CacheManager {
    config: CacheConfig,
    capacity: AtomicUsize,
    store: SegmentStore,
    live: CacheIndex,
    dormant: CacheIndex,
    in_flight: Mutex<HashMap<Fingerprint, Arc<InFlight>>>,
    counters: Counters,
    closed: bool,
}

impl CacheManager {
    /// Opens the cache described by `config`.
    ///
    /// Existing segments and the table of contents are recovered; anything
    /// unreadable or written by another version is dropped and the cache starts
    /// colder. Only an invalid configuration or a cache directory that cannot be
    /// created is an error.
    pub fn open(config: CacheConfig) -> CacheResult<Self> {
        config.validate()?;
        let store = SegmentStore::new(&config)?;

        let manager = Self {
            capacity: AtomicUsize::new(config.capacity_bytes),
            config,
            store,
            live: CacheIndex::new(),
            dormant: CacheIndex::new(),
            in_flight: Mutex::new(HashMap::new()),
            counters: Counters::default(),
            closed: false,
        };
        manager.restore();
        Ok(manager)
    }

    fn restore(&self) {
        let recovered = match self.store.recover_from_disk() {
            Ok(ids) => ids,
            Err(e) => {
                tracing::warn!(error = %e, "segment recovery failed, starting cold");
                Vec::new()
            }
        };

        let toc_path = self.config.toc_path();
        let entries = match TableOfContents::load(&toc_path, &self.config) {
            Ok(Some(entries)) => entries,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(error = %e, "discarding table of contents");
                if let Err(e) = fs::remove_file(&toc_path) {
                    tracing::warn!(error = %e, "failed to remove table of contents");
                }
                return;
            }
        };

        let total = entries.len();
        let mut restored = 0;
        for entry in entries {
            if !recovered.contains(&entry.backing.segment) {
                continue;
            }
            match self
                .store
                .claim(&entry.backing, entry.fingerprint, params_digest(&entry.params))
            {
                Ok(handle) => {
                    let entry = CacheEntry::new(entry.fingerprint, entry.params, handle);
                    if let Some(old) = self.dormant.insert(entry) {
                        self.store.release(&old.backing);
                    }
                    restored += 1;
                }
                Err(e) => {
                    tracing::debug!(fingerprint = entry.fingerprint, error = %e, "dropping entry");
                }
            }
        }
        tracing::debug!(restored, dropped = total - restored, "restored table of contents");
    }

    /// Looks up a frame.
    ///
    /// Returns `None` when the fingerprint is unknown, when the stored render
    /// state differs from `params`, or when the bytes are no longer available.
    pub fn get(&self, fingerprint: Fingerprint, params: &ValidationParams) -> Option<CachedFrame> {
        let entry = match self.live.lookup(fingerprint, params) {
            Lookup::Hit(entry) => Some(entry),
            Lookup::Mismatch => {
                Counters::bump(&self.counters.mismatches);
                None
            }
            Lookup::Absent => self.promote(fingerprint, params),
        };

        let frame = entry.and_then(|entry| match self.store.map(&entry.backing) {
            Ok(bytes) => Some(CachedFrame { entry, bytes }),
            Err(e) => {
                tracing::debug!(fingerprint, error = %e, "cached bytes unavailable");
                None
            }
        });

        match frame {
            Some(_) => Counters::bump(&self.counters.hits),
            None => Counters::bump(&self.counters.misses),
        }
        frame
    }

    /// Looks up a viewer frame by its full key
    pub fn get_frame(&self, key: &FrameKey) -> Option<CachedFrame> {
        self.get(key.fingerprint(), &key.params)
    }

    /// Moves a matching dormant entry into the in-memory portion
    fn promote(&self, fingerprint: Fingerprint, params: &ValidationParams) -> Option<CacheEntry> {
        let entry = match self.dormant.lookup(fingerprint, params) {
            Lookup::Hit(entry) => entry,
            Lookup::Mismatch => {
                Counters::bump(&self.counters.mismatches);
                return None;
            }
            Lookup::Absent => return None,
        };
        if !self.dormant.remove_exact(&entry) {
            return None;
        }

        let size = entry.size_bytes();
        if size > self.capacity_bytes() {
            self.store.release(&entry.backing);
            return None;
        }
        if !self.live.contains(fingerprint) {
            self.make_room(fingerprint, size);
        }
        if !self.live.insert_if_absent(entry) {
            // Rebuilt meanwhile; the fresher copy wins.
            self.store.release(&entry.backing);
            return self.live.lookup(fingerprint, params).hit();
        }
        self.enforce_capacity();
        Some(entry)
    }

    /// Renders and stores a frame.
    ///
    /// The producer receives exactly `size` bytes of mapped storage. If it fails
    /// or reports a short write the range is freed and nothing is inserted. An
    /// existing entry under the same fingerprint is replaced.
    ///
    /// Concurrent calls for the same fingerprint are serialized: later callers
    /// wait for the running build and reuse its result when their parameters
    /// match, without invoking their own producer.
    pub fn add<P>(
        &self,
        fingerprint: Fingerprint,
        params: ValidationParams,
        size: usize,
        producer: &mut P,
    ) -> CacheResult<CachedFrame>
    where
        P: FrameProducer + ?Sized,
    {
        let capacity = self.capacity_bytes();
        if size > capacity {
            return Err(CacheError::EntryTooLarge { size, capacity });
        }
        if !self.store.fits_quota(size) {
            return Err(CacheError::OutOfDiskSpace {
                requested: size,
                quota: self.store.disk_quota(),
            });
        }

        let _guard = loop {
            let mut flights = self.in_flight.lock();
            if let Some(flight) = flights.get(&fingerprint).cloned() {
                drop(flights);
                flight.wait();
                if let Some(frame) = self.get(fingerprint, &params) {
                    return Ok(frame);
                }
                continue;
            }
            let flight = Arc::new(InFlight::default());
            flights.insert(fingerprint, flight.clone());
            break BuildGuard {
                in_flight: &self.in_flight,
                fingerprint,
                flight,
            };
        };

        self.make_room(fingerprint, size);
        let mut writer = self.allocate(size, fingerprint, params_digest(&params))?;

        let written = producer
            .fill(&params, writer.as_mut_slice())
            .map_err(CacheError::Producer)?;
        if written != size {
            return Err(CacheError::IncompleteWrite {
                expected: size,
                written,
            });
        }

        let bytes = writer.commit()?;
        let entry = CacheEntry::new(fingerprint, params, bytes.handle());

        if let Some(stale) = self.dormant.remove(fingerprint) {
            self.store.release(&stale.backing);
        }
        if let Some(old) = self.live.insert(entry) {
            self.store.release(&old.backing);
        }
        Counters::bump(&self.counters.insertions);
        self.enforce_capacity();

        Ok(CachedFrame { entry, bytes })
    }

    /// [`CacheManager::add`] with a closure as producer
    pub fn add_with<F>(
        &self,
        fingerprint: Fingerprint,
        params: ValidationParams,
        size: usize,
        mut fill: F,
    ) -> CacheResult<CachedFrame>
    where
        F: FnMut(&ValidationParams, &mut [u8]) -> Result<usize, ProducerError>,
    {
        self.add(fingerprint, params, size, &mut fill)
    }

    /// Renders and stores a viewer frame sized for its ROI and channels
    pub fn add_frame<P>(&self, key: &FrameKey, producer: &mut P) -> CacheResult<CachedFrame>
    where
        P: FrameProducer + ?Sized,
    {
        let roi = key.params.roi;
        let size = key.params.buffer_size().ok_or(CacheError::RegionTooLarge {
            width: roi.width(),
            height: roi.height(),
        })?;
        self.add(key.fingerprint(), key.params, size, producer)
    }

    /// Allocates storage, giving up dormant and then live entries while the disk
    /// quota is exhausted
    fn allocate(&self, size: usize, fingerprint: Fingerprint, digest: u64) -> CacheResult<RangeWriter<'_>> {
        loop {
            match self.store.allocate(size, fingerprint, digest) {
                Err(e @ CacheError::OutOfDiskSpace { .. }) => {
                    if let Some(old) = self.dormant.pop_lru() {
                        self.store.release(&old.backing);
                    } else if let Some(old) = self.live.pop_lru() {
                        self.store.release(&old.backing);
                        Counters::bump(&self.counters.evictions);
                    } else {
                        return Err(e);
                    }
                }
                result => return result,
            }
        }
    }

    /// Evicts so that `size` more bytes fit, counting a replaced entry as freed
    fn make_room(&self, fingerprint: Fingerprint, size: usize) {
        let replaced = self.live.peek(fingerprint).map_or(0, |e| e.size_bytes());
        let target = self.capacity_bytes().saturating_add(replaced).saturating_sub(size);
        self.evict_to(target);
    }

    fn enforce_capacity(&self) {
        self.evict_to(self.capacity_bytes());
    }

    fn evict_to(&self, target: usize) {
        let evicted = self.live.evict_until(target, |e| self.store.release(&e.backing));
        if !evicted.is_empty() {
            Counters::add(&self.counters.evictions, evicted.len());
            tracing::debug!(count = evicted.len(), target, "evicted frames");
        }
    }

    /// Moves every in-memory entry to the dormant tier and persists the
    /// table of contents. The bytes stay on disk and can be promoted again.
    pub fn clear_in_memory_portion(&self) {
        for entry in self.live.snapshot_lru_order() {
            if self.live.remove_exact(&entry) {
                if let Some(old) = self.dormant.insert(entry) {
                    self.store.release(&old.backing);
                }
            }
        }
        if let Err(e) = self.save_table_of_contents() {
            tracing::warn!(error = %e, "failed to save table of contents");
        }
    }

    /// Drops every entry in both tiers and releases all storage
    pub fn clear_all(&self) {
        let released =
            self.live.remove_all(|e| self.store.release(&e.backing))
                + self.dormant.remove_all(|e| self.store.release(&e.backing));
        tracing::debug!(released, "cleared frame cache");

        if let Err(e) = self.save_table_of_contents() {
            tracing::warn!(error = %e, "failed to save table of contents");
        }
    }

    /// Drops one entry from either tier
    pub fn remove(&self, fingerprint: Fingerprint) -> bool {
        let mut removed = false;
        for tier in [&self.live, &self.dormant] {
            if let Some(entry) = tier.remove(fingerprint) {
                self.store.release(&entry.backing);
                removed = true;
            }
        }
        removed
    }

    /// Drops every entry, in both tiers, for which `predicate` holds
    pub fn remove_matching<P>(&self, mut predicate: P) -> usize
    where
        P: FnMut(&CacheEntry) -> bool,
    {
        self.live
            .remove_matching(&mut predicate, |e| self.store.release(&e.backing))
            + self
                .dormant
                .remove_matching(&mut predicate, |e| self.store.release(&e.backing))
    }

    /// Drops frames rendered before the upstream graph reached `tree_version`
    pub fn invalidate_tree_versions_below(&self, tree_version: u64) -> usize {
        self.remove_matching(|e| e.params.tree_version < tree_version)
    }

    /// Sets the in-memory capacity and evicts down to it
    pub fn set_capacity_bytes(&self, bytes: usize) {
        self.capacity.store(bytes, Ordering::SeqCst);
        self.enforce_capacity();
    }

    pub fn capacity_bytes(&self) -> usize {
        self.capacity.load(Ordering::SeqCst)
    }

    /// Flushes the segments and writes the table of contents
    pub fn save_table_of_contents(&self) -> CacheResult<()> {
        self.store.flush()?;
        let mut entries = self.dormant.snapshot_lru_order();
        entries.extend(self.live.snapshot_lru_order());

        let toc = TableOfContents::new(&self.config, &entries);
        toc.save(&self.config.toc_path())?;
        tracing::debug!(entries = toc.len(), "saved table of contents");
        Ok(())
    }

    /// Persists the table of contents and closes the cache
    pub fn shutdown(mut self) -> CacheResult<()> {
        self.closed = true;
        self.save_table_of_contents()
    }

    /// True if either tier holds `fingerprint`
    pub fn contains(&self, fingerprint: Fingerprint) -> bool {
        self.live.contains(fingerprint) || self.dormant.contains(fingerprint)
    }

    /// True if `fingerprint` is in the in-memory portion
    pub fn is_resident(&self, fingerprint: Fingerprint) -> bool {
        self.live.contains(fingerprint)
    }

    /// Number of callers blocked on a build of `fingerprint`
    pub fn waiting_on(&self, fingerprint: Fingerprint) -> usize {
        self.in_flight
            .lock()
            .get(&fingerprint)
            .map_or(0, |flight| flight.waiters.load(Ordering::SeqCst))
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: Counters::load(&self.counters.hits),
            misses: Counters::load(&self.counters.misses),
            mismatches: Counters::load(&self.counters.mismatches),
            insertions: Counters::load(&self.counters.insertions),
            evictions: Counters::load(&self.counters.evictions),
            entry_count: self.live.len(),
            dormant_count: self.dormant.len(),
            bytes_used: self.live.bytes_used(),
            dormant_bytes: self.dormant.bytes_used(),
            capacity: self.capacity_bytes(),
            disk_used: self.store.disk_used(),
            disk_quota: self.store.disk_quota(),
        }
    }
}

impl Drop for CacheManager {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = self.save_table_of_contents() {
            tracing::warn!(error = %e, "failed to save table of contents on drop");
        }
    }
}
