//! Memory-mapped segment pool
//!
//! Pixel bytes live in segment files under the cache directory, each mapped
//! read-write for the lifetime of the store. A segment's data area is carved
//! into ranges; every range starts with a small record header carrying a state
//! flag, so a range whose producer never finished is never mistaken for a
//! complete frame after a restart.
//!
//! Segment file layout:
//!
//! ```text
//! [0..8)    magic "FRMCACHE"
//! [8..48)   "<cache name>-<version>" zero padded
//! [48..56)  segment id (u64 LE)
//! [56..64)  data capacity (u64 LE)
//! [64..)    data area
//! ```
//!
//! Record header at the start of each range (32 bytes, LE): magic, state,
//! fingerprint, payload length, params digest.

use memmap2::MmapMut;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, OpenOptions};
use std::io::{self, Read};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::allocator::RangeAllocator;
use crate::config::{CacheConfig, ConfigError};
use crate::entry::{SegmentHandle, SegmentId};
use crate::error::{CacheError, CacheResult};
use crate::fingerprint::Fingerprint;

pub const SEGMENT_HEADER_LEN: usize = 64;
pub const RECORD_HEADER_LEN: usize = 32;
/// Ranges start on this boundary
pub const RANGE_ALIGN: usize = 64;

const SEGMENT_MAGIC: &[u8; 8] = b"FRMCACHE";
const TAG_LEN: usize = 40;
const RECORD_MAGIC: u32 = 0x454d_5246; // "FRME"

const STATE_FREE: u32 = 0;
const STATE_WRITING: u32 = 1;
const STATE_COMPLETE: u32 = 2;

fn align_up(n: usize) -> usize {
    n.div_ceil(RANGE_ALIGN) * RANGE_ALIGN
}

/// Bytes a payload of `length` occupies in a segment
pub fn span_for(length: usize) -> usize {
    align_up(RECORD_HEADER_LEN + length)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RecordHeader {
    magic: u32,
    state: u32,
    fingerprint: u64,
    length: u64,
    digest: u64,
}

impl RecordHeader {
    fn encode(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.magic.to_le_bytes());
        out[4..8].copy_from_slice(&self.state.to_le_bytes());
        out[8..16].copy_from_slice(&self.fingerprint.to_le_bytes());
        out[16..24].copy_from_slice(&self.length.to_le_bytes());
        out[24..32].copy_from_slice(&self.digest.to_le_bytes());
    }

    fn decode(bytes: &[u8]) -> Self {
        let u32_at = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        let u64_at = |i: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&bytes[i..i + 8]);
            u64::from_le_bytes(b)
        };
        Self {
            magic: u32_at(0),
            state: u32_at(4),
            fingerprint: u64_at(8),
            length: u64_at(16),
            digest: u64_at(24),
        }
    }
}

fn encode_tag(tag: &str) -> [u8; TAG_LEN] {
    let mut out = [0u8; TAG_LEN];
    let bytes = tag.as_bytes();
    out[..bytes.len()].copy_from_slice(bytes);
    out
}

/// One mapped segment file.
struct Segment {
    id: SegmentId,
    path: PathBuf,
    capacity: usize,
    mmap: MmapMut,
    /// Start of the data area inside `mmap`
    base: *mut u8,
    alloc: Mutex<RangeAllocator>,
}

// SAFETY: `base` points into `mmap`, which lives as long as the segment. Callers
// only touch bytes of ranges they exclusively own (a writer before commit, the
// last lease on drop) or read committed ranges that are never written again
// while pinned.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    fn file_name(cache_name: &str, id: SegmentId) -> String {
        format!("{}.{:08}.seg", cache_name, id)
    }

    fn parse_file_name(cache_name: &str, file_name: &str) -> Option<SegmentId> {
        let rest = file_name.strip_prefix(cache_name)?.strip_prefix('.')?;
        let id = rest.strip_suffix(".seg")?;
        if id.len() != 8 {
            return None;
        }
        id.parse().ok()
    }

    fn create(dir: &Path, cache_name: &str, tag: &str, id: SegmentId, capacity: usize) -> io::Result<Self> {
        let path = dir.join(Self::file_name(cache_name, id));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len((SEGMENT_HEADER_LEN + capacity) as u64)?;

        // SAFETY: the file was just created by us and is only modified through this map.
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        mmap[0..8].copy_from_slice(SEGMENT_MAGIC);
        mmap[8..48].copy_from_slice(&encode_tag(tag));
        mmap[48..56].copy_from_slice(&(id as u64).to_le_bytes());
        mmap[56..64].copy_from_slice(&(capacity as u64).to_le_bytes());
        mmap.flush_range(0, SEGMENT_HEADER_LEN)?;

        Ok(Self::from_map(id, path, capacity, mmap))
    }

    /// Opens an existing segment; `Ok(None)` if the header does not match this cache
    fn open(path: &Path, tag: &str, id: SegmentId) -> io::Result<Option<Self>> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let file_len = file.metadata()?.len() as usize;
        if file_len < SEGMENT_HEADER_LEN {
            return Ok(None);
        }

        let mut header = [0u8; SEGMENT_HEADER_LEN];
        file.read_exact(&mut header)?;
        let mut word = [0u8; 8];
        word.copy_from_slice(&header[48..56]);
        let stored_id = u64::from_le_bytes(word);
        word.copy_from_slice(&header[56..64]);
        let capacity = u64::from_le_bytes(word) as usize;

        if &header[0..8] != SEGMENT_MAGIC
            || header[8..48] != encode_tag(tag)
            || stored_id != id as u64
            || capacity.checked_add(SEGMENT_HEADER_LEN) != Some(file_len)
        {
            return Ok(None);
        }

        // SAFETY: header validated above; the cache directory is owned by this process.
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Some(Self::from_map(id, path.to_path_buf(), capacity, mmap)))
    }

    fn from_map(id: SegmentId, path: PathBuf, capacity: usize, mut mmap: MmapMut) -> Self {
        // SAFETY: the map is at least SEGMENT_HEADER_LEN bytes long.
        let base = unsafe { mmap.as_mut_ptr().add(SEGMENT_HEADER_LEN) };
        Self {
            id,
            path,
            capacity,
            mmap,
            base,
            alloc: Mutex::new(RangeAllocator::new(capacity)),
        }
    }

    fn file_len(&self) -> usize {
        SEGMENT_HEADER_LEN + self.capacity
    }

    /// # Safety
    /// `offset + len` must lie in the data area and nobody may write the bytes
    /// while the slice is alive.
    unsafe fn bytes(&self, offset: usize, len: usize) -> &[u8] {
        debug_assert!(offset + len <= self.capacity);
        std::slice::from_raw_parts(self.base.add(offset), len)
    }

    /// # Safety
    /// `offset + len` must lie in the data area and the caller must own the range.
    #[allow(clippy::mut_from_ref)]
    unsafe fn bytes_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        debug_assert!(offset + len <= self.capacity);
        std::slice::from_raw_parts_mut(self.base.add(offset), len)
    }

    fn write_header(&self, offset: usize, header: &RecordHeader) {
        // SAFETY: only called by the owner of the range starting at `offset`.
        header.encode(unsafe { self.bytes_mut(offset, RECORD_HEADER_LEN) });
    }

    fn read_header(&self, offset: usize) -> RecordHeader {
        // SAFETY: the header is only read for ranges the caller reserved.
        RecordHeader::decode(unsafe { self.bytes(offset, RECORD_HEADER_LEN) })
    }

    fn set_state(&self, offset: usize, state: u32) {
        // SAFETY: as in `write_header`.
        let bytes = unsafe { self.bytes_mut(offset + 4, 4) };
        bytes.copy_from_slice(&state.to_le_bytes());
    }

    fn flush_range(&self, offset: usize, len: usize) -> io::Result<()> {
        if len == 0 {
            return Ok(());
        }
        self.mmap.flush_range(SEGMENT_HEADER_LEN + offset, len)
    }

    fn flush(&self) -> io::Result<()> {
        self.mmap.flush()
    }
}

/// Ownership of one allocated range. The range goes back to the segment's free
/// list when the last reference is dropped.
struct Lease {
    segment: Arc<Segment>,
    offset: usize,
    span: usize,
    length: usize,
    generation: u64,
    /// Set once the range is given up; a retired range also has its record
    /// header cleared so it cannot be recovered after a restart
    retired: AtomicBool,
}

impl Lease {
    fn handle(&self) -> SegmentHandle {
        SegmentHandle {
            segment: self.segment.id,
            offset: self.offset as u64,
            length: self.length as u64,
            generation: self.generation,
        }
    }

    fn payload_offset(&self) -> usize {
        self.offset + RECORD_HEADER_LEN
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.retired.load(Ordering::Acquire) {
            self.segment.set_state(self.offset, STATE_FREE);
        }
        self.segment.alloc.lock().release(self.offset, self.span);
    }
}

/// Pinned, read-only view of a committed range.
///
/// While a `FrameBytes` is alive the range cannot be reused, even if its entry
/// has already been evicted.
#[derive(Clone)]
pub struct FrameBytes {
    lease: Arc<Lease>,
}

impl FrameBytes {
    pub fn handle(&self) -> SegmentHandle {
        self.lease.handle()
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: committed ranges are immutable until the last lease drops.
        unsafe {
            self.lease
                .segment
                .bytes(self.lease.payload_offset(), self.lease.length)
        }
    }
}

impl Deref for FrameBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl std::fmt::Debug for FrameBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBytes")
            .field("handle", &self.handle())
            .finish()
    }
}

/// Exclusive writer for a freshly allocated range.
///
/// Dropping the writer without calling [`RangeWriter::commit`] frees the range
/// and clears its record header. A process that dies mid-write leaves the header
/// in the "writing" state, which recovery rejects.
pub struct RangeWriter<'a> {
    store: &'a SegmentStore,
    lease: Arc<Lease>,
    committed: bool,
}

impl RangeWriter<'_> {
    pub fn handle(&self) -> SegmentHandle {
        self.lease.handle()
    }

    /// The payload bytes, exactly the requested size
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: the lease is not yet published, so this writer is its only user.
        unsafe {
            self.lease
                .segment
                .bytes_mut(self.lease.payload_offset(), self.lease.length)
        }
    }

    /// Marks the range complete, flushes it and publishes it to readers.
    pub fn commit(mut self) -> CacheResult<FrameBytes> {
        let segment = &self.lease.segment;
        segment.flush_range(self.lease.payload_offset(), self.lease.length)?;
        segment.set_state(self.lease.offset, STATE_COMPLETE);
        segment.flush_range(self.lease.offset, RECORD_HEADER_LEN)?;

        self.committed = true;
        let handle = self.lease.handle();
        self.store
            .state
            .lock()
            .live
            .insert((handle.segment, handle.offset), self.lease.clone());

        Ok(FrameBytes {
            lease: self.lease.clone(),
        })
    }
}

impl Drop for RangeWriter<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.lease.retired.store(true, Ordering::Release);
        }
    }
}

struct StoreState {
    segments: BTreeMap<SegmentId, Arc<Segment>>,
    /// Committed ranges keyed by (segment, offset)
    live: HashMap<(SegmentId, u64), Arc<Lease>>,
    next_segment: SegmentId,
    next_generation: u64,
    disk_used: usize,
}

/// Pool of memory-mapped segment files.
pub struct SegmentStore {
    dir: PathBuf,
    cache_name: String,
    tag: String,
    segment_size: usize,
    disk_quota: usize,
    state: Mutex<StoreState>,
}

impl SegmentStore {
    /// Creates the store, creating the cache directory if needed.
    ///
    /// No existing segment is touched until [`SegmentStore::recover_from_disk`].
    pub fn new(config: &CacheConfig) -> CacheResult<Self> {
        let tag = config.version_tag();
        if tag.len() > TAG_LEN {
            return Err(ConfigError::InvalidValue("cache_name".to_string()).into());
        }
        fs::create_dir_all(&config.cache_dir)?;

        Ok(Self {
            dir: config.cache_dir.clone(),
            cache_name: config.cache_name.clone(),
            tag,
            segment_size: config.segment_size,
            disk_quota: config.disk_quota_bytes,
            state: Mutex::new(StoreState {
                segments: BTreeMap::new(),
                live: HashMap::new(),
                next_segment: 0,
                next_generation: 1,
                disk_used: 0,
            }),
        })
    }

    /// Scans the cache directory for segment files of this cache.
    ///
    /// Files whose header carries another version tag, or that are damaged, are
    /// deleted. Returns the ids of the segments now available, in ascending order.
    pub fn recover_from_disk(&self) -> CacheResult<Vec<SegmentId>> {
        let mut found: Vec<(SegmentId, PathBuf)> = Vec::new();
        for dir_entry in fs::read_dir(&self.dir)? {
            let dir_entry = dir_entry?;
            let file_name = dir_entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if let Some(id) = Segment::parse_file_name(&self.cache_name, name) {
                found.push((id, dir_entry.path()));
            }
        }
        found.sort_by_key(|(id, _)| *id);

        let mut state = self.state.lock();
        let mut recovered = Vec::new();
        for (id, path) in found {
            if state.segments.contains_key(&id) {
                recovered.push(id);
                continue;
            }
            match Segment::open(&path, &self.tag, id) {
                Ok(Some(segment)) => {
                    if state.disk_used + segment.file_len() > self.disk_quota {
                        tracing::warn!(segment = id, "segment exceeds disk quota, discarding");
                        drop(segment);
                        remove_segment_file(&path);
                        continue;
                    }
                    tracing::debug!(segment = id, capacity = segment.capacity, "recovered segment");
                    state.disk_used += segment.file_len();
                    state.next_segment = state.next_segment.max(id + 1);
                    state.segments.insert(id, Arc::new(segment));
                    recovered.push(id);
                }
                Ok(None) => {
                    tracing::warn!(path = %path.display(), "segment version mismatch, discarding");
                    remove_segment_file(&path);
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "unreadable segment, discarding");
                    remove_segment_file(&path);
                }
            }
        }

        Ok(recovered)
    }

    /// Allocates a range for `size` payload bytes and returns its writer.
    ///
    /// Fails with [`CacheError::OutOfDiskSpace`] when no segment has room and a
    /// new segment would exceed the disk quota even after deleting empty ones.
    pub fn allocate(&self, size: usize, fingerprint: Fingerprint, digest: u64) -> CacheResult<RangeWriter<'_>> {
        let span = span_for(size);
        let mut state = self.state.lock();

        let mut slot = None;
        for segment in state.segments.values() {
            if let Some(offset) = segment.alloc.lock().allocate(span) {
                slot = Some((segment.clone(), offset));
                break;
            }
        }

        let (segment, offset) = match slot {
            Some(slot) => slot,
            None => {
                let segment = self.create_segment(&mut state, size, span)?;
                let offset = segment
                    .alloc
                    .lock()
                    .allocate(span)
                    .ok_or(CacheError::OutOfDiskSpace {
                        requested: size,
                        quota: self.disk_quota,
                    })?;
                (segment, offset)
            }
        };

        let generation = state.next_generation;
        state.next_generation += 1;
        drop(state);

        segment.write_header(
            offset,
            &RecordHeader {
                magic: RECORD_MAGIC,
                state: STATE_WRITING,
                fingerprint,
                length: size as u64,
                digest,
            },
        );

        Ok(RangeWriter {
            store: self,
            lease: Arc::new(Lease {
                segment,
                offset,
                span,
                length: size,
                generation,
                retired: AtomicBool::new(false),
            }),
            committed: false,
        })
    }

    /// True if a range of `size` payload bytes could be placed at all, given
    /// an otherwise empty pool under the disk quota
    pub fn fits_quota(&self, size: usize) -> bool {
        RECORD_HEADER_LEN
            .checked_add(size)
            .and_then(|n| n.checked_next_multiple_of(RANGE_ALIGN))
            .map(|span| span.max(self.segment_size))
            .and_then(|capacity| capacity.checked_add(SEGMENT_HEADER_LEN))
            .map_or(false, |file_len| file_len <= self.disk_quota)
    }

    fn create_segment(&self, state: &mut StoreState, size: usize, span: usize) -> CacheResult<Arc<Segment>> {
        let capacity = self.segment_size.max(span);
        let file_len = SEGMENT_HEADER_LEN + capacity;

        if state.disk_used + file_len > self.disk_quota {
            self.reclaim_empty_segments(state);
        }
        if state.disk_used + file_len > self.disk_quota {
            return Err(CacheError::OutOfDiskSpace {
                requested: size,
                quota: self.disk_quota,
            });
        }

        let id = state.next_segment;
        let segment = Arc::new(Segment::create(&self.dir, &self.cache_name, &self.tag, id, capacity)?);
        tracing::debug!(segment = id, capacity, "created segment");

        state.next_segment += 1;
        state.disk_used += file_len;
        state.segments.insert(id, segment.clone());
        Ok(segment)
    }

    /// Deletes segment files that hold no ranges
    fn reclaim_empty_segments(&self, state: &mut StoreState) {
        let empty: Vec<SegmentId> = state
            .segments
            .iter()
            .filter(|(_, segment)| segment.alloc.lock().is_empty())
            .map(|(id, _)| *id)
            .collect();

        for id in empty {
            if let Some(segment) = state.segments.remove(&id) {
                state.disk_used = state.disk_used.saturating_sub(segment.file_len());
                let path = segment.path.clone();
                drop(segment);
                tracing::debug!(segment = id, "reclaimed empty segment");
                remove_segment_file(&path);
            }
        }
    }

    /// Pins a committed range for reading
    pub fn map(&self, handle: &SegmentHandle) -> CacheResult<FrameBytes> {
        let state = self.state.lock();
        match state.live.get(&(handle.segment, handle.offset)) {
            Some(lease) if lease.generation == handle.generation && lease.length as u64 == handle.length => {
                Ok(FrameBytes {
                    lease: lease.clone(),
                })
            }
            _ => Err(CacheError::StaleHandle),
        }
    }

    /// Gives up a committed range. Its bytes are reused once no reader pins them.
    pub fn release(&self, handle: &SegmentHandle) {
        let lease = {
            let mut state = self.state.lock();
            let key = (handle.segment, handle.offset);
            match state.live.get(&key) {
                Some(lease) if lease.generation == handle.generation => state.live.remove(&key),
                _ => None,
            }
        };
        if let Some(lease) = lease {
            lease.retired.store(true, Ordering::Release);
        }
    }

    /// Re-registers a range listed in a persisted table of contents.
    ///
    /// The record header must say the range is complete and carry the same
    /// fingerprint, length and params digest. Returns the handle with a fresh
    /// generation.
    pub fn claim(&self, handle: &SegmentHandle, fingerprint: Fingerprint, digest: u64) -> CacheResult<SegmentHandle> {
        let length = handle.length as usize;
        let offset = handle.offset as usize;
        let span = span_for(length);

        let mut state = self.state.lock();
        let segment = state
            .segments
            .get(&handle.segment)
            .cloned()
            .ok_or(CacheError::StaleHandle)?;

        if offset % RANGE_ALIGN != 0 || offset.checked_add(span).map_or(true, |end| end > segment.capacity) {
            return Err(CacheError::StaleHandle);
        }
        if !segment.alloc.lock().reserve(offset, span) {
            return Err(CacheError::StaleHandle);
        }

        let header = segment.read_header(offset);
        let expected = RecordHeader {
            magic: RECORD_MAGIC,
            state: STATE_COMPLETE,
            fingerprint,
            length: handle.length,
            digest,
        };
        if header != expected {
            segment.alloc.lock().release(offset, span);
            if header.magic == RECORD_MAGIC && header.state == STATE_WRITING {
                return Err(CacheError::IncompleteWrite {
                    expected: length,
                    written: 0,
                });
            }
            return Err(CacheError::StaleHandle);
        }

        let generation = state.next_generation;
        state.next_generation += 1;
        let lease = Arc::new(Lease {
            segment,
            offset,
            span,
            length,
            generation,
            retired: AtomicBool::new(false),
        });
        let claimed = lease.handle();
        state.live.insert((claimed.segment, claimed.offset), lease);
        Ok(claimed)
    }

    /// Flushes every mapped segment to disk
    pub fn flush(&self) -> CacheResult<()> {
        let segments: Vec<Arc<Segment>> = self.state.lock().segments.values().cloned().collect();
        for segment in segments {
            segment.flush()?;
        }
        Ok(())
    }

    /// Total size of all segment files
    pub fn disk_used(&self) -> usize {
        self.state.lock().disk_used
    }

    pub fn disk_quota(&self) -> usize {
        self.disk_quota
    }

    pub fn segment_count(&self) -> usize {
        self.state.lock().segments.len()
    }

    /// Number of committed ranges held by the store
    pub fn live_ranges(&self) -> usize {
        self.state.lock().live.len()
    }

    /// Payload-plus-header bytes in use across segments, including pinned ranges
    pub fn bytes_allocated(&self) -> usize {
        self.state
            .lock()
            .segments
            .values()
            .map(|segment| segment.alloc.lock().used())
            .sum()
    }
}

fn remove_segment_file(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove segment file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_with(segment_size: usize, quota: usize) -> (SegmentStore, TempDir) {
        let temp = tempfile::tempdir().unwrap();
        let config = CacheConfig::default()
            .with_cache_dir(temp.path())
            .with_capacity_bytes(0)
            .with_segment_size(segment_size)
            .with_disk_quota_bytes(quota);
        (SegmentStore::new(&config).unwrap(), temp)
    }

    fn write(store: &SegmentStore, fill: u8, size: usize, fp: u64) -> FrameBytes {
        let mut writer = store.allocate(size, fp, 7).unwrap();
        writer.as_mut_slice().fill(fill);
        writer.commit().unwrap()
    }

    #[test]
    fn test_file_name_roundtrip() {
        let name = Segment::file_name("ViewerCache", 42);
        assert_eq!(name, "ViewerCache.00000042.seg");
        assert_eq!(Segment::parse_file_name("ViewerCache", &name), Some(42));
        assert_eq!(Segment::parse_file_name("NodeCache", &name), None);
        assert_eq!(Segment::parse_file_name("ViewerCache", "ViewerCache.42.seg"), None);
    }

    #[test]
    fn test_allocate_write_map() {
        let (store, _temp) = store_with(4096, 1 << 20);
        let bytes = write(&store, 0xab, 1000, 1);

        assert_eq!(bytes.len(), 1000);
        assert!(bytes.iter().all(|&b| b == 0xab));

        let mapped = store.map(&bytes.handle()).unwrap();
        assert_eq!(mapped.as_slice(), bytes.as_slice());
        assert_eq!(store.segment_count(), 1);
        assert_eq!(store.live_ranges(), 1);
    }

    #[test]
    fn test_ranges_share_segment() {
        let (store, _temp) = store_with(4096, 1 << 20);
        let a = write(&store, 1, 500, 1);
        let b = write(&store, 2, 500, 2);

        assert_eq!(a.handle().segment, b.handle().segment);
        assert_ne!(a.handle().offset, b.handle().offset);
        assert!(a.iter().all(|&x| x == 1));
        assert!(b.iter().all(|&x| x == 2));
    }

    #[test]
    fn test_oversized_gets_dedicated_segment() {
        let (store, _temp) = store_with(1024, 1 << 20);
        let big = write(&store, 3, 10_000, 1);
        assert_eq!(big.len(), 10_000);
        assert_eq!(store.segment_count(), 1);
        assert!(store.disk_used() >= 10_000 + SEGMENT_HEADER_LEN);
    }

    #[test]
    fn test_uncommitted_writer_frees_range() {
        let (store, _temp) = store_with(4096, 1 << 20);
        let writer = store.allocate(1000, 1, 0).unwrap();
        let handle = writer.handle();
        drop(writer);

        assert_eq!(store.bytes_allocated(), 0);
        assert!(matches!(store.map(&handle), Err(CacheError::StaleHandle)));
    }

    #[test]
    fn test_release_is_lazy_while_pinned() {
        let (store, _temp) = store_with(4096, 1 << 20);
        let bytes = write(&store, 9, 1000, 1);
        let handle = bytes.handle();

        store.release(&handle);
        assert!(store.map(&handle).is_err());
        assert_eq!(store.bytes_allocated(), span_for(1000));
        assert!(bytes.iter().all(|&b| b == 9));

        drop(bytes);
        assert_eq!(store.bytes_allocated(), 0);
    }

    #[test]
    fn test_stale_generation_rejected() {
        let (store, _temp) = store_with(4096, 1 << 20);
        let first = write(&store, 1, 100, 1).handle();
        store.release(&first);

        let second = write(&store, 2, 100, 2).handle();
        assert_eq!(first.offset, second.offset);
        assert!(store.map(&first).is_err());
        assert!(store.map(&second).is_ok());

        // Releasing through the stale handle must not free the new range
        store.release(&first);
        assert!(store.map(&second).is_ok());
    }

    #[test]
    fn test_fits_quota() {
        let quota = 2 * (1024 + SEGMENT_HEADER_LEN);
        let (store, _temp) = store_with(1024, quota);

        assert!(store.fits_quota(0));
        assert!(store.fits_quota(900));
        let largest = quota - SEGMENT_HEADER_LEN - RECORD_HEADER_LEN;
        assert_eq!(span_for(largest), quota - SEGMENT_HEADER_LEN);
        assert!(store.fits_quota(largest));
        assert!(!store.fits_quota(largest + 1));
        assert!(!store.fits_quota(usize::MAX));
    }

    #[test]
    fn test_out_of_disk_space() {
        let (store, _temp) = store_with(1024, 2 * (1024 + SEGMENT_HEADER_LEN));
        let _a = write(&store, 1, 900, 1);
        let _b = write(&store, 2, 900, 2);

        let err = store.allocate(900, 3, 0).err().unwrap();
        assert!(matches!(err, CacheError::OutOfDiskSpace { .. }));
    }

    #[test]
    fn test_empty_segment_reclaimed_for_new_one() {
        let (store, _temp) = store_with(1024, 1024 + SEGMENT_HEADER_LEN + 100);
        let a = write(&store, 1, 900, 1).handle();
        store.release(&a);

        // Too big for the existing segment; the empty one is deleted to make room.
        let quota_fit = 1024 + 100 - RECORD_HEADER_LEN - RANGE_ALIGN;
        let bytes = write(&store, 2, quota_fit, 2);
        assert_eq!(bytes.len(), quota_fit);
        assert_eq!(store.segment_count(), 1);
    }

    #[test]
    fn test_recover_and_claim() {
        let temp = tempfile::tempdir().unwrap();
        let config = CacheConfig::default()
            .with_cache_dir(temp.path())
            .with_capacity_bytes(0)
            .with_segment_size(4096)
            .with_disk_quota_bytes(1 << 20);

        let handle = {
            let store = SegmentStore::new(&config).unwrap();
            write(&store, 0x5a, 300, 77).handle()
        };

        let store = SegmentStore::new(&config).unwrap();
        assert_eq!(store.recover_from_disk().unwrap(), vec![handle.segment]);

        assert!(store.claim(&handle, 78, 7).is_err());
        assert!(store.claim(&handle, 77, 8).is_err());

        let claimed = store.claim(&handle, 77, 7).unwrap();
        let bytes = store.map(&claimed).unwrap();
        assert!(bytes.iter().all(|&b| b == 0x5a));

        // A second claim of the same range is refused
        assert!(store.claim(&handle, 77, 7).is_err());
    }

    #[test]
    fn test_claim_rejects_incomplete_range() {
        let temp = tempfile::tempdir().unwrap();
        let config = CacheConfig::default()
            .with_cache_dir(temp.path())
            .with_capacity_bytes(0)
            .with_segment_size(4096)
            .with_disk_quota_bytes(1 << 20);

        let handle = {
            let store = SegmentStore::new(&config).unwrap();
            let mut writer = store.allocate(300, 5, 1).unwrap();
            writer.as_mut_slice()[..100].fill(1);
            let handle = writer.handle();
            // Simulate a crash: the writer is never committed nor dropped.
            std::mem::forget(writer);
            handle
        };

        let store = SegmentStore::new(&config).unwrap();
        store.recover_from_disk().unwrap();
        assert!(matches!(
            store.claim(&handle, 5, 1),
            Err(CacheError::IncompleteWrite { .. })
        ));
        assert_eq!(store.bytes_allocated(), 0);
    }

    #[test]
    fn test_recover_discards_other_version() {
        let temp = tempfile::tempdir().unwrap();
        let old = CacheConfig::default()
            .with_cache_dir(temp.path())
            .with_capacity_bytes(0)
            .with_segment_size(4096)
            .with_disk_quota_bytes(1 << 20)
            .with_cache_version("v0.9.0");
        {
            let store = SegmentStore::new(&old).unwrap();
            write(&store, 1, 100, 1);
        }

        let current = old.clone().with_cache_version("v1.0.0");
        let store = SegmentStore::new(&current).unwrap();
        assert!(store.recover_from_disk().unwrap().is_empty());
        assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_recover_discards_truncated_file() {
        let (store, temp) = store_with(4096, 1 << 20);
        fs::write(temp.path().join("ViewerCache.00000003.seg"), b"FRMCACHE").unwrap();
        fs::write(temp.path().join("unrelated.txt"), b"keep").unwrap();

        assert!(store.recover_from_disk().unwrap().is_empty());
        assert!(!temp.path().join("ViewerCache.00000003.seg").exists());
        assert!(temp.path().join("unrelated.txt").exists());
    }

    #[test]
    fn test_new_segments_after_recovery_use_fresh_ids() {
        let temp = tempfile::tempdir().unwrap();
        let config = CacheConfig::default()
            .with_cache_dir(temp.path())
            .with_capacity_bytes(0)
            .with_segment_size(1024)
            .with_disk_quota_bytes(1 << 20);
        {
            let store = SegmentStore::new(&config).unwrap();
            write(&store, 1, 900, 1);
            write(&store, 2, 900, 2);
        }

        let store = SegmentStore::new(&config).unwrap();
        assert_eq!(store.recover_from_disk().unwrap(), vec![0, 1]);
        // Recovered segments start empty, so this lands in segment 0
        let bytes = write(&store, 3, 900, 3);
        assert_eq!(bytes.handle().segment, 0);
        let bytes = write(&store, 4, 900, 4);
        assert_eq!(bytes.handle().segment, 1);
        let bytes = write(&store, 5, 900, 5);
        assert_eq!(bytes.handle().segment, 2);
    }
}
