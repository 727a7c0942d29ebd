//! Fingerprint directory with LRU recency
//!
//! Lookups share a read lock; recency is bumped through an atomic tick drawn
//! from one counter, so every hit and insert gets a distinct, totally ordered
//! timestamp and eviction order is reproducible. Inserts, removals and eviction
//! take the write lock, which keeps the byte total consistent.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::entry::CacheEntry;
use crate::fingerprint::Fingerprint;
use crate::params::ValidationParams;

/// Result of a directory lookup
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    /// Present and the stored render state matches
    Hit(CacheEntry),
    /// No entry under this fingerprint
    Absent,
    /// An entry exists but was rendered with different parameters
    Mismatch,
}

impl Lookup {
    pub fn hit(self) -> Option<CacheEntry> {
        match self {
            Lookup::Hit(entry) => Some(entry),
            _ => None,
        }
    }
}

struct Slot {
    entry: CacheEntry,
    last_access: AtomicU64,
    inserted: u64,
}

#[derive(Default)]
struct IndexState {
    slots: HashMap<Fingerprint, Slot>,
    bytes: usize,
    next_insert: u64,
}

impl IndexState {
    fn take(&mut self, fingerprint: Fingerprint) -> Option<CacheEntry> {
        let slot = self.slots.remove(&fingerprint)?;
        self.bytes = self.bytes.saturating_sub(slot.entry.size_bytes());
        Some(slot.entry)
    }

    /// Fingerprints ordered least to most recently used
    fn lru_order(&self) -> Vec<Fingerprint> {
        let mut order: Vec<(u64, u64, Fingerprint)> = self
            .slots
            .iter()
            .map(|(fp, slot)| (slot.last_access.load(Ordering::Relaxed), slot.inserted, *fp))
            .collect();
        order.sort_unstable();
        order.into_iter().map(|(_, _, fp)| fp).collect()
    }
}

/// Concurrent fingerprint → entry map.
#[derive(Default)]
pub struct CacheIndex {
    state: RwLock<IndexState>,
    clock: AtomicU64,
}

impl CacheIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Finds the entry for `fingerprint` and checks its stored render state.
    ///
    /// Only a hit refreshes recency.
    pub fn lookup(&self, fingerprint: Fingerprint, params: &ValidationParams) -> Lookup {
        let state = self.state.read();
        match state.slots.get(&fingerprint) {
            Some(slot) if slot.entry.params.matches(params) => {
                slot.last_access.store(self.tick(), Ordering::Relaxed);
                Lookup::Hit(slot.entry)
            }
            Some(_) => Lookup::Mismatch,
            None => Lookup::Absent,
        }
    }

    /// Reads an entry without touching recency
    pub fn peek(&self, fingerprint: Fingerprint) -> Option<CacheEntry> {
        self.state.read().slots.get(&fingerprint).map(|slot| slot.entry)
    }

    pub fn contains(&self, fingerprint: Fingerprint) -> bool {
        self.state.read().slots.contains_key(&fingerprint)
    }

    /// Marks an entry most recently used. Returns false if absent.
    pub fn touch(&self, fingerprint: Fingerprint) -> bool {
        let state = self.state.read();
        match state.slots.get(&fingerprint) {
            Some(slot) => {
                slot.last_access.store(self.tick(), Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    fn place(&self, state: &mut IndexState, entry: CacheEntry) {
        let inserted = state.next_insert;
        state.next_insert += 1;
        state.bytes += entry.size_bytes();
        let slot = Slot {
            entry,
            last_access: AtomicU64::new(self.tick()),
            inserted,
        };
        state.slots.insert(entry.fingerprint, slot);
    }

    /// Adds or replaces an entry as most recently used. Returns the replaced entry.
    pub fn insert(&self, entry: CacheEntry) -> Option<CacheEntry> {
        let mut state = self.state.write();
        let replaced = state.take(entry.fingerprint);
        self.place(&mut state, entry);
        replaced
    }

    /// Adds `entry` as most recently used unless its fingerprint is already
    /// present. Returns false, leaving the index untouched, in that case.
    pub fn insert_if_absent(&self, entry: CacheEntry) -> bool {
        let mut state = self.state.write();
        if state.slots.contains_key(&entry.fingerprint) {
            return false;
        }
        self.place(&mut state, entry);
        true
    }

    pub fn remove(&self, fingerprint: Fingerprint) -> Option<CacheEntry> {
        self.state.write().take(fingerprint)
    }

    /// Removes `entry` only if it is still the one stored under its fingerprint
    pub fn remove_exact(&self, entry: &CacheEntry) -> bool {
        let mut state = self.state.write();
        let current = state.slots.get(&entry.fingerprint).map(|slot| slot.entry.backing);
        if current == Some(entry.backing) {
            state.take(entry.fingerprint);
            true
        } else {
            false
        }
    }

    /// Removes and returns the least recently used entry
    pub fn pop_lru(&self) -> Option<CacheEntry> {
        let mut state = self.state.write();
        let victim = state
            .slots
            .iter()
            .min_by_key(|(_, slot)| (slot.last_access.load(Ordering::Relaxed), slot.inserted))
            .map(|(fp, _)| *fp)?;
        state.take(victim)
    }

    /// Evicts least recently used entries until at most `target_bytes` remain.
    ///
    /// `release` runs for every evicted entry after the lock is dropped.
    pub fn evict_until<F>(&self, target_bytes: usize, mut release: F) -> Vec<CacheEntry>
    where
        F: FnMut(&CacheEntry),
    {
        let evicted = {
            let mut state = self.state.write();
            if state.bytes <= target_bytes {
                return Vec::new();
            }
            let mut evicted = Vec::new();
            for fp in state.lru_order() {
                if state.bytes <= target_bytes {
                    break;
                }
                if let Some(entry) = state.take(fp) {
                    evicted.push(entry);
                }
            }
            evicted
        };

        for entry in &evicted {
            release(entry);
        }
        evicted
    }

    /// Removes every entry, calling `release` for each
    pub fn remove_all<F>(&self, mut release: F) -> usize
    where
        F: FnMut(&CacheEntry),
    {
        let removed: Vec<CacheEntry> = {
            let mut state = self.state.write();
            state.bytes = 0;
            state.slots.drain().map(|(_, slot)| slot.entry).collect()
        };
        for entry in &removed {
            release(entry);
        }
        removed.len()
    }

    /// Removes every entry for which `predicate` holds
    pub fn remove_matching<P, F>(&self, mut predicate: P, mut release: F) -> usize
    where
        P: FnMut(&CacheEntry) -> bool,
        F: FnMut(&CacheEntry),
    {
        let removed: Vec<CacheEntry> = {
            let mut state = self.state.write();
            let doomed: Vec<Fingerprint> = state
                .slots
                .values()
                .filter(|slot| predicate(&slot.entry))
                .map(|slot| slot.entry.fingerprint)
                .collect();
            doomed.into_iter().filter_map(|fp| state.take(fp)).collect()
        };
        for entry in &removed {
            release(entry);
        }
        removed.len()
    }

    /// All entries, least recently used first
    pub fn snapshot_lru_order(&self) -> Vec<CacheEntry> {
        let state = self.state.read();
        state
            .lru_order()
            .into_iter()
            .filter_map(|fp| state.slots.get(&fp).map(|slot| slot.entry))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().slots.is_empty()
    }

    /// Sum of the payload sizes of all entries
    pub fn bytes_used(&self) -> usize {
        self.state.read().bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::SegmentHandle;
    use crate::params::{BitDepth, Box2D, ChannelSet, Format};

    fn params(tree_version: u64) -> ValidationParams {
        ValidationParams {
            tree_version,
            roi: Box2D::new(0, 0, 10, 10),
            format: Format::from_size(10, 10),
            channels: ChannelSet::RGBA,
            byte_mode: BitDepth::Byte,
            exposure: 0.0,
            lut_id: 0,
        }
    }

    fn entry(fp: u64, size: u64) -> CacheEntry {
        entry_v(fp, size, 1)
    }

    fn entry_v(fp: u64, size: u64, tree_version: u64) -> CacheEntry {
        CacheEntry::new(
            fp,
            params(tree_version),
            SegmentHandle {
                segment: 0,
                offset: fp * 4096,
                length: size,
                generation: fp,
            },
        )
    }

    #[test]
    fn test_lookup_hit_absent_mismatch() {
        let index = CacheIndex::new();
        index.insert(entry(1, 100));

        assert_eq!(index.lookup(1, &params(1)), Lookup::Hit(entry(1, 100)));
        assert_eq!(index.lookup(2, &params(1)), Lookup::Absent);
        assert_eq!(index.lookup(1, &params(2)), Lookup::Mismatch);
    }

    #[test]
    fn test_insert_replaces() {
        let index = CacheIndex::new();
        assert!(index.insert(entry(1, 100)).is_none());

        let replaced = index.insert(entry(1, 250)).unwrap();
        assert_eq!(replaced.size_bytes(), 100);
        assert_eq!(index.len(), 1);
        assert_eq!(index.bytes_used(), 250);
    }

    #[test]
    fn test_evict_until_lru() {
        let index = CacheIndex::new();
        index.insert(entry(1, 100));
        index.insert(entry(2, 100));
        index.insert(entry(3, 100));

        let mut released = Vec::new();
        let evicted = index.evict_until(150, |e| released.push(e.fingerprint));

        assert_eq!(evicted.len(), 2);
        assert_eq!(released, vec![1, 2]);
        assert!(index.contains(3));
        assert_eq!(index.bytes_used(), 100);
    }

    #[test]
    fn test_lookup_refreshes_recency() {
        let index = CacheIndex::new();
        index.insert(entry(1, 100));
        index.insert(entry(2, 100));
        index.insert(entry(3, 100));

        assert!(index.lookup(1, &params(1)).hit().is_some());
        let evicted = index.evict_until(200, |_| {});
        assert_eq!(evicted[0].fingerprint, 2);
        assert!(index.contains(1));
    }

    #[test]
    fn test_mismatch_does_not_refresh_recency() {
        let index = CacheIndex::new();
        index.insert(entry(1, 100));
        index.insert(entry(2, 100));

        assert_eq!(index.lookup(1, &params(9)), Lookup::Mismatch);
        let evicted = index.evict_until(100, |_| {});
        assert_eq!(evicted[0].fingerprint, 1);
    }

    #[test]
    fn test_touch_and_pop_lru() {
        let index = CacheIndex::new();
        index.insert(entry(1, 10));
        index.insert(entry(2, 10));

        assert!(index.touch(1));
        assert!(!index.touch(99));
        assert_eq!(index.pop_lru().unwrap().fingerprint, 2);
        assert_eq!(index.pop_lru().unwrap().fingerprint, 1);
        assert!(index.pop_lru().is_none());
    }

    #[test]
    fn test_insert_if_absent_keeps_existing() {
        let index = CacheIndex::new();
        let fresh = entry(1, 100);
        assert!(index.insert_if_absent(fresh));

        let mut older = entry(1, 300);
        older.backing.generation = 0;
        assert!(!index.insert_if_absent(older));
        assert_eq!(index.peek(1), Some(fresh));
        assert_eq!(index.bytes_used(), 100);

        assert!(index.insert_if_absent(entry(2, 50)));
        assert_eq!(index.len(), 2);
        assert_eq!(index.bytes_used(), 150);
    }

    #[test]
    fn test_remove_exact() {
        let index = CacheIndex::new();
        let old = entry(1, 10);
        index.insert(old);
        let mut newer = entry(1, 10);
        newer.backing.generation = 1000;
        index.insert(newer);

        assert!(!index.remove_exact(&old));
        assert!(index.remove_exact(&newer));
        assert!(index.is_empty());
    }

    #[test]
    fn test_remove_matching_and_all() {
        let index = CacheIndex::new();
        index.insert(entry_v(1, 10, 1));
        index.insert(entry_v(2, 10, 2));
        index.insert(entry_v(3, 10, 3));

        let mut released = 0;
        let removed = index.remove_matching(|e| e.params.tree_version < 3, |_| released += 1);
        assert_eq!(removed, 2);
        assert_eq!(released, 2);
        assert_eq!(index.len(), 1);
        assert_eq!(index.bytes_used(), 10);

        assert_eq!(index.remove_all(|_| {}), 1);
        assert!(index.is_empty());
        assert_eq!(index.bytes_used(), 0);
    }

    #[test]
    fn test_snapshot_order() {
        let index = CacheIndex::new();
        index.insert(entry(1, 10));
        index.insert(entry(2, 10));
        index.insert(entry(3, 10));
        index.touch(1);

        let order: Vec<u64> = index.snapshot_lru_order().iter().map(|e| e.fingerprint).collect();
        assert_eq!(order, vec![2, 3, 1]);
    }

    #[test]
    fn test_concurrent_lookups() {
        use std::sync::Arc;
        use std::thread;

        let index = Arc::new(CacheIndex::new());
        for fp in 0..64 {
            index.insert(entry(fp, 10));
        }

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let index = index.clone();
                thread::spawn(move || {
                    for i in 0..1000u64 {
                        let fp = (i * 7 + t) % 64;
                        assert!(index.lookup(fp, &params(1)).hit().is_some());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(index.len(), 64);
        assert_eq!(index.bytes_used(), 640);
    }
}
