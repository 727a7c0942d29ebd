//! First-fit byte range allocator for a single segment
//!
//! Free space is a map from offset to length. Adjacent free ranges are merged on
//! release so a segment that empties out returns to a single free block.

use std::collections::BTreeMap;

#[derive(Debug)]
pub(crate) struct RangeAllocator {
    capacity: usize,
    free: BTreeMap<usize, usize>,
    used: usize,
}

impl RangeAllocator {
    pub(crate) fn new(capacity: usize) -> Self {
        let mut free = BTreeMap::new();
        if capacity > 0 {
            free.insert(0, capacity);
        }
        Self {
            capacity,
            free,
            used: 0,
        }
    }

    /// Returns the offset of a free range of `len` bytes
    pub(crate) fn allocate(&mut self, len: usize) -> Option<usize> {
        if len == 0 {
            return None;
        }
        let (&offset, &free_len) = self.free.iter().find(|(_, &free_len)| free_len >= len)?;
        self.free.remove(&offset);
        if free_len > len {
            self.free.insert(offset + len, free_len - len);
        }
        self.used += len;
        Some(offset)
    }

    /// Marks a specific range as used. Fails if any byte of it is already taken.
    pub(crate) fn reserve(&mut self, offset: usize, len: usize) -> bool {
        if len == 0 || offset.checked_add(len).map_or(true, |end| end > self.capacity) {
            return false;
        }
        let Some((&block, &block_len)) = self.free.range(..=offset).next_back() else {
            return false;
        };
        if block + block_len < offset + len {
            return false;
        }

        self.free.remove(&block);
        if offset > block {
            self.free.insert(block, offset - block);
        }
        let tail = block + block_len - (offset + len);
        if tail > 0 {
            self.free.insert(offset + len, tail);
        }
        self.used += len;
        true
    }

    /// Returns a range to the free list, merging with its neighbours
    pub(crate) fn release(&mut self, offset: usize, len: usize) {
        debug_assert!(offset + len <= self.capacity);
        let mut start = offset;
        let mut end = offset + len;

        if let Some((&prev, &prev_len)) = self.free.range(..offset).next_back() {
            debug_assert!(prev + prev_len <= offset, "double free at {offset}");
            if prev + prev_len == offset {
                self.free.remove(&prev);
                start = prev;
            }
        }
        if let Some(next_len) = self.free.remove(&end) {
            end += next_len;
        }

        self.free.insert(start, end - start);
        self.used = self.used.saturating_sub(len);
    }

    pub(crate) fn used(&self) -> usize {
        self.used
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.used == 0
    }

    pub(crate) fn free_blocks(&self) -> usize {
        self.free.len()
    }
}
