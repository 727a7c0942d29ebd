//! Cache statistics and pressure levels

use std::sync::atomic::{AtomicU64, Ordering};

/// Utilization level of the in-memory capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MemoryPressure {
    /// Below 50%
    Low,
    /// 50-75%
    Moderate,
    /// 75-90%
    High,
    /// Above 90%
    Critical,
}

impl MemoryPressure {
    /// Maps a utilization ratio (0.0 to 1.0) to a pressure level
    pub fn from_utilization(utilization: f64) -> Self {
        if utilization < 0.5 {
            MemoryPressure::Low
        } else if utilization < 0.75 {
            MemoryPressure::Moderate
        } else if utilization < 0.90 {
            MemoryPressure::High
        } else {
            MemoryPressure::Critical
        }
    }

    pub fn is_high(&self) -> bool {
        matches!(self, MemoryPressure::High | MemoryPressure::Critical)
    }
}

/// Snapshot of cache counters and sizes
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheStats {
    /// Lookups that returned a frame
    pub hits: u64,
    /// Lookups that returned nothing, mismatches included
    pub misses: u64,
    /// Lookups that found a fingerprint rendered with other parameters
    pub mismatches: u64,
    /// Entries added
    pub insertions: u64,
    /// Entries evicted for capacity or disk space
    pub evictions: u64,
    /// Entries in the in-memory portion
    pub entry_count: usize,
    /// Entries kept on disk only
    pub dormant_count: usize,
    /// Payload bytes of the in-memory portion
    pub bytes_used: usize,
    /// Payload bytes kept on disk only
    pub dormant_bytes: usize,
    /// Configured in-memory capacity
    pub capacity: usize,
    /// Size of all segment files
    pub disk_used: usize,
    /// Configured disk quota
    pub disk_quota: usize,
}

impl CacheStats {
    /// Hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// In-memory utilization (0.0 to 1.0)
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.bytes_used as f64 / self.capacity as f64
        }
    }

    /// Disk utilization (0.0 to 1.0)
    pub fn disk_utilization(&self) -> f64 {
        if self.disk_quota == 0 {
            0.0
        } else {
            self.disk_used as f64 / self.disk_quota as f64
        }
    }

    pub fn pressure(&self) -> MemoryPressure {
        MemoryPressure::from_utilization(self.utilization())
    }
}

/// Monotonic counters shared by all threads using a manager
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) hits: AtomicU64,
    pub(crate) misses: AtomicU64,
    pub(crate) mismatches: AtomicU64,
    pub(crate) insertions: AtomicU64,
    pub(crate) evictions: AtomicU64,
}

impl Counters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn load(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}
