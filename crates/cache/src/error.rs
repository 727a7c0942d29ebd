//! Error types for cache operations
//!
//! Almost every failure here is recoverable by re-rendering: the manager turns
//! them into misses. Only a cache directory that cannot be created reaches the
//! application as a hard error.

use std::io;

use crate::config::ConfigError;

/// Error reported by a pixel producer
pub type ProducerError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// No segment space left within the disk quota, even after eviction
    #[error("out of disk space: requested {requested} bytes with a quota of {quota} bytes")]
    OutOfDiskSpace { requested: usize, quota: usize },

    /// Segment read, write or map failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Table of contents could not be parsed or belongs to another cache version
    #[error("corrupt table of contents: {0}")]
    CorruptTableOfContents(String),

    /// The producer wrote fewer bytes than the entry size
    #[error("incomplete write: expected {expected} bytes, producer wrote {written}")]
    IncompleteWrite { expected: usize, written: usize },

    /// The producer itself failed
    #[error("producer failed: {0}")]
    Producer(ProducerError),

    /// A single entry larger than the whole capacity budget
    #[error("entry of {size} bytes exceeds cache capacity of {capacity} bytes")]
    EntryTooLarge { size: usize, capacity: usize },

    /// The buffer size of a region of interest does not fit in memory
    #[error("buffer for region {width}x{height} overflows the address space")]
    RegionTooLarge { width: i64, height: i64 },

    /// The handle refers to a range that was released or reused
    #[error("stale segment handle")]
    StaleHandle,

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::CorruptTableOfContents(err.to_string())
    }
}

/// Result type for cache operations
pub type CacheResult<T> = Result<T, CacheError>;
