//! Frame Cache Library
//!
//! Disk-backed cache for rendered viewer frames. Pixel buffers live in
//! memory-mapped segment files; a fingerprint directory with LRU eviction keeps
//! the in-memory portion under a byte budget, and a table of contents lets a
//! restarted process reuse frames rendered by the previous one.

mod allocator;
pub mod config;
pub mod entry;
pub mod error;
pub mod fingerprint;
pub mod index;
pub mod manager;
pub mod params;
pub mod segment;
pub mod stats;
mod toc;

pub use config::{CacheConfig, ConfigError};
pub use entry::{CacheEntry, SegmentHandle, SegmentId};
pub use error::{CacheError, CacheResult, ProducerError};
pub use fingerprint::{compute_fingerprint, params_digest, Fingerprint, FingerprintHasher};
pub use index::{CacheIndex, Lookup};
pub use manager::{CacheManager, CachedFrame, FrameProducer};
pub use params::{BitDepth, Box2D, ChannelSet, Format, FrameKey, TextureRect, ValidationParams};
pub use segment::{FrameBytes, RangeWriter, SegmentStore};
pub use stats::{CacheStats, MemoryPressure};
