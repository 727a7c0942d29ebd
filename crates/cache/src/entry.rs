//! Cache entries
//!
//! An entry describes one cached frame. It refers to its pixel bytes through a
//! [`SegmentHandle`] (segment id and offset), never through a pointer into a
//! mapping, so the directory can outlive any particular mapping.

use serde::{Deserialize, Serialize};

use crate::fingerprint::Fingerprint;
use crate::params::ValidationParams;

/// Identifier of a segment file
pub type SegmentId = u32;

/// Location of an entry's bytes inside the segment pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SegmentHandle {
    /// Segment file holding the range
    pub segment: SegmentId,
    /// Offset of the range's record header inside the segment data area
    pub offset: u64,
    /// Payload length in bytes
    pub length: u64,
    /// Allocation generation; not persisted, reassigned when a range is claimed
    #[serde(skip)]
    pub generation: u64,
}

/// One cached frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub params: ValidationParams,
    pub backing: SegmentHandle,
}

impl CacheEntry {
    pub fn new(fingerprint: Fingerprint, params: ValidationParams, backing: SegmentHandle) -> Self {
        Self {
            fingerprint,
            params,
            backing,
        }
    }

    /// Size of the pixel payload in bytes
    pub fn size_bytes(&self) -> usize {
        self.backing.length as usize
    }
}
