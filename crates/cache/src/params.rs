//! Render-state value types
//!
//! These describe everything that makes a rendered frame pixel-unique. They are
//! plain values supplied by the renderer; the cache only hashes and compares them.

use serde::{Deserialize, Serialize};

/// Integer pixel rectangle (left, bottom, right, top)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Box2D {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl Box2D {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> i64 {
        self.x2 as i64 - self.x1 as i64
    }

    pub fn height(&self) -> i64 {
        self.y2 as i64 - self.y1 as i64
    }

    pub fn is_empty(&self) -> bool {
        self.width() <= 0 || self.height() <= 0
    }
}

/// Output display window with its pixel aspect ratio
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Format {
    pub display_window: Box2D,
    pub pixel_aspect: f64,
}

impl Format {
    pub fn new(display_window: Box2D, pixel_aspect: f64) -> Self {
        Self {
            display_window,
            pixel_aspect,
        }
    }

    /// Square-pixel format anchored at the origin
    pub fn from_size(width: i32, height: i32) -> Self {
        Self::new(Box2D::new(0, 0, width, height), 1.0)
    }

    /// Bit-exact comparison, so `-0.0` and `0.0` aspects are different formats
    pub fn same_as(&self, other: &Format) -> bool {
        self.display_window == other.display_window
            && self.pixel_aspect.to_bits() == other.pixel_aspect.to_bits()
    }
}

/// Bitmask of image channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ChannelSet(u32);

impl ChannelSet {
    pub const NONE: ChannelSet = ChannelSet(0);
    pub const RED: ChannelSet = ChannelSet(1 << 0);
    pub const GREEN: ChannelSet = ChannelSet(1 << 1);
    pub const BLUE: ChannelSet = ChannelSet(1 << 2);
    pub const ALPHA: ChannelSet = ChannelSet(1 << 3);
    pub const RGB: ChannelSet = ChannelSet(0b0111);
    pub const RGBA: ChannelSet = ChannelSet(0b1111);

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: ChannelSet) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn len(&self) -> u32 {
        self.0.count_ones()
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for ChannelSet {
    type Output = ChannelSet;

    fn bitor(self, rhs: ChannelSet) -> ChannelSet {
        ChannelSet(self.0 | rhs.0)
    }
}

/// Zoomed viewport rectangle the frame texture covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TextureRect {
    pub x: i32,
    pub y: i32,
    pub r: i32,
    pub t: i32,
    pub w: i32,
    pub h: i32,
}

impl TextureRect {
    pub fn new(x: i32, y: i32, r: i32, t: i32, w: i32, h: i32) -> Self {
        Self { x, y, r, t, w, h }
    }
}

/// Storage depth of the cached pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum BitDepth {
    /// 8-bit per channel display buffer
    #[default]
    Byte,
    /// 32-bit float per channel buffer
    Float,
}

impl BitDepth {
    pub fn bytes_per_channel(&self) -> usize {
        match self {
            BitDepth::Byte => 1,
            BitDepth::Float => 4,
        }
    }

    pub(crate) fn tag(&self) -> u64 {
        match self {
            BitDepth::Byte => 1,
            BitDepth::Float => 2,
        }
    }
}

/// The render-state fields stored with every entry and re-checked on lookup.
///
/// A fingerprint collision between two different parameter sets is caught here:
/// `matches` must agree before a cached frame is handed out.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValidationParams {
    /// Upstream graph version at render time
    pub tree_version: u64,
    /// Region of interest the frame covers
    pub roi: Box2D,
    /// Output format
    pub format: Format,
    /// Channels present in the buffer
    pub channels: ChannelSet,
    /// Buffer bit depth
    pub byte_mode: BitDepth,
    /// Viewer exposure
    pub exposure: f32,
    /// Color-transform (LUT) identifier
    pub lut_id: u32,
}

impl ValidationParams {
    /// Field-wise equality with floats compared on their bit patterns
    pub fn matches(&self, other: &ValidationParams) -> bool {
        self.tree_version == other.tree_version
            && self.roi == other.roi
            && self.format.same_as(&other.format)
            && self.channels == other.channels
            && self.byte_mode == other.byte_mode
            && self.exposure.to_bits() == other.exposure.to_bits()
            && self.lut_id == other.lut_id
    }

    /// Bytes needed for a full buffer over the ROI, `None` if that overflows `usize`
    pub fn buffer_size(&self) -> Option<usize> {
        if self.roi.is_empty() {
            return Some(0);
        }
        let width = usize::try_from(self.roi.width()).ok()?;
        let height = usize::try_from(self.roi.height()).ok()?;
        width
            .checked_mul(height)?
            .checked_mul(self.channels.len() as usize)?
            .checked_mul(self.byte_mode.bytes_per_channel())
    }
}

/// Full key of a viewer frame: the validation fields plus the fields that
/// only influence the fingerprint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameKey {
    pub frame_number: i64,
    pub zoom: f32,
    pub texture_rect: TextureRect,
    pub params: ValidationParams,
}

impl FrameKey {
    pub fn fingerprint(&self) -> u64 {
        crate::fingerprint::compute_fingerprint(self)
    }
}
