//! Frame fingerprints
//!
//! A fingerprint is a 64-bit key derived from every render parameter that affects
//! the pixels of a frame. Each field is mixed together with its own seed and the
//! mixed words are summed, so feeding fields in a different order gives the same
//! key while moving a value from one field to another does not. Floats are hashed
//! on their exact bit pattern: a one-ULP change is a different frame.

use crate::params::{Box2D, Format, FrameKey, TextureRect, ValidationParams};

/// Cache key type
pub type Fingerprint = u64;

const FRAME_NUMBER: u64 = 0x9e37_79b9_7f4a_7c15;
const TREE_VERSION: u64 = 0xbf58_476d_1ce4_e5b9;
const ZOOM: u64 = 0x94d0_49bb_1331_11eb;
const EXPOSURE: u64 = 0x2545_f491_4f6c_dd1d;
const LUT_ID: u64 = 0xd6e8_feb8_6659_fd93;
const BYTE_MODE: u64 = 0xa076_1d64_78bd_642f;
const ROI: u64 = 0xe703_7ed1_a0b4_28db;
const FORMAT: u64 = 0x8ebc_6af0_9c88_c6e3;
const PIXEL_ASPECT: u64 = 0x5899_65cc_7537_4cc3;
const TEXTURE_RECT: u64 = 0x1d8e_4e27_c47d_124f;
const CHANNELS: u64 = 0xc2b2_ae3d_27d4_eb4f;

/// splitmix64 finalizer
#[inline]
fn mix64(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// Incremental fingerprint builder.
///
/// Every `write_*` call takes a field seed. Within one field, words are chained
/// (the seed is rotated and re-mixed per word) so `(1, 2)` and `(2, 1)` differ.
#[derive(Debug, Clone, Default)]
pub struct FingerprintHasher {
    acc: u64,
}

impl FingerprintHasher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mixes one 64-bit word under `seed`
    pub fn write_u64(&mut self, seed: u64, value: u64) -> &mut Self {
        self.acc = self.acc.wrapping_add(mix64(mix64(seed) ^ value));
        self
    }

    pub fn write_i64(&mut self, seed: u64, value: i64) -> &mut Self {
        self.write_u64(seed, value as u64)
    }

    pub fn write_f32(&mut self, seed: u64, value: f32) -> &mut Self {
        self.write_u64(seed, value.to_bits() as u64)
    }

    pub fn write_f64(&mut self, seed: u64, value: f64) -> &mut Self {
        self.write_u64(seed, value.to_bits())
    }

    /// Mixes an ordered sequence of words as a single field
    pub fn write_words(&mut self, seed: u64, words: &[u64]) -> &mut Self {
        let mut chained = mix64(seed);
        for &word in words {
            chained = mix64(chained.rotate_left(23) ^ word);
        }
        self.acc = self.acc.wrapping_add(chained);
        self
    }

    pub fn write_box(&mut self, seed: u64, b: &Box2D) -> &mut Self {
        self.write_words(
            seed,
            &[b.x1 as u64, b.y1 as u64, b.x2 as u64, b.y2 as u64],
        )
    }

    pub fn finish(&self) -> Fingerprint {
        mix64(self.acc ^ 0x6a09_e667_f3bc_c909)
    }
}

fn write_format(hasher: &mut FingerprintHasher, format: &Format) {
    hasher
        .write_box(FORMAT, &format.display_window)
        .write_f64(PIXEL_ASPECT, format.pixel_aspect);
}

fn write_texture_rect(hasher: &mut FingerprintHasher, rect: &TextureRect) {
    hasher.write_words(
        TEXTURE_RECT,
        &[
            rect.x as u64,
            rect.y as u64,
            rect.r as u64,
            rect.t as u64,
            rect.w as u64,
            rect.h as u64,
        ],
    );
}

/// Computes the fingerprint of a viewer frame
pub fn compute_fingerprint(key: &FrameKey) -> Fingerprint {
    let p = &key.params;
    let mut hasher = FingerprintHasher::new();
    hasher
        .write_i64(FRAME_NUMBER, key.frame_number)
        .write_u64(TREE_VERSION, p.tree_version)
        .write_f32(ZOOM, key.zoom)
        .write_f32(EXPOSURE, p.exposure)
        .write_u64(LUT_ID, p.lut_id as u64)
        .write_u64(BYTE_MODE, p.byte_mode.tag())
        .write_box(ROI, &p.roi)
        .write_u64(CHANNELS, p.channels.bits() as u64);
    write_format(&mut hasher, &p.format);
    write_texture_rect(&mut hasher, &key.texture_rect);
    hasher.finish()
}

/// Digest of the validation fields alone, stamped into each range's record
/// header so a persisted entry can only be re-attached to bytes rendered with
/// the same state.
pub fn params_digest(params: &ValidationParams) -> u64 {
    let mut hasher = FingerprintHasher::new();
    hasher
        .write_u64(TREE_VERSION, params.tree_version)
        .write_f32(EXPOSURE, params.exposure)
        .write_u64(LUT_ID, params.lut_id as u64)
        .write_u64(BYTE_MODE, params.byte_mode.tag())
        .write_box(ROI, &params.roi)
        .write_u64(CHANNELS, params.channels.bits() as u64);
    write_format(&mut hasher, &params.format);
    hasher.finish()
}
