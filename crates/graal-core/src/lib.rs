//! graal-core: Shared types for the Graal convolution engine
//!
//! This crate provides the sample type, error type and configuration used
//! across all Graal crates.

mod config;
mod error;

pub use config::*;
pub use error::*;

/// Type alias for audio samples (per-channel float arrays at the boundary)
pub type Sample = f32;

/// `dst[i] += src[i]`
#[inline]
pub fn add_into(dst: &mut [Sample], src: &[Sample]) {
    debug_assert_eq!(dst.len(), src.len());
    for (d, &s) in dst.iter_mut().zip(src) {
        *d += s;
    }
}

/// `dst[i] = src[i] * gain`
#[inline]
pub fn scale_into(dst: &mut [Sample], src: &[Sample], gain: Sample) {
    debug_assert_eq!(dst.len(), src.len());
    for (d, &s) in dst.iter_mut().zip(src) {
        *d = s * gain;
    }
}
