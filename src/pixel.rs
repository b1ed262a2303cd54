//! Sample types for the grayscale planes the pipeline math runs on.
//!
//! Planes are stored as integers, but corner responses, Lucas-Kanade
//! refinement and bilinear resampling all work in floating point. [`Pixel`]
//! is the small contract a sample type needs to cross that boundary.

use num_traits::{AsPrimitive, PrimInt};

/// An integer grayscale sample that widens losslessly into the float math
/// the detector, tracker and warp run on.
///
/// Implemented for `u8`, the only depth the host delivers today, and `u16`
/// so a high-bit-depth luma plane can reuse the same pipeline code.
pub trait Pixel: PrimInt + AsPrimitive<f32> + Send + Sync + 'static {
    /// Widens the sample into the interpolation domain.
    #[inline(always)]
    fn to_f32(self) -> f32 {
        self.as_()
    }
}

impl Pixel for u8 {}
impl Pixel for u16 {}
