//! `av_stabilizer` is a real-time video stabilization engine. It consumes a
//! stream of raw video frames and emits geometrically warped frames in which
//! unwanted inter-frame camera motion has been attenuated.
//!
//! The pipeline tracks corner features between consecutive frames with
//! pyramidal Lucas-Kanade optical flow, fits a similarity transform to the
//! surviving correspondences with RANSAC, smooths the recent motion over a
//! sliding window, and re-projects each frame onto the smoothed trajectory.
//! A motion classifier watches the transform stream and retunes the pipeline
//! on the fly through the adaptive controller.
//!
//! The entry point for host applications is [`Stabilizer`], an exclusively
//! locked wrapper that is safe to drive from a video thread while a UI thread
//! updates parameters.
//!
//! ```
//! use av_stabilizer::{PixelFormat, PlaneViewMut, FrameViewMut, Stabilizer, StabilizerParams};
//!
//! let stab = Stabilizer::new();
//! assert!(stab.initialize(640, 480, StabilizerParams::default()));
//!
//! let mut data = vec![128u8; 640 * 480 * 4];
//! let planes = vec![PlaneViewMut { data: &mut data, stride: 640 * 4 }];
//! let mut frame = FrameViewMut::new(640, 480, PixelFormat::Bgra, planes, 0).unwrap();
//! stab.process_frame(&mut frame);
//! ```

#![allow(clippy::cast_lossless)]
#![allow(clippy::needless_range_loop)]
#![allow(clippy::too_many_arguments)]
#![deny(missing_docs)]

pub mod adaptive;
pub mod classify;
pub mod compose;
pub mod detect;
pub mod engine;
pub mod estimate;
pub mod flow;
pub mod frame;
pub mod metrics;
pub mod params;
pub mod pixel;
pub mod smooth;
pub mod stabilizer;
pub mod transform;
pub mod tune;
pub(crate) mod warp;

pub use crate::adaptive::{AdaptiveConfig, AdaptiveStabilizer};
pub use crate::classify::{MotionClassifier, MotionMetrics, MotionThresholds, MotionType};
pub use crate::compose::EdgeMode;
pub use crate::engine::{FrameResult, StabilizerCore};
pub use crate::frame::{FrameViewMut, PixelFormat, PlaneViewMut};
pub use crate::metrics::{PerformanceMetrics, StabilizerStatus};
pub use crate::params::StabilizerParams;
pub use crate::stabilizer::Stabilizer;
pub use crate::transform::{Point, Transform};

use thiserror::Error;

/// Possible errors that may occur while stabilizing a stream.
///
/// Faults are reported per frame and never cross the [`Stabilizer`] boundary
/// as panics; the affected frame is passed through unchanged and the error is
/// retained for [`Stabilizer::last_error`].
///
/// This enum may be added to in the future and should not be assumed to be
/// exhaustive.
#[derive(Debug, Error)]
pub enum StabilizerError {
    /// The stream dimensions are outside the supported range.
    #[error("invalid dimensions: {reason}")]
    InvalidDimensions {
        #[doc(hidden)]
        reason: String,
    },
    /// A frame failed validation and cannot be processed.
    #[error("invalid frame: {reason}")]
    InvalidFrame {
        #[doc(hidden)]
        reason: &'static str,
    },
    /// The host handed us a frame in a format the engine does not support.
    #[error("unsupported frame format: {code}")]
    UnsupportedFormat {
        #[doc(hidden)]
        code: u32,
    },
    /// Corner detection failed inside the detector backend.
    #[error("feature detection failed: {reason}")]
    FeatureDetection {
        #[doc(hidden)]
        reason: &'static str,
    },
    /// Optical flow lost too many features to continue tracking.
    #[error("feature tracking failed: {reason}")]
    FeatureTracking {
        #[doc(hidden)]
        reason: &'static str,
    },
    /// The transform estimator could not produce a usable fit.
    #[error("transform estimation failed: {reason}")]
    TransformCalculation {
        #[doc(hidden)]
        reason: &'static str,
    },
    /// A lower layer reported a fault the per-frame boundary absorbed.
    #[error("internal fault: {reason}")]
    Internal {
        #[doc(hidden)]
        reason: String,
    },
}

#[cfg(test)]
#[inline(always)]
pub(crate) fn assert_close(expected: f64, value: f64, epsilon: f64) {
    assert!(
        (expected - value).abs() < epsilon,
        "Expected {}, got {}",
        expected,
        value
    );
}
