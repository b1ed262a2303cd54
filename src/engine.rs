//! The per-frame stabilization engine.
//!
//! [`StabilizerCore`] orchestrates the whole pipeline: grayscale conversion,
//! corner detection, optical-flow tracking, robust transform estimation,
//! sliding-window smoothing, warping and edge handling. It is deliberately
//! single-threaded at the API level; thread safety is the
//! [`Stabilizer`](crate::Stabilizer) wrapper's responsibility, which keeps
//! the hot path free of locks.
//!
//! Faults never escape `process_frame`: any stage that fails downgrades the
//! frame to a passthrough, records the error for later inspection, and the
//! engine keeps running.

use crate::classify::transform_magnitude;
use crate::compose::apply_edge_handling;
use crate::detect::{CornerDetector, DetectorConfig, FeatureDetector};
use crate::estimate::{clamp_correction, estimate_partial_affine, EstimatorConfig};
use crate::flow::{FlowConfig, FlowTracker, LkTracker};
use crate::frame::{extract_luma, FrameBuf, FrameViewMut, PlaneData, MAX_IMAGE_SIZE, MIN_IMAGE_SIZE};
use crate::metrics::{PerformanceMetrics, StabilizerStatus};
use crate::params::StabilizerParams;
use crate::smooth::TransformHistory;
use crate::transform::{Point, Transform};
use crate::warp::warp_frame;
use crate::StabilizerError;
use log::{debug, info, warn};
use std::time::Instant;

// Frames slower than this get logged; the budget for 30 fps is three times
// larger, so one slow frame is a smell rather than a failure.
const SLOW_FRAME_THRESHOLD_MS: f64 = 10.0;

// Consecutive tracking failures that trigger a full feature re-detection.
const MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// What `process_frame` did with the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameResult {
    /// The frame was left untouched (disabled, warming up, or a fault).
    Passthrough,
    /// The frame was warped in place.
    Stabilized,
}

/// The single-threaded stabilization engine.
pub struct StabilizerCore {
    width: usize,
    height: usize,
    params: StabilizerParams,
    detector: Box<dyn FeatureDetector>,
    tracker: Box<dyn FlowTracker>,
    prev_gray: PlaneData<u8>,
    curr_gray: PlaneData<u8>,
    prev_points: Vec<Point>,
    curr_points: Vec<Point>,
    history: TransformHistory,
    metrics: PerformanceMetrics,
    first_frame: bool,
    consecutive_failures: u32,
    last_error: String,
    warp_buf: FrameBuf,
    compose_buf: FrameBuf,
    initialized: bool,
}

impl Default for StabilizerCore {
    fn default() -> Self {
        StabilizerCore::new()
    }
}

impl StabilizerCore {
    /// Creates an uninitialized engine with the portable detector and
    /// tracker backends.
    pub fn new() -> Self {
        StabilizerCore::with_backends(Box::new(CornerDetector::new()), Box::new(LkTracker::new()))
    }

    /// Creates an engine with caller-supplied detector/tracker backends.
    pub fn with_backends(detector: Box<dyn FeatureDetector>, tracker: Box<dyn FlowTracker>) -> Self {
        StabilizerCore {
            width: 0,
            height: 0,
            params: StabilizerParams::default(),
            detector,
            tracker,
            prev_gray: PlaneData::new(0, 0),
            curr_gray: PlaneData::new(0, 0),
            prev_points: Vec::new(),
            curr_points: Vec::new(),
            history: TransformHistory::new(1),
            metrics: PerformanceMetrics::default(),
            first_frame: true,
            consecutive_failures: 0,
            last_error: String::new(),
            warp_buf: FrameBuf::default(),
            compose_buf: FrameBuf::default(),
            initialized: false,
        }
    }

    /// Prepares the engine for a `width` x `height` stream.
    ///
    /// Returns `false` (with `last_error` set) when the dimensions fall
    /// outside `[32, 16384]`; parameters are clamped, never rejected.
    pub fn initialize(&mut self, width: usize, height: usize, params: StabilizerParams) -> bool {
        if width < MIN_IMAGE_SIZE || height < MIN_IMAGE_SIZE {
            self.last_error = StabilizerError::InvalidDimensions {
                reason: format!(
                    "{}x{}: minimum is {}x{}",
                    width, height, MIN_IMAGE_SIZE, MIN_IMAGE_SIZE
                ),
            }
            .to_string();
            warn!("{}", self.last_error);
            return false;
        }
        if width > MAX_IMAGE_SIZE || height > MAX_IMAGE_SIZE {
            self.last_error = StabilizerError::InvalidDimensions {
                reason: format!(
                    "{}x{}: maximum is {}x{}",
                    width, height, MAX_IMAGE_SIZE, MAX_IMAGE_SIZE
                ),
            }
            .to_string();
            warn!("{}", self.last_error);
            return false;
        }

        self.params = params.validated();
        self.width = width;
        self.height = height;
        self.first_frame = true;
        self.prev_gray.reset(0, 0);
        self.prev_points.clear();
        self.history = TransformHistory::new(self.params.smoothing_radius);
        self.metrics = PerformanceMetrics::default();
        self.metrics.status = StabilizerStatus::Initializing;
        self.consecutive_failures = 0;
        self.last_error.clear();
        self.initialized = true;
        info!("stabilizer initialized for {}x{} stream", width, height);
        true
    }

    /// Whether `initialize` has succeeded.
    pub fn is_ready(&self) -> bool {
        self.initialized && self.width > 0 && self.height > 0
    }

    /// Stabilizes one frame in place.
    ///
    /// Passthrough outcomes leave the frame's planes byte-identical to the
    /// input; the caller can forward the frame either way.
    pub fn process_frame(&mut self, frame: &mut FrameViewMut<'_>) -> FrameResult {
        let start = Instant::now();
        if !self.initialized {
            return FrameResult::Passthrough;
        }
        if frame.width() < MIN_IMAGE_SIZE || frame.height() < MIN_IMAGE_SIZE {
            self.record_fault(format!(
                "frame of {}x{} is below the {} px processing minimum",
                frame.width(),
                frame.height(),
                MIN_IMAGE_SIZE
            ));
            self.metrics.status = StabilizerStatus::Failed;
            return FrameResult::Passthrough;
        }
        if !self.params.enabled {
            debug!("stabilizer disabled, passing frame through");
            return FrameResult::Passthrough;
        }

        if let Err(err) = extract_luma(frame, &mut self.curr_gray) {
            self.record_fault(format!("grayscale conversion failed: {}", err));
            self.metrics.record_frame(start.elapsed().as_secs_f64());
            return FrameResult::Passthrough;
        }

        if self.first_frame {
            return self.process_first_frame(start);
        }

        // The tracker requires the hint sequence to match the input length.
        self.curr_points.clear();
        self.curr_points.extend_from_slice(&self.prev_points);
        let flow_config = self.flow_config();
        let report = self.tracker.track(
            &self.prev_gray,
            &self.curr_gray,
            &mut self.prev_points,
            &mut self.curr_points,
            &flow_config,
        );

        let report = match report {
            Ok(r) if r.is_usable() => r,
            outcome => {
                let rate = outcome.as_ref().map(|r| r.success_rate).unwrap_or(0.0);
                self.handle_tracking_failure(rate);
                self.metrics.record_frame(start.elapsed().as_secs_f64());
                return FrameResult::Passthrough;
            }
        };
        self.consecutive_failures = 0;

        let estimator_config = EstimatorConfig {
            ransac_threshold: self.params.ransac_threshold_min as f64,
            ..EstimatorConfig::default()
        };
        let raw = match estimate_partial_affine(&self.prev_points, &self.curr_points, &estimator_config)
        {
            Some(t) => t,
            None => {
                // Identity is still pushed so the smoothing window keeps
                // advancing at one transform per frame.
                self.record_fault(
                    StabilizerError::TransformCalculation {
                        reason: "degenerate correspondences",
                    }
                    .to_string(),
                );
                Transform::identity()
            }
        };
        let transform = clamp_correction(&raw, self.params.max_correction);
        self.history.push(transform);

        let correction = self.history.trajectory_correction();

        // The tracked positions become the reference for the next frame.
        std::mem::swap(&mut self.prev_gray, &mut self.curr_gray);
        std::mem::swap(&mut self.prev_points, &mut self.curr_points);
        self.metrics.tracking_success_rate = report.success_rate;

        if report.success_rate < self.params.feature_refresh_threshold {
            self.refresh_features();
        }

        if let Err(err) = warp_frame(frame, &correction, &mut self.warp_buf) {
            self.record_fault(format!("warp failed: {}", err));
            self.metrics.record_frame(start.elapsed().as_secs_f64());
            return FrameResult::Passthrough;
        }
        apply_edge_handling(&mut self.warp_buf, &mut self.compose_buf, self.params.edge_mode);
        self.warp_buf.write_into(frame);

        self.metrics.status = StabilizerStatus::Active;
        self.metrics.tracked_features = self.prev_points.len();
        self.metrics.transform_stability = self.transform_stability();
        self.metrics.record_frame(start.elapsed().as_secs_f64());

        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        if elapsed_ms > SLOW_FRAME_THRESHOLD_MS {
            warn!(
                "slow frame: {:.2}ms with {} features at {}x{}",
                elapsed_ms,
                self.prev_points.len(),
                self.width,
                self.height
            );
        }
        FrameResult::Stabilized
    }

    fn process_first_frame(&mut self, start: Instant) -> FrameResult {
        let config = self.detector_config();
        let detected = self
            .detector
            .detect(&self.curr_gray, &config, &mut self.prev_points);
        if let Err(err) = detected {
            self.record_fault(format!("feature detection failed: {}", err));
        }
        if self.prev_points.is_empty() {
            debug!("no features in first frame, retrying on the next one");
            self.metrics.status = StabilizerStatus::Initializing;
            self.metrics.record_frame(start.elapsed().as_secs_f64());
            return FrameResult::Passthrough;
        }

        std::mem::swap(&mut self.prev_gray, &mut self.curr_gray);
        self.first_frame = false;
        self.history.push(Transform::identity());
        self.metrics.status = StabilizerStatus::Initializing;
        self.metrics.tracked_features = self.prev_points.len();
        self.metrics.record_frame(start.elapsed().as_secs_f64());
        debug!("first frame processed, {} features detected", self.prev_points.len());

        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        if elapsed_ms > SLOW_FRAME_THRESHOLD_MS * 2.0 {
            warn!(
                "first frame took {:.2}ms (initialization overhead expected)",
                elapsed_ms
            );
        }
        FrameResult::Passthrough
    }

    fn handle_tracking_failure(&mut self, success_rate: f32) {
        self.consecutive_failures += 1;
        self.metrics.tracking_success_rate = success_rate;
        self.metrics.error_count += 1;
        self.last_error = format!(
            "feature tracking failed (attempt {}/{}), success rate {:.2}",
            self.consecutive_failures, MAX_CONSECUTIVE_FAILURES, success_rate
        );
        warn!("{}", self.last_error);

        if self.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
            info!("tracking failed {} times, re-detecting features", MAX_CONSECUTIVE_FAILURES);
            let config = self.detector_config();
            if let Err(err) = self
                .detector
                .detect(&self.curr_gray, &config, &mut self.prev_points)
            {
                self.record_fault(format!("re-detection failed: {}", err));
            }
            // The reference frame must move together with the new features,
            // or the next tracking call sees mismatched inputs.
            std::mem::swap(&mut self.prev_gray, &mut self.curr_gray);
            self.consecutive_failures = 0;
            self.metrics.status = StabilizerStatus::ErrorRecovery;
            if self.prev_points.is_empty() {
                // Nothing trackable either; start over from scratch.
                self.first_frame = true;
            }
        } else {
            self.metrics.status = StabilizerStatus::Degraded;
        }
    }

    /// Replaces the tracked set with a fresh detection on the current frame.
    /// Keeps the tracked points when the detector comes back empty.
    fn refresh_features(&mut self) {
        let config = self.detector_config();
        self.curr_points.clear();
        let refreshed = self
            .detector
            .detect(&self.prev_gray, &config, &mut self.curr_points);
        match refreshed {
            Ok(()) if !self.curr_points.is_empty() => {
                debug!(
                    "feature set refreshed: {} -> {} points",
                    self.prev_points.len(),
                    self.curr_points.len()
                );
                std::mem::swap(&mut self.prev_points, &mut self.curr_points);
            }
            Ok(()) => {}
            Err(err) => {
                self.record_fault(format!("feature refresh failed: {}", err));
            }
        }
    }

    fn transform_stability(&self) -> f32 {
        if self.history.len() < 2 {
            return 1.0;
        }
        let n = self.history.len() as f64;
        let mean = self.history.iter().map(transform_magnitude).sum::<f64>() / n;
        let variance = self
            .history
            .iter()
            .map(|t| {
                let d = transform_magnitude(t) - mean;
                d * d
            })
            .sum::<f64>()
            / n;
        (1.0 / (1.0 + variance.sqrt())) as f32
    }

    fn record_fault(&mut self, message: String) {
        warn!("{}", message);
        self.last_error = message;
        self.metrics.error_count += 1;
    }

    fn detector_config(&self) -> DetectorConfig {
        DetectorConfig {
            max_features: self.params.feature_count,
            quality_level: self.params.quality_level as f64,
            min_distance: self.params.min_distance as f64,
            block_size: self.params.block_size,
            use_harris: self.params.use_harris,
            harris_k: self.params.harris_k as f64,
        }
    }

    fn flow_config(&self) -> FlowConfig {
        FlowConfig {
            window_size: self.params.flow_window_size,
            pyramid_levels: self.params.pyramid_levels,
        }
    }

    /// Swaps in a new, clamped parameter set. Takes effect on the next frame;
    /// a smaller smoothing radius truncates the history immediately.
    pub fn update_parameters(&mut self, params: StabilizerParams) {
        self.params = params.validated();
        self.history.set_capacity(self.params.smoothing_radius);
    }

    /// Clears all per-stream state and returns to the initializing state.
    pub fn reset(&mut self) {
        self.first_frame = true;
        self.prev_gray.reset(0, 0);
        self.prev_points.clear();
        self.history.clear();
        self.metrics = PerformanceMetrics::default();
        self.metrics.status = if self.initialized {
            StabilizerStatus::Initializing
        } else {
            StabilizerStatus::Inactive
        };
        self.consecutive_failures = 0;
    }

    /// Snapshot of the performance metrics.
    pub fn metrics(&self) -> PerformanceMetrics {
        self.metrics
    }

    /// The active (clamped) parameter set.
    pub fn current_params(&self) -> StabilizerParams {
        self.params.clone()
    }

    /// The most recent fault description; empty when nothing has failed.
    pub fn last_error(&self) -> &str {
        &self.last_error
    }

    /// Borrow of the transform history for classification.
    pub fn transform_history(&self) -> &TransformHistory {
        &self.history
    }

    /// Marks the engine failed after a fault absorbed above this layer.
    pub(crate) fn mark_failed(&mut self) {
        self.metrics.status = StabilizerStatus::Failed;
        self.metrics.error_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{PixelFormat, PlaneViewMut};

    pub(crate) fn bgra_scene(width: usize, height: usize, shift: (i64, i64)) -> Vec<u8> {
        let mut data = vec![0u8; width * height * 4];
        for px in data.chunks_exact_mut(4) {
            px.copy_from_slice(&[128, 128, 128, 255]);
        }
        for &(sx, sy) in &[(100i64, 100i64), (200, 200), (300, 300)] {
            let sx = sx + shift.0;
            let sy = sy + shift.1;
            for y in sy.max(0)..(sy + 20).min(height as i64) {
                for x in sx.max(0)..(sx + 20).min(width as i64) {
                    let idx = (y as usize * width + x as usize) * 4;
                    data[idx..idx + 3].copy_from_slice(&[255, 255, 255]);
                }
            }
        }
        data
    }

    fn view(data: &mut [u8], width: usize, height: usize) -> FrameViewMut<'_> {
        let stride = width * 4;
        FrameViewMut::new(
            width,
            height,
            PixelFormat::Bgra,
            vec![PlaneViewMut { data, stride }],
            0,
        )
        .unwrap()
    }

    #[test]
    fn initialize_rejects_out_of_range_dimensions() {
        let mut core = StabilizerCore::new();
        assert!(!core.initialize(16, 16, StabilizerParams::default()));
        assert_eq!(StabilizerStatus::Inactive, core.metrics().status);
        assert!(core.last_error().contains("minimum"));

        assert!(!core.initialize(31, 480, StabilizerParams::default()));
        assert!(!core.initialize(640, 16385, StabilizerParams::default()));
        assert!(core.initialize(32, 32, StabilizerParams::default()));
        assert_eq!(StabilizerStatus::Initializing, core.metrics().status);
    }

    #[test]
    fn initialize_clamps_parameters() {
        let mut core = StabilizerCore::new();
        let mut params = StabilizerParams::default();
        params.feature_count = 0;
        params.smoothing_radius = 1000;
        assert!(core.initialize(640, 480, params));
        let active = core.current_params();
        assert_eq!(50, active.feature_count);
        assert_eq!(200, active.smoothing_radius);
    }

    #[test]
    fn disabled_engine_passes_frames_through_untouched() {
        let mut core = StabilizerCore::new();
        let mut params = StabilizerParams::default();
        params.enabled = false;
        assert!(core.initialize(640, 480, params));

        let mut data = bgra_scene(640, 480, (0, 0));
        let snapshot = data.clone();
        let mut frame = view(&mut data, 640, 480);
        assert_eq!(FrameResult::Passthrough, core.process_frame(&mut frame));
        assert_eq!(0, core.metrics().frame_count);
        assert_eq!(snapshot, data);
    }

    #[test]
    fn first_frame_is_passthrough_and_seeds_identity() {
        let mut core = StabilizerCore::new();
        assert!(core.initialize(640, 480, StabilizerParams::default()));
        let mut data = bgra_scene(640, 480, (0, 0));
        let snapshot = data.clone();
        let mut frame = view(&mut data, 640, 480);
        assert_eq!(FrameResult::Passthrough, core.process_frame(&mut frame));
        assert_eq!(1, core.metrics().frame_count);
        assert_eq!(1, core.transform_history().len());
        assert!(core.transform_history().latest().unwrap().is_identity());
        assert_eq!(snapshot, data);
    }

    #[test]
    fn featureless_first_frame_keeps_initializing() {
        let mut core = StabilizerCore::new();
        assert!(core.initialize(640, 480, StabilizerParams::default()));
        let mut data = vec![10u8; 640 * 480 * 4];
        let mut frame = view(&mut data, 640, 480);
        assert_eq!(FrameResult::Passthrough, core.process_frame(&mut frame));
        assert_eq!(StabilizerStatus::Initializing, core.metrics().status);
        assert_eq!(0, core.transform_history().len());
    }

    #[test]
    fn static_stream_goes_active_and_stays_byte_identical() {
        let mut core = StabilizerCore::new();
        assert!(core.initialize(640, 480, StabilizerParams::default()));
        for i in 0..5 {
            let mut data = bgra_scene(640, 480, (0, 0));
            let snapshot = data.clone();
            let mut frame = view(&mut data, 640, 480);
            let result = core.process_frame(&mut frame);
            if i > 0 {
                assert_eq!(FrameResult::Stabilized, result);
                assert_eq!(StabilizerStatus::Active, core.metrics().status);
            }
            assert_eq!(snapshot, data, "frame {} changed", i);
        }
        assert!(core.transform_history().latest().unwrap().is_identity());
    }

    #[test]
    fn undersized_frame_fails_without_poisoning_the_engine() {
        let mut core = StabilizerCore::new();
        assert!(core.initialize(640, 480, StabilizerParams::default()));
        let mut small = vec![0u8; 16 * 16 * 4];
        let mut frame = view(&mut small, 16, 16);
        assert_eq!(FrameResult::Passthrough, core.process_frame(&mut frame));
        assert_eq!(StabilizerStatus::Failed, core.metrics().status);
        assert!(!core.last_error().is_empty());

        // A good frame still processes afterwards.
        let mut data = bgra_scene(640, 480, (0, 0));
        let mut frame = view(&mut data, 640, 480);
        assert_eq!(FrameResult::Passthrough, core.process_frame(&mut frame));
        assert_eq!(StabilizerStatus::Initializing, core.metrics().status);
    }

    #[test]
    fn reset_returns_to_initializing() {
        let mut core = StabilizerCore::new();
        assert!(core.initialize(640, 480, StabilizerParams::default()));
        for _ in 0..3 {
            let mut data = bgra_scene(640, 480, (0, 0));
            let mut frame = view(&mut data, 640, 480);
            core.process_frame(&mut frame);
        }
        core.reset();
        assert_eq!(StabilizerStatus::Initializing, core.metrics().status);
        assert_eq!(0, core.metrics().frame_count);
        assert_eq!(0, core.transform_history().len());
    }

    #[test]
    fn shrinking_radius_truncates_history() {
        let mut core = StabilizerCore::new();
        assert!(core.initialize(640, 480, StabilizerParams::default()));
        for i in 0..8 {
            let mut data = bgra_scene(640, 480, (i, 0));
            let mut frame = view(&mut data, 640, 480);
            core.process_frame(&mut frame);
        }
        assert!(core.transform_history().len() > 2);
        let mut params = core.current_params();
        params.smoothing_radius = 2;
        core.update_parameters(params);
        assert!(core.transform_history().len() <= 2);
    }
}
