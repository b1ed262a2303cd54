//! Adaptive parameter control.
//!
//! Sits one layer above the engine: after each stabilized frame it classifies
//! the recent motion and, when the regime changes, retargets the engine's
//! tuning parameters. Transitions are linearly interpolated per field so a
//! regime flip never yanks the pipeline, except when leaving the cold-start
//! `Static` regime, where the target is adopted outright.

use crate::classify::{MotionClassifier, MotionMetrics, MotionType};
use crate::engine::{FrameResult, StabilizerCore};
use crate::frame::FrameViewMut;
use crate::metrics::PerformanceMetrics;
use crate::params::StabilizerParams;
use log::debug;

/// Per-regime parameter targets plus the transition pace.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AdaptiveConfig {
    /// Smoothing radius while static.
    pub static_smoothing: usize,
    /// Correction limit while static.
    pub static_correction: f32,
    /// Feature budget while static.
    pub static_features: usize,
    /// Corner quality while static.
    pub static_quality: f32,

    /// Smoothing radius for slow motion.
    pub slow_smoothing: usize,
    /// Correction limit for slow motion.
    pub slow_correction: f32,
    /// Feature budget for slow motion.
    pub slow_features: usize,
    /// Corner quality for slow motion.
    pub slow_quality: f32,

    /// Smoothing radius for fast motion.
    pub fast_smoothing: usize,
    /// Correction limit for fast motion.
    pub fast_correction: f32,
    /// Feature budget for fast motion.
    pub fast_features: usize,
    /// Corner quality for fast motion.
    pub fast_quality: f32,

    /// Smoothing radius for camera shake.
    pub shake_smoothing: usize,
    /// Correction limit for camera shake.
    pub shake_correction: f32,
    /// Feature budget for camera shake.
    pub shake_features: usize,
    /// Corner quality for camera shake.
    pub shake_quality: f32,

    /// Smoothing radius for pans and zooms.
    pub pan_smoothing: usize,
    /// Correction limit for pans and zooms.
    pub pan_correction: f32,
    /// Feature budget for pans and zooms.
    pub pan_features: usize,
    /// Corner quality for pans and zooms.
    pub pan_quality: f32,

    /// Per-frame interpolation fraction for parameter transitions, in (0, 1].
    pub transition_rate: f64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        AdaptiveConfig {
            static_smoothing: 8,
            static_correction: 15.0,
            static_features: 120,
            static_quality: 0.015,
            slow_smoothing: 25,
            slow_correction: 25.0,
            slow_features: 175,
            slow_quality: 0.010,
            fast_smoothing: 50,
            fast_correction: 35.0,
            fast_features: 250,
            fast_quality: 0.010,
            shake_smoothing: 65,
            shake_correction: 45.0,
            shake_features: 350,
            shake_quality: 0.005,
            pan_smoothing: 15,
            pan_correction: 20.0,
            pan_features: 225,
            pan_quality: 0.010,
            transition_rate: 0.1,
        }
    }
}

// Tracking success rate below which each regime refreshes its feature set.
fn refresh_threshold_for(motion: MotionType) -> f32 {
    match motion {
        MotionType::Static => 0.9,
        MotionType::SlowMotion => 0.7,
        MotionType::FastMotion => 0.5,
        MotionType::CameraShake => 0.4,
        MotionType::PanZoom => 0.6,
    }
}

/// Per-field linear interpolation between two parameter sets. Integer fields
/// round to nearest; boolean and categorical fields take the target's value.
fn blend_params(prev: &StabilizerParams, target: &StabilizerParams, rate: f64) -> StabilizerParams {
    let lerp_f32 = |a: f32, b: f32| a + (b - a) * rate as f32;
    let lerp_usize =
        |a: usize, b: usize| (a as f64 + (b as f64 - a as f64) * rate).round() as usize;
    StabilizerParams {
        smoothing_radius: lerp_usize(prev.smoothing_radius, target.smoothing_radius),
        max_correction: lerp_f32(prev.max_correction, target.max_correction),
        feature_count: lerp_usize(prev.feature_count, target.feature_count),
        quality_level: lerp_f32(prev.quality_level, target.quality_level),
        ..target.clone()
    }
}

/// The engine plus its motion classifier and parameter controller.
///
/// The classifier borrows the engine's transform history per call and the
/// controller owns no back-reference; composition happens here, so neither
/// lower component knows about the other.
pub struct AdaptiveStabilizer {
    core: StabilizerCore,
    classifier: MotionClassifier,
    config: AdaptiveConfig,
    adaptive_enabled: bool,
    initialized: bool,
    previous_type: MotionType,
    previous_params: StabilizerParams,
    last_error: String,
}

impl Default for AdaptiveStabilizer {
    fn default() -> Self {
        AdaptiveStabilizer::new(AdaptiveConfig::default())
    }
}

impl AdaptiveStabilizer {
    /// Creates an adaptive engine with the given regime targets.
    pub fn new(config: AdaptiveConfig) -> Self {
        AdaptiveStabilizer {
            core: StabilizerCore::new(),
            classifier: MotionClassifier::new(30, 1.0),
            config,
            adaptive_enabled: true,
            initialized: false,
            previous_type: MotionType::Static,
            previous_params: StabilizerParams::default(),
            last_error: String::new(),
        }
    }

    /// Wraps an existing engine (useful for custom detector/tracker
    /// backends).
    pub fn with_core(core: StabilizerCore, config: AdaptiveConfig) -> Self {
        AdaptiveStabilizer {
            core,
            ..AdaptiveStabilizer::new(config)
        }
    }

    /// Initializes the underlying engine. See [`StabilizerCore::initialize`].
    pub fn initialize(&mut self, width: usize, height: usize, params: StabilizerParams) -> bool {
        if !self.core.initialize(width, height, params) {
            self.last_error = self.core.last_error().to_string();
            return false;
        }
        self.initialized = true;
        self.last_error.clear();
        self.previous_params = self.core.current_params();
        self.classifier
            .set_sensitivity(self.previous_params.motion_sensitivity as f64);
        true
    }

    /// Stabilizes one frame, then lets the controller react to the motion
    /// the frame revealed. The parameter retarget is observed on the next
    /// frame, never the current one.
    pub fn process_frame(&mut self, frame: &mut FrameViewMut<'_>) -> FrameResult {
        if !self.initialized {
            return FrameResult::Passthrough;
        }
        let result = self.core.process_frame(frame);
        if self.adaptive_enabled && result == FrameResult::Stabilized {
            self.update_adaptive_parameters();
        }
        result
    }

    /// Forwards a host parameter update to the engine.
    pub fn update_parameters(&mut self, params: StabilizerParams) {
        if self.initialized {
            self.core.update_parameters(params);
            self.previous_params = self.core.current_params();
            self.classifier
                .set_sensitivity(self.previous_params.motion_sensitivity as f64);
        }
    }

    /// Resets the engine and the controller's regime memory.
    pub fn reset(&mut self) {
        self.core.reset();
        self.previous_type = MotionType::Static;
        self.previous_params = self.core.current_params();
    }

    /// Whether the engine is initialized and ready for frames.
    pub fn is_ready(&self) -> bool {
        self.initialized && self.core.is_ready()
    }

    /// The most recent fault, from this layer or the engine.
    pub fn last_error(&self) -> &str {
        if self.last_error.is_empty() {
            self.core.last_error()
        } else {
            &self.last_error
        }
    }

    /// Engine metrics snapshot.
    pub fn metrics(&self) -> PerformanceMetrics {
        self.core.metrics()
    }

    /// The engine's active parameter set.
    pub fn current_params(&self) -> StabilizerParams {
        self.core.current_params()
    }

    /// Borrow of the engine's transform history.
    pub fn transform_history(&self) -> &crate::smooth::TransformHistory {
        self.core.transform_history()
    }

    /// Turns the adaptive controller on or off; the engine itself keeps
    /// running either way.
    pub fn set_adaptive_enabled(&mut self, enabled: bool) {
        self.adaptive_enabled = enabled;
    }

    /// Whether the adaptive controller is active.
    pub fn is_adaptive_enabled(&self) -> bool {
        self.adaptive_enabled
    }

    /// The regime from the most recent classification.
    pub fn current_motion_type(&self) -> MotionType {
        self.classifier.current_type()
    }

    /// The metrics from the most recent classification.
    pub fn current_motion_metrics(&self) -> &MotionMetrics {
        self.classifier.current_metrics()
    }

    /// Adjusts the classifier sensitivity directly.
    pub fn set_motion_sensitivity(&mut self, sensitivity: f64) {
        self.classifier.set_sensitivity(sensitivity);
    }

    /// The classifier's current sensitivity.
    pub fn motion_sensitivity(&self) -> f64 {
        self.classifier.sensitivity()
    }

    /// Replaces the regime target table.
    pub fn set_config(&mut self, config: AdaptiveConfig) {
        self.config = config;
    }

    /// The active regime target table.
    pub fn config(&self) -> &AdaptiveConfig {
        &self.config
    }

    pub(crate) fn record_panic(&mut self, message: String) {
        self.last_error = message;
        self.core.mark_failed();
    }

    fn update_adaptive_parameters(&mut self) {
        let history = self.core.transform_history();
        if history.len() < 5 {
            return;
        }
        let current = self.classifier.classify(history);
        if current == self.previous_type {
            return;
        }

        debug!(
            "motion regime changed: {} -> {}",
            self.previous_type, current
        );
        let target = self.target_params_for(current);
        let next = if self.previous_type != MotionType::Static {
            blend_params(&self.previous_params, &target, self.config.transition_rate)
        } else {
            target
        };
        self.core.update_parameters(next);
        self.previous_params = self.core.current_params();
        self.previous_type = current;
    }

    fn target_params_for(&self, motion: MotionType) -> StabilizerParams {
        let mut params = self.core.current_params();
        let c = &self.config;
        let (smoothing, correction, features, quality) = match motion {
            MotionType::Static => (
                c.static_smoothing,
                c.static_correction,
                c.static_features,
                c.static_quality,
            ),
            MotionType::SlowMotion => (
                c.slow_smoothing,
                c.slow_correction,
                c.slow_features,
                c.slow_quality,
            ),
            MotionType::FastMotion => (
                c.fast_smoothing,
                c.fast_correction,
                c.fast_features,
                c.fast_quality,
            ),
            MotionType::CameraShake => (
                c.shake_smoothing,
                c.shake_correction,
                c.shake_features,
                c.shake_quality,
            ),
            MotionType::PanZoom => (
                c.pan_smoothing,
                c.pan_correction,
                c.pan_features,
                c.pan_quality,
            ),
        };
        params.smoothing_radius = smoothing;
        params.max_correction = correction;
        params.feature_count = features;
        params.quality_level = quality;
        params.feature_refresh_threshold = refresh_threshold_for(motion);
        params
    }
}
