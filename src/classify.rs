//! Statistical classification of recent camera motion.
//!
//! The classifier looks at a window of recent inter-frame transforms and
//! labels the motion as one of five regimes. It holds no reference to the
//! engine's history; each call borrows the transform sequence.
//!
//! The decision tree is evaluated top-down and the first match wins. Note
//! that the fast-motion band is tested before the slow-motion band even
//! though both claim the `[slow, fast)` range; the band labels were settled
//! empirically and the ordering is part of the observable behavior.

use crate::smooth::TransformHistory;
use crate::transform::Transform;
use itertools::Itertools;
use log::{error, warn};
use std::fmt;

/// One of the recognized motion regimes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionType {
    /// Minimal movement.
    Static,
    /// Gentle, possibly meandering movement.
    SlowMotion,
    /// Rapid movement.
    FastMotion,
    /// High-frequency jitter.
    CameraShake,
    /// Systematic directional motion.
    PanZoom,
}

impl fmt::Display for MotionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MotionType::Static => "Static",
            MotionType::SlowMotion => "Slow Motion",
            MotionType::FastMotion => "Fast Motion",
            MotionType::CameraShake => "Camera Shake",
            MotionType::PanZoom => "Pan/Zoom",
        };
        f.write_str(name)
    }
}

/// Derived statistics for one classification window.
#[derive(Debug, Clone, Copy, Default)]
pub struct MotionMetrics {
    /// Average per-frame motion magnitude.
    pub mean_magnitude: f64,
    /// Variance of the per-frame magnitudes.
    pub variance_magnitude: f64,
    /// Standard deviation of the translation vectors around their mean.
    pub directional_variance: f64,
    /// Share of second-difference energy in the magnitude signal.
    pub high_frequency_ratio: f64,
    /// Mean cosine between consecutive translation directions.
    pub consistency_score: f64,
    /// Number of transforms analyzed.
    pub transform_count: usize,
}

/// The canonical decision thresholds, immutable after construction.
///
/// Sensitivity scales the magnitude and frequency thresholds up and the
/// consistency threshold down, each clamped to its physical range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionThresholds {
    /// Mean magnitude below which motion can be Static.
    pub static_threshold: f64,
    /// Mean magnitude at which motion stops being slow.
    pub slow_threshold: f64,
    /// Mean magnitude at which the fast band ends.
    pub fast_threshold: f64,
    /// Magnitude variance cap for the Static label.
    pub variance_threshold: f64,
    /// High-frequency energy ratio above which motion is shake.
    pub high_frequency_threshold: f64,
    /// Consistency score above which slow motion reads as a pan.
    pub consistency_threshold: f64,
}

impl Default for MotionThresholds {
    fn default() -> Self {
        MotionThresholds {
            static_threshold: 6.0,
            slow_threshold: 15.0,
            fast_threshold: 40.0,
            variance_threshold: 3.0,
            high_frequency_threshold: 0.70,
            consistency_threshold: 0.96,
        }
    }
}

/// Combined per-frame motion magnitude: translation distance plus weighted
/// scale and rotation deviations.
pub fn transform_magnitude(t: &Transform) -> f64 {
    let translation = (t.tx * t.tx + t.ty * t.ty).sqrt();
    let scale_deviation = (t.a - 1.0).abs() + (t.d - 1.0).abs();
    let rotation_deviation = t.b.atan2(t.a).abs();
    translation + scale_deviation * 100.0 + rotation_deviation * 200.0
}

/// Labels windows of recent transforms; see the module docs for the tree.
#[derive(Debug, Clone)]
pub struct MotionClassifier {
    window_size: usize,
    sensitivity: f64,
    thresholds: MotionThresholds,
    current_type: MotionType,
    current_metrics: MotionMetrics,
}

impl Default for MotionClassifier {
    fn default() -> Self {
        MotionClassifier::new(30, 1.0)
    }
}

impl MotionClassifier {
    /// Creates a classifier with the canonical thresholds.
    pub fn new(window_size: usize, sensitivity: f64) -> Self {
        MotionClassifier::with_thresholds(window_size, sensitivity, MotionThresholds::default())
    }

    /// Creates a classifier with an explicit threshold set.
    pub fn with_thresholds(
        window_size: usize,
        sensitivity: f64,
        thresholds: MotionThresholds,
    ) -> Self {
        MotionClassifier {
            window_size: window_size.max(1),
            sensitivity,
            thresholds,
            current_type: MotionType::Static,
            current_metrics: MotionMetrics::default(),
        }
    }

    /// The label from the most recent classification.
    pub fn current_type(&self) -> MotionType {
        self.current_type
    }

    /// The metrics from the most recent classification.
    pub fn current_metrics(&self) -> &MotionMetrics {
        &self.current_metrics
    }

    /// Adjusts the sensitivity scalar.
    pub fn set_sensitivity(&mut self, sensitivity: f64) {
        self.sensitivity = sensitivity;
    }

    /// The current sensitivity scalar.
    pub fn sensitivity(&self) -> f64 {
        self.sensitivity
    }

    /// Classifies the trailing window of `history`.
    ///
    /// Idempotent for a given window; an empty history reads as Static.
    pub fn classify(&mut self, history: &TransformHistory) -> MotionType {
        if history.is_empty() {
            self.current_type = MotionType::Static;
            self.current_metrics = MotionMetrics::default();
            return self.current_type;
        }
        let skip = history.len().saturating_sub(self.window_size);
        let window: Vec<Transform> = history.iter().skip(skip).copied().collect();
        self.current_metrics = calculate_metrics(&window);
        self.current_type = self.classify_from_metrics(&self.current_metrics);
        self.current_type
    }

    fn classify_from_metrics(&self, m: &MotionMetrics) -> MotionType {
        let mut sensitivity = self.sensitivity;
        if sensitivity <= 0.0 {
            error!("invalid motion sensitivity {}, falling back to 1.0", sensitivity);
            sensitivity = 1.0;
        }
        if sensitivity > 100.0 {
            warn!("motion sensitivity {} too high, clamping to 100", sensitivity);
            sensitivity = 100.0;
        }

        let t = &self.thresholds;
        let static_t = (t.static_threshold * sensitivity).max(0.0).min(100.0);
        let slow_t = (t.slow_threshold * sensitivity).max(0.0).min(100.0);
        let fast_t = (t.fast_threshold * sensitivity).max(0.0).min(100.0);
        let variance_t = (t.variance_threshold * sensitivity).max(0.0).min(100.0);
        let high_freq_t = (t.high_frequency_threshold * sensitivity).max(0.0).min(1.0);
        let consistency_t = (t.consistency_threshold / sensitivity).max(0.0).min(1.0);

        if m.mean_magnitude < static_t && m.variance_magnitude < variance_t {
            return MotionType::Static;
        }
        if m.high_frequency_ratio > high_freq_t {
            return MotionType::CameraShake;
        }
        if m.mean_magnitude >= slow_t && m.mean_magnitude < fast_t {
            return MotionType::FastMotion;
        }
        if m.mean_magnitude >= static_t && m.mean_magnitude < slow_t {
            if m.consistency_score > consistency_t && m.directional_variance < 2.0 {
                return MotionType::PanZoom;
            }
            return MotionType::SlowMotion;
        }
        MotionType::SlowMotion
    }
}

fn calculate_metrics(window: &[Transform]) -> MotionMetrics {
    let mut metrics = MotionMetrics {
        transform_count: window.len(),
        ..MotionMetrics::default()
    };
    if window.is_empty() {
        return metrics;
    }
    let n = window.len() as f64;
    let magnitudes: Vec<f64> = window.iter().map(transform_magnitude).collect();

    metrics.mean_magnitude = magnitudes.iter().sum::<f64>() / n;
    if window.len() >= 2 {
        metrics.variance_magnitude = magnitudes
            .iter()
            .map(|m| (m - metrics.mean_magnitude) * (m - metrics.mean_magnitude))
            .sum::<f64>()
            / n;
    }

    let mean_dx = window.iter().map(|t| t.tx).sum::<f64>() / n;
    let mean_dy = window.iter().map(|t| t.ty).sum::<f64>() / n;
    let var_dx = window
        .iter()
        .map(|t| (t.tx - mean_dx) * (t.tx - mean_dx))
        .sum::<f64>()
        / n;
    let var_dy = window
        .iter()
        .map(|t| (t.ty - mean_dy) * (t.ty - mean_dy))
        .sum::<f64>()
        / n;
    metrics.directional_variance = (var_dx + var_dy).sqrt();

    metrics.consistency_score = consistency_score(window);
    metrics.high_frequency_ratio = high_frequency_ratio(&magnitudes);
    metrics
}

/// Mean cosine between consecutive translation vectors, skipping pairs where
/// either vector is numerically zero.
fn consistency_score(window: &[Transform]) -> f64 {
    if window.len() < 2 {
        return if window.is_empty() { 0.0 } else { 1.0 };
    }
    let mut dot_sum = 0.0;
    let mut pairs = 0.0;
    for (prev, curr) in window.iter().tuple_windows() {
        let mag_prev = (prev.tx * prev.tx + prev.ty * prev.ty).sqrt();
        let mag_curr = (curr.tx * curr.tx + curr.ty * curr.ty).sqrt();
        if mag_prev > 0.001 && mag_curr > 0.001 {
            dot_sum += (prev.tx * curr.tx + prev.ty * curr.ty) / (mag_prev * mag_curr);
            pairs += 1.0;
        }
    }
    if pairs > 0.0 {
        dot_sum / pairs
    } else {
        0.0
    }
}

/// Second-difference energy share of the magnitude signal. Windows shorter
/// than six frames carry too little signal and read as zero.
fn high_frequency_ratio(magnitudes: &[f64]) -> f64 {
    if magnitudes.len() < 6 {
        return 0.0;
    }
    let mut high = 0.0;
    let mut low = 0.0;
    for i in 2..magnitudes.len() {
        let diff_1 = magnitudes[i] - magnitudes[i - 1];
        let diff_2 = magnitudes[i - 1] - magnitudes[i - 2];
        high += (diff_1 - diff_2).abs();
        low += (magnitudes[i] - magnitudes[i - 2]).abs() * 0.5;
    }
    let total = high + low;
    if total > 0.001 {
        high / total
    } else {
        0.0
    }
}
