//! Engine status and per-frame performance metrics.

/// Lifecycle state of the stabilization engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StabilizerStatus {
    /// Not initialized, or disabled.
    Inactive,
    /// Waiting for a first frame with trackable features.
    Initializing,
    /// Tracking and stabilizing normally.
    Active,
    /// Recent tracking failures; frames pass through while recovering.
    Degraded,
    /// Rebuilding the feature set after repeated tracking failures.
    ErrorRecovery,
    /// A frame-level fault occurred; frames pass through until reset.
    Failed,
}

impl Default for StabilizerStatus {
    fn default() -> Self {
        StabilizerStatus::Inactive
    }
}

// Smoothing factor for the processing-time moving average.
const PROCESSING_TIME_EMA_ALPHA: f64 = 0.1;

/// Monotonically updated snapshot of engine health.
#[derive(Debug, Clone, Copy, Default)]
pub struct PerformanceMetrics {
    /// Frames accepted by `process_frame` while enabled.
    pub frame_count: u64,
    /// Exponential moving average of per-frame processing time, in seconds.
    pub avg_processing_time: f64,
    /// Features carried by the tracker after the last frame.
    pub tracked_features: usize,
    /// Tracking success rate of the last tracked frame.
    pub tracking_success_rate: f32,
    /// Inverse spread of recent transform magnitudes; 1.0 is perfectly
    /// steady, lower values mean jittery motion.
    pub transform_stability: f32,
    /// Current engine state.
    pub status: StabilizerStatus,
    /// Number of per-frame faults absorbed since initialization.
    pub error_count: u32,
}

impl PerformanceMetrics {
    /// Folds one frame's processing time into the moving average.
    pub(crate) fn record_frame(&mut self, seconds: f64) {
        self.frame_count += 1;
        if self.frame_count == 1 {
            self.avg_processing_time = seconds;
        } else {
            self.avg_processing_time +=
                PROCESSING_TIME_EMA_ALPHA * (seconds - self.avg_processing_time);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_frame_seeds_the_average() {
        let mut m = PerformanceMetrics::default();
        m.record_frame(0.008);
        assert_eq!(1, m.frame_count);
        assert!((m.avg_processing_time - 0.008).abs() < 1e-12);
    }

    #[test]
    fn average_tracks_recent_frames() {
        let mut m = PerformanceMetrics::default();
        for _ in 0..200 {
            m.record_frame(0.004);
        }
        assert!((m.avg_processing_time - 0.004).abs() < 1e-6);
        for _ in 0..200 {
            m.record_frame(0.012);
        }
        assert!((m.avg_processing_time - 0.012).abs() < 1e-4);
    }
}
