//! Offline search for motion-classification thresholds.
//!
//! The classifier's canonical thresholds were settled empirically. This
//! module keeps that process reproducible: it evaluates a threshold set
//! against a battery of synthetic motion sequences with known labels, and
//! searches the threshold space by grid or by deterministic random sampling.
//! Nothing here runs on the per-frame path; it is a calibration tool.

use crate::classify::{MotionClassifier, MotionMetrics, MotionThresholds, MotionType};
use crate::estimate::SampleRng;
use crate::smooth::TransformHistory;
use crate::transform::Transform;

/// One labeled synthetic motion sequence.
#[derive(Debug, Clone)]
struct TestCase {
    name: &'static str,
    transforms: Vec<Transform>,
    expected: MotionType,
}

/// Outcome of evaluating one test case under a threshold set.
#[derive(Debug, Clone)]
pub struct CaseResult {
    /// Name of the synthetic sequence.
    pub name: &'static str,
    /// Whether the predicted label matched the expected one.
    pub passed: bool,
    /// The label the classifier produced.
    pub predicted: MotionType,
    /// The label the sequence was built to represent.
    pub expected: MotionType,
    /// The window metrics the classifier derived.
    pub metrics: MotionMetrics,
}

/// Result of a threshold search.
#[derive(Debug, Clone)]
pub struct TuningReport {
    /// The best-scoring threshold set found.
    pub best: MotionThresholds,
    /// Fraction of test cases the best set labels correctly.
    pub best_accuracy: f64,
    /// Number of threshold combinations evaluated.
    pub iterations: usize,
    /// Per-case outcomes under the best set.
    pub results: Vec<CaseResult>,
}

/// Inclusive search range for one threshold.
#[derive(Debug, Clone, Copy)]
struct SearchRange {
    min: f64,
    max: f64,
}

impl SearchRange {
    fn at(&self, step: usize, steps: usize) -> f64 {
        if steps <= 1 {
            return self.min;
        }
        self.min + (self.max - self.min) * step as f64 / (steps - 1) as f64
    }

    fn sample(&self, rng: &mut SampleRng) -> f64 {
        let t = (rng.next() % 10_000) as f64 / 10_000.0;
        self.min + (self.max - self.min) * t
    }
}

/// Searches threshold space against synthetic labeled motion.
#[derive(Debug, Clone)]
pub struct ThresholdTuner {
    range_static: SearchRange,
    range_slow: SearchRange,
    range_fast: SearchRange,
    range_variance: SearchRange,
    range_high_freq: SearchRange,
    range_consistency: SearchRange,
    cases: Vec<TestCase>,
}

impl Default for ThresholdTuner {
    fn default() -> Self {
        ThresholdTuner::new()
    }
}

impl ThresholdTuner {
    /// Creates a tuner with ranges bracketing the canonical thresholds and
    /// the standard synthetic test battery.
    pub fn new() -> Self {
        ThresholdTuner {
            range_static: SearchRange { min: 2.0, max: 10.0 },
            range_slow: SearchRange { min: 5.0, max: 25.0 },
            range_fast: SearchRange { min: 30.0, max: 50.0 },
            range_variance: SearchRange { min: 1.0, max: 5.0 },
            range_high_freq: SearchRange { min: 0.5, max: 0.9 },
            range_consistency: SearchRange { min: 0.92, max: 1.0 },
            cases: generate_test_cases(),
        }
    }

    /// Overrides the search ranges, `(min, max)` per threshold in the order
    /// static, slow, fast, variance, high-frequency, consistency.
    pub fn set_search_ranges(
        &mut self,
        static_range: (f64, f64),
        slow_range: (f64, f64),
        fast_range: (f64, f64),
        variance_range: (f64, f64),
        high_freq_range: (f64, f64),
        consistency_range: (f64, f64),
    ) {
        self.range_static = SearchRange { min: static_range.0, max: static_range.1 };
        self.range_slow = SearchRange { min: slow_range.0, max: slow_range.1 };
        self.range_fast = SearchRange { min: fast_range.0, max: fast_range.1 };
        self.range_variance = SearchRange { min: variance_range.0, max: variance_range.1 };
        self.range_high_freq = SearchRange { min: high_freq_range.0, max: high_freq_range.1 };
        self.range_consistency = SearchRange {
            min: consistency_range.0,
            max: consistency_range.1,
        };
    }

    /// Evaluates one threshold set against every test case.
    pub fn evaluate(&self, thresholds: &MotionThresholds) -> Vec<CaseResult> {
        self.cases
            .iter()
            .map(|case| {
                let mut classifier = MotionClassifier::with_thresholds(30, 1.0, *thresholds);
                let mut history = TransformHistory::new(case.transforms.len().max(1));
                for t in &case.transforms {
                    history.push(*t);
                }
                let predicted = classifier.classify(&history);
                CaseResult {
                    name: case.name,
                    passed: predicted == case.expected,
                    predicted,
                    expected: case.expected,
                    metrics: *classifier.current_metrics(),
                }
            })
            .collect()
    }

    /// Fraction of passed cases in an evaluation.
    pub fn accuracy(results: &[CaseResult]) -> f64 {
        if results.is_empty() {
            return 0.0;
        }
        results.iter().filter(|r| r.passed).count() as f64 / results.len() as f64
    }

    /// Exhaustive grid search with `steps` samples per threshold.
    ///
    /// The grid has `steps^6` combinations; keep `steps` small.
    pub fn tune_grid_search(&self, steps: usize) -> TuningReport {
        let steps = steps.max(1);
        let mut best = MotionThresholds::default();
        let mut best_accuracy = -1.0;
        let mut iterations = 0;
        for s0 in 0..steps {
            for s1 in 0..steps {
                for s2 in 0..steps {
                    for s3 in 0..steps {
                        for s4 in 0..steps {
                            for s5 in 0..steps {
                                let candidate = MotionThresholds {
                                    static_threshold: self.range_static.at(s0, steps),
                                    slow_threshold: self.range_slow.at(s1, steps),
                                    fast_threshold: self.range_fast.at(s2, steps),
                                    variance_threshold: self.range_variance.at(s3, steps),
                                    high_frequency_threshold: self.range_high_freq.at(s4, steps),
                                    consistency_threshold: self.range_consistency.at(s5, steps),
                                };
                                iterations += 1;
                                let accuracy =
                                    ThresholdTuner::accuracy(&self.evaluate(&candidate));
                                if accuracy > best_accuracy {
                                    best_accuracy = accuracy;
                                    best = candidate;
                                }
                            }
                        }
                    }
                }
            }
        }
        TuningReport {
            results: self.evaluate(&best),
            best,
            best_accuracy,
            iterations,
        }
    }

    /// Deterministic random search over the configured ranges.
    pub fn tune_random_search(&self, iterations: usize) -> TuningReport {
        let mut rng = SampleRng::new(0x5851_F42D_4C95_7F2D ^ iterations as u64);
        let mut best = MotionThresholds::default();
        let mut best_accuracy = ThresholdTuner::accuracy(&self.evaluate(&best));
        for _ in 0..iterations {
            let candidate = MotionThresholds {
                static_threshold: self.range_static.sample(&mut rng),
                slow_threshold: self.range_slow.sample(&mut rng),
                fast_threshold: self.range_fast.sample(&mut rng),
                variance_threshold: self.range_variance.sample(&mut rng),
                high_frequency_threshold: self.range_high_freq.sample(&mut rng),
                consistency_threshold: self.range_consistency.sample(&mut rng),
            };
            let accuracy = ThresholdTuner::accuracy(&self.evaluate(&candidate));
            if accuracy > best_accuracy {
                best_accuracy = accuracy;
                best = candidate;
            }
        }
        TuningReport {
            results: self.evaluate(&best),
            best,
            best_accuracy,
            iterations,
        }
    }
}

fn generate_test_cases() -> Vec<TestCase> {
    let mut cases = Vec::new();

    cases.push(TestCase {
        name: "static scene",
        transforms: vec![Transform::identity(); 30],
        expected: MotionType::Static,
    });

    let meander = [
        Transform::translation(8.0, 0.0),
        Transform::translation(0.0, 8.0),
        Transform::translation(-8.0, 0.0),
        Transform::translation(0.0, -8.0),
    ];
    cases.push(TestCase {
        name: "slow meander",
        transforms: meander.iter().cycle().take(28).copied().collect(),
        expected: MotionType::SlowMotion,
    });

    cases.push(TestCase {
        name: "fast pan",
        transforms: vec![Transform::translation(20.0, 0.0); 30],
        expected: MotionType::FastMotion,
    });

    let mut shake = Vec::new();
    for i in 0..30 {
        let tx = if i % 2 == 0 { 20.0 } else { -20.0 };
        let ty = match i % 3 {
            0 => 18.0,
            1 => 0.0,
            _ => -18.0,
        };
        shake.push(Transform::translation(tx, ty));
    }
    cases.push(TestCase {
        name: "camera shake",
        transforms: shake,
        expected: MotionType::CameraShake,
    });

    cases.push(TestCase {
        name: "steady pan",
        transforms: vec![Transform::translation(10.0, 0.0); 30],
        expected: MotionType::PanZoom,
    });

    cases
}
