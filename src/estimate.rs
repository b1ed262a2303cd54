//! Robust similarity-transform estimation from point correspondences.
//!
//! Fits a partial affine (rotation + uniform scale + translation) transform
//! mapping previous feature positions onto current ones with RANSAC, then
//! refines the winning hypothesis by least squares over its inlier set.
//! The sampler is seeded deterministically, so the same correspondences
//! always produce the same fit.

use crate::transform::{Point, Transform, MAX_REASONABLE_TRANSLATION};

/// Estimator tuning; the reprojection threshold comes from the active
/// parameter set's RANSAC threshold range.
#[derive(Debug, Clone)]
pub struct EstimatorConfig {
    /// Inlier reprojection threshold, in pixels.
    pub ransac_threshold: f64,
    /// Hard cap on RANSAC hypothesis draws.
    pub max_iterations: usize,
    /// Early-exit confidence for the adaptive iteration bound.
    pub confidence: f64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        EstimatorConfig {
            ransac_threshold: 2.0,
            max_iterations: 200,
            confidence: 0.99,
        }
    }
}

// xorshift64*, seeded per call so estimation (and the threshold tuner's
// random search) is reproducible.
pub(crate) struct SampleRng(u64);

impl SampleRng {
    pub(crate) fn new(seed: u64) -> Self {
        SampleRng(seed | 1)
    }

    pub(crate) fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.0 = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn below(&mut self, n: usize) -> usize {
        (self.next() % n as u64) as usize
    }
}

#[inline]
fn reprojection_sq(t: &Transform, p: &Point, q: &Point) -> f64 {
    let (x, y) = t.apply(p.x as f64, p.y as f64);
    let dx = x - q.x as f64;
    let dy = y - q.y as f64;
    dx * dx + dy * dy
}

/// Solves the exact similarity mapping two point pairs onto two others.
fn similarity_from_two(p1: Point, p2: Point, q1: Point, q2: Point) -> Option<Transform> {
    let dpx = (p2.x - p1.x) as f64;
    let dpy = (p2.y - p1.y) as f64;
    let dqx = (q2.x - q1.x) as f64;
    let dqy = (q2.y - q1.y) as f64;
    let norm = dpx * dpx + dpy * dpy;
    if norm < 1e-9 {
        return None;
    }
    let a = (dpx * dqx + dpy * dqy) / norm;
    let b = (dpx * dqy - dpy * dqx) / norm;
    let tx = q1.x as f64 - (a * p1.x as f64 - b * p1.y as f64);
    let ty = q1.y as f64 - (b * p1.x as f64 + a * p1.y as f64);
    Some(Transform::new(a, -b, tx, b, a, ty))
}

/// Least-squares similarity over a set of correspondences.
fn similarity_least_squares(
    prev: &[Point],
    curr: &[Point],
    indices: &[usize],
) -> Option<Transform> {
    let n = indices.len() as f64;
    if indices.len() < 2 {
        return None;
    }
    let mut sx = 0.0;
    let mut sy = 0.0;
    let mut sqx = 0.0;
    let mut sqy = 0.0;
    let mut spp = 0.0;
    let mut spq = 0.0;
    let mut spq_cross = 0.0;
    for &i in indices {
        let px = prev[i].x as f64;
        let py = prev[i].y as f64;
        let qx = curr[i].x as f64;
        let qy = curr[i].y as f64;
        sx += px;
        sy += py;
        sqx += qx;
        sqy += qy;
        spp += px * px + py * py;
        spq += px * qx + py * qy;
        spq_cross += px * qy - py * qx;
    }
    let denom = spp - (sx * sx + sy * sy) / n;
    if denom.abs() < 1e-9 {
        return None;
    }
    let a = (spq - (sx * sqx + sy * sqy) / n) / denom;
    let b = (spq_cross - (sx * sqy - sy * sqx) / n) / denom;
    let tx = (sqx - a * sx + b * sy) / n;
    let ty = (sqy - a * sy - b * sx) / n;
    let t = Transform::new(a, -b, tx, b, a, ty);
    if t.is_finite() {
        Some(t)
    } else {
        None
    }
}

/// Estimates the partial affine transform mapping `prev` onto `curr`.
///
/// Returns `None` when the correspondences are too few or too degenerate to
/// support a fit; the caller substitutes the identity in that case.
pub fn estimate_partial_affine(
    prev: &[Point],
    curr: &[Point],
    config: &EstimatorConfig,
) -> Option<Transform> {
    if prev.len() != curr.len() {
        return None;
    }
    let usable: Vec<usize> = (0..prev.len())
        .filter(|&i| prev[i].is_finite() && curr[i].is_finite())
        .collect();
    if usable.len() < 2 {
        return None;
    }

    let threshold_sq = config.ransac_threshold * config.ransac_threshold;
    let mut rng = SampleRng::new(0x9E37_79B9_7F4A_7C15 ^ usable.len() as u64);
    let mut best_inliers: Vec<usize> = Vec::new();
    let mut iterations = config.max_iterations.max(1);

    let mut iter = 0;
    while iter < iterations {
        iter += 1;
        let i0 = usable[rng.below(usable.len())];
        let i1 = usable[rng.below(usable.len())];
        if i0 == i1 {
            continue;
        }
        let hypothesis = match similarity_from_two(prev[i0], prev[i1], curr[i0], curr[i1]) {
            Some(t) => t,
            None => continue,
        };
        let inliers: Vec<usize> = usable
            .iter()
            .copied()
            .filter(|&i| reprojection_sq(&hypothesis, &prev[i], &curr[i]) <= threshold_sq)
            .collect();
        if inliers.len() > best_inliers.len() {
            best_inliers = inliers;
            // Shrink the iteration bound as the inlier ratio firms up.
            let ratio = best_inliers.len() as f64 / usable.len() as f64;
            let p_outlier = (1.0 - ratio * ratio).max(1e-9).min(1.0 - 1e-9);
            let needed = ((1.0 - config.confidence).ln() / p_outlier.ln()).ceil();
            if needed.is_finite() && needed >= 0.0 {
                iterations = iterations.min(iter + needed as usize);
            }
            if best_inliers.len() == usable.len() {
                break;
            }
        }
    }

    if best_inliers.len() < 2 {
        return None;
    }
    similarity_least_squares(prev, curr, &best_inliers)
}

/// Applies the mandatory post-estimate correction limit.
///
/// `max_correction` is a percentage: scale and shear entries are limited to
/// `1 ± m` and `±m`, translations to `±m` times the 200 px sane-translation
/// bound, so every clamped transform satisfies
/// [`Transform::is_reasonable`]. Anything still unreasonable after clamping
/// (a NaN fit, say) degrades to the identity.
pub fn clamp_correction(t: &Transform, max_correction: f32) -> Transform {
    if !t.is_finite() {
        return Transform::identity();
    }
    let m = (max_correction as f64 / 100.0).max(0.0).min(1.0);
    let t_limit = m * MAX_REASONABLE_TRANSLATION;
    let clamped = Transform::new(
        t.a.max(1.0 - m).min(1.0 + m),
        t.b.max(-m).min(m),
        t.tx.max(-t_limit).min(t_limit),
        t.c.max(-m).min(m),
        t.d.max(1.0 - m).min(1.0 + m),
        t.ty.max(-t_limit).min(t_limit),
    );
    if clamped.is_reasonable() {
        clamped
    } else {
        Transform::identity()
    }
}
