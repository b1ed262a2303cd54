//! Pyramidal Lucas-Kanade optical flow.
//!
//! Tracks a sparse point set from the previous grayscale frame into the
//! current one. Each point is refined coarse-to-fine over an image pyramid,
//! iterating the classic 2x2 normal-equation solve until the update falls
//! below [`EPSILON`] or [`MAX_ITERATIONS`] is reached. Points whose window
//! leaves the image, or whose gradient matrix is numerically singular, are
//! dropped; the surviving entries of both point sequences are compacted in
//! lockstep so correspondence is preserved.
//!
//! Tracking sits behind the [`FlowTracker`] trait so a platform-tuned
//! implementation can replace the portable one without touching the engine.

use crate::frame::PlaneData;
use crate::pixel::Pixel;
use crate::transform::Point;
use crate::StabilizerError;
use rayon::prelude::*;

/// Iteration cap for the per-level refinement loop.
pub const MAX_ITERATIONS: usize = 30;

/// Convergence threshold for the per-level refinement loop, in pixels.
pub const EPSILON: f64 = 0.01;

/// Fewer surviving points than this and the frame cannot be stabilized.
pub const MIN_FEATURES_FOR_TRACKING: usize = 6;

// Windows with a normalized minimum eigenvalue below this are untrackable.
const MIN_EIGEN_THRESHOLD: f64 = 1e-4;

/// Tracker tuning derived from the active
/// [`StabilizerParams`](crate::StabilizerParams).
#[derive(Debug, Clone)]
pub struct FlowConfig {
    /// Side length of the correlation window. Must be odd.
    pub window_size: usize,
    /// Number of pyramid levels, including the full-resolution base.
    pub pyramid_levels: usize,
}

/// Outcome of one tracking pass.
#[derive(Debug, Clone, Copy)]
pub struct TrackReport {
    /// Number of points handed in.
    pub attempted: usize,
    /// Number of points that survived tracking.
    pub tracked: usize,
    /// `tracked / attempted`, computed against the *input* size.
    ///
    /// Using the post-compaction size here would always report 100%; the
    /// refresh and failure logic downstream depends on the input-relative
    /// rate.
    pub success_rate: f32,
}

impl TrackReport {
    /// Whether enough points survived to estimate a transform.
    #[inline]
    pub fn is_usable(&self) -> bool {
        self.tracked >= MIN_FEATURES_FOR_TRACKING
    }
}

/// Capability to track a point set between two grayscale frames.
pub trait FlowTracker: Send {
    /// Tracks `prev_pts` from `prev` into `curr`.
    ///
    /// `curr_pts` must be pre-sized to `prev_pts.len()`; its entries serve as
    /// the initial flow hint. On return both sequences are compacted to the
    /// surviving correspondences.
    fn track(
        &mut self,
        prev: &PlaneData<u8>,
        curr: &PlaneData<u8>,
        prev_pts: &mut Vec<Point>,
        curr_pts: &mut Vec<Point>,
        config: &FlowConfig,
    ) -> Result<TrackReport, StabilizerError>;
}

/// Samples `plane` at a fractional position with bilinear interpolation.
/// The caller guarantees `(x, y)` is at least one pixel inside the plane.
#[inline(always)]
fn sample<T: Pixel>(plane: &PlaneData<T>, x: f32, y: f32) -> f32 {
    let w = plane.width;
    let x0 = (x as usize).min(w - 2);
    let y0 = (y as usize).min(plane.height - 2);
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;
    let idx = y0 * w + x0;
    let p00 = plane.data[idx].to_f32();
    let p01 = plane.data[idx + 1].to_f32();
    let p10 = plane.data[idx + w].to_f32();
    let p11 = plane.data[idx + w + 1].to_f32();
    let top = p00 + (p01 - p00) * fx;
    let bottom = p10 + (p11 - p10) * fx;
    top + (bottom - top) * fy
}

/// Halves a plane with 2x2 averaging.
fn downsample(src: &PlaneData<u8>, dst: &mut PlaneData<u8>) {
    let w = src.width / 2;
    let h = src.height / 2;
    dst.reset(w, h);
    for y in 0..h {
        let top = src.row(2 * y);
        let bottom = src.row(2 * y + 1);
        let out = dst.row_mut(y);
        for x in 0..w {
            let sum = top[2 * x] as u16
                + top[2 * x + 1] as u16
                + bottom[2 * x] as u16
                + bottom[2 * x + 1] as u16;
            out[x] = ((sum + 2) / 4) as u8;
        }
    }
}

/// The portable CPU Lucas-Kanade tracker.
#[derive(Default)]
pub struct LkTracker {
    prev_pyramid: Vec<PlaneData<u8>>,
    curr_pyramid: Vec<PlaneData<u8>>,
}

impl LkTracker {
    /// Creates a tracker with empty pyramid scratch; it is rebuilt per call.
    pub fn new() -> Self {
        LkTracker::default()
    }

    /// Number of usable levels for this geometry: each level must still fit
    /// the correlation window with a border.
    fn usable_levels(width: usize, height: usize, config: &FlowConfig) -> usize {
        let needed = config.window_size + 4;
        let mut levels = 1;
        let mut w = width;
        let mut h = height;
        while levels < config.pyramid_levels && w / 2 >= needed && h / 2 >= needed {
            w /= 2;
            h /= 2;
            levels += 1;
        }
        levels
    }

    fn build_pyramid(base: &PlaneData<u8>, levels: usize, out: &mut Vec<PlaneData<u8>>) {
        out.resize(levels.saturating_sub(1), PlaneData::default());
        for i in 0..levels.saturating_sub(1) {
            let (built, rest) = out.split_at_mut(i);
            let src = if i == 0 { base } else { &built[i - 1] };
            downsample(src, &mut rest[0]);
        }
    }

    fn level<'a>(base: &'a PlaneData<u8>, pyramid: &'a [PlaneData<u8>], level: usize) -> &'a PlaneData<u8> {
        if level == 0 {
            base
        } else {
            &pyramid[level - 1]
        }
    }
}

/// Tracks a single point through the pyramid. Returns the tracked position
/// and residual error, or `None` when the point is lost.
fn track_point(
    prev_base: &PlaneData<u8>,
    prev_pyramid: &[PlaneData<u8>],
    curr_base: &PlaneData<u8>,
    curr_pyramid: &[PlaneData<u8>],
    origin: Point,
    hint: Point,
    levels: usize,
    window_size: usize,
) -> Option<(Point, f32)> {
    if !origin.is_finite() {
        return None;
    }
    let r = (window_size / 2) as i32;
    let area = (window_size * window_size) as f64;
    let mut template = vec![0.0f32; window_size * window_size];
    let mut grad_x = vec![0.0f32; window_size * window_size];
    let mut grad_y = vec![0.0f32; window_size * window_size];

    // Flow in the coordinates of the coarsest level, seeded from the hint.
    let top_scale = (1u32 << (levels - 1)) as f32;
    let mut flow_x = (hint.x - origin.x) / top_scale;
    let mut flow_y = (hint.y - origin.y) / top_scale;
    let mut residual = 0.0f32;

    for level in (0..levels).rev() {
        let prev = LkTracker::level(prev_base, prev_pyramid, level);
        let curr = LkTracker::level(curr_base, curr_pyramid, level);
        let scale = (1u32 << level) as f32;
        let px = origin.x / scale;
        let py = origin.y / scale;

        let fits = |plane: &PlaneData<u8>, x: f32, y: f32| -> bool {
            x - (r + 1) as f32 >= 0.0
                && y - (r + 1) as f32 >= 0.0
                && x + (r + 2) as f32 <= plane.width as f32
                && y + (r + 2) as f32 <= plane.height as f32
        };
        if !fits(prev, px, py) {
            return None;
        }

        // Template intensities and spatial gradients, sampled once per level.
        let mut gxx = 0.0f64;
        let mut gxy = 0.0f64;
        let mut gyy = 0.0f64;
        for wy in -r..=r {
            for wx in -r..=r {
                let sx = px + wx as f32;
                let sy = py + wy as f32;
                let idx = ((wy + r) * (2 * r + 1) + (wx + r)) as usize;
                template[idx] = sample(prev, sx, sy);
                let gx = (sample(prev, sx + 1.0, sy) - sample(prev, sx - 1.0, sy)) * 0.5;
                let gy = (sample(prev, sx, sy + 1.0) - sample(prev, sx, sy - 1.0)) * 0.5;
                grad_x[idx] = gx;
                grad_y[idx] = gy;
                gxx += (gx * gx) as f64;
                gxy += (gx * gy) as f64;
                gyy += (gy * gy) as f64;
            }
        }

        // Reject untrackable windows by the normalized minimum eigenvalue.
        let trace = gxx + gyy;
        let det = gxx * gyy - gxy * gxy;
        let min_eigen = 0.5 * (trace - (trace * trace - 4.0 * det).max(0.0).sqrt());
        if min_eigen / area < MIN_EIGEN_THRESHOLD {
            return None;
        }
        let inv_det = 1.0 / det.max(1e-12);

        let mut lost = false;
        for _ in 0..MAX_ITERATIONS {
            let cx = px + flow_x;
            let cy = py + flow_y;
            if !fits(curr, cx, cy) {
                lost = true;
                break;
            }
            let mut bx = 0.0f64;
            let mut by = 0.0f64;
            let mut err = 0.0f64;
            for wy in -r..=r {
                for wx in -r..=r {
                    let idx = ((wy + r) * (2 * r + 1) + (wx + r)) as usize;
                    let diff =
                        (template[idx] - sample(curr, cx + wx as f32, cy + wy as f32)) as f64;
                    bx += diff * grad_x[idx] as f64;
                    by += diff * grad_y[idx] as f64;
                    err += diff.abs();
                }
            }
            residual = (err / area) as f32;
            let dx = (gyy * bx - gxy * by) * inv_det;
            let dy = (gxx * by - gxy * bx) * inv_det;
            flow_x += dx as f32;
            flow_y += dy as f32;
            if dx * dx + dy * dy < EPSILON * EPSILON {
                break;
            }
        }
        if lost {
            return None;
        }
        if level > 0 {
            flow_x *= 2.0;
            flow_y *= 2.0;
        }
    }

    let tracked = Point::new(origin.x + flow_x, origin.y + flow_y);
    if !tracked.is_finite() {
        return None;
    }
    Some((tracked, residual))
}

impl FlowTracker for LkTracker {
    fn track(
        &mut self,
        prev: &PlaneData<u8>,
        curr: &PlaneData<u8>,
        prev_pts: &mut Vec<Point>,
        curr_pts: &mut Vec<Point>,
        config: &FlowConfig,
    ) -> Result<TrackReport, StabilizerError> {
        if prev.width != curr.width || prev.height != curr.height {
            return Err(StabilizerError::FeatureTracking {
                reason: "previous and current frames differ in size",
            });
        }
        if prev.width == 0 || prev.height == 0 {
            return Err(StabilizerError::FeatureTracking {
                reason: "empty grayscale plane",
            });
        }
        if prev_pts.is_empty() {
            return Err(StabilizerError::FeatureTracking {
                reason: "no features to track",
            });
        }
        if curr_pts.len() != prev_pts.len() {
            return Err(StabilizerError::FeatureTracking {
                reason: "point sequences are not the same length",
            });
        }

        let levels = Self::usable_levels(prev.width, prev.height, config);
        Self::build_pyramid(prev, levels, &mut self.prev_pyramid);
        Self::build_pyramid(curr, levels, &mut self.curr_pyramid);

        let prev_pyramid = &self.prev_pyramid;
        let curr_pyramid = &self.curr_pyramid;
        let window_size = config.window_size;
        let results: Vec<Option<(Point, f32)>> = prev_pts
            .par_iter()
            .zip(curr_pts.par_iter())
            .map(|(&origin, &hint)| {
                track_point(
                    prev,
                    prev_pyramid,
                    curr,
                    curr_pyramid,
                    origin,
                    hint,
                    levels,
                    window_size,
                )
            })
            .collect();

        let attempted = results.len();
        let mut kept = 0;
        for j in 0..attempted {
            if let Some((tracked, _err)) = results[j] {
                prev_pts[kept] = prev_pts[j];
                curr_pts[kept] = tracked;
                kept += 1;
            }
        }
        prev_pts.truncate(kept);
        curr_pts.truncate(kept);

        Ok(TrackReport {
            attempted,
            tracked: kept,
            success_rate: kept as f32 / attempted as f32,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::tests::squares_plane;
    use crate::detect::{tests::test_config, CornerDetector, FeatureDetector};

    fn flow_config() -> FlowConfig {
        FlowConfig {
            window_size: 21,
            pyramid_levels: 3,
        }
    }

    fn detect_corners(plane: &PlaneData<u8>) -> Vec<Point> {
        let mut points = Vec::new();
        CornerDetector::new()
            .detect(plane, &test_config(), &mut points)
            .unwrap();
        points
    }

    fn track_between(
        prev: &PlaneData<u8>,
        curr: &PlaneData<u8>,
        prev_pts: &mut Vec<Point>,
    ) -> (Vec<Point>, TrackReport) {
        let mut curr_pts = prev_pts.clone();
        let report = LkTracker::new()
            .track(prev, curr, prev_pts, &mut curr_pts, &flow_config())
            .unwrap();
        (curr_pts, report)
    }

    #[test]
    fn recovers_small_translation() {
        let prev = squares_plane(640, 480, &[(100, 100), (200, 200), (300, 300)]);
        let curr = squares_plane(640, 480, &[(103, 102), (203, 202), (303, 302)]);
        let mut prev_pts = detect_corners(&prev);
        assert!(prev_pts.len() >= MIN_FEATURES_FOR_TRACKING);
        let (curr_pts, report) = track_between(&prev, &curr, &mut prev_pts);
        assert!(report.is_usable());
        assert!(report.success_rate > 0.5);
        for (p, c) in prev_pts.iter().zip(curr_pts.iter()) {
            assert!((c.x - p.x - 3.0).abs() < 0.5, "dx off: {}", c.x - p.x);
            assert!((c.y - p.y - 2.0).abs() < 0.5, "dy off: {}", c.y - p.y);
        }
    }

    #[test]
    fn recovers_large_translation_with_pyramid() {
        let prev = squares_plane(640, 480, &[(100, 100), (200, 200), (300, 300)]);
        let curr = squares_plane(640, 480, &[(110, 91), (210, 191), (310, 291)]);
        let mut prev_pts = detect_corners(&prev);
        let (curr_pts, report) = track_between(&prev, &curr, &mut prev_pts);
        assert!(report.is_usable());
        for (p, c) in prev_pts.iter().zip(curr_pts.iter()) {
            assert!((c.x - p.x - 10.0).abs() < 1.0, "dx off: {}", c.x - p.x);
            assert!((c.y - p.y + 9.0).abs() < 1.0, "dy off: {}", c.y - p.y);
        }
    }

    #[test]
    fn featureless_target_loses_all_points() {
        let prev = squares_plane(640, 480, &[(100, 100), (200, 200), (300, 300)]);
        let mut curr = PlaneData::new(640, 480);
        for px in curr.data.iter_mut() {
            *px = 10;
        }
        // Track from the featureless frame: every window is degenerate.
        let mut prev_pts = detect_corners(&prev);
        let mut curr_pts = prev_pts.clone();
        let report = LkTracker::new()
            .track(&curr, &curr, &mut prev_pts, &mut curr_pts, &flow_config())
            .unwrap();
        assert_eq!(0, report.tracked);
        assert!(!report.is_usable());
        assert!(prev_pts.is_empty());
        assert!(curr_pts.is_empty());
    }

    #[test]
    fn compaction_keeps_sequences_in_lockstep() {
        let prev = squares_plane(640, 480, &[(100, 100), (300, 300)]);
        let curr = squares_plane(640, 480, &[(102, 100), (302, 300)]);
        let mut prev_pts = detect_corners(&prev);
        // Poison one point so it gets dropped.
        prev_pts.push(Point::new(2.0, 2.0));
        let before = prev_pts.len();
        let (curr_pts, report) = track_between(&prev, &curr, &mut prev_pts);
        assert_eq!(before, report.attempted);
        assert!(report.tracked < before);
        assert_eq!(prev_pts.len(), curr_pts.len());
        assert_eq!(report.tracked, prev_pts.len());
    }

    #[test]
    fn mismatched_dimensions_fail() {
        let prev = PlaneData::<u8>::new(64, 64);
        let curr = PlaneData::<u8>::new(64, 32);
        let mut prev_pts = vec![Point::new(32.0, 32.0)];
        let mut curr_pts = prev_pts.clone();
        assert!(LkTracker::new()
            .track(&prev, &curr, &mut prev_pts, &mut curr_pts, &flow_config())
            .is_err());
    }
}
