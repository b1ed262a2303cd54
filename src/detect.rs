//! Corner feature detection on grayscale planes.
//!
//! The detector follows the classic "good features to track" recipe:
//! Sobel gradients, a box-summed structure tensor, a Shi-Tomasi (or Harris)
//! corner response, quality thresholding relative to the strongest response,
//! 3x3 non-maximum suppression and greedy minimum-distance selection.
//!
//! Detection sits behind the [`FeatureDetector`] trait so a platform-tuned
//! implementation can replace the portable one without touching the engine.

use crate::frame::PlaneData;
use crate::transform::Point;
use crate::StabilizerError;
use rayon::prelude::*;

/// Tuning knobs for one detection pass, derived from the active
/// [`StabilizerParams`](crate::StabilizerParams).
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Upper bound on the number of returned corners.
    pub max_features: usize,
    /// Fraction of the strongest response a corner must reach to be kept.
    pub quality_level: f64,
    /// Minimum pairwise distance between returned corners, in pixels.
    pub min_distance: f64,
    /// Side length of the structure-tensor summation window. Must be odd.
    pub block_size: usize,
    /// Use the Harris response instead of Shi-Tomasi.
    pub use_harris: bool,
    /// Harris free parameter `k`, ignored for Shi-Tomasi.
    pub harris_k: f64,
}

/// Capability to find trackable corners in a grayscale plane.
pub trait FeatureDetector: Send {
    /// Fills `points` with up to `config.max_features` corners of `gray`.
    ///
    /// An empty result is not an error: it means the frame currently offers
    /// nothing trackable and the caller should pass it through unchanged.
    fn detect(
        &mut self,
        gray: &PlaneData<u8>,
        config: &DetectorConfig,
        points: &mut Vec<Point>,
    ) -> Result<(), StabilizerError>;
}

/// The portable CPU corner detector.
#[derive(Default)]
pub struct CornerDetector {
    ix: Vec<f32>,
    iy: Vec<f32>,
    response: Vec<f32>,
    sat_xx: Vec<f64>,
    sat_yy: Vec<f64>,
    sat_xy: Vec<f64>,
}

impl CornerDetector {
    /// Creates a detector with empty scratch buffers; they grow to frame
    /// size on first use and are reused afterwards.
    pub fn new() -> Self {
        CornerDetector::default()
    }

    fn sobel_gradients(&mut self, gray: &PlaneData<u8>) {
        let w = gray.width;
        let h = gray.height;
        self.ix.clear();
        self.ix.resize(w * h, 0.0);
        self.iy.clear();
        self.iy.resize(w * h, 0.0);

        let data = &gray.data;
        self.ix
            .par_chunks_mut(w)
            .zip(self.iy.par_chunks_mut(w))
            .enumerate()
            .for_each(|(y, (ix_row, iy_row))| {
                if y == 0 || y + 1 >= h {
                    return;
                }
                let above = &data[(y - 1) * w..y * w];
                let here = &data[y * w..(y + 1) * w];
                let below = &data[(y + 1) * w..(y + 2) * w];
                for x in 1..w - 1 {
                    let gx = (above[x + 1] as i32 + 2 * here[x + 1] as i32 + below[x + 1] as i32)
                        - (above[x - 1] as i32 + 2 * here[x - 1] as i32 + below[x - 1] as i32);
                    let gy = (below[x - 1] as i32 + 2 * below[x] as i32 + below[x + 1] as i32)
                        - (above[x - 1] as i32 + 2 * above[x] as i32 + above[x + 1] as i32);
                    ix_row[x] = gx as f32;
                    iy_row[x] = gy as f32;
                }
            });
    }

    fn integrate_tensor(&mut self, w: usize, h: usize) {
        let stride = w + 1;
        let len = stride * (h + 1);
        self.sat_xx.clear();
        self.sat_xx.resize(len, 0.0);
        self.sat_yy.clear();
        self.sat_yy.resize(len, 0.0);
        self.sat_xy.clear();
        self.sat_xy.resize(len, 0.0);

        for y in 0..h {
            let mut run_xx = 0.0f64;
            let mut run_yy = 0.0f64;
            let mut run_xy = 0.0f64;
            for x in 0..w {
                let gx = self.ix[y * w + x] as f64;
                let gy = self.iy[y * w + x] as f64;
                run_xx += gx * gx;
                run_yy += gy * gy;
                run_xy += gx * gy;
                let idx = (y + 1) * stride + (x + 1);
                self.sat_xx[idx] = self.sat_xx[idx - stride] + run_xx;
                self.sat_yy[idx] = self.sat_yy[idx - stride] + run_yy;
                self.sat_xy[idx] = self.sat_xy[idx - stride] + run_xy;
            }
        }
    }

    fn corner_response(&mut self, w: usize, h: usize, config: &DetectorConfig) {
        let stride = w + 1;
        let margin = config.block_size / 2 + 1;
        let radius = config.block_size / 2;
        let use_harris = config.use_harris;
        let k = config.harris_k;

        self.response.clear();
        self.response.resize(w * h, 0.0);

        let sat_xx = &self.sat_xx;
        let sat_yy = &self.sat_yy;
        let sat_xy = &self.sat_xy;
        let box_sum = |sat: &[f64], x0: usize, y0: usize, x1: usize, y1: usize| {
            sat[y1 * stride + x1] + sat[y0 * stride + x0]
                - sat[y0 * stride + x1]
                - sat[y1 * stride + x0]
        };

        self.response
            .par_chunks_mut(w)
            .enumerate()
            .for_each(|(y, row)| {
                if y < margin || y + margin >= h {
                    return;
                }
                let y0 = y - radius;
                let y1 = y + radius + 1;
                for x in margin..w - margin {
                    let x0 = x - radius;
                    let x1 = x + radius + 1;
                    let sxx = box_sum(sat_xx, x0, y0, x1, y1);
                    let syy = box_sum(sat_yy, x0, y0, x1, y1);
                    let sxy = box_sum(sat_xy, x0, y0, x1, y1);
                    let r = if use_harris {
                        (sxx * syy - sxy * sxy) - k * (sxx + syy) * (sxx + syy)
                    } else {
                        // Smaller eigenvalue of the 2x2 structure tensor.
                        0.5 * ((sxx + syy) - ((sxx - syy) * (sxx - syy) + 4.0 * sxy * sxy).sqrt())
                    };
                    row[x] = r as f32;
                }
            });
    }

    fn select_corners(
        &self,
        w: usize,
        h: usize,
        config: &DetectorConfig,
        points: &mut Vec<Point>,
    ) {
        let max_response = self.response.iter().copied().fold(0.0f32, f32::max);
        if max_response <= f32::EPSILON {
            return;
        }
        let threshold = (config.quality_level as f32) * max_response;

        let mut candidates: Vec<(f32, usize, usize)> = Vec::new();
        for y in 1..h.saturating_sub(1) {
            for x in 1..w - 1 {
                let r = self.response[y * w + x];
                if r <= threshold || r <= 0.0 {
                    continue;
                }
                let mut local_max = true;
                'nms: for dy in 0..3usize {
                    for dx in 0..3usize {
                        if dy == 1 && dx == 1 {
                            continue;
                        }
                        if self.response[(y + dy - 1) * w + (x + dx - 1)] > r {
                            local_max = false;
                            break 'nms;
                        }
                    }
                }
                if local_max {
                    candidates.push((r, x, y));
                }
            }
        }
        candidates.sort_unstable_by(|lhs, rhs| {
            rhs.0
                .partial_cmp(&lhs.0)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        // Greedy minimum-distance selection over a coarse grid.
        let min_dist = config.min_distance.max(1.0);
        let min_dist_sq = (min_dist * min_dist) as f32;
        let cell = min_dist.ceil() as usize;
        let grid_w = w / cell + 1;
        let grid_h = h / cell + 1;
        let mut grid: Vec<Vec<Point>> = vec![Vec::new(); grid_w * grid_h];

        for (_, x, y) in candidates {
            if points.len() >= config.max_features {
                break;
            }
            let candidate = Point::new(x as f32, y as f32);
            let gx = x / cell;
            let gy = y / cell;
            let mut keep = true;
            'cells: for ny in gy.saturating_sub(1)..(gy + 2).min(grid_h) {
                for nx in gx.saturating_sub(1)..(gx + 2).min(grid_w) {
                    for accepted in &grid[ny * grid_w + nx] {
                        if accepted.distance_sq(&candidate) < min_dist_sq {
                            keep = false;
                            break 'cells;
                        }
                    }
                }
            }
            if keep {
                grid[gy * grid_w + gx].push(candidate);
                points.push(candidate);
            }
        }
    }
}

impl FeatureDetector for CornerDetector {
    fn detect(
        &mut self,
        gray: &PlaneData<u8>,
        config: &DetectorConfig,
        points: &mut Vec<Point>,
    ) -> Result<(), StabilizerError> {
        points.clear();
        points.reserve(config.max_features);

        let w = gray.width;
        let h = gray.height;
        let margin = config.block_size / 2 + 1;
        if w <= 2 * margin + 1 || h <= 2 * margin + 1 {
            return Ok(());
        }
        if gray.data.len() != w * h {
            return Err(StabilizerError::FeatureDetection {
                reason: "grayscale plane has inconsistent geometry",
            });
        }

        self.sobel_gradients(gray);
        self.integrate_tensor(w, h);
        self.corner_response(w, h, config);
        self.select_corners(w, h, config, points);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn test_config() -> DetectorConfig {
        DetectorConfig {
            max_features: 200,
            quality_level: 0.01,
            min_distance: 10.0,
            block_size: 3,
            use_harris: false,
            harris_k: 0.04,
        }
    }

    /// A flat gray canvas with white squares, the shared test scene.
    pub(crate) fn squares_plane(width: usize, height: usize, offsets: &[(usize, usize)]) -> PlaneData<u8> {
        let mut plane = PlaneData::new(width, height);
        for row in plane.data.chunks_exact_mut(width) {
            for px in row.iter_mut() {
                *px = 128;
            }
        }
        for &(sx, sy) in offsets {
            for y in sy..(sy + 20).min(height) {
                for x in sx..(sx + 20).min(width) {
                    plane.data[y * width + x] = 255;
                }
            }
        }
        plane
    }

    #[test]
    fn uniform_plane_has_no_features() {
        let mut plane = PlaneData::new(128, 128);
        for px in plane.data.iter_mut() {
            *px = 10;
        }
        let mut points = Vec::new();
        CornerDetector::new()
            .detect(&plane, &test_config(), &mut points)
            .unwrap();
        assert!(points.is_empty());
    }

    #[test]
    fn finds_square_corners() {
        let plane = squares_plane(320, 240, &[(100, 100), (200, 120), (50, 180)]);
        let mut points = Vec::new();
        CornerDetector::new()
            .detect(&plane, &test_config(), &mut points)
            .unwrap();
        assert!(points.len() >= 8, "found only {} corners", points.len());

        // Every reported corner should be near an actual square corner.
        let mut corners = Vec::new();
        for &(sx, sy) in &[(100usize, 100usize), (200, 120), (50, 180)] {
            for &(dx, dy) in &[(0usize, 0usize), (19, 0), (0, 19), (19, 19)] {
                corners.push(Point::new((sx + dx) as f32, (sy + dy) as f32));
            }
        }
        for p in &points {
            let best = corners
                .iter()
                .map(|c| c.distance_sq(p))
                .fold(f32::INFINITY, f32::min);
            assert!(best <= 25.0, "corner at ({}, {}) is unexpected", p.x, p.y);
        }
    }

    #[test]
    fn honors_min_distance_and_count() {
        let plane = squares_plane(320, 240, &[(100, 100), (160, 100)]);
        let mut config = test_config();
        config.max_features = 4;
        config.min_distance = 15.0;
        let mut points = Vec::new();
        CornerDetector::new()
            .detect(&plane, &config, &mut points)
            .unwrap();
        assert!(points.len() <= 4);
        for (i, p) in points.iter().enumerate() {
            for q in &points[i + 1..] {
                assert!(p.distance_sq(q) >= 15.0 * 15.0);
            }
        }
    }

    #[test]
    fn harris_mode_also_finds_corners() {
        let plane = squares_plane(320, 240, &[(100, 100), (200, 120)]);
        let mut config = test_config();
        config.use_harris = true;
        let mut points = Vec::new();
        CornerDetector::new()
            .detect(&plane, &config, &mut points)
            .unwrap();
        assert!(!points.is_empty());
    }
}
