//! Edge handling for stabilized output.
//!
//! Warping reveals black borders wherever the frame was pushed away from its
//! original placement. The compositor decides what to do about them: leave
//! them visible, crop to the remaining content, or crop and rescale back to
//! the original geometry.

use crate::frame::{FrameBuf, PixelFormat};
use rayon::prelude::*;

/// Border policy applied to warped frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EdgeMode {
    /// Keep the warped frame as-is; borders stay visible.
    Padding,
    /// Crop to the bounding box of visible content.
    Crop,
    /// Crop, then rescale to the original dimensions, preserving aspect.
    Scale,
}

impl Default for EdgeMode {
    fn default() -> Self {
        EdgeMode::Padding
    }
}

// Luma above this counts as content when hunting for borders.
const CONTENT_THRESHOLD: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Bounds {
    x: usize,
    y: usize,
    w: usize,
    h: usize,
}

fn luma_at(frame: &FrameBuf, format: PixelFormat, x: usize, y: usize) -> u8 {
    match format {
        PixelFormat::Bgra | PixelFormat::Bgrx | PixelFormat::Bgr3 => {
            let channels = format.channels();
            let row = frame.row(0, y);
            let b = row[x * channels] as u32;
            let g = row[x * channels + 1] as u32;
            let r = row[x * channels + 2] as u32;
            ((19595 * r + 38470 * g + 7471 * b + 32768) >> 16) as u8
        }
        PixelFormat::Nv12 | PixelFormat::I420 | PixelFormat::Y800 => frame.row(0, y)[x],
    }
}

/// Bounding box of pixels whose luma exceeds the content threshold.
fn content_bounds(frame: &FrameBuf) -> Option<Bounds> {
    let format = frame.format?;
    let mut min_x = usize::MAX;
    let mut min_y = usize::MAX;
    let mut max_x = 0usize;
    let mut max_y = 0usize;
    let mut any = false;
    for y in 0..frame.height {
        for x in 0..frame.width {
            if luma_at(frame, format, x, y) > CONTENT_THRESHOLD {
                any = true;
                min_x = min_x.min(x);
                min_y = min_y.min(y);
                max_x = max_x.max(x);
                max_y = max_y.max(y);
            }
        }
    }
    if !any {
        return None;
    }
    Some(Bounds {
        x: min_x,
        y: min_y,
        w: max_x - min_x + 1,
        h: max_y - min_y + 1,
    })
}

/// Rounds bounds outward to even offsets/sizes so subsampled chroma stays
/// aligned, clamped against the frame.
fn align_bounds(format: PixelFormat, frame_w: usize, frame_h: usize, b: Bounds) -> Bounds {
    if !matches!(format, PixelFormat::Nv12 | PixelFormat::I420) {
        return b;
    }
    let x = b.x & !1;
    let y = b.y & !1;
    let w = (((b.x + b.w + 1) & !1) - x).min(frame_w - x);
    let h = (((b.y + b.h + 1) & !1) - y).min(frame_h - y);
    Bounds { x, y, w, h }
}

fn plane_rect(format: PixelFormat, plane: usize, b: Bounds) -> Bounds {
    if plane == 0 || !matches!(format, PixelFormat::Nv12 | PixelFormat::I420) {
        b
    } else {
        Bounds {
            x: b.x / 2,
            y: b.y / 2,
            w: (b.w + 1) / 2,
            h: (b.h + 1) / 2,
        }
    }
}

fn plane_channels(format: PixelFormat, plane: usize) -> usize {
    match (format, plane) {
        (PixelFormat::Bgra, 0) | (PixelFormat::Bgrx, 0) => 4,
        (PixelFormat::Bgr3, 0) => 3,
        (PixelFormat::Nv12, 1) => 2,
        _ => 1,
    }
}

fn crop_into(frame: &FrameBuf, bounds: Bounds, out: &mut FrameBuf) {
    let format = frame.format.expect("cropping an uninitialized frame");
    out.prepare(format, bounds.w, bounds.h);
    for plane in 0..format.plane_count() {
        let rect = plane_rect(format, plane, bounds);
        let channels = plane_channels(format, plane);
        let (rows, row_bytes) = format.plane_geometry(plane, bounds.w, bounds.h);
        for y in 0..rows.min(rect.h) {
            let src = frame.row(plane, rect.y + y);
            let src_start = rect.x * channels;
            let out_plane = &mut out.planes[plane];
            out_plane[y * row_bytes..y * row_bytes + row_bytes]
                .copy_from_slice(&src[src_start..src_start + row_bytes]);
        }
    }
}

fn scale_into(frame: &FrameBuf, bounds: Bounds, out: &mut FrameBuf) {
    let format = frame.format.expect("scaling an uninitialized frame");
    let frame_w = frame.width;
    let frame_h = frame.height;
    let scale = (frame_w as f64 / bounds.w as f64).min(frame_h as f64 / bounds.h as f64);
    let scaled_w = ((bounds.w as f64 * scale) as usize).min(frame_w).max(1);
    let scaled_h = ((bounds.h as f64 * scale) as usize).min(frame_h).max(1);
    let off_x = (frame_w - scaled_w) / 2;
    let off_y = (frame_h - scaled_h) / 2;

    out.prepare(format, frame_w, frame_h);
    for plane in 0..format.plane_count() {
        let src_rect = plane_rect(format, plane, bounds);
        let dst_rect = plane_rect(
            format,
            plane,
            Bounds {
                x: off_x,
                y: off_y,
                w: scaled_w,
                h: scaled_h,
            },
        );
        let channels = plane_channels(format, plane);
        let (src_rows, row_bytes) = format.plane_geometry(plane, frame_w, frame_h);
        let src_pw = row_bytes / channels;
        let inv_scale = 1.0 / scale;

        let out_plane = &mut out.planes[plane];
        out_plane
            .par_chunks_mut(row_bytes)
            .enumerate()
            .for_each(|(y, out_row)| {
                if y < dst_rect.y || y >= dst_rect.y + dst_rect.h {
                    return;
                }
                let sy = src_rect.y as f64 + (y - dst_rect.y) as f64 * inv_scale;
                let sy = sy.min((src_rect.y + src_rect.h) as f64 - 1.0);
                for x in dst_rect.x..dst_rect.x + dst_rect.w {
                    let sx = src_rect.x as f64 + (x - dst_rect.x) as f64 * inv_scale;
                    let sx = sx.min((src_rect.x + src_rect.w) as f64 - 1.0);
                    let x0 = (sx as usize).min(src_pw - 2);
                    let y0 = (sy as usize).min(src_rows - 2);
                    let fx = (sx - x0 as f64) as f32;
                    let fy = (sy - y0 as f64) as f32;
                    let top_row = frame.row(plane, y0);
                    let bottom_row = frame.row(plane, y0 + 1);
                    for c in 0..channels {
                        let p00 = top_row[x0 * channels + c] as f32;
                        let p01 = top_row[(x0 + 1) * channels + c] as f32;
                        let p10 = bottom_row[x0 * channels + c] as f32;
                        let p11 = bottom_row[(x0 + 1) * channels + c] as f32;
                        let top = p00 + (p01 - p00) * fx;
                        let bottom = p10 + (p11 - p10) * fx;
                        let v = top + (bottom - top) * fy;
                        out_row[x * channels + c] = (v + 0.5).min(255.0).max(0.0) as u8;
                    }
                }
            });
    }
}

/// Applies the configured edge policy to a warped frame in place.
///
/// `scratch` is reused storage for the modes that rebuild the frame. Fully
/// black frames (an empty content box) pass through unchanged in every mode.
pub(crate) fn apply_edge_handling(frame: &mut FrameBuf, scratch: &mut FrameBuf, mode: EdgeMode) {
    if frame.format.is_none() {
        return;
    }
    match mode {
        EdgeMode::Padding => {}
        EdgeMode::Crop => {
            let bounds = match content_bounds(frame) {
                Some(b) => align_bounds(frame.format.unwrap(), frame.width, frame.height, b),
                None => return,
            };
            if bounds.w == 0 || bounds.h == 0 {
                return;
            }
            if bounds.w == frame.width && bounds.h == frame.height {
                return;
            }
            crop_into(frame, bounds, scratch);
            std::mem::swap(frame, scratch);
        }
        EdgeMode::Scale => {
            let bounds = match content_bounds(frame) {
                Some(b) => align_bounds(frame.format.unwrap(), frame.width, frame.height, b),
                None => return,
            };
            if bounds.w < 2 || bounds.h < 2 {
                return;
            }
            if bounds.w == frame.width && bounds.h == frame.height {
                return;
            }
            scale_into(frame, bounds, scratch);
            std::mem::swap(frame, scratch);
        }
    }
}
