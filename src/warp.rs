//! Affine frame warping.
//!
//! Re-samples a borrowed input frame through an affine transform into the
//! engine's owned scratch frame, using inverse mapping with bilinear
//! interpolation and a constant black border. Chroma planes of subsampled
//! formats are warped in their own coordinate space with the translation
//! halved accordingly.

use crate::frame::{FrameBuf, FrameViewMut, PixelFormat};
use crate::transform::Transform;
use crate::StabilizerError;
use rayon::prelude::*;

#[inline(always)]
fn tap(src: &FrameViewMut<'_>, plane: usize, channels: usize, c: usize, x: i64, y: i64, pw: i64, ph: i64) -> f32 {
    if x < 0 || y < 0 || x >= pw || y >= ph {
        0.0
    } else {
        src.row(plane, y as usize)[x as usize * channels + c] as f32
    }
}

fn warp_plane(
    src: &FrameViewMut<'_>,
    plane: usize,
    channels: usize,
    pw: usize,
    ph: usize,
    inv: &Transform,
    dst: &mut [u8],
    row_bytes: usize,
) {
    let pw_i = pw as i64;
    let ph_i = ph as i64;
    dst.par_chunks_mut(row_bytes).enumerate().for_each(|(y, out_row)| {
        // Source coordinates step linearly along the row.
        let mut sx = inv.b * y as f64 + inv.tx;
        let mut sy = inv.d * y as f64 + inv.ty;
        for x in 0..pw {
            let x0 = sx.floor();
            let y0 = sy.floor();
            let fx = (sx - x0) as f32;
            let fy = (sy - y0) as f32;
            let xi = x0 as i64;
            let yi = y0 as i64;
            for c in 0..channels {
                let p00 = tap(src, plane, channels, c, xi, yi, pw_i, ph_i);
                let p01 = tap(src, plane, channels, c, xi + 1, yi, pw_i, ph_i);
                let p10 = tap(src, plane, channels, c, xi, yi + 1, pw_i, ph_i);
                let p11 = tap(src, plane, channels, c, xi + 1, yi + 1, pw_i, ph_i);
                let top = p00 + (p01 - p00) * fx;
                let bottom = p10 + (p11 - p10) * fx;
                let v = top + (bottom - top) * fy;
                out_row[x * channels + c] = (v + 0.5).min(255.0).max(0.0) as u8;
            }
            sx += inv.a;
            sy += inv.c;
        }
    });
}

fn copy_plane(src: &FrameViewMut<'_>, plane: usize, rows: usize, dst: &mut [u8], row_bytes: usize) {
    for (y, out_row) in dst.chunks_mut(row_bytes).enumerate().take(rows) {
        out_row.copy_from_slice(src.row(plane, y));
    }
}

/// Warps `src` by `correction` into `out`.
///
/// `out` is resized to the source geometry. The identity correction takes a
/// copy-only fast path, which also keeps zero-motion streams pixel-exact.
pub(crate) fn warp_frame(
    src: &FrameViewMut<'_>,
    correction: &Transform,
    out: &mut FrameBuf,
) -> Result<(), StabilizerError> {
    let format = src.format();
    let width = src.width();
    let height = src.height();
    out.prepare(format, width, height);

    if correction.is_identity() {
        for plane in 0..format.plane_count() {
            let (rows, row_bytes) = format.plane_geometry(plane, width, height);
            let dst = &mut out.planes[plane];
            // prepare() sized the plane to rows * row_bytes.
            copy_plane(src, plane, rows, dst, row_bytes);
        }
        return Ok(());
    }

    let inv = correction.invert().ok_or(StabilizerError::Internal {
        reason: "stabilizing transform is singular".to_string(),
    })?;

    // Chroma planes move at half rate in their own coordinate space.
    let chroma_inv = Transform::new(inv.a, inv.b, inv.tx / 2.0, inv.c, inv.d, inv.ty / 2.0);

    for plane in 0..format.plane_count() {
        let (rows, row_bytes) = format.plane_geometry(plane, width, height);
        let is_chroma = plane > 0;
        let channels = match (format, plane) {
            (PixelFormat::Bgra, 0) | (PixelFormat::Bgrx, 0) => 4,
            (PixelFormat::Bgr3, 0) => 3,
            (PixelFormat::Nv12, 1) => 2,
            _ => 1,
        };
        let pw = row_bytes / channels;
        let transform = if is_chroma { &chroma_inv } else { &inv };
        let dst = &mut out.planes[plane];
        warp_plane(src, plane, channels, pw, rows, transform, dst, row_bytes);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PlaneViewMut;

    fn y800_frame(data: &mut [u8], width: usize, height: usize) -> FrameViewMut<'_> {
        FrameViewMut::new(
            width,
            height,
            PixelFormat::Y800,
            vec![PlaneViewMut {
                data,
                stride: width,
            }],
            0,
        )
        .unwrap()
    }

    fn gradient_data(width: usize, height: usize) -> Vec<u8> {
        (0..width * height).map(|i| (i % 199) as u8).collect()
    }

    #[test]
    fn identity_warp_is_a_copy() {
        let mut data = gradient_data(32, 24);
        let expected = data.clone();
        let frame = y800_frame(&mut data, 32, 24);
        let mut out = FrameBuf::default();
        warp_frame(&frame, &Transform::identity(), &mut out).unwrap();
        assert_eq!(expected, out.planes[0]);
    }

    #[test]
    fn integer_translation_moves_content() {
        let mut data = vec![0u8; 32 * 32];
        data[10 * 32 + 10] = 200;
        let frame = y800_frame(&mut data, 32, 32);
        let mut out = FrameBuf::default();
        // Content moves +5 in x, +3 in y.
        warp_frame(&frame, &Transform::translation(5.0, 3.0), &mut out).unwrap();
        assert_eq!(200, out.planes[0][13 * 32 + 15]);
        assert_eq!(0, out.planes[0][10 * 32 + 10]);
    }

    #[test]
    fn out_of_frame_samples_are_black() {
        let mut data = vec![77u8; 16 * 16];
        let frame = y800_frame(&mut data, 16, 16);
        let mut out = FrameBuf::default();
        warp_frame(&frame, &Transform::translation(4.0, 0.0), &mut out).unwrap();
        // The four leftmost columns were revealed by the shift.
        for y in 0..16 {
            for x in 0..4 {
                assert_eq!(0, out.planes[0][y * 16 + x]);
            }
            assert_eq!(77, out.planes[0][y * 16 + 8]);
        }
    }

    #[test]
    fn fractional_translation_interpolates() {
        let mut data = vec![0u8; 16 * 16];
        for y in 0..16 {
            data[y * 16 + 8] = 100;
        }
        let frame = y800_frame(&mut data, 16, 16);
        let mut out = FrameBuf::default();
        warp_frame(&frame, &Transform::translation(0.5, 0.0), &mut out).unwrap();
        // A half-pixel shift splits the column across two columns.
        assert_eq!(50, out.planes[0][8 * 16 + 8]);
        assert_eq!(50, out.planes[0][8 * 16 + 9]);
    }

    #[test]
    fn nv12_chroma_moves_at_half_rate() {
        let w = 16usize;
        let h = 16usize;
        let mut y = vec![0u8; w * h];
        let mut uv = vec![128u8; (w / 2) * 2 * (h / 2)];
        // One distinctive chroma sample at chroma position (2, 2).
        uv[2 * w + 2 * 2] = 240;
        uv[2 * w + 2 * 2 + 1] = 16;
        let frame = FrameViewMut::new(
            w,
            h,
            PixelFormat::Nv12,
            vec![
                PlaneViewMut {
                    data: &mut y,
                    stride: w,
                },
                PlaneViewMut {
                    data: &mut uv,
                    stride: w,
                },
            ],
            0,
        )
        .unwrap();
        let mut out = FrameBuf::default();
        warp_frame(&frame, &Transform::translation(4.0, 2.0), &mut out).unwrap();
        // Chroma shifted by (2, 1) in its own plane.
        let uv_out = &out.planes[1];
        assert_eq!(240, uv_out[3 * w + 4 * 2]);
        assert_eq!(16, uv_out[3 * w + 4 * 2 + 1]);
    }

    #[test]
    fn i420_warps_all_three_planes() {
        let w = 16usize;
        let h = 16usize;
        let mut y = vec![0u8; w * h];
        y[8 * w + 8] = 220;
        let mut u = vec![128u8; (w / 2) * (h / 2)];
        let mut v = vec![128u8; (w / 2) * (h / 2)];
        u[2 * (w / 2) + 2] = 200;
        v[2 * (w / 2) + 2] = 40;
        let frame = FrameViewMut::new(
            w,
            h,
            PixelFormat::I420,
            vec![
                PlaneViewMut {
                    data: &mut y,
                    stride: w,
                },
                PlaneViewMut {
                    data: &mut u,
                    stride: w / 2,
                },
                PlaneViewMut {
                    data: &mut v,
                    stride: w / 2,
                },
            ],
            0,
        )
        .unwrap();
        let mut out = FrameBuf::default();
        warp_frame(&frame, &Transform::translation(2.0, 4.0), &mut out).unwrap();
        assert_eq!(220, out.planes[0][12 * w + 10]);
        // Chroma planes moved by (1, 2) in their own coordinates.
        assert_eq!(200, out.planes[1][4 * (w / 2) + 3]);
        assert_eq!(40, out.planes[2][4 * (w / 2) + 3]);
    }

    #[test]
    fn bgra_warp_preserves_channel_order() {
        let w = 8usize;
        let mut data = vec![0u8; w * 8 * 4];
        let idx = (4 * w + 4) * 4;
        data[idx] = 10;
        data[idx + 1] = 20;
        data[idx + 2] = 30;
        data[idx + 3] = 255;
        let stride = w * 4;
        let frame = FrameViewMut::new(
            w,
            8,
            PixelFormat::Bgra,
            vec![PlaneViewMut {
                data: &mut data,
                stride,
            }],
            0,
        )
        .unwrap();
        let mut out = FrameBuf::default();
        warp_frame(&frame, &Transform::translation(1.0, 0.0), &mut out).unwrap();
        let moved = (4 * w + 5) * 4;
        assert_eq!(
            &[10, 20, 30, 255],
            &out.planes[0][moved..moved + 4]
        );
    }
}
