//! End-to-end scenarios driven through the public `Stabilizer` API with
//! synthetic frames: a flat gray canvas carrying three white squares, shifted
//! per scenario to simulate camera motion.

use av_stabilizer::{
    FrameViewMut, MotionType, PixelFormat, PlaneViewMut, Stabilizer, StabilizerParams,
    StabilizerStatus,
};

const WIDTH: usize = 640;
const HEIGHT: usize = 480;

/// Frame content: RGBA(128, 128, 128, 255) background with three 20 px white
/// squares whose top-left corners sit at (100, 100), (200, 200), (300, 300),
/// offset by `shift`.
fn scene(shift: (i64, i64)) -> Vec<u8> {
    let mut data = vec![0u8; WIDTH * HEIGHT * 4];
    for px in data.chunks_exact_mut(4) {
        px.copy_from_slice(&[128, 128, 128, 255]);
    }
    for &(sx, sy) in &[(100i64, 100i64), (200, 200), (300, 300)] {
        let sx = sx + shift.0;
        let sy = sy + shift.1;
        for y in sy.max(0)..(sy + 20).min(HEIGHT as i64) {
            for x in sx.max(0)..(sx + 20).min(WIDTH as i64) {
                let idx = (y as usize * WIDTH + x as usize) * 4;
                data[idx..idx + 3].copy_from_slice(&[255, 255, 255]);
            }
        }
    }
    data
}

fn dark_scene() -> Vec<u8> {
    let mut data = vec![0u8; WIDTH * HEIGHT * 4];
    for px in data.chunks_exact_mut(4) {
        px.copy_from_slice(&[10, 10, 10, 255]);
    }
    data
}

/// Processes `data` in place and returns it (now holding the output frame).
fn process(stab: &Stabilizer, mut data: Vec<u8>) -> Vec<u8> {
    let stride = WIDTH * 4;
    let mut frame = FrameViewMut::new(
        WIDTH,
        HEIGHT,
        PixelFormat::Bgra,
        vec![PlaneViewMut {
            data: &mut data,
            stride,
        }],
        0,
    )
    .unwrap();
    stab.process_frame(&mut frame);
    data
}

/// Centroid of bright (square) pixels, from the green channel.
fn bright_centroid(data: &[u8]) -> (f64, f64) {
    let mut sum_x = 0.0;
    let mut sum_y = 0.0;
    let mut count = 0.0;
    for y in 0..HEIGHT {
        for x in 0..WIDTH {
            if data[(y * WIDTH + x) * 4 + 1] > 200 {
                sum_x += x as f64;
                sum_y += y as f64;
                count += 1.0;
            }
        }
    }
    assert!(count > 0.0, "no bright content in frame");
    (sum_x / count, sum_y / count)
}

fn mean_abs_diff(a: &[u8], b: &[u8]) -> f64 {
    let total: u64 = a
        .iter()
        .zip(b.iter())
        .map(|(&x, &y)| (x as i64 - y as i64).unsigned_abs())
        .sum();
    total as f64 / a.len() as f64
}

fn variance(values: &[f64]) -> f64 {
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / values.len() as f64
}

#[test]
fn static_stream_activates_and_leaves_pixels_alone() {
    let stab = Stabilizer::new();
    assert!(stab.initialize(WIDTH, HEIGHT, StabilizerParams::default()));

    let mut last_output = Vec::new();
    for i in 0..30 {
        let input = scene((0, 0));
        last_output = process(&stab, input);
        if i >= 1 {
            assert_eq!(
                StabilizerStatus::Active,
                stab.metrics().status,
                "not active by frame {}",
                i
            );
        }
        if i == 10 {
            let motion = stab.with_engine_mut(|e| e.current_motion_type());
            assert_eq!(MotionType::Static, motion);
        }
    }

    // Under Padding mode a zero-motion stream must come through (nearly)
    // untouched: < 0.5% of full intensity on average.
    let pristine = scene((0, 0));
    assert!(mean_abs_diff(&pristine, &last_output) < 255.0 * 0.005);
    assert_eq!(30, stab.metrics().frame_count);
}

#[test]
fn uniform_drift_is_estimated_and_not_amplified() {
    let stab = Stabilizer::new();
    assert!(stab.initialize(WIDTH, HEIGHT, StabilizerParams::default()));

    let mut estimated_tx = Vec::new();
    let mut output_centroids = Vec::new();
    let mut input_centroids = Vec::new();
    for i in 0..30i64 {
        let input = scene((2 * i, 0));
        input_centroids.push(bright_centroid(&input).0);
        let output = process(&stab, input);
        output_centroids.push(bright_centroid(&output).0);
        if i >= 1 {
            let latest = stab
                .with_engine_mut(|e| e.transform_history().latest().copied())
                .unwrap();
            estimated_tx.push(latest.tx);
        }
    }

    // The per-frame motion estimate should sit at ~+2 px.
    let mean_tx = estimated_tx.iter().sum::<f64>() / estimated_tx.len() as f64;
    assert!(
        mean_tx > 1.5 && mean_tx < 2.5,
        "mean estimated tx was {}",
        mean_tx
    );

    // Once the window is warm the output is pulled back toward the window
    // mean trajectory, and the drift is never amplified.
    for i in 12..30 {
        assert!(
            output_centroids[i] < input_centroids[i] - 4.0,
            "frame {} was not re-projected toward the smoothed trajectory",
            i
        );
        let out_step = output_centroids[i] - output_centroids[i - 1];
        assert!(
            out_step.abs() < 2.5,
            "frame {} drifted {} px, input drifts 2 px",
            i,
            out_step
        );
    }
}

#[test]
fn high_frequency_shake_is_classified_and_attenuated() {
    let stab = Stabilizer::new();
    assert!(stab.initialize(WIDTH, HEIGHT, StabilizerParams::default()));

    let mut input_x = Vec::new();
    let mut output_x = Vec::new();
    for i in 0..30i64 {
        let dx = if i % 2 != 0 { 10 } else { -10 };
        let dy = if i % 3 != 0 { 9 } else { -9 };
        let input = scene((dx, dy));
        input_x.push(bright_centroid(&input).0);
        let output = process(&stab, input);
        output_x.push(bright_centroid(&output).0);
    }

    let motion = stab.with_engine_mut(|e| e.current_motion_type());
    assert_eq!(MotionType::CameraShake, motion);

    // Compare steady-state jitter: the smoothed trajectory's variance must
    // collapse to below a quarter of the input's.
    let input_var = variance(&input_x[10..]);
    let output_var = variance(&output_x[10..]);
    assert!(
        output_var < input_var * 0.25,
        "shake variance {} vs input {}",
        output_var,
        input_var
    );
}

#[test]
fn tracking_collapse_recovers_with_a_fresh_feature_set() {
    let stab = Stabilizer::new();
    assert!(stab.initialize(WIDTH, HEIGHT, StabilizerParams::default()));

    for _ in 0..3 {
        process(&stab, scene((0, 0)));
    }

    let mut error_seen_during_collapse = false;
    for _ in 0..5 {
        process(&stab, dark_scene());
        if !stab.last_error().is_empty() {
            error_seen_during_collapse = true;
        }
    }
    assert!(error_seen_during_collapse);
    assert!(stab.metrics().error_count > 0);

    for _ in 0..10 {
        process(&stab, scene((0, 0)));
    }
    assert_eq!(StabilizerStatus::Active, stab.metrics().status);
    assert!(stab.metrics().tracked_features > 0);
}

#[test]
fn smoothing_radius_hot_swap_mid_stream() {
    let stab = Stabilizer::new();
    let mut params = StabilizerParams::default();
    params.smoothing_radius = 10;
    assert!(stab.initialize(WIDTH, HEIGHT, params.clone()));

    for _ in 0..10 {
        process(&stab, scene((0, 0)));
        assert!(stab.with_engine_mut(|e| e.transform_history().len()) <= 10);
    }

    params.smoothing_radius = 50;
    stab.update_parameters(params);

    for _ in 0..50 {
        process(&stab, scene((0, 0)));
        let len = stab.with_engine_mut(|e| e.transform_history().len());
        assert!(len <= 50, "history grew to {}", len);
    }
    // Frames kept flowing after the swap and the window filled up.
    assert_eq!(StabilizerStatus::Active, stab.metrics().status);
    assert_eq!(50, stab.with_engine_mut(|e| e.transform_history().len()));
    assert_eq!(60, stab.metrics().frame_count);
}

/// NV12 frame with the same square layout on the Y plane and flat chroma.
fn nv12_scene(shift: (i64, i64)) -> (Vec<u8>, Vec<u8>) {
    let mut y = vec![128u8; WIDTH * HEIGHT];
    for &(sx, sy) in &[(100i64, 100i64), (200, 200), (300, 300)] {
        let sx = sx + shift.0;
        let sy = sy + shift.1;
        for row in sy.max(0)..(sy + 20).min(HEIGHT as i64) {
            for col in sx.max(0)..(sx + 20).min(WIDTH as i64) {
                y[row as usize * WIDTH + col as usize] = 255;
            }
        }
    }
    let uv = vec![128u8; WIDTH * (HEIGHT / 2)];
    (y, uv)
}

#[test]
fn nv12_stream_stabilizes_all_planes() {
    let stab = Stabilizer::new();
    assert!(stab.initialize(WIDTH, HEIGHT, StabilizerParams::default()));

    for i in 0..12i64 {
        let (mut y, mut uv) = nv12_scene((2 * i, 0));
        let mut frame = FrameViewMut::new(
            WIDTH,
            HEIGHT,
            PixelFormat::Nv12,
            vec![
                PlaneViewMut {
                    data: &mut y,
                    stride: WIDTH,
                },
                PlaneViewMut {
                    data: &mut uv,
                    stride: WIDTH,
                },
            ],
            0,
        )
        .unwrap();
        stab.process_frame(&mut frame);

        if i >= 2 {
            assert_eq!(StabilizerStatus::Active, stab.metrics().status);
            // Flat chroma must come out flat away from the warp borders.
            for row in uv.chunks_exact(WIDTH) {
                assert!(row[32..WIDTH - 32].iter().all(|&v| v == 128));
            }
        }
    }
    assert_eq!(12, stab.metrics().frame_count);
}

#[test]
fn undersized_initialization_is_rejected() {
    let stab = Stabilizer::new();
    assert!(!stab.initialize(16, 16, StabilizerParams::default()));
    assert_eq!(StabilizerStatus::Inactive, stab.metrics().status);
    let error = stab.last_error();
    assert!(
        error.contains("minimum") && error.contains("16x16"),
        "unhelpful error: {}",
        error
    );
}

#[test]
fn disabled_stream_is_structurally_untouched() {
    let stab = Stabilizer::new();
    let mut params = StabilizerParams::default();
    params.enabled = false;
    assert!(stab.initialize(WIDTH, HEIGHT, params));

    let pristine = scene((3, 1));
    let output = process(&stab, pristine.clone());
    assert_eq!(pristine, output);
    assert_eq!(0, stab.metrics().frame_count);
}
