//! Synthetic frames shared by the unit tests.

use image::{Rgba, RgbaImage};
use z1_data::{CANONICAL_HEIGHT, CANONICAL_WIDTH};

use crate::calibration::CalibrationMapping;

/// 2x scale with a letterbox of 16 px left/right and 8 px top/bottom.
pub fn mapping() -> CalibrationMapping {
    CalibrationMapping {
        crop_x: 16.0,
        crop_y: 8.0,
        scale_x: 2.0,
        scale_y: 2.0,
        grid_dx: 0.0,
        grid_dy: 0.0,
        video_width: CANONICAL_WIDTH * 2 + 32,
        video_height: CANONICAL_HEIGHT * 2 + 16,
        confidence: 1.0,
    }
}

/// Render a stream frame for `mapping()` from a canonical-pixel color function.
pub fn render(color: impl Fn(u32, u32) -> [u8; 3]) -> RgbaImage {
    let m = mapping();
    RgbaImage::from_fn(m.video_width, m.video_height, |x, y| {
        let (cx, cy) = m.to_canonical(x as f32, y as f32);
        if cx < 0.0 || cy < 0.0 || cx >= CANONICAL_WIDTH as f32 || cy >= CANONICAL_HEIGHT as f32 {
            return Rgba([0, 0, 0, 255]);
        }
        let [r, g, b] = color(cx as u32, cy as u32);
        Rgba([r, g, b, 255])
    })
}

/// Deterministic 0/1 pattern with plenty of variance.
pub fn pattern(seed: u32, len: usize) -> Vec<f32> {
    let mut state = seed.wrapping_mul(2_654_435_761).wrapping_add(12_345);
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            ((state >> 16) & 1) as f32
        })
        .collect()
}

pub fn gray(value: f32) -> [u8; 3] {
    let v = (value.clamp(0.0, 1.0) * 255.0).round() as u8;
    [v, v, v]
}
