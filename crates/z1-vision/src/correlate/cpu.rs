use anyhow::{Context, Result};
use image::RgbaImage;
use std::sync::Arc;
use z1_data::{luma, RoomMode, CANONICAL_HEIGHT, CANONICAL_WIDTH};

use super::{
    floor_hit, ncc, pack_floor_key, CorrelationPlan, AGG_BRIGHTNESS, AGG_GOLD, AGG_HEARTS,
    AGG_LEN, AGG_LIFE_RED, BRIGHTNESS_SAMPLES, GOLD_SAMPLES, LIFE_SAMPLES, ROOM_PIXELS,
};
use crate::calibration::CalibrationMapping;
use crate::layout::{
    floor_position, BRIGHTNESS_COLS, FLOOR_COLS, FLOOR_ROWS, HEARTS_BOTTOM_Y, HEARTS_TOP_Y,
    HEARTS_X, HEART_SIZE, HEART_SLOTS, LIFE_W, LIFE_X, LIFE_Y, ROOM_W, TRIFORCE_W, TRIFORCE_X,
    TRIFORCE_Y,
};
use crate::scores::{Aggregates, FloorHit, RawFrameScores, ScoreMatrix};

/// Reference correlator running on the blocking thread pool.
#[derive(Debug, Clone)]
pub struct CpuCorrelator {
    plan: Arc<CorrelationPlan>,
}

impl CpuCorrelator {
    pub fn new(plan: CorrelationPlan) -> Self {
        Self {
            plan: Arc::new(plan),
        }
    }

    pub fn plan(&self) -> &CorrelationPlan {
        &self.plan
    }

    pub async fn correlate(
        &self,
        frame: Arc<RgbaImage>,
        room_mode: RoomMode,
    ) -> Result<RawFrameScores> {
        let plan = Arc::clone(&self.plan);
        tokio::task::spawn_blocking(move || correlate_frame(&plan, &frame, room_mode))
            .await
            .context("CPU correlation task failed")?
    }
}

/// Run every enabled pass over one frame on the calling thread.
pub fn correlate_frame(
    plan: &CorrelationPlan,
    frame: &RgbaImage,
    room_mode: RoomMode,
) -> Result<RawFrameScores> {
    let (w, h) = frame.dimensions();
    anyhow::ensure!(
        plan.mapping.matches(w, h),
        "frame {}x{} does not match calibration {}x{}",
        w,
        h,
        plan.mapping.video_width,
        plan.mapping.video_height
    );

    let canvas = Canvas::sample(frame, &plan.mapping);
    let rooms = match plan.room_group(room_mode) {
        Some(group) => {
            let patch = room_patch(&canvas);
            group
                .templates
                .iter()
                .map(|t| score_patch(&patch, &t.values))
                .collect()
        }
        None => Vec::new(),
    };

    Ok(RawFrameScores {
        tiles: score_tiles(plan, frame),
        room_mode,
        rooms,
        floor: search_floor(plan, &canvas),
        aggregates: aggregates(&canvas),
    })
}

/// One sample per canonical pixel of the whole NES picture.
struct Canvas {
    rgb: Vec<[u8; 3]>,
    luma: Vec<f32>,
}

impl Canvas {
    fn sample(frame: &RgbaImage, mapping: &CalibrationMapping) -> Self {
        let (w, h) = frame.dimensions();
        let len = (CANONICAL_WIDTH * CANONICAL_HEIGHT) as usize;
        let mut rgb = Vec::with_capacity(len);
        for y in 0..CANONICAL_HEIGHT {
            for x in 0..CANONICAL_WIDTH {
                let (sx, sy) = mapping.sample_point(x as f32, y as f32, w, h);
                let px = frame.get_pixel(sx, sy);
                rgb.push([px[0], px[1], px[2]]);
            }
        }
        let luma = rgb.iter().map(|p| luma(*p)).collect();
        Self { rgb, luma }
    }

    fn index(x: u32, y: u32) -> usize {
        let x = x.min(CANONICAL_WIDTH - 1);
        let y = y.min(CANONICAL_HEIGHT - 1);
        (y * CANONICAL_WIDTH + x) as usize
    }

    fn rgb(&self, x: u32, y: u32) -> [u8; 3] {
        self.rgb[Self::index(x, y)]
    }

    fn luma(&self, x: u32, y: u32) -> f32 {
        self.luma[Self::index(x, y)]
    }
}

fn score_patch(patch: &[f32], template: &[f32]) -> f32 {
    let (mut sum, mut sum_sq, mut cross) = (0.0f32, 0.0f32, 0.0f32);
    for (p, t) in patch.iter().zip(template) {
        sum += p;
        sum_sq += p * p;
        cross += p * t;
    }
    ncc(sum, sum_sq, cross, patch.len() as f32)
}

/// HUD tiles may sit at fractional canonical positions, so they sample the frame directly.
fn score_tiles(plan: &CorrelationPlan, frame: &RgbaImage) -> ScoreMatrix {
    let (w, h) = frame.dimensions();
    let mut matrix = ScoreMatrix::new(plan.score_shape());
    for (index, tile) in plan.layout.tiles().iter().enumerate() {
        let templates = plan.tile_templates(tile);
        if templates.is_empty() {
            continue;
        }
        let patch: Vec<f32> = (0..8 * tile.size.height())
            .map(|i| {
                let (sx, sy) = plan.mapping.sample_point(
                    tile.nes_x + (i % 8) as f32,
                    tile.nes_y + (i / 8) as f32,
                    w,
                    h,
                );
                let px = frame.get_pixel(sx, sy);
                luma([px[0], px[1], px[2]])
            })
            .collect();
        for (t, template) in templates.iter().enumerate() {
            matrix.set(index, t, score_patch(&patch, &template.values));
        }
    }
    matrix
}

fn room_patch(canvas: &Canvas) -> Vec<f32> {
    (0..ROOM_PIXELS)
        .map(|cell| {
            let x0 = cell % ROOM_W * 4;
            let y0 = 64 + cell / ROOM_W * 4;
            (canvas.luma(x0 + 1, y0 + 1)
                + canvas.luma(x0 + 3, y0 + 1)
                + canvas.luma(x0 + 1, y0 + 3)
                + canvas.luma(x0 + 3, y0 + 3))
                * 0.25
        })
        .collect()
}

fn search_floor(plan: &CorrelationPlan, canvas: &Canvas) -> Vec<FloorHit> {
    let Some(drops) = plan.drops() else {
        return Vec::new();
    };
    let (tw, th) = (drops.width, drops.height);
    let positions = FLOOR_COLS * FLOOR_ROWS;

    // Patch sums are shared by every template
    let stats: Vec<(f32, f32)> = (0..positions)
        .map(|pos| {
            let (ox, oy) = floor_position(pos);
            let (mut sum, mut sum_sq) = (0.0f32, 0.0f32);
            for i in 0..tw * th {
                let v = canvas.luma(ox as u32 + i % tw, oy as u32 + i / tw);
                sum += v;
                sum_sq += v * v;
            }
            (sum, sum_sq)
        })
        .collect();

    let n = (tw * th) as f32;
    drops
        .templates
        .iter()
        .enumerate()
        .map(|(t, template)| {
            let best = (0..positions)
                .map(|pos| {
                    let (ox, oy) = floor_position(pos);
                    let mut cross = 0.0f32;
                    for (i, value) in template.values.iter().enumerate() {
                        let i = i as u32;
                        cross += canvas.luma(ox as u32 + i % tw, oy as u32 + i / tw) * value;
                    }
                    let (sum, sum_sq) = stats[pos as usize];
                    pack_floor_key(ncc(sum, sum_sq, cross, n), pos)
                })
                .max()
                .unwrap_or(0);
            floor_hit(t, best)
        })
        .collect()
}

fn is_red(rgb: [u8; 3]) -> bool {
    let (r, g, b) = (rgb[0] as u32, rgb[1] as u32, rgb[2] as u32);
    r > 50 && r > 2 * g && r > 2 * b
}

fn is_gold(rgb: [u8; 3]) -> bool {
    let [r, g, b] = rgb.map(|c| c as f32 / 255.0);
    r > 0.588 && g > 0.314 && b < 0.275 && r > g
}

fn aggregates(canvas: &Canvas) -> Aggregates {
    let mut counters = [0u32; AGG_LEN];

    for i in 0..BRIGHTNESS_SAMPLES {
        let x = i % BRIGHTNESS_COLS * 8 + 4;
        let y = 64 + i / BRIGHTNESS_COLS * 8 + 4;
        counters[AGG_BRIGHTNESS] += (canvas.luma(x, y) * 255.0 + 0.5) as u32;
    }
    for i in 0..LIFE_SAMPLES {
        if is_red(canvas.rgb(LIFE_X as u32 + i % LIFE_W, LIFE_Y as u32 + i / LIFE_W)) {
            counters[AGG_LIFE_RED] += 1;
        }
    }
    for i in 0..GOLD_SAMPLES {
        let rgb = canvas.rgb(TRIFORCE_X as u32 + i % TRIFORCE_W, TRIFORCE_Y as u32 + i / TRIFORCE_W);
        if is_gold(rgb) {
            counters[AGG_GOLD] += 1;
        }
    }
    for slot in 0..HEART_SLOTS as u32 {
        let row_y = (if slot >= 8 { HEARTS_TOP_Y } else { HEARTS_BOTTOM_Y }) as u32;
        let x0 = HEARTS_X as u32 + slot % 8 * HEART_SIZE;
        for p in 0..HEART_SIZE * HEART_SIZE {
            if is_red(canvas.rgb(x0 + p % HEART_SIZE, row_y + p / HEART_SIZE)) {
                counters[AGG_HEARTS + slot as usize] += 1;
            }
        }
    }

    Aggregates::from_counters(&counters)
}
