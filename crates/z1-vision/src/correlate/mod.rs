//! Template correlation over calibrated stream frames.
//!
//! Both backends sample the frame at the centre of each canonical pixel's
//! footprint and score candidates with zero-mean normalized cross-correlation
//! against pre-normalized templates, so their outputs agree.

use anyhow::Result;
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};
use z1_data::{GroupKind, RoomMode, Template, TemplateAtlas, TemplateGroup, FLAT_VARIANCE};

use crate::calibration::CalibrationMapping;
use crate::layout::{
    floor_position, TileDefinition, TileId, TileLayout, BRIGHTNESS_COLS, BRIGHTNESS_ROWS,
    HEART_SIZE, HEART_SLOTS, LIFE_H, LIFE_W, ROOM_H, ROOM_W, TRIFORCE_H, TRIFORCE_W,
};
use crate::scores::{Aggregates, FloorHit, RawFrameScores, MAX_TEMPLATES};

pub mod cpu;
pub mod gpu;

pub use cpu::CpuCorrelator;
pub use gpu::{GpuContext, GpuCorrelator};

pub const ROOM_PIXELS: u32 = ROOM_W * ROOM_H;
pub const BRIGHTNESS_SAMPLES: u32 = BRIGHTNESS_COLS * BRIGHTNESS_ROWS;
pub const LIFE_SAMPLES: u32 = LIFE_W * LIFE_H;
pub const GOLD_SAMPLES: u32 = TRIFORCE_W * TRIFORCE_H;
pub const HEART_SAMPLES: u32 = HEART_SLOTS as u32 * HEART_SIZE * HEART_SIZE;
pub const AGGREGATE_SAMPLES: u32 = BRIGHTNESS_SAMPLES + LIFE_SAMPLES + GOLD_SAMPLES + HEART_SAMPLES;

/// Aggregate counter slots: brightness sum, LIFE red count, gold count, then one per heart.
pub const AGG_BRIGHTNESS: usize = 0;
pub const AGG_LIFE_RED: usize = 1;
pub const AGG_GOLD: usize = 2;
pub const AGG_HEARTS: usize = 3;
pub const AGG_LEN: usize = AGG_HEARTS + HEART_SLOTS;

pub(crate) const FLOOR_SCORE_LEVELS: f32 = ((1u32 << 20) - 1) as f32;

/// Which correlation passes have templates to run with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PassSet {
    pub tiles: bool,
    pub overworld_rooms: bool,
    pub dungeon_rooms: bool,
    pub floor: bool,
}

impl PassSet {
    pub fn rooms(&self, mode: RoomMode) -> bool {
        match mode {
            RoomMode::Overworld => self.overworld_rooms,
            RoomMode::Dungeon => self.dungeon_rooms,
        }
    }
}

/// Everything a correlator needs for one calibrated stream.
#[derive(Debug, Clone)]
pub struct CorrelationPlan {
    pub mapping: CalibrationMapping,
    pub layout: TileLayout,
    pub passes: PassSet,
    atlas: Arc<TemplateAtlas>,
}

impl CorrelationPlan {
    pub fn new(atlas: Arc<TemplateAtlas>, mapping: CalibrationMapping, layout: TileLayout) -> Self {
        let passes = PassSet {
            tiles: layout
                .tiles()
                .iter()
                .any(|t| atlas.group(t.group).is_some()),
            overworld_rooms: atlas.group(GroupKind::OverworldRooms).is_some(),
            dungeon_rooms: atlas.group(GroupKind::DungeonRooms).is_some(),
            floor: atlas.group(GroupKind::Drops).is_some(),
        };
        for (name, enabled) in [
            ("HUD tile", passes.tiles),
            ("overworld room", passes.overworld_rooms),
            ("dungeon room", passes.dungeon_rooms),
            ("floor item", passes.floor),
        ] {
            if !enabled {
                warn!("{} pass disabled: no templates loaded", name);
            }
        }
        Self {
            mapping,
            layout,
            passes,
            atlas,
        }
    }

    pub fn atlas(&self) -> &TemplateAtlas {
        &self.atlas
    }

    /// Candidate templates for a tile, capped at `MAX_TEMPLATES`.
    pub fn tile_templates(&self, tile: &TileDefinition) -> &[Template] {
        match self.atlas.group(tile.group) {
            Some(group) if group.height == tile.size.height() => {
                &group.templates[..group.len().min(MAX_TEMPLATES)]
            }
            Some(group) => {
                debug!(
                    "Tile {} is {} rows but {:?} templates are {}",
                    tile.id.as_str(),
                    tile.size.height(),
                    tile.group,
                    group.height
                );
                &[]
            }
            None => &[],
        }
    }

    /// (tile, template count) per row of the score matrix.
    pub fn score_shape(&self) -> Vec<(TileId, usize)> {
        self.layout
            .tiles()
            .iter()
            .map(|t| (t.id, self.tile_templates(t).len()))
            .collect()
    }

    pub fn room_group(&self, mode: RoomMode) -> Option<&TemplateGroup> {
        if !self.passes.rooms(mode) {
            return None;
        }
        self.atlas.group(mode.group())
    }

    pub fn drops(&self) -> Option<&TemplateGroup> {
        self.atlas.group(GroupKind::Drops)
    }
}

/// NCC of a sampled patch against a zero-mean, unit-variance template.
///
/// `cross` is the sum of patch value times template value. A flat patch scores 0.
pub fn ncc(sum: f32, sum_sq: f32, cross: f32, n: f32) -> f32 {
    let mean = sum / n;
    let variance = (sum_sq / n - mean * mean).max(0.0);
    if variance <= FLAT_VARIANCE {
        return 0.0;
    }
    (cross / (n * variance.sqrt())).clamp(-1.0, 1.0)
}

/// Floor-search key: quantized score in the high 20 bits, position in the low 12.
/// Taking the max key keeps the best score, ties going to the later position.
pub fn pack_floor_key(score: f32, position: u32) -> u32 {
    let quantized = (((score + 1.0) * 0.5).clamp(0.0, 1.0) * FLOOR_SCORE_LEVELS) as u32;
    (quantized << 12) | (position & 0xfff)
}

pub fn unpack_floor_key(key: u32) -> (f32, u32) {
    let score = (key >> 12) as f32 / FLOOR_SCORE_LEVELS * 2.0 - 1.0;
    (score, key & 0xfff)
}

pub(crate) fn floor_hit(template: usize, key: u32) -> FloorHit {
    let (score, position) = unpack_floor_key(key);
    let (x, y) = floor_position(position);
    FloorHit {
        template,
        score,
        x,
        y,
    }
}

impl Aggregates {
    /// Decode the aggregate counters shared by both backends.
    pub fn from_counters(counters: &[u32]) -> Self {
        let at = |i: usize| counters.get(i).copied().unwrap_or(0);
        let mut heart_fill = [0.0; HEART_SLOTS];
        for (slot, fill) in heart_fill.iter_mut().enumerate() {
            *fill = at(AGG_HEARTS + slot) as f32 / (HEART_SIZE * HEART_SIZE) as f32;
        }
        Self {
            brightness: at(AGG_BRIGHTNESS) as f32 / BRIGHTNESS_SAMPLES as f32,
            red_ratio: at(AGG_LIFE_RED) as f32 * 100.0 / LIFE_SAMPLES as f32,
            gold_pixels: at(AGG_GOLD),
            heart_fill,
        }
    }
}

/// Correlation backend bound to one calibrated stream.
pub enum Correlator {
    Gpu(GpuCorrelator),
    Cpu(CpuCorrelator),
}

impl Correlator {
    /// GPU backend when a context is given and its pipelines build, CPU otherwise.
    pub async fn new(plan: CorrelationPlan, gpu: Option<&GpuContext>) -> Self {
        if let Some(ctx) = gpu {
            match GpuCorrelator::new(ctx, plan.clone()).await {
                Ok(correlator) => return Self::Gpu(correlator),
                Err(e) => warn!("GPU correlator unavailable, using CPU: {:#}", e),
            }
        }
        Self::Cpu(CpuCorrelator::new(plan))
    }

    pub fn backend(&self) -> &'static str {
        match self {
            Self::Gpu(_) => "gpu",
            Self::Cpu(_) => "cpu",
        }
    }

    pub fn plan(&self) -> &CorrelationPlan {
        match self {
            Self::Gpu(c) => c.plan(),
            Self::Cpu(c) => c.plan(),
        }
    }

    /// Score one frame. Room templates are taken from `room_mode`'s grid.
    pub async fn correlate(
        &mut self,
        frame: Arc<RgbaImage>,
        room_mode: RoomMode,
    ) -> Result<RawFrameScores> {
        match self {
            Self::Gpu(c) => c.correlate(frame, room_mode).await,
            Self::Cpu(c) => c.correlate(frame, room_mode).await,
        }
    }
}
