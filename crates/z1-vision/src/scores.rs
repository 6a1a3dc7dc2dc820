use serde::{Deserialize, Serialize};
use z1_data::RoomMode;

use crate::layout::{TileId, HEART_SLOTS};

/// Upper bound on candidate templates scored per tile.
pub const MAX_TEMPLATES: usize = 32;

/// Per-tile NCC scores, one row of up to `MAX_TEMPLATES` per HUD tile.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreMatrix {
    ids: Vec<TileId>,
    counts: Vec<usize>,
    values: Vec<f32>,
}

impl ScoreMatrix {
    /// Zeroed matrix for the given tiles and their template counts.
    pub fn new(tiles: Vec<(TileId, usize)>) -> Self {
        let (ids, counts): (Vec<_>, Vec<_>) = tiles
            .into_iter()
            .map(|(id, n)| (id, n.min(MAX_TEMPLATES)))
            .unzip();
        let values = vec![0.0; ids.len() * MAX_TEMPLATES];
        Self {
            ids,
            counts,
            values,
        }
    }

    /// Build from a flat `tiles * MAX_TEMPLATES` buffer.
    pub fn from_flat(tiles: Vec<(TileId, usize)>, flat: &[f32]) -> Self {
        let mut matrix = Self::new(tiles);
        let n = matrix.values.len().min(flat.len());
        matrix.values[..n].copy_from_slice(&flat[..n]);
        matrix
    }

    pub fn tile_count(&self) -> usize {
        self.ids.len()
    }

    pub fn set(&mut self, tile: usize, template: usize, score: f32) {
        if tile < self.ids.len() && template < self.counts[tile] {
            self.values[tile * MAX_TEMPLATES + template] = score;
        }
    }

    /// Valid scores of one tile, indexed by template.
    pub fn row(&self, tile: usize) -> &[f32] {
        match self.counts.get(tile) {
            Some(&n) => &self.values[tile * MAX_TEMPLATES..tile * MAX_TEMPLATES + n],
            None => &[],
        }
    }

    /// Scores for a tile by id; empty when the tile had no templates.
    pub fn tile(&self, id: TileId) -> &[f32] {
        match self.ids.iter().position(|t| *t == id) {
            Some(index) => self.row(index),
            None => &[],
        }
    }
}

/// Best placement of one drop template in the viewport.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FloorHit {
    pub template: usize,
    pub score: f32,
    /// Canonical top-left of the match
    pub x: f32,
    pub y: f32,
}

/// Whole-frame measurements independent of any template.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Aggregates {
    /// Mean viewport luma, 0..255
    pub brightness: f32,
    /// Percentage of LIFE glyph samples that are red
    pub red_ratio: f32,
    /// Gold samples in the triforce region
    pub gold_pixels: u32,
    /// Red fraction of each heart slot, 0..1
    pub heart_fill: [f32; HEART_SLOTS],
}

/// Everything one correlation pass produces for one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrameScores {
    pub tiles: ScoreMatrix,
    /// Grid the room scores belong to
    pub room_mode: RoomMode,
    /// One score per room template of `room_mode`; empty when the pass was disabled
    pub rooms: Vec<f32>,
    pub floor: Vec<FloorHit>,
    pub aggregates: Aggregates,
}
