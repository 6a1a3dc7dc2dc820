use serde::{Deserialize, Serialize};
use tracing::debug;
use z1_data::GroupKind;

use crate::calibration::CalibrationMapping;

/// "-LIFE-" glyph, the primary calibration anchor.
pub const LIFE_X: f32 = 184.0;
pub const LIFE_Y: f32 = 16.0;
pub const LIFE_W: u32 = 48;
pub const LIFE_H: u32 = 8;

/// Heart slots: hearts 1-8 on the bottom row, 9-16 on the top row.
pub const HEARTS_X: f32 = 176.0;
pub const HEARTS_TOP_Y: f32 = 32.0;
pub const HEARTS_BOTTOM_Y: f32 = 40.0;
pub const HEART_SLOTS: usize = 16;
pub const HEART_SIZE: u32 = 8;

/// Triforce display on the subscreen.
pub const TRIFORCE_X: f32 = 96.0;
pub const TRIFORCE_Y: f32 = 112.0;
pub const TRIFORCE_W: u32 = 64;
pub const TRIFORCE_H: u32 = 48;

/// Subscreen inventory grid: two rows of four slots.
pub const INVENTORY_X: f32 = 132.0;
pub const INVENTORY_Y: f32 = 48.0;
pub const INVENTORY_STEP_X: f32 = 24.0;
pub const INVENTORY_STEP_Y: f32 = 16.0;

/// Left borders of the B and A item boxes, and the row the boxes start on.
pub const B_BOX_X: f32 = 120.0;
pub const A_BOX_X: f32 = 144.0;
pub const BOX_TOP_Y: f32 = 16.0;

/// Playable viewport below the HUD.
pub const VIEWPORT_Y: f32 = 64.0;
pub const VIEWPORT_W: u32 = 256;
pub const VIEWPORT_H: u32 = 176;

/// Downsampled room thumbnail: one cell per 4x4 canonical block of the viewport.
pub const ROOM_W: u32 = 64;
pub const ROOM_H: u32 = 44;
pub const ROOM_CELL: f32 = 4.0;

/// Floor-item search grid over the viewport.
pub const FLOOR_STRIDE: u32 = 4;
pub const FLOOR_COLS: u32 = (VIEWPORT_W - 8) / FLOOR_STRIDE + 1;
pub const FLOOR_ROWS: u32 = (VIEWPORT_H - 16) / FLOOR_STRIDE + 1;

/// Brightness sampling grid over the viewport.
pub const BRIGHTNESS_COLS: u32 = 32;
pub const BRIGHTNESS_ROWS: u32 = 22;
pub const BRIGHTNESS_STEP: f32 = 8.0;

/// Canonical top-left of a floor search position.
pub fn floor_position(index: u32) -> (f32, f32) {
    (
        (index % FLOOR_COLS * FLOOR_STRIDE) as f32,
        VIEWPORT_Y + (index / FLOOR_COLS * FLOOR_STRIDE) as f32,
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TileId {
    Rupee0,
    Rupee1,
    Rupee2,
    Key0,
    Key1,
    Bomb0,
    Bomb1,
    Level,
    BItem,
    Sword,
    Inventory0,
    Inventory1,
    Inventory2,
    Inventory3,
    Inventory4,
    Inventory5,
    Inventory6,
    Inventory7,
}

impl TileId {
    pub const INVENTORY: [TileId; 8] = [
        TileId::Inventory0,
        TileId::Inventory1,
        TileId::Inventory2,
        TileId::Inventory3,
        TileId::Inventory4,
        TileId::Inventory5,
        TileId::Inventory6,
        TileId::Inventory7,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TileId::Rupee0 => "rupee_0",
            TileId::Rupee1 => "rupee_1",
            TileId::Rupee2 => "rupee_2",
            TileId::Key0 => "key_0",
            TileId::Key1 => "key_1",
            TileId::Bomb0 => "bomb_0",
            TileId::Bomb1 => "bomb_1",
            TileId::Level => "level",
            TileId::BItem => "b_item",
            TileId::Sword => "sword",
            TileId::Inventory0 => "inventory_0",
            TileId::Inventory1 => "inventory_1",
            TileId::Inventory2 => "inventory_2",
            TileId::Inventory3 => "inventory_3",
            TileId::Inventory4 => "inventory_4",
            TileId::Inventory5 => "inventory_5",
            TileId::Inventory6 => "inventory_6",
            TileId::Inventory7 => "inventory_7",
        }
    }

    /// Counter a digit tile belongs to, used to match group landmarks.
    pub fn counter(self) -> Option<&'static str> {
        match self {
            TileId::Rupee0 | TileId::Rupee1 | TileId::Rupee2 => Some("rupees"),
            TileId::Key0 | TileId::Key1 => Some("keys"),
            TileId::Bomb0 | TileId::Bomb1 => Some("bombs"),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TileSize {
    Square,
    Tall,
}

impl TileSize {
    pub fn height(self) -> u32 {
        match self {
            TileSize::Square => 8,
            TileSize::Tall => 16,
        }
    }
}

/// One HUD field at a canonical position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TileDefinition {
    pub id: TileId,
    pub nes_x: f32,
    pub nes_y: f32,
    pub size: TileSize,
    pub group: GroupKind,
}

/// Empirically measured position of a HUD element in stream pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Landmark {
    pub label: String,
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

/// The HUD tile table for one stream.
#[derive(Debug, Clone, PartialEq)]
pub struct TileLayout {
    tiles: Vec<TileDefinition>,
}

impl Default for TileLayout {
    fn default() -> Self {
        let digit = |id, nes_x, nes_y| TileDefinition {
            id,
            nes_x,
            nes_y,
            size: TileSize::Square,
            group: GroupKind::Digits,
        };
        let mut tiles = vec![
            digit(TileId::Rupee0, 96.0, 16.0),
            digit(TileId::Rupee1, 104.0, 16.0),
            digit(TileId::Rupee2, 112.0, 16.0),
            digit(TileId::Key0, 104.0, 32.0),
            digit(TileId::Key1, 112.0, 32.0),
            digit(TileId::Bomb0, 104.0, 40.0),
            digit(TileId::Bomb1, 112.0, 40.0),
            digit(TileId::Level, 64.0, 8.0),
            TileDefinition {
                id: TileId::BItem,
                nes_x: 128.0,
                nes_y: 24.0,
                size: TileSize::Tall,
                group: GroupKind::BItems,
            },
            TileDefinition {
                id: TileId::Sword,
                nes_x: 152.0,
                nes_y: 24.0,
                size: TileSize::Tall,
                group: GroupKind::Swords,
            },
        ];
        // Only meaningful while the subscreen is open
        tiles.extend(TileId::INVENTORY.iter().enumerate().map(|(i, id)| TileDefinition {
            id: *id,
            nes_x: INVENTORY_X + (i % 4) as f32 * INVENTORY_STEP_X,
            nes_y: INVENTORY_Y + (i / 4) as f32 * INVENTORY_STEP_Y,
            size: TileSize::Tall,
            group: GroupKind::BItems,
        }));
        Self { tiles }
    }
}

impl TileLayout {
    pub fn tiles(&self) -> &[TileDefinition] {
        &self.tiles
    }

    pub fn get(&self, id: TileId) -> Option<&TileDefinition> {
        self.tiles.iter().find(|t| t.id == id)
    }

    /// Default layout with landmark overrides applied.
    ///
    /// A landmark labelled with a tile id (`rupee_0`, `b_item`, ...) moves that
    /// tile. A landmark labelled with a counter name (`rupees`, `keys`, `bombs`)
    /// places that counter's digits left to right from the landmark origin.
    /// Unknown labels are ignored.
    pub fn with_landmarks(mapping: &CalibrationMapping, landmarks: &[Landmark]) -> Self {
        let mut layout = Self::default();
        for landmark in landmarks {
            let (nes_x, nes_y) = mapping.to_canonical(landmark.x, landmark.y);
            let mut matched = false;
            let mut slot = 0.0;
            for tile in layout.tiles.iter_mut() {
                if tile.id.as_str() == landmark.label {
                    tile.nes_x = nes_x;
                    tile.nes_y = nes_y;
                    matched = true;
                } else if tile.id.counter() == Some(landmark.label.as_str()) {
                    tile.nes_x = nes_x + slot * 8.0;
                    tile.nes_y = nes_y;
                    slot += 1.0;
                    matched = true;
                }
            }
            if matched {
                debug!(
                    "Landmark {} overrides tile position to ({:.1}, {:.1})",
                    landmark.label, nes_x, nes_y
                );
            } else {
                debug!("Ignoring landmark with unknown label {}", landmark.label);
            }
        }
        layout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping() -> CalibrationMapping {
        CalibrationMapping {
            crop_x: 100.0,
            crop_y: 20.0,
            scale_x: 2.0,
            scale_y: 2.0,
            grid_dx: 0.0,
            grid_dy: 0.0,
            video_width: 800,
            video_height: 600,
            confidence: 1.0,
        }
    }

    #[test]
    fn test_default_table() {
        let layout = TileLayout::default();
        assert_eq!(layout.tiles().len(), 18);
        assert_eq!(layout.get(TileId::BItem).unwrap().size.height(), 16);
        assert_eq!(layout.get(TileId::Rupee2).unwrap().nes_x, 112.0);
        let slot = layout.get(TileId::Inventory5).unwrap();
        assert_eq!((slot.nes_x, slot.nes_y), (156.0, 64.0));
        assert_eq!(slot.group, GroupKind::BItems);
    }

    #[test]
    fn test_tile_landmark_override() {
        let landmarks = vec![Landmark {
            label: "sword".into(),
            x: 420.0,
            y: 70.0,
            w: 16.0,
            h: 32.0,
        }];
        let layout = TileLayout::with_landmarks(&mapping(), &landmarks);
        let sword = layout.get(TileId::Sword).unwrap();
        assert_eq!((sword.nes_x, sword.nes_y), (160.0, 25.0));
        // Others untouched
        assert_eq!(layout.get(TileId::BItem).unwrap().nes_x, 128.0);
    }

    #[test]
    fn test_counter_landmark_lays_out_digits() {
        let landmarks = vec![Landmark {
            label: "keys".into(),
            x: 300.0,
            y: 84.0,
            w: 32.0,
            h: 16.0,
        }];
        let layout = TileLayout::with_landmarks(&mapping(), &landmarks);
        assert_eq!(layout.get(TileId::Key0).unwrap().nes_x, 100.0);
        assert_eq!(layout.get(TileId::Key1).unwrap().nes_x, 108.0);
        assert_eq!(layout.get(TileId::Key1).unwrap().nes_y, 32.0);
    }

    #[test]
    fn test_floor_grid() {
        assert_eq!(FLOOR_COLS, 63);
        assert_eq!(FLOOR_ROWS, 41);
        assert_eq!(floor_position(0), (0.0, 64.0));
        assert_eq!(floor_position(FLOOR_COLS + 2), (8.0, 68.0));
    }
}
