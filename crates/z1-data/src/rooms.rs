use serde::{Deserialize, Serialize};

use crate::GroupKind;

/// Which room grid the room-matching pass correlates against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomMode {
    #[default]
    Overworld,
    Dungeon,
}

impl RoomMode {
    /// Grid size as (columns, rows)
    pub fn grid(self) -> (u8, u8) {
        match self {
            RoomMode::Overworld => (16, 8),
            RoomMode::Dungeon => (8, 8),
        }
    }

    pub fn room_count(self) -> usize {
        let (cols, rows) = self.grid();
        cols as usize * rows as usize
    }

    pub fn group(self) -> GroupKind {
        match self {
            RoomMode::Overworld => GroupKind::OverworldRooms,
            RoomMode::Dungeon => GroupKind::DungeonRooms,
        }
    }

    /// Room id for a grid cell, row-major.
    pub fn room_id(self, col: u8, row: u8) -> Option<u8> {
        let (cols, rows) = self.grid();
        (col < cols && row < rows).then(|| row * cols + col)
    }

    /// Parse a room thumbnail name of the form `{col}_{row}`.
    pub fn parse_name(self, name: &str) -> Option<u8> {
        let (col, row) = name.split_once('_')?;
        self.room_id(col.parse().ok()?, row.parse().ok()?)
    }
}
