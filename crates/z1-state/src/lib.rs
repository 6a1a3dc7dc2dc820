use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use z1_data::RoomMode;

pub mod floor_items;
pub mod player_items;
pub mod stabilizer;

pub use floor_items::{FloorItemTracker, FloorUpdate, RoomKey, TrackedFloorItem};
pub use player_items::{PlayerInventory, PlayerItemTracker};
pub use stabilizer::{Debounced, Field, PendingFieldInfo, StabilizerConfig, StateStabilizer};

/// Coarse classification of what the stream is currently showing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScreenType {
    #[default]
    Unknown,
    Transition,
    Overworld,
    Cave,
    Dungeon,
    Subscreen,
}

impl ScreenType {
    /// Screens where the HUD and playfield are visible and readable.
    pub fn is_gameplay(self) -> bool {
        matches!(
            self,
            ScreenType::Overworld | ScreenType::Cave | ScreenType::Dungeon
        )
    }

    /// Room grid a screen of this type is localized against.
    pub fn room_mode(self) -> Option<RoomMode> {
        match self {
            ScreenType::Overworld | ScreenType::Cave => Some(RoomMode::Overworld),
            ScreenType::Dungeon => Some(RoomMode::Dungeon),
            _ => None,
        }
    }
}

/// A floor-item sighting in one frame, in canonical coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FloorDetection {
    pub name: String,
    pub x: f32,
    pub y: f32,
    pub score: f32,
}

/// Best-guess game state read from a single frame.
///
/// `None` means "no observation" for that field in this frame, never zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameState {
    pub screen: ScreenType,
    /// 0 on the overworld, 1-9 inside a dungeon
    pub dungeon_level: Option<u8>,
    pub rupees: Option<u32>,
    pub keys: Option<u32>,
    pub bombs: Option<u32>,
    pub b_item: Option<String>,
    pub sword_level: Option<u8>,
    pub has_master_key: Option<bool>,
    pub room: Option<u8>,
    /// Grid `room` was matched against
    pub room_mode: Option<RoomMode>,
    pub floor_items: Vec<FloorDetection>,
    pub triforce_pieces: Option<u8>,
    /// Current life in half-heart units
    pub hearts_current: Option<u8>,
    /// Heart containers
    pub hearts_max: Option<u8>,
    /// Subscreen inventory scan: every known item, true when seen in a slot
    pub inventory: Option<BTreeMap<String, bool>>,
}

/// Debounced game state exposed to every downstream consumer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StableState {
    pub frame_number: u64,
    pub timestamp_ms: u64,
    pub screen: Option<ScreenType>,
    pub dungeon_level: Option<u8>,
    pub rupees: Option<u32>,
    pub keys: Option<u32>,
    pub bombs: Option<u32>,
    pub b_item: Option<String>,
    pub sword_level: Option<u8>,
    pub has_master_key: Option<bool>,
    pub room: Option<u8>,
    pub room_mode: Option<RoomMode>,
    pub floor_items: Vec<TrackedFloorItem>,
    pub triforce_pieces: Option<u8>,
    pub hearts_current: Option<u8>,
    pub hearts_max: Option<u8>,
    pub pending: Vec<PendingFieldInfo>,
}

impl StableState {
    pub fn is_gameplay(&self) -> bool {
        self.screen.map_or(false, ScreenType::is_gameplay)
    }

    /// Room grid for the next frame's room-matching pass.
    pub fn matching_mode(&self) -> RoomMode {
        self.screen
            .and_then(ScreenType::room_mode)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gameplay_screens() {
        assert!(ScreenType::Cave.is_gameplay());
        assert!(!ScreenType::Subscreen.is_gameplay());
        assert!(!ScreenType::Transition.is_gameplay());
    }

    #[test]
    fn test_matching_mode_follows_screen() {
        let mut state = StableState::default();
        assert_eq!(state.matching_mode(), RoomMode::Overworld);
        state.screen = Some(ScreenType::Dungeon);
        assert_eq!(state.matching_mode(), RoomMode::Dungeon);
        state.screen = Some(ScreenType::Subscreen);
        assert_eq!(state.matching_mode(), RoomMode::Overworld);
    }
}
