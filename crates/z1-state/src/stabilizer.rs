use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use z1_data::RoomMode;

use crate::{FrameState, ScreenType, StableState};

/// Fields tracked by the stabilizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Screen,
    DungeonLevel,
    Rupees,
    Keys,
    Bombs,
    BItem,
    SwordLevel,
    MasterKey,
    Room,
    TriforcePieces,
    HeartsCurrent,
    HeartsMax,
}

/// A change waiting for enough consecutive confirmations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingFieldInfo {
    pub field: Field,
    pub stable_value: Value,
    pub pending_value: Value,
    pub count: u32,
    pub threshold: u32,
}

/// Consecutive frames required before each field's stable value changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilizerConfig {
    pub screen: u32,
    pub dungeon_level: u32,
    pub rupees: u32,
    pub keys: u32,
    pub bombs: u32,
    pub b_item: u32,
    pub sword_level: u32,
    pub master_key: u32,
    pub room: u32,
    pub triforce_pieces: u32,
    pub hearts_current: u32,
    pub hearts_max: u32,
}

impl Default for StabilizerConfig {
    fn default() -> Self {
        Self {
            screen: 2,
            dungeon_level: 2,
            rupees: 3,
            keys: 3,
            bombs: 3,
            b_item: 3,
            sword_level: 3,
            master_key: 3,
            room: 2,
            triforce_pieces: 3,
            hearts_current: 3,
            hearts_max: 3,
        }
    }
}

impl StabilizerConfig {
    pub fn threshold(&self, field: Field) -> u32 {
        match field {
            Field::Screen => self.screen,
            Field::DungeonLevel => self.dungeon_level,
            Field::Rupees => self.rupees,
            Field::Keys => self.keys,
            Field::Bombs => self.bombs,
            Field::BItem => self.b_item,
            Field::SwordLevel => self.sword_level,
            Field::MasterKey => self.master_key,
            Field::Room => self.room,
            Field::TriforcePieces => self.triforce_pieces,
            Field::HeartsCurrent => self.hearts_current,
            Field::HeartsMax => self.hearts_max,
        }
    }
}

/// Debounce for a single field.
#[derive(Debug, Clone)]
pub struct Debounced<T> {
    stable: Option<T>,
    pending: Option<(T, u32)>,
    threshold: u32,
}

impl<T: Clone + PartialEq + Serialize> Debounced<T> {
    pub fn new(threshold: u32) -> Self {
        Self {
            stable: None,
            pending: None,
            threshold: threshold.max(1),
        }
    }

    pub fn stable(&self) -> Option<&T> {
        self.stable.as_ref()
    }

    /// Feed one frame's observation. `None` is "no observation" and leaves
    /// both the stable value and any pending candidate untouched.
    ///
    /// Returns true when the stable value changed.
    pub fn observe(&mut self, value: Option<T>) -> bool {
        let Some(value) = value else {
            return false;
        };

        if self.stable.as_ref() == Some(&value) {
            self.pending = None;
            return false;
        }

        let extended = match self.pending.as_mut() {
            Some((candidate, count)) if *candidate == value => {
                *count += 1;
                Some(*count)
            }
            _ => None,
        };
        let count = match extended {
            Some(count) => count,
            None => {
                self.pending = Some((value.clone(), 1));
                1
            }
        };

        if count >= self.threshold {
            self.stable = Some(value);
            self.pending = None;
            true
        } else {
            false
        }
    }

    pub fn pending_info(&self, field: Field) -> Option<PendingFieldInfo> {
        let (candidate, count) = self.pending.as_ref()?;
        Some(PendingFieldInfo {
            field,
            stable_value: serde_json::to_value(&self.stable).unwrap_or(Value::Null),
            pending_value: serde_json::to_value(candidate).unwrap_or(Value::Null),
            count: *count,
            threshold: self.threshold,
        })
    }
}

/// Per-field debounce over the interpreter's frame states.
#[derive(Debug, Clone)]
pub struct StateStabilizer {
    screen: Debounced<ScreenType>,
    dungeon_level: Debounced<u8>,
    rupees: Debounced<u32>,
    keys: Debounced<u32>,
    bombs: Debounced<u32>,
    b_item: Debounced<String>,
    sword_level: Debounced<u8>,
    master_key: Debounced<bool>,
    /// Room ids are only comparable within one grid, so the mode is debounced with the id
    room: Debounced<(RoomMode, u8)>,
    triforce_pieces: Debounced<u8>,
    hearts_current: Debounced<u8>,
    hearts_max: Debounced<u8>,
    frame_number: u64,
    timestamp_ms: u64,
}

impl StateStabilizer {
    pub fn new(config: &StabilizerConfig) -> Self {
        Self {
            screen: Debounced::new(config.threshold(Field::Screen)),
            dungeon_level: Debounced::new(config.threshold(Field::DungeonLevel)),
            rupees: Debounced::new(config.threshold(Field::Rupees)),
            keys: Debounced::new(config.threshold(Field::Keys)),
            bombs: Debounced::new(config.threshold(Field::Bombs)),
            b_item: Debounced::new(config.threshold(Field::BItem)),
            sword_level: Debounced::new(config.threshold(Field::SwordLevel)),
            master_key: Debounced::new(config.threshold(Field::MasterKey)),
            room: Debounced::new(config.threshold(Field::Room)),
            triforce_pieces: Debounced::new(config.threshold(Field::TriforcePieces)),
            hearts_current: Debounced::new(config.threshold(Field::HeartsCurrent)),
            hearts_max: Debounced::new(config.threshold(Field::HeartsMax)),
            frame_number: 0,
            timestamp_ms: 0,
        }
    }

    /// Fold one frame into the stable state. Returns the fields whose stable value changed.
    pub fn update(&mut self, frame: &FrameState, frame_number: u64, timestamp_ms: u64) -> Vec<Field> {
        self.frame_number = frame_number;
        self.timestamp_ms = timestamp_ms;

        let mut changed = Vec::new();
        let mut track = |field: Field, did_change: bool| {
            if did_change {
                changed.push(field);
            }
        };

        track(Field::Screen, self.screen.observe(Some(frame.screen)));
        track(Field::DungeonLevel, self.dungeon_level.observe(frame.dungeon_level));
        track(Field::Rupees, self.rupees.observe(frame.rupees));
        track(Field::Keys, self.keys.observe(frame.keys));
        track(Field::Bombs, self.bombs.observe(frame.bombs));
        track(Field::BItem, self.b_item.observe(frame.b_item.clone()));
        track(Field::SwordLevel, self.sword_level.observe(frame.sword_level));
        track(Field::MasterKey, self.master_key.observe(frame.has_master_key));
        track(Field::Room, self.room.observe(frame.room_mode.zip(frame.room)));
        track(Field::TriforcePieces, self.triforce_pieces.observe(frame.triforce_pieces));
        track(Field::HeartsCurrent, self.hearts_current.observe(frame.hearts_current));
        track(Field::HeartsMax, self.hearts_max.observe(frame.hearts_max));

        if !changed.is_empty() {
            debug!("Frame {}: stable fields changed {:?}", frame_number, changed);
        }
        changed
    }

    /// Snapshot of the stable state with pending diagnostics.
    /// Floor items are owned by the floor tracker and left empty here.
    pub fn stable(&self) -> StableState {
        let pending = [
            self.screen.pending_info(Field::Screen),
            self.dungeon_level.pending_info(Field::DungeonLevel),
            self.rupees.pending_info(Field::Rupees),
            self.keys.pending_info(Field::Keys),
            self.bombs.pending_info(Field::Bombs),
            self.b_item.pending_info(Field::BItem),
            self.sword_level.pending_info(Field::SwordLevel),
            self.master_key.pending_info(Field::MasterKey),
            self.room.pending_info(Field::Room),
            self.triforce_pieces.pending_info(Field::TriforcePieces),
            self.hearts_current.pending_info(Field::HeartsCurrent),
            self.hearts_max.pending_info(Field::HeartsMax),
        ]
        .into_iter()
        .flatten()
        .collect();

        StableState {
            frame_number: self.frame_number,
            timestamp_ms: self.timestamp_ms,
            screen: self.screen.stable().copied(),
            dungeon_level: self.dungeon_level.stable().copied(),
            rupees: self.rupees.stable().copied(),
            keys: self.keys.stable().copied(),
            bombs: self.bombs.stable().copied(),
            b_item: self.b_item.stable().cloned(),
            sword_level: self.sword_level.stable().copied(),
            has_master_key: self.master_key.stable().copied(),
            room: self.room.stable().map(|(_, id)| *id),
            room_mode: self.room.stable().map(|(mode, _)| *mode),
            floor_items: Vec::new(),
            triforce_pieces: self.triforce_pieces.stable().copied(),
            hearts_current: self.hearts_current.stable().copied(),
            hearts_max: self.hearts_max.stable().copied(),
            pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(rupees: Option<u32>) -> FrameState {
        FrameState {
            screen: ScreenType::Overworld,
            rupees,
            ..Default::default()
        }
    }

    #[test]
    fn test_debounce_requires_threshold() {
        let mut field = Debounced::new(3);
        assert!(!field.observe(Some(5u32)));
        assert!(!field.observe(Some(5)));
        assert!(field.stable().is_none());
        assert!(field.observe(Some(5)));
        assert_eq!(field.stable(), Some(&5));
    }

    #[test]
    fn test_repeats_change_stable_once() {
        let mut field = Debounced::new(2);
        let changes = (0..10).filter(|_| field.observe(Some(7u8))).count();
        assert_eq!(changes, 1);
        assert_eq!(field.stable(), Some(&7));
    }

    #[test]
    fn test_single_frame_glitch_ignored() {
        let mut field = Debounced::new(3);
        for _ in 0..3 {
            field.observe(Some(10u32));
        }
        assert!(!field.observe(Some(99)));
        assert!(!field.observe(Some(10)));
        assert_eq!(field.stable(), Some(&10));
        assert!(field.pending_info(Field::Rupees).is_none());
    }

    #[test]
    fn test_pending_resets_on_different_value() {
        let mut field = Debounced::new(3);
        field.observe(Some(1u32));
        field.observe(Some(1));
        field.observe(Some(2));
        let info = field.pending_info(Field::Keys).unwrap();
        assert_eq!(info.count, 1);
        assert_eq!(info.pending_value, serde_json::json!(2));
    }

    #[test]
    fn test_no_observation_keeps_pending() {
        let mut field = Debounced::new(2);
        field.observe(Some(4u32));
        assert!(!field.observe(None));
        assert!(field.observe(Some(4)));
    }

    #[test]
    fn test_stabilizer_idempotent() {
        let mut stabilizer = StateStabilizer::new(&StabilizerConfig::default());
        let mut rupee_changes = 0;
        for i in 0..8 {
            let changed = stabilizer.update(&frame(Some(42)), i, i * 16);
            if changed.contains(&Field::Rupees) {
                rupee_changes += 1;
            }
        }
        assert_eq!(rupee_changes, 1);
        let stable = stabilizer.stable();
        assert_eq!(stable.rupees, Some(42));
        assert_eq!(stable.screen, Some(ScreenType::Overworld));
        assert_eq!(stable.frame_number, 7);
        assert!(stable.pending.is_empty());
    }

    #[test]
    fn test_pending_exposed_in_snapshot() {
        let mut stabilizer = StateStabilizer::new(&StabilizerConfig::default());
        stabilizer.update(&frame(Some(3)), 0, 0);
        let stable = stabilizer.stable();
        assert_eq!(stable.rupees, None);
        let info = stable
            .pending
            .iter()
            .find(|p| p.field == Field::Rupees)
            .unwrap();
        assert_eq!(info.count, 1);
        assert_eq!(info.threshold, 3);
        assert_eq!(info.stable_value, serde_json::Value::Null);
    }

    #[test]
    fn test_room_carries_its_grid() {
        let mut stabilizer = StateStabilizer::new(&StabilizerConfig::default());
        let overworld = FrameState {
            screen: ScreenType::Overworld,
            room: Some(12),
            room_mode: Some(RoomMode::Overworld),
            ..Default::default()
        };
        let dungeon = FrameState {
            screen: ScreenType::Dungeon,
            room: Some(12),
            room_mode: Some(RoomMode::Dungeon),
            ..Default::default()
        };
        stabilizer.update(&overworld, 0, 0);
        stabilizer.update(&overworld, 1, 16);
        assert_eq!(stabilizer.stable().room_mode, Some(RoomMode::Overworld));
        stabilizer.update(&dungeon, 2, 32);
        let changed = stabilizer.update(&dungeon, 3, 48);
        assert!(changed.contains(&Field::Room));
        let stable = stabilizer.stable();
        assert_eq!(stable.room, Some(12));
        assert_eq!(stable.room_mode, Some(RoomMode::Dungeon));
    }

    #[test]
    fn test_per_field_thresholds() {
        let config = StabilizerConfig {
            screen: 1,
            ..Default::default()
        };
        let mut stabilizer = StateStabilizer::new(&config);
        let changed = stabilizer.update(&frame(None), 0, 0);
        assert_eq!(changed, vec![Field::Screen]);
    }
}
