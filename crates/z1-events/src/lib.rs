//! One-shot race events inferred from stable state transitions.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use tracing::info;
use z1_data::{items, RoomMode};
use z1_state::{ScreenType, StableState, TrackedFloorItem};

/// Ganon lives in level 9.
pub const GANON_LEVEL: u8 = 9;
/// Ganon's room in the level 9 grid.
pub const GANON_ROOM: u8 = 13;
/// The room north of Ganon, reachable only after the kill.
pub const PRINCESS_ROOM: u8 = 5;
/// Consecutive stable updates on the ending screen before the game counts as complete.
pub const ENDING_FRAMES: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    HeartContainer,
    SwordUpgrade,
    BItemChange,
    DungeonFirstVisit,
    Death,
    TriforceInferred,
    GanonFight,
    GanonKill,
    GameComplete,
    ItemPickup,
    MasterKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventPriority {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameEvent {
    pub racer_id: String,
    pub event_type: EventType,
    pub timestamp_ms: u64,
    pub frame_number: u64,
    pub priority: EventPriority,
    pub description: String,
    pub data: Value,
}

/// Per-racer state machine over consecutive stable states.
#[derive(Debug, Clone)]
pub struct EventInferencer {
    racer_id: String,
    // Highest values seen; these only grow during a run
    max_hearts: Option<u8>,
    max_sword: Option<u8>,
    max_triforce: Option<u8>,
    last_b_item: Option<String>,
    visited: HashSet<(u8, u8)>,
    dead: bool,
    master_key: bool,
    ganon_fight: bool,
    ganon_killed: bool,
    ending_frames: u32,
    complete: bool,
}

/// Raise `mark` to `value`; returns (old, new) when an existing mark went up.
fn rise(mark: &mut Option<u8>, value: Option<u8>) -> Option<(u8, u8)> {
    let value = value?;
    match *mark {
        Some(before) if value > before => {
            *mark = Some(value);
            Some((before, value))
        }
        Some(_) => None,
        None => {
            *mark = Some(value);
            None
        }
    }
}

impl EventInferencer {
    pub fn new(racer_id: impl Into<String>) -> Self {
        Self {
            racer_id: racer_id.into(),
            max_hearts: None,
            max_sword: None,
            max_triforce: None,
            last_b_item: None,
            visited: HashSet::new(),
            dead: false,
            master_key: false,
            ganon_fight: false,
            ganon_killed: false,
            ending_frames: 0,
            complete: false,
        }
    }

    pub fn racer_id(&self) -> &str {
        &self.racer_id
    }

    /// Dungeon rooms seen so far as (level, room).
    pub fn visited(&self) -> &HashSet<(u8, u8)> {
        &self.visited
    }

    /// Compare `state` against what was seen so far and return the events it triggers.
    /// `obtained` are floor items the tracker reported picked up this frame.
    pub fn update(&mut self, state: &StableState, obtained: &[TrackedFloorItem]) -> Vec<GameEvent> {
        let mut events = Vec::new();
        let mut emit = |event_type, priority, description: String, data: Value| {
            events.push(GameEvent {
                racer_id: self.racer_id.clone(),
                event_type,
                timestamp_ms: state.timestamp_ms,
                frame_number: state.frame_number,
                priority,
                description,
                data,
            });
        };

        if let Some((before, after)) = rise(&mut self.max_hearts, state.hearts_max) {
            emit(
                EventType::HeartContainer,
                EventPriority::Medium,
                format!("Heart container ({} -> {})", before, after),
                json!({ "from": before, "to": after }),
            );
        }
        if let Some((before, after)) = rise(&mut self.max_sword, state.sword_level) {
            emit(
                EventType::SwordUpgrade,
                EventPriority::High,
                format!("Sword upgraded to level {}", after),
                json!({ "from": before, "to": after }),
            );
        }
        if let Some((before, after)) = rise(&mut self.max_triforce, state.triforce_pieces) {
            emit(
                EventType::TriforceInferred,
                EventPriority::High,
                format!("Triforce pieces: {}", after),
                json!({ "from": before, "to": after }),
            );
        }

        if let Some(b_item) = &state.b_item {
            if self.last_b_item.as_ref() != Some(b_item) {
                if let Some(before) = &self.last_b_item {
                    emit(
                        EventType::BItemChange,
                        EventPriority::Low,
                        format!("B item {} -> {}", before, b_item),
                        json!({ "from": before, "to": b_item }),
                    );
                }
                self.last_b_item = Some(b_item.clone());
            }
        }

        if let Some((level, room)) = dungeon_room(state) {
            if self.visited.insert((level, room)) {
                emit(
                    EventType::DungeonFirstVisit,
                    EventPriority::Low,
                    format!("First visit to level {} room {}", level, room),
                    json!({ "level": level, "room": room }),
                );
            }
        }

        match (state.hearts_current, state.is_gameplay()) {
            (Some(0), true) if !self.dead => {
                self.dead = true;
                emit(
                    EventType::Death,
                    EventPriority::High,
                    "Died".to_string(),
                    json!({ "level": state.dungeon_level, "room": state.room }),
                );
            }
            (Some(h), _) if h > 0 => self.dead = false,
            _ => {}
        }

        if state.has_master_key == Some(true) && !self.master_key {
            self.master_key = true;
            emit(
                EventType::MasterKey,
                EventPriority::Medium,
                "Master key".to_string(),
                Value::Null,
            );
        }

        for item in obtained {
            let consumable = items::is_consumable(&item.name);
            emit(
                EventType::ItemPickup,
                if consumable {
                    EventPriority::Low
                } else {
                    EventPriority::Medium
                },
                format!("Picked up {}", item.name),
                json!({ "item": item.name, "x": item.x, "y": item.y }),
            );
        }

        match dungeon_room(state) {
            Some((GANON_LEVEL, GANON_ROOM)) if !self.ganon_fight => {
                self.ganon_fight = true;
                emit(
                    EventType::GanonFight,
                    EventPriority::High,
                    "Entered Ganon's room".to_string(),
                    Value::Null,
                );
            }
            Some((GANON_LEVEL, PRINCESS_ROOM)) if self.ganon_fight && !self.ganon_killed => {
                self.ganon_killed = true;
                emit(
                    EventType::GanonKill,
                    EventPriority::High,
                    "Ganon defeated".to_string(),
                    Value::Null,
                );
            }
            _ => {}
        }
        if self.ganon_killed && state.screen == Some(ScreenType::Unknown) {
            self.ending_frames += 1;
        } else {
            self.ending_frames = 0;
        }
        if self.ending_frames >= ENDING_FRAMES && !self.complete {
            self.complete = true;
            emit(
                EventType::GameComplete,
                EventPriority::High,
                "Game complete".to_string(),
                Value::Null,
            );
        }

        for event in &events {
            info!("[{}] {:?}: {}", self.racer_id, event.event_type, event.description);
        }
        events
    }
}

/// (level, room) when the stable state places the player in a dungeon room.
fn dungeon_room(state: &StableState) -> Option<(u8, u8)> {
    if state.room_mode != Some(RoomMode::Dungeon) {
        return None;
    }
    let level = state.dungeon_level.filter(|l| *l >= 1)?;
    Some((level, state.room?))
}
