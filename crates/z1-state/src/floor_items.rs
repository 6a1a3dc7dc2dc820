use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::FloorDetection;

/// Consecutive sightings before an item counts as on screen.
pub const CONFIRM_FRAMES: u32 = 3;
/// Consecutive misses before a confirmed item counts as picked up.
pub const OBTAIN_FRAMES: u32 = 6;
/// Frames ignored after entering a new room.
pub const ROOM_GRACE_FRAMES: u32 = 3;
/// Position bucket size in canonical pixels.
const POSITION_QUANTUM: f32 = 16.0;

/// Identifies a room for object permanence: (dungeon level, room id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoomKey {
    pub dungeon_level: u8,
    pub room: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedFloorItem {
    pub name: String,
    pub x: f32,
    pub y: f32,
    pub score: f32,
    pub confirmed_frames: u32,
    pub gone_frames: u32,
}

impl TrackedFloorItem {
    pub fn is_confirmed(&self) -> bool {
        self.confirmed_frames >= CONFIRM_FRAMES
    }
}

/// What changed in one tracker update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FloorUpdate {
    /// Items that reached confirmation this frame
    pub confirmed: Vec<TrackedFloorItem>,
    /// Confirmed items that disappeared long enough to count as picked up
    pub obtained: Vec<TrackedFloorItem>,
}

type ItemKey = (String, i32, i32);

fn item_key(det: &FloorDetection) -> ItemKey {
    (
        det.name.clone(),
        (det.x / POSITION_QUANTUM).round() as i32,
        (det.y / POSITION_QUANTUM).round() as i32,
    )
}

/// Multi-frame object permanence for dropped items in the current room.
#[derive(Debug, Clone, Default)]
pub struct FloorItemTracker {
    room: Option<RoomKey>,
    grace: u32,
    items: HashMap<ItemKey, TrackedFloorItem>,
}

impl FloorItemTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn room(&self) -> Option<RoomKey> {
        self.room
    }

    /// Feed one gameplay frame's detections.
    ///
    /// `room` of `None` means the room could not be read this frame and is
    /// treated as unchanged.
    pub fn update(&mut self, room: Option<RoomKey>, detections: &[FloorDetection]) -> FloorUpdate {
        if let Some(room) = room {
            if self.room != Some(room) {
                if !self.items.is_empty() {
                    debug!(
                        "Room changed to {:?}, dropping {} tracked item(s)",
                        room,
                        self.items.len()
                    );
                }
                self.items.clear();
                self.room = Some(room);
                self.grace = ROOM_GRACE_FRAMES;
            }
        }

        let mut update = FloorUpdate::default();

        if self.grace > 0 {
            self.grace -= 1;
            return update;
        }

        let mut seen: HashSet<ItemKey> = HashSet::new();
        for det in detections {
            let key = item_key(det);
            if !seen.insert(key.clone()) {
                continue;
            }
            match self.items.get_mut(&key) {
                Some(item) => {
                    item.confirmed_frames = item.confirmed_frames.saturating_add(1);
                    item.gone_frames = 0;
                    item.x = det.x;
                    item.y = det.y;
                    item.score = det.score;
                    if item.confirmed_frames == CONFIRM_FRAMES {
                        update.confirmed.push(item.clone());
                    }
                }
                None => {
                    self.items.insert(
                        key,
                        TrackedFloorItem {
                            name: det.name.clone(),
                            x: det.x,
                            y: det.y,
                            score: det.score,
                            confirmed_frames: 1,
                            gone_frames: 0,
                        },
                    );
                }
            }
        }

        let known_room = self.room.is_some();
        let mut obtained = Vec::new();
        self.items.retain(|key, item| {
            if seen.contains(key) {
                return true;
            }
            if !item.is_confirmed() {
                // Candidate failed to reconfirm
                return false;
            }
            item.gone_frames += 1;
            if item.gone_frames >= OBTAIN_FRAMES {
                if known_room {
                    obtained.push(item.clone());
                }
                return false;
            }
            true
        });

        for item in &obtained {
            debug!("Floor item {} at ({:.0}, {:.0}) picked up", item.name, item.x, item.y);
        }
        update.obtained = obtained;
        update
    }

    /// Confirmed items currently considered on screen.
    pub fn visible(&self) -> Vec<TrackedFloorItem> {
        let mut items: Vec<_> = self
            .items
            .values()
            .filter(|item| item.is_confirmed())
            .cloned()
            .collect();
        items.sort_by(|a, b| {
            a.name
                .cmp(&b.name)
                .then(a.x.total_cmp(&b.x))
                .then(a.y.total_cmp(&b.y))
        });
        items
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.room = None;
        self.grace = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROOM: RoomKey = RoomKey {
        dungeon_level: 1,
        room: 20,
    };

    fn heart() -> FloorDetection {
        FloorDetection {
            name: "heart".into(),
            x: 120.0,
            y: 140.0,
            score: 0.9,
        }
    }

    /// Tracker already past the grace period of `ROOM`.
    fn settled() -> FloorItemTracker {
        let mut tracker = FloorItemTracker::new();
        for _ in 0..ROOM_GRACE_FRAMES {
            tracker.update(Some(ROOM), &[]);
        }
        tracker
    }

    #[test]
    fn test_confirm_after_three_frames() {
        let mut tracker = settled();
        assert!(tracker.update(Some(ROOM), &[heart()]).confirmed.is_empty());
        assert!(tracker.update(Some(ROOM), &[heart()]).confirmed.is_empty());
        assert!(tracker.visible().is_empty());
        let update = tracker.update(Some(ROOM), &[heart()]);
        assert_eq!(update.confirmed.len(), 1);
        assert_eq!(tracker.visible().len(), 1);
        // Already confirmed: not reported again
        assert!(tracker.update(Some(ROOM), &[heart()]).confirmed.is_empty());
    }

    #[test]
    fn test_interrupted_candidate_dropped() {
        let mut tracker = settled();
        tracker.update(Some(ROOM), &[heart()]);
        tracker.update(Some(ROOM), &[heart()]);
        tracker.update(Some(ROOM), &[]);
        assert!(tracker.update(Some(ROOM), &[heart()]).confirmed.is_empty());
    }

    #[test]
    fn test_obtained_after_six_misses() {
        let mut tracker = settled();
        for _ in 0..CONFIRM_FRAMES {
            tracker.update(Some(ROOM), &[heart()]);
        }
        for _ in 0..OBTAIN_FRAMES - 1 {
            assert!(tracker.update(Some(ROOM), &[]).obtained.is_empty());
        }
        assert_eq!(tracker.visible().len(), 1);
        let update = tracker.update(Some(ROOM), &[]);
        assert_eq!(update.obtained.len(), 1);
        assert_eq!(update.obtained[0].name, "heart");
        assert!(tracker.visible().is_empty());
    }

    #[test]
    fn test_short_gap_is_not_pickup() {
        let mut tracker = settled();
        for _ in 0..CONFIRM_FRAMES {
            tracker.update(Some(ROOM), &[heart()]);
        }
        for _ in 0..3 {
            tracker.update(Some(ROOM), &[]);
        }
        tracker.update(Some(ROOM), &[heart()]);
        for _ in 0..OBTAIN_FRAMES - 1 {
            assert!(tracker.update(Some(ROOM), &[]).obtained.is_empty());
        }
    }

    #[test]
    fn test_room_change_clears_without_pickup() {
        let mut tracker = settled();
        for _ in 0..CONFIRM_FRAMES {
            tracker.update(Some(ROOM), &[heart()]);
        }
        let next = RoomKey {
            dungeon_level: 1,
            room: 21,
        };
        for _ in 0..ROOM_GRACE_FRAMES {
            let update = tracker.update(Some(next), &[heart()]);
            assert!(update.obtained.is_empty());
            assert!(update.confirmed.is_empty());
        }
        assert!(tracker.visible().is_empty());
        // Fresh confirmation needed after the grace period
        assert!(tracker.update(Some(next), &[heart()]).confirmed.is_empty());
        assert!(tracker.update(Some(next), &[heart()]).confirmed.is_empty());
        assert_eq!(tracker.update(Some(next), &[heart()]).confirmed.len(), 1);
    }

    #[test]
    fn test_unknown_room_never_reports_pickup() {
        let mut tracker = FloorItemTracker::new();
        for _ in 0..CONFIRM_FRAMES {
            tracker.update(None, &[heart()]);
        }
        for _ in 0..OBTAIN_FRAMES * 2 {
            assert!(tracker.update(None, &[]).obtained.is_empty());
        }
    }

    #[test]
    fn test_missing_room_read_is_unchanged() {
        let mut tracker = settled();
        for _ in 0..CONFIRM_FRAMES {
            tracker.update(None, &[heart()]);
        }
        assert_eq!(tracker.room(), Some(ROOM));
        assert_eq!(tracker.visible().len(), 1);
    }
}
