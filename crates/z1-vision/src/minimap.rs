use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::trace;
use z1_data::RoomMode;
use z1_state::ScreenType;

use crate::interpret::TemplateIndex;

/// Minimum room-template score for a localization.
pub const ROOM_MATCH_THRESHOLD: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RoomMatch {
    pub mode: RoomMode,
    pub room: u8,
    pub score: f32,
}

/// Localizes the player by matching the playfield against room thumbnails.
#[derive(Debug, Clone)]
pub struct MinimapReader {
    index: Arc<TemplateIndex>,
}

impl MinimapReader {
    pub fn new(index: Arc<TemplateIndex>) -> Self {
        Self { index }
    }

    /// Best room for this frame, if any.
    ///
    /// `scored_mode` is the grid the scores were computed against. Scores from
    /// the wrong grid for the screen, non-gameplay screens, and weak matches
    /// all yield `None`.
    pub fn read(
        &self,
        scores: &[f32],
        scored_mode: RoomMode,
        screen: ScreenType,
        dungeon_level: Option<u8>,
    ) -> Option<RoomMatch> {
        let expected = screen.room_mode()?;
        if expected != scored_mode {
            trace!(
                "Room scores are for {:?} but screen is {:?}",
                scored_mode,
                screen
            );
            return None;
        }
        if expected == RoomMode::Dungeon && dungeon_level == Some(0) {
            return None;
        }

        let (best, score) = scores
            .iter()
            .copied()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(&b.1))?;
        if score < ROOM_MATCH_THRESHOLD {
            return None;
        }
        let room = self.index.rooms(scored_mode).get(best).copied().flatten()?;
        Some(RoomMatch {
            mode: scored_mode,
            room,
            score,
        })
    }
}
