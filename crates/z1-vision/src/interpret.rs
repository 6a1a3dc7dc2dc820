use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, trace};
use z1_data::{items, GroupKind, RoomMode, TemplateAtlas};
use z1_state::{FloorDetection, FrameState, ScreenType};

use crate::layout::{TileId, HEART_SLOTS};
use crate::minimap::MinimapReader;
use crate::scores::{Aggregates, RawFrameScores, ScoreMatrix, MAX_TEMPLATES};

/// Best digit score below which a tile is considered blank.
pub const DARK_TILE: f32 = 0.3;
/// An active key tile whose best digit scores below this is the master key glyph.
pub const CONFIDENT_DIGIT: f32 = 0.65;
/// Minimum score for an item icon match.
pub const ITEM_MATCH: f32 = 0.5;
/// Minimum score for a floor drop detection.
pub const FLOOR_MATCH: f32 = 0.7;
pub const RUPEE_CAP: u32 = 255;

/// Red-ratio (percent) above which the LIFE glyph is considered visible.
pub const GAMEPLAY_RED_RATIO: f32 = 16.0;

/// Heart slot red fractions for an empty container, a half heart and a full heart.
pub const HEART_CONTAINER: f32 = 0.08;
pub const HEART_HALF: f32 = 0.38;
pub const HEART_FULL: f32 = 0.56;

/// Gold pixels drawn by the empty triforce outline, and per collected piece.
pub const TRIFORCE_OUTLINE: u32 = 40;
pub const TRIFORCE_PIECE: u32 = 120;
pub const TRIFORCE_PIECES: u8 = 8;

const RUPEE_TILES: [TileId; 3] = [TileId::Rupee0, TileId::Rupee1, TileId::Rupee2];
const KEY_TILES: [TileId; 2] = [TileId::Key0, TileId::Key1];
const BOMB_TILES: [TileId; 2] = [TileId::Bomb0, TileId::Bomb1];

/// What each template index means, resolved once from the atlas.
///
/// Score rows are indexed the same way as the atlas groups, so this is the
/// only place template names are looked at on the hot path.
#[derive(Debug, Clone, Default)]
pub struct TemplateIndex {
    pub digits: Vec<Option<u8>>,
    pub b_items: Vec<String>,
    pub swords: Vec<Option<u8>>,
    pub drops: Vec<String>,
    overworld_rooms: Vec<Option<u8>>,
    dungeon_rooms: Vec<Option<u8>>,
}

impl TemplateIndex {
    pub fn from_atlas(atlas: &TemplateAtlas) -> Self {
        let names = |kind: GroupKind, cap: usize| -> Vec<String> {
            atlas
                .group(kind)
                .map(|g| g.names().take(cap).map(str::to_string).collect())
                .unwrap_or_default()
        };
        let rooms = |mode: RoomMode| -> Vec<Option<u8>> {
            names(mode.group(), usize::MAX)
                .iter()
                .map(|n| {
                    let id = mode.parse_name(n);
                    if id.is_none() {
                        debug!("Room template {} does not name a grid cell", n);
                    }
                    id
                })
                .collect()
        };

        Self {
            digits: names(GroupKind::Digits, MAX_TEMPLATES)
                .iter()
                .map(|n| parse_digit(n))
                .collect(),
            b_items: names(GroupKind::BItems, MAX_TEMPLATES),
            swords: names(GroupKind::Swords, MAX_TEMPLATES)
                .iter()
                .map(|n| items::sword_level(n))
                .collect(),
            drops: names(GroupKind::Drops, usize::MAX),
            overworld_rooms: rooms(RoomMode::Overworld),
            dungeon_rooms: rooms(RoomMode::Dungeon),
        }
    }

    /// Room id per room template of `mode`; `None` for unparseable names.
    pub fn rooms(&self, mode: RoomMode) -> &[Option<u8>] {
        match mode {
            RoomMode::Overworld => &self.overworld_rooms,
            RoomMode::Dungeon => &self.dungeon_rooms,
        }
    }
}

/// Digit templates are named `0`..`9`, optionally prefixed with `digit_`.
fn parse_digit(name: &str) -> Option<u8> {
    name.trim_start_matches("digit_")
        .parse::<u8>()
        .ok()
        .filter(|d| *d < 10)
}

/// Reading of a single digit tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigitRead {
    /// Nothing drawn
    Blank,
    Digit(u8),
    /// Unscored tile or a template that is not a digit
    Glyph,
}

/// Multi-digit counter value. `active` is false when every tile was blank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterRead {
    pub value: u32,
    pub active: bool,
}

fn best(scores: &[f32]) -> Option<(usize, f32)> {
    scores
        .iter()
        .copied()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(&b.1))
}

/// Screen type from mean viewport brightness and LIFE glyph red ratio.
pub fn classify_screen(brightness: f32, red_ratio: f32) -> ScreenType {
    if brightness < 8.0 {
        ScreenType::Transition
    } else if red_ratio > GAMEPLAY_RED_RATIO {
        if brightness < 35.0 {
            ScreenType::Dungeon
        } else if brightness < 55.0 {
            ScreenType::Cave
        } else {
            ScreenType::Overworld
        }
    } else if brightness < 30.0 {
        ScreenType::Subscreen
    } else {
        ScreenType::Unknown
    }
}

/// (heart containers, current life in half hearts)
pub fn read_hearts(fill: &[f32; HEART_SLOTS]) -> (u8, u8) {
    let mut containers = 0;
    let mut halves = 0;
    for f in fill.iter().copied().filter(|f| *f >= HEART_CONTAINER) {
        containers += 1;
        if f >= HEART_FULL {
            halves += 2;
        } else if f >= HEART_HALF {
            halves += 1;
        }
    }
    (containers, halves)
}

pub fn read_triforce(gold_pixels: u32) -> Option<u8> {
    if gold_pixels < TRIFORCE_OUTLINE {
        return None;
    }
    let pieces = ((gold_pixels - TRIFORCE_OUTLINE) as f32 / TRIFORCE_PIECE as f32).round() as u8;
    Some(pieces.min(TRIFORCE_PIECES))
}

/// Turns one frame's raw correlation output into a best-guess game state.
#[derive(Debug, Clone)]
pub struct PixelInterpreter {
    index: Arc<TemplateIndex>,
    minimap: MinimapReader,
}

impl PixelInterpreter {
    pub fn new(index: Arc<TemplateIndex>) -> Self {
        Self {
            minimap: MinimapReader::new(index.clone()),
            index,
        }
    }

    pub fn index(&self) -> &TemplateIndex {
        &self.index
    }

    pub fn read_digit(&self, scores: &[f32]) -> DigitRead {
        let Some((template, score)) = best(scores) else {
            // Pass disabled
            return DigitRead::Glyph;
        };
        if score < DARK_TILE {
            return DigitRead::Blank;
        }
        match self.index.digits.get(template).copied().flatten() {
            Some(digit) => DigitRead::Digit(digit),
            None => DigitRead::Glyph,
        }
    }

    /// Concatenate digit tiles left to right, skipping blanks.
    /// `None` when any tile was not scored against the digit templates.
    pub fn read_counter(&self, tiles: &ScoreMatrix, ids: &[TileId]) -> Option<CounterRead> {
        let mut read = CounterRead {
            value: 0,
            active: false,
        };
        for id in ids {
            match self.read_digit(tiles.tile(*id)) {
                DigitRead::Blank => continue,
                DigitRead::Digit(d) => {
                    read.value = read.value * 10 + d as u32;
                    read.active = true;
                }
                DigitRead::Glyph => return None,
            }
        }
        Some(read)
    }

    /// The key counter shows a non-numeric glyph instead of digits when the
    /// master key is held. `None` when the counter is dark.
    pub fn read_master_key(&self, tiles: &ScoreMatrix) -> Option<bool> {
        let mut active = false;
        let mut glyph = false;
        for id in KEY_TILES {
            let (_, score) = best(tiles.tile(id))?;
            if score >= DARK_TILE {
                active = true;
                glyph |= score < CONFIDENT_DIGIT;
            }
        }
        active.then_some(glyph)
    }

    fn read_level(&self, tiles: &ScoreMatrix, screen: ScreenType) -> Option<u8> {
        match screen {
            ScreenType::Overworld | ScreenType::Cave => Some(0),
            ScreenType::Dungeon => match self.read_digit(tiles.tile(TileId::Level)) {
                DigitRead::Digit(d) if (1..=9).contains(&d) => Some(d),
                _ => None,
            },
            _ => None,
        }
    }

    fn read_sword(&self, tiles: &ScoreMatrix) -> Option<u8> {
        let (template, score) = best(tiles.tile(TileId::Sword))?;
        if score < DARK_TILE {
            Some(0)
        } else if score >= ITEM_MATCH {
            self.index.swords.get(template).copied().flatten()
        } else {
            None
        }
    }

    fn read_b_item(&self, tiles: &ScoreMatrix) -> Option<String> {
        let (template, score) = best(tiles.tile(TileId::BItem))?;
        if score < ITEM_MATCH {
            return None;
        }
        self.index.b_items.get(template).cloned()
    }

    /// Items shown in the subscreen inventory slots. Every B-item template is
    /// listed, false when no slot shows it. `None` when the slots were not scored.
    pub fn read_inventory(&self, tiles: &ScoreMatrix) -> Option<BTreeMap<String, bool>> {
        if TileId::INVENTORY.iter().all(|id| tiles.tile(*id).is_empty()) {
            return None;
        }
        let mut scan: BTreeMap<String, bool> = self
            .index
            .b_items
            .iter()
            .map(|name| (name.clone(), false))
            .collect();
        for id in TileId::INVENTORY {
            let Some((template, score)) = best(tiles.tile(id)) else {
                continue;
            };
            if score < ITEM_MATCH {
                continue;
            }
            if let Some(name) = self.index.b_items.get(template) {
                scan.insert(name.clone(), true);
            }
        }
        Some(scan)
    }

    fn floor_items(&self, scores: &RawFrameScores) -> Vec<FloorDetection> {
        scores
            .floor
            .iter()
            .filter(|hit| hit.score >= FLOOR_MATCH)
            .filter_map(|hit| {
                let name = self.index.drops.get(hit.template)?;
                Some(FloorDetection {
                    name: name.clone(),
                    x: hit.x,
                    y: hit.y,
                    score: hit.score,
                })
            })
            .collect()
    }

    pub fn interpret(&self, scores: &RawFrameScores) -> FrameState {
        let Aggregates {
            brightness,
            red_ratio,
            gold_pixels,
            heart_fill,
        } = scores.aggregates;
        let screen = classify_screen(brightness, red_ratio);
        let mut state = FrameState {
            screen,
            ..Default::default()
        };

        if screen == ScreenType::Subscreen {
            state.triforce_pieces = read_triforce(gold_pixels);
            state.inventory = self.read_inventory(&scores.tiles);
        }
        if !screen.is_gameplay() {
            trace!("{:?} screen, HUD not read", screen);
            return state;
        }

        let tiles = &scores.tiles;
        let counter = |ids: &[TileId]| {
            self.read_counter(tiles, ids)
                .filter(|c| c.active)
                .map(|c| c.value)
        };
        state.rupees = counter(&RUPEE_TILES).map(|v| v.min(RUPEE_CAP));
        state.bombs = counter(&BOMB_TILES);
        state.has_master_key = self.read_master_key(tiles);
        if state.has_master_key != Some(true) {
            state.keys = counter(&KEY_TILES);
        }

        state.dungeon_level = self.read_level(tiles, screen);
        state.sword_level = self.read_sword(tiles);
        state.b_item = self.read_b_item(tiles);

        let (containers, halves) = read_hearts(&heart_fill);
        if containers > 0 {
            state.hearts_max = Some(containers);
            state.hearts_current = Some(halves);
        }

        if let Some(m) =
            self.minimap
                .read(&scores.rooms, scores.room_mode, screen, state.dungeon_level)
        {
            state.room = Some(m.room);
            state.room_mode = Some(m.mode);
        }
        state.floor_items = self.floor_items(scores);
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scores::FloorHit;
    use crate::test_support::pattern;
    use z1_data::TemplateGroup;

    fn index() -> Arc<TemplateIndex> {
        let group = |kind: GroupKind, names: &[&str]| {
            let (w, h) = kind.size();
            let raw = names
                .iter()
                .enumerate()
                .map(|(i, n)| (n.to_string(), pattern(i as u32, (w * h) as usize)))
                .collect();
            TemplateGroup::from_raw(kind, raw).unwrap()
        };
        let digits: Vec<String> = (0..10).map(|d| d.to_string()).collect();
        let digits: Vec<&str> = digits.iter().map(String::as_str).collect();
        let atlas = TemplateAtlas::from_groups([
            group(GroupKind::Digits, &digits),
            group(GroupKind::BItems, &["boomerang", "bomb", "arrows"]),
            group(GroupKind::Swords, &["wood_sword", "white_sword"]),
            group(GroupKind::Drops, &["heart", "magical_boomerang"]),
            group(GroupKind::DungeonRooms, &["0_0", "4_1"]),
        ]);
        Arc::new(TemplateIndex::from_atlas(&atlas))
    }

    fn interpreter() -> PixelInterpreter {
        PixelInterpreter::new(index())
    }

    fn digit_row(digit: Option<u8>, score: f32) -> [f32; 10] {
        let mut row = [0.1; 10];
        if let Some(d) = digit {
            row[d as usize] = score;
        }
        row
    }

    fn matrix(rows: &[(TileId, &[f32])]) -> ScoreMatrix {
        let mut m = ScoreMatrix::new(rows.iter().map(|(id, r)| (*id, r.len())).collect());
        for (tile, (_, row)) in rows.iter().enumerate() {
            for (t, s) in row.iter().enumerate() {
                m.set(tile, t, *s);
            }
        }
        m
    }

    fn frame(tiles: ScoreMatrix, brightness: f32) -> RawFrameScores {
        RawFrameScores {
            tiles,
            room_mode: RoomMode::Overworld,
            rooms: Vec::new(),
            floor: Vec::new(),
            aggregates: Aggregates {
                brightness,
                red_ratio: 40.0,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_classify_screen_bands() {
        assert_eq!(classify_screen(5.0, 90.0), ScreenType::Transition);
        assert_eq!(classify_screen(20.0, 30.0), ScreenType::Dungeon);
        assert_eq!(classify_screen(40.0, 30.0), ScreenType::Cave);
        assert_eq!(classify_screen(55.0, 30.0), ScreenType::Overworld);
        assert_eq!(classify_screen(20.0, 16.0), ScreenType::Subscreen);
        assert_eq!(classify_screen(80.0, 2.0), ScreenType::Unknown);
    }

    #[test]
    fn test_all_dark_counter_is_inactive_zero() {
        let interp = interpreter();
        let dark = digit_row(None, 0.0);
        let tiles = matrix(&[
            (TileId::Rupee0, &dark[..]),
            (TileId::Rupee1, &dark[..]),
            (TileId::Rupee2, &dark[..]),
        ]);
        let read = interp.read_counter(&tiles, &RUPEE_TILES).unwrap();
        assert_eq!(read, CounterRead { value: 0, active: false });
        assert_eq!(interp.interpret(&frame(tiles, 80.0)).rupees, None);
    }

    #[test]
    fn test_leading_blank_skipped() {
        let interp = interpreter();
        let blank = digit_row(None, 0.0);
        let four = digit_row(Some(4), 0.9);
        let two = digit_row(Some(2), 0.8);
        let tiles = matrix(&[
            (TileId::Rupee0, &blank[..]),
            (TileId::Rupee1, &four[..]),
            (TileId::Rupee2, &two[..]),
        ]);
        assert_eq!(interp.interpret(&frame(tiles, 80.0)).rupees, Some(42));
    }

    #[test]
    fn test_weak_digits_still_read() {
        let interp = interpreter();
        let blank = digit_row(None, 0.0);
        let four = digit_row(Some(4), 0.5);
        let two = digit_row(Some(2), 0.5);
        let tiles = matrix(&[
            (TileId::Rupee0, &blank[..]),
            (TileId::Rupee1, &four[..]),
            (TileId::Rupee2, &two[..]),
            (TileId::Level, &two[..]),
        ]);
        let state = interp.interpret(&frame(tiles, 20.0));
        assert_eq!(state.rupees, Some(42));
        assert_eq!(state.dungeon_level, Some(2));
        assert_eq!(interp.read_digit(&four), DigitRead::Digit(4));
        assert_eq!(interp.read_digit(&digit_row(Some(4), 0.29)), DigitRead::Blank);
        assert_eq!(interp.read_digit(&[]), DigitRead::Glyph);
    }

    #[test]
    fn test_rupees_cap() {
        let nine = digit_row(Some(9), 0.95);
        let tiles = matrix(&[
            (TileId::Rupee0, &nine[..]),
            (TileId::Rupee1, &nine[..]),
            (TileId::Rupee2, &nine[..]),
        ]);
        assert_eq!(interpreter().interpret(&frame(tiles, 80.0)).rupees, Some(255));
    }

    #[test]
    fn test_master_key_glyph() {
        let interp = interpreter();
        let blank = digit_row(None, 0.0);
        let glyph = digit_row(Some(3), 0.5);
        let tiles = matrix(&[(TileId::Key0, &blank[..]), (TileId::Key1, &glyph[..])]);
        let state = interp.interpret(&frame(tiles, 80.0));
        assert_eq!(state.has_master_key, Some(true));
        assert_eq!(state.keys, None);

        // A confident digit is a real count
        let three = digit_row(Some(3), 0.65);
        let tiles = matrix(&[(TileId::Key0, &blank[..]), (TileId::Key1, &three[..])]);
        let state = interp.interpret(&frame(tiles, 80.0));
        assert_eq!(state.has_master_key, Some(false));
        assert_eq!(state.keys, Some(3));

        // Dark tiles say nothing
        let tiles = matrix(&[(TileId::Key0, &blank[..]), (TileId::Key1, &blank[..])]);
        assert_eq!(interp.read_master_key(&tiles), None);
    }

    #[test]
    fn test_level_and_items() {
        let level = digit_row(Some(7), 0.9);
        let b_items = [0.2, 0.1, 0.8];
        let swords = [0.1, 0.7];
        let tiles = matrix(&[
            (TileId::Level, &level[..]),
            (TileId::BItem, &b_items[..]),
            (TileId::Sword, &swords[..]),
        ]);
        let state = interpreter().interpret(&frame(tiles, 20.0));
        assert_eq!(state.screen, ScreenType::Dungeon);
        assert_eq!(state.dungeon_level, Some(7));
        assert_eq!(state.b_item.as_deref(), Some("arrows"));
        assert_eq!(state.sword_level, Some(2));
    }

    #[test]
    fn test_dark_sword_tile_means_no_sword() {
        let swords = [0.1, 0.05];
        let tiles = matrix(&[(TileId::Sword, &swords[..])]);
        assert_eq!(interpreter().interpret(&frame(tiles, 80.0)).sword_level, Some(0));
    }

    #[test]
    fn test_hearts() {
        let mut fill = [0.0; HEART_SLOTS];
        fill[..3].copy_from_slice(&[0.7, 0.7, 0.45]);
        fill[3] = 0.15;
        assert_eq!(read_hearts(&fill), (4, 5));
    }

    #[test]
    fn test_triforce_only_on_subscreen() {
        assert_eq!(read_triforce(10), None);
        assert_eq!(read_triforce(45), Some(0));
        assert_eq!(read_triforce(40 + 3 * 120), Some(3));
        assert_eq!(read_triforce(5000), Some(8));

        let mut scores = frame(ScoreMatrix::new(Vec::new()), 20.0);
        scores.aggregates.red_ratio = 0.0;
        scores.aggregates.gold_pixels = 400;
        let state = interpreter().interpret(&scores);
        assert_eq!(state.screen, ScreenType::Subscreen);
        assert_eq!(state.triforce_pieces, Some(3));
        assert_eq!(state.rupees, None);
    }

    #[test]
    fn test_subscreen_inventory_scan() {
        let interp = interpreter();
        let empty = [0.0, 0.0, 0.0];
        let arrows = [0.1, 0.2, 0.85];
        let weak = [0.45, 0.1, 0.0];
        let tiles = matrix(&[
            (TileId::Inventory0, &weak[..]),
            (TileId::Inventory1, &empty[..]),
            (TileId::Inventory2, &arrows[..]),
        ]);
        let mut scores = frame(tiles, 20.0);
        scores.aggregates.red_ratio = 0.0;
        let state = interp.interpret(&scores);
        assert_eq!(state.screen, ScreenType::Subscreen);
        let scan = state.inventory.unwrap();
        assert_eq!(scan.get("arrows"), Some(&true));
        assert_eq!(scan.get("boomerang"), Some(&false));
        assert_eq!(scan.len(), 3);

        // Slots are ignored during gameplay
        let tiles = matrix(&[(TileId::Inventory2, &arrows[..])]);
        assert_eq!(interp.interpret(&frame(tiles, 80.0)).inventory, None);
        assert_eq!(interp.read_inventory(&ScoreMatrix::new(Vec::new())), None);
    }

    #[test]
    fn test_floor_and_room_passthrough() {
        let mut scores = frame(ScoreMatrix::new(Vec::new()), 20.0);
        scores.room_mode = RoomMode::Dungeon;
        scores.rooms = vec![0.3, 0.9];
        scores.floor = vec![
            FloorHit { template: 0, score: 0.5, x: 8.0, y: 80.0 },
            FloorHit { template: 1, score: 0.92, x: 120.0, y: 128.0 },
        ];
        let state = interpreter().interpret(&scores);
        // Level unread, so the room is still localized
        assert_eq!(state.room, Some(12));
        assert_eq!(state.room_mode, Some(RoomMode::Dungeon));
        assert_eq!(state.floor_items.len(), 1);
        assert_eq!(state.floor_items[0].name, "magical_boomerang");
    }
}
