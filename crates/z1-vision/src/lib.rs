use anyhow::{Context, Result};
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use z1_data::{RoomMode, TemplateAtlas};
use z1_state::FrameState;

pub mod calibration;
pub mod correlate;
pub mod interpret;
pub mod layout;
pub mod minimap;
pub mod scores;

#[cfg(test)]
mod test_support;

pub use calibration::{calibrate, CalibrationError, CalibrationMapping};
pub use correlate::{CorrelationPlan, Correlator, GpuContext};
pub use interpret::{PixelInterpreter, TemplateIndex};
pub use layout::{Landmark, TileId, TileLayout};
pub use minimap::{MinimapReader, RoomMatch};
pub use scores::{Aggregates, RawFrameScores};

/// Best template for one HUD tile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TileDiagnostic {
    pub tile: TileId,
    pub template: Option<String>,
    pub score: f32,
}

/// Operator-facing readout of one frame: how it calibrated, what the raw
/// passes measured, and what the interpreter made of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameDiagnostics {
    pub mapping: CalibrationMapping,
    pub aggregates: Aggregates,
    pub tiles: Vec<TileDiagnostic>,
    pub best_room: Option<RoomMatch>,
    pub state: FrameState,
}

/// Calibrate, correlate on the CPU and interpret a single saved frame.
///
/// Room scores are taken from both grids; the interpreted state uses the one
/// matching the classified screen.
pub fn analyze(
    frame: &RgbaImage,
    atlas: Arc<TemplateAtlas>,
    landmarks: &[Landmark],
) -> Result<FrameDiagnostics> {
    let mapping = calibrate(frame).context("Calibration failed")?;
    let layout = TileLayout::with_landmarks(&mapping, landmarks);
    let plan = CorrelationPlan::new(atlas.clone(), mapping, layout);
    let index = Arc::new(TemplateIndex::from_atlas(&atlas));
    let interpreter = PixelInterpreter::new(index.clone());

    let mut scores = correlate::cpu::correlate_frame(&plan, frame, RoomMode::Overworld)?;
    let mut state = interpreter.interpret(&scores);
    if let Some(mode) = state.screen.room_mode().filter(|m| *m != scores.room_mode) {
        scores = correlate::cpu::correlate_frame(&plan, frame, mode)?;
        state = interpreter.interpret(&scores);
    }

    let tiles = plan
        .layout
        .tiles()
        .iter()
        .map(|t| {
            let row = scores.tiles.tile(t.id);
            let best = row
                .iter()
                .copied()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(&b.1));
            TileDiagnostic {
                tile: t.id,
                template: best.and_then(|(i, _)| {
                    atlas.group(t.group).and_then(|g| g.name(i)).map(str::to_string)
                }),
                score: best.map_or(0.0, |(_, s)| s),
            }
        })
        .collect();

    let best_room = scores
        .rooms
        .iter()
        .copied()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .and_then(|(i, score)| {
            let room = index.rooms(scores.room_mode).get(i).copied().flatten()?;
            Some(RoomMatch {
                mode: scores.room_mode,
                room,
                score,
            })
        });

    Ok(FrameDiagnostics {
        mapping,
        aggregates: scores.aggregates,
        tiles,
        best_room,
        state,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_support::{gray, pattern, render};
    use z1_data::{GroupKind, TemplateGroup};
    use z1_state::ScreenType;

    #[test]
    fn test_analyze_reads_rupees_end_to_end() {
        let digits: Vec<Vec<f32>> = (0..10).map(|d| pattern(d, 64)).collect();
        let atlas = Arc::new(TemplateAtlas::from_groups([TemplateGroup::from_raw(
            GroupKind::Digits,
            digits
                .iter()
                .enumerate()
                .map(|(d, values)| (d.to_string(), values.clone()))
                .collect(),
        )
        .unwrap()]));

        let frame = render(|x, y| {
            if (184..232).contains(&x) && (16..24).contains(&y) {
                [220, 30, 30]
            } else if (96..120).contains(&x) && (16..24).contains(&y) {
                let digit = &digits[((x - 96) / 8 + 1) as usize];
                gray(digit[((y - 16) * 8 + (x - 96) % 8) as usize])
            } else if y >= 64 {
                [200, 200, 200]
            } else {
                [0, 0, 0]
            }
        });

        let diag = analyze(&frame, atlas, &[]).unwrap();
        assert!((diag.mapping.scale_x - 2.0).abs() < 1e-3, "{:?}", diag.mapping);
        assert!((diag.mapping.crop_x - 16.0).abs() < 1e-3);
        assert_eq!(diag.state.screen, ScreenType::Overworld);
        assert_eq!(diag.state.rupees, Some(123));
        assert_eq!(diag.state.dungeon_level, Some(0));
        let rupee0 = diag.tiles.iter().find(|t| t.tile == TileId::Rupee0).unwrap();
        assert_eq!(rupee0.template.as_deref(), Some("1"));
        assert!(diag.best_room.is_none());
    }

    #[test]
    fn test_analyze_rejects_blank_frame() {
        let frame = render(|_, _| [0, 0, 0]);
        assert!(analyze(&frame, Arc::new(TemplateAtlas::default()), &[]).is_err());
    }
}
