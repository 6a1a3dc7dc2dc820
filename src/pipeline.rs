use anyhow::{Context, Result};
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use z1_capture::Frame;
use z1_data::{items, RoomMode, TemplateAtlas};
use z1_events::{EventInferencer, GameEvent};
use z1_state::{
    FloorItemTracker, FloorUpdate, PlayerInventory, PlayerItemTracker, RoomKey, ScreenType,
    StabilizerConfig, StableState, StateStabilizer,
};
use z1_vision::{
    calibrate, Aggregates, CorrelationPlan, Correlator, GpuContext, Landmark, PixelInterpreter,
    TemplateIndex, TileLayout,
};

/// Read-only resources shared by every racer.
#[derive(Debug, Clone)]
pub struct SharedAssets {
    pub atlas: Arc<TemplateAtlas>,
    pub index: Arc<TemplateIndex>,
    pub gpu: Option<GpuContext>,
}

impl SharedAssets {
    pub fn new(atlas: TemplateAtlas, gpu: Option<GpuContext>) -> Self {
        let index = Arc::new(TemplateIndex::from_atlas(&atlas));
        Self {
            atlas: Arc::new(atlas),
            index,
            gpu,
        }
    }
}

/// Everything published for one racer after a processed frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RacerUpdate {
    pub racer_id: String,
    pub backend: String,
    pub calibration_confidence: f32,
    pub state: StableState,
    pub inventory: PlayerInventory,
    /// Raw brightness, LIFE red ratio, gold and heart measurements of this frame
    pub aggregates: Aggregates,
    /// Events that fired on this frame
    pub events: Vec<GameEvent>,
}

/// Per-racer processing chain: correlate, interpret, stabilize, track, infer.
pub struct RacerPipeline {
    racer_id: String,
    assets: SharedAssets,
    landmarks: Vec<Landmark>,
    correlator: Correlator,
    interpreter: PixelInterpreter,
    stabilizer: StateStabilizer,
    floor: FloorItemTracker,
    items: PlayerItemTracker,
    events: EventInferencer,
    stable: StableState,
}

impl RacerPipeline {
    /// Calibrate against `first_frame`. Fails when the frame does not calibrate.
    pub async fn new(
        racer_id: &str,
        assets: SharedAssets,
        landmarks: Vec<Landmark>,
        stabilizer: &StabilizerConfig,
        first_frame: &RgbaImage,
    ) -> Result<Self> {
        let correlator = build_correlator(&assets, &landmarks, first_frame)
            .await
            .with_context(|| format!("Calibration failed for {}", racer_id))?;
        info!(
            "[{}] Pipeline ready ({} backend, confidence {:.2})",
            racer_id,
            correlator.backend(),
            correlator.plan().mapping.confidence
        );
        Ok(Self {
            racer_id: racer_id.to_string(),
            interpreter: PixelInterpreter::new(assets.index.clone()),
            assets,
            landmarks,
            correlator,
            stabilizer: StateStabilizer::new(stabilizer),
            floor: FloorItemTracker::new(),
            items: PlayerItemTracker::new(),
            events: EventInferencer::new(racer_id),
            stable: StableState::default(),
        })
    }

    pub fn racer_id(&self) -> &str {
        &self.racer_id
    }

    pub fn backend(&self) -> &'static str {
        self.correlator.backend()
    }

    /// Replace the correlator when the stream resolution changes.
    async fn recalibrate(&mut self, image: &RgbaImage) -> Result<()> {
        info!(
            "[{}] Stream is now {}x{}, recalibrating",
            self.racer_id,
            image.width(),
            image.height()
        );
        self.correlator = build_correlator(&self.assets, &self.landmarks, image).await?;
        Ok(())
    }

    pub async fn process(&mut self, frame: &Frame) -> Result<RacerUpdate> {
        let (w, h) = frame.image.dimensions();
        if !self.correlator.plan().mapping.matches(w, h) {
            self.recalibrate(&frame.image).await?;
        }

        let scores = self
            .correlator
            .correlate(frame.image.clone(), self.stable.matching_mode())
            .await?;
        let observed = self.interpreter.interpret(&scores);
        self.stabilizer
            .update(&observed, frame.number, frame.timestamp_ms);
        let mut stable = self.stabilizer.stable();

        let floor = if stable.is_gameplay() {
            self.floor.update(room_key(&stable), &observed.floor_items)
        } else {
            FloorUpdate::default()
        };
        stable.floor_items = self.floor.visible();

        if let Some(level) = stable.sword_level {
            self.items.observe_sword_level(level);
        }
        if let Some(b_item) = &stable.b_item {
            self.items.observe_b_item(b_item);
        }
        for item in floor.obtained.iter().filter(|i| !items::is_consumable(&i.name)) {
            self.items.record_obtained(&item.name);
        }
        if stable.screen == Some(ScreenType::Subscreen) {
            if let Some(scan) = &observed.inventory {
                self.items.merge_subscreen(scan);
            }
        }

        let events = self.events.update(&stable, &floor.obtained);
        self.stable = stable.clone();

        Ok(RacerUpdate {
            racer_id: self.racer_id.clone(),
            backend: self.correlator.backend().to_string(),
            calibration_confidence: self.correlator.plan().mapping.confidence,
            state: stable,
            inventory: self.items.inventory().clone(),
            aggregates: scores.aggregates,
            events,
        })
    }
}

async fn build_correlator(
    assets: &SharedAssets,
    landmarks: &[Landmark],
    image: &RgbaImage,
) -> Result<Correlator> {
    let mapping = calibrate(image)?;
    let layout = TileLayout::with_landmarks(&mapping, landmarks);
    let plan = CorrelationPlan::new(assets.atlas.clone(), mapping, layout);
    Ok(Correlator::new(plan, assets.gpu.as_ref()).await)
}

/// Floor tracking key for the stable room. Overworld rooms use level 0.
fn room_key(state: &StableState) -> Option<RoomKey> {
    let room = state.room?;
    let dungeon_level = match state.room_mode? {
        RoomMode::Overworld => 0,
        RoomMode::Dungeon => state.dungeon_level.filter(|l| *l > 0)?,
    };
    Some(RoomKey {
        dungeon_level,
        room,
    })
}

/// Drive one racer's pipeline from its frame channel until the source ends
/// or `stop` is set.
///
/// The watch channel only holds the newest frame, so frames that arrive
/// while one is being processed are dropped rather than queued.
pub async fn run_racer(
    mut pipeline: RacerPipeline,
    mut frame_rx: watch::Receiver<Option<Frame>>,
    state_tx: watch::Sender<Option<RacerUpdate>>,
    events_tx: broadcast::Sender<GameEvent>,
    stop: Arc<AtomicBool>,
) {
    let racer_id = pipeline.racer_id().to_string();
    info!("[{}] Racer loop started", racer_id);
    let mut last_number: Option<u64> = None;

    loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        if frame_rx.changed().await.is_err() {
            debug!("[{}] Frame source closed", racer_id);
            break;
        }
        let Some(frame) = frame_rx.borrow_and_update().clone() else {
            continue;
        };
        if let Some(last) = last_number {
            if frame.number > last + 1 {
                debug!("[{}] Dropped {} stale frame(s)", racer_id, frame.number - last - 1);
            }
        }
        last_number = Some(frame.number);

        let update = match pipeline.process(&frame).await {
            Ok(update) => update,
            Err(e) => {
                warn!("[{}] Skipping frame {}: {:#}", racer_id, frame.number, e);
                continue;
            }
        };
        // Nothing is published once the racer has been removed
        if stop.load(Ordering::Relaxed) {
            break;
        }
        for event in &update.events {
            let _ = events_tx.send(event.clone());
        }
        let _ = state_tx.send(Some(update));
    }

    info!("[{}] Racer loop stopped", racer_id);
}
