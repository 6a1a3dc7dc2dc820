use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use z1_capture::{CaptureStatus, Frame};
use z1_data::TemplateAtlas;
use z1_events::GameEvent;
use z1_state::StabilizerConfig;
use z1_vision::GpuContext;

use crate::config::{Backend, MonitorConfig, RacerConfig};
use crate::pipeline::{run_racer, RacerPipeline, RacerUpdate, SharedAssets};

/// How long a new racer's source has to deliver its first frame.
const FIRST_FRAME_TIMEOUT: Duration = Duration::from_secs(10);
const EVENT_CAPACITY: usize = 256;

struct RacerHandle {
    stop: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
    state_rx: watch::Receiver<Option<RacerUpdate>>,
    status_rx: watch::Receiver<CaptureStatus>,
}

impl RacerHandle {
    fn shutdown(self) {
        self.stop.store(true, Ordering::Relaxed);
        for task in self.tasks {
            task.abort();
        }
    }
}

/// Pool of independently running racer pipelines sharing one template atlas.
pub struct Monitor {
    assets: SharedAssets,
    stabilizer: StabilizerConfig,
    frame_interval: Duration,
    racers: HashMap<String, RacerHandle>,
    events_tx: broadcast::Sender<GameEvent>,
}

impl Monitor {
    /// Load the atlas and, for the GPU backend, open a device.
    pub async fn new(config: &MonitorConfig) -> Result<Self> {
        let data_dir = config.data_dir.clone();
        let atlas = tokio::task::spawn_blocking(move || TemplateAtlas::load(&data_dir))
            .await
            .context("Atlas loading task failed")??;
        info!("Template atlas ready: {} templates", atlas.template_count());

        let gpu = match config.backend {
            Backend::Cpu => None,
            Backend::Gpu => match GpuContext::new().await {
                Ok(ctx) => {
                    info!("Using GPU adapter {}", ctx.adapter_name);
                    Some(ctx)
                }
                Err(e) => {
                    warn!("GPU unavailable, correlating on the CPU: {:#}", e);
                    None
                }
            },
        };

        Ok(Self::with_assets(
            SharedAssets::new(atlas, gpu),
            config.stabilizer.clone(),
            config.frame_interval(),
        ))
    }

    pub fn with_assets(
        assets: SharedAssets,
        stabilizer: StabilizerConfig,
        frame_interval: Duration,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            assets,
            stabilizer,
            frame_interval,
            racers: HashMap::new(),
            events_tx,
        }
    }

    /// Start the racer's source, calibrate on its first frame and start its pipeline.
    ///
    /// A racer that fails to calibrate is never added; its source is stopped.
    pub async fn add_racer(&mut self, racer: &RacerConfig) -> Result<()> {
        if self.racers.contains_key(&racer.id) {
            anyhow::bail!("Racer {} is already monitored", racer.id);
        }

        let stop = Arc::new(AtomicBool::new(false));
        let (frame_tx, mut frame_rx) = watch::channel::<Option<Frame>>(None);
        let (status_tx, status_rx) = watch::channel(CaptureStatus::default());

        let source = racer.frame_source();
        let source_stop = stop.clone();
        let interval = self.frame_interval;
        let source_id = racer.id.clone();
        let source_task = tokio::spawn(async move {
            if let Err(e) =
                z1_capture::run_source(&source, frame_tx, status_tx, interval, source_stop).await
            {
                warn!("[{}] Frame source error: {:#}", source_id, e);
            }
        });

        let first = match first_frame(&mut frame_rx).await {
            Ok(frame) => frame,
            Err(e) => {
                stop.store(true, Ordering::Relaxed);
                source_task.abort();
                return Err(e.context(format!("No frames from {}", racer.id)));
            }
        };

        let pipeline = match RacerPipeline::new(
            &racer.id,
            self.assets.clone(),
            racer.landmarks.clone(),
            &self.stabilizer,
            &first.image,
        )
        .await
        {
            Ok(p) => p,
            Err(e) => {
                stop.store(true, Ordering::Relaxed);
                source_task.abort();
                return Err(e);
            }
        };

        // The calibration frame is already marked seen, so the loop starts from the next one
        let (state_tx, state_rx) = watch::channel(None);
        let racer_task = tokio::spawn(run_racer(
            pipeline,
            frame_rx,
            state_tx,
            self.events_tx.clone(),
            stop.clone(),
        ));

        info!("[{}] Monitoring started", racer.id);
        self.racers.insert(
            racer.id.clone(),
            RacerHandle {
                stop,
                tasks: vec![source_task, racer_task],
                state_rx,
                status_rx,
            },
        );
        Ok(())
    }

    /// Stop a racer and release its pipeline. Returns false if it was not monitored.
    pub fn remove_racer(&mut self, racer_id: &str) -> bool {
        match self.racers.remove(racer_id) {
            Some(handle) => {
                handle.shutdown();
                info!("[{}] Monitoring stopped", racer_id);
                true
            }
            None => false,
        }
    }

    pub fn racer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.racers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Events from every racer.
    pub fn subscribe(&self) -> broadcast::Receiver<GameEvent> {
        self.events_tx.subscribe()
    }

    /// Latest published update for a racer.
    pub fn snapshot(&self, racer_id: &str) -> Option<RacerUpdate> {
        self.racers.get(racer_id)?.state_rx.borrow().clone()
    }

    pub fn watch_racer(&self, racer_id: &str) -> Option<watch::Receiver<Option<RacerUpdate>>> {
        Some(self.racers.get(racer_id)?.state_rx.clone())
    }

    pub fn capture_status(&self, racer_id: &str) -> Option<CaptureStatus> {
        Some(self.racers.get(racer_id)?.status_rx.borrow().clone())
    }

    pub fn shutdown(&mut self) {
        for (id, handle) in self.racers.drain() {
            handle.shutdown();
            info!("[{}] Monitoring stopped", id);
        }
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn first_frame(frame_rx: &mut watch::Receiver<Option<Frame>>) -> Result<Frame> {
    let wait = async {
        loop {
            if let Some(frame) = frame_rx.borrow_and_update().clone() {
                return Ok(frame);
            }
            if frame_rx.changed().await.is_err() {
                anyhow::bail!("source ended before producing a frame");
            }
        }
    };
    tokio::time::timeout(FIRST_FRAME_TIMEOUT, wait)
        .await
        .context("timed out waiting for the first frame")?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_frames::{digit_atlas, hud_frame};
    use std::path::PathBuf;
    use z1_state::ScreenType;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("racewatch_{}_{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn monitor() -> Monitor {
        Monitor::with_assets(
            SharedAssets::new(digit_atlas(), None),
            StabilizerConfig::default(),
            Duration::from_millis(40),
        )
    }

    #[tokio::test]
    async fn test_racer_lifecycle() {
        let dir = scratch_dir("lifecycle");
        let image = hud_frame(2, [Some(1), Some(0), Some(7)]);
        for n in 0..8 {
            image.save(dir.join(format!("{:04}.png", n))).unwrap();
        }

        let mut monitor = monitor();
        let racer = RacerConfig {
            id: "alice".into(),
            source: dir.clone(),
            landmarks: Vec::new(),
        };
        monitor.add_racer(&racer).await.unwrap();
        assert_eq!(monitor.racer_ids(), vec!["alice".to_string()]);
        assert!(monitor.add_racer(&racer).await.is_err());

        let mut rx = monitor.watch_racer("alice").unwrap();
        let mut rupees = None;
        while rupees.is_none() {
            if rx.changed().await.is_err() {
                break;
            }
            rupees = rx.borrow_and_update().as_ref().and_then(|u| u.state.rupees);
        }
        assert_eq!(rupees, Some(107));
        let snapshot = monitor.snapshot("alice").unwrap();
        assert_eq!(snapshot.state.screen, Some(ScreenType::Overworld));
        assert_eq!(snapshot.backend, "cpu");

        assert!(monitor.remove_racer("alice"));
        assert!(!monitor.remove_racer("alice"));
        assert!(monitor.snapshot("alice").is_none());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_uncalibrated_racer_not_added() {
        let dir = scratch_dir("blank");
        image::RgbaImage::new(640, 480).save(dir.join("0000.png")).unwrap();

        let mut monitor = monitor();
        let result = monitor
            .add_racer(&RacerConfig {
                id: "bob".into(),
                source: dir.clone(),
                landmarks: Vec::new(),
            })
            .await;
        assert!(result.is_err());
        assert!(monitor.racer_ids().is_empty());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_empty_source_fails() {
        let dir = scratch_dir("empty");
        let mut monitor = monitor();
        let result = monitor
            .add_racer(&RacerConfig {
                id: "carol".into(),
                source: dir.clone(),
                landmarks: Vec::new(),
            })
            .await;
        assert!(result.is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
