use anyhow::{Context, Result};
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[cfg(feature = "video")]
pub mod video;

/// Normalized frame region (0.0-1.0 coordinates relative to the stream frame)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreenRegion {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// One decoded stream frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// 0-based position in the source
    pub number: u64,
    /// Stream time of the frame
    pub timestamp_ms: u64,
    pub image: Arc<RgbaImage>,
}

/// Status of a frame source
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaptureStatus {
    pub is_capturing: bool,
    pub source: Option<String>,
    pub fps: f64,
    pub frames: u64,
    pub last_capture_time: Option<u64>,
    pub resolution: Option<(u32, u32)>,
}

/// Frames-per-second over a window that resets every 5 seconds.
#[derive(Debug)]
pub struct FpsCounter {
    count: u64,
    timer: Instant,
}

impl Default for FpsCounter {
    fn default() -> Self {
        Self {
            count: 0,
            timer: Instant::now(),
        }
    }
}

impl FpsCounter {
    /// Count one frame and return the current rate.
    pub fn tick(&mut self) -> f64 {
        self.count += 1;
        let elapsed = self.timer.elapsed().as_secs_f64();
        let fps = if elapsed > 0.0 {
            self.count as f64 / elapsed
        } else {
            0.0
        };
        if elapsed > 5.0 {
            self.count = 0;
            self.timer = Instant::now();
        }
        fps
    }
}

pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Where a racer's frames come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "path", rename_all = "snake_case")]
pub enum FrameSource {
    /// Directory of numbered still images, replayed in name order
    Images(PathBuf),
    /// Video file decoded with ffmpeg (requires the `video` feature)
    Video(PathBuf),
}

impl FrameSource {
    /// Directories replay as image sequences, anything else is a video file.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if path.is_dir() {
            FrameSource::Images(path)
        } else {
            FrameSource::Video(path)
        }
    }

    pub fn name(&self) -> String {
        let (kind, path) = match self {
            FrameSource::Images(p) => ("Images", p),
            FrameSource::Video(p) => ("Video", p),
        };
        let file = path
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        format!("[{}] {}", kind, file)
    }
}

/// Crop a region from a frame using normalized coordinates
pub fn crop_region(frame: &RgbaImage, region: &ScreenRegion) -> RgbaImage {
    let (w, h) = (frame.width(), frame.height());
    let x = (region.x.max(0.0) * w as f64) as u32;
    let y = (region.y.max(0.0) * h as f64) as u32;
    let rw = (region.width.max(0.0) * w as f64).round() as u32;
    let rh = (region.height.max(0.0) * h as f64).round() as u32;

    // Clamp to image bounds
    let x = x.min(w.saturating_sub(1));
    let y = y.min(h.saturating_sub(1));
    let rw = rw.min(w - x);
    let rh = rh.min(h - y);

    image::imageops::crop_imm(frame, x, y, rw, rh).to_image()
}

/// Still images in `dir`, sorted by file name.
pub fn list_frames(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .map(|e| matches!(e.to_ascii_lowercase().as_str(), "png" | "jpg" | "jpeg"))
                .unwrap_or(false)
        })
        .collect();
    paths.sort();
    Ok(paths)
}

/// Replay a directory of frames through the watch channel, one per `frame_interval`.
pub async fn replay_loop(
    dir: &Path,
    frame_tx: watch::Sender<Option<Frame>>,
    status_tx: watch::Sender<CaptureStatus>,
    frame_interval: Duration,
    stop: Arc<AtomicBool>,
) -> Result<()> {
    let paths = list_frames(dir)?;
    let source = FrameSource::Images(dir.to_path_buf()).name();
    info!("Replaying {} frames from {}", paths.len(), dir.display());

    let mut fps = FpsCounter::default();
    for (number, path) in paths.into_iter().enumerate() {
        if stop.load(Ordering::Relaxed) {
            info!("Replay stopping (stop signal received)");
            break;
        }
        let tick_start = Instant::now();

        let shown = path.display().to_string();
        let decoded = tokio::task::spawn_blocking(move || image::open(&path)).await;
        let image = match decoded {
            Ok(Ok(img)) => img.to_rgba8(),
            Ok(Err(e)) => {
                warn!("Skipping unreadable frame {}: {}", shown, e);
                continue;
            }
            Err(e) => {
                warn!("Frame decode task panicked: {}", e);
                continue;
            }
        };
        debug!("Frame {} <- {}", number, shown);

        let number = number as u64;
        let _ = status_tx.send(CaptureStatus {
            is_capturing: true,
            source: Some(source.clone()),
            fps: fps.tick(),
            frames: number + 1,
            last_capture_time: Some(now_ms()),
            resolution: Some(image.dimensions()),
        });
        let _ = frame_tx.send(Some(Frame {
            number,
            timestamp_ms: number * frame_interval.as_millis() as u64,
            image: Arc::new(image),
        }));

        let elapsed = tick_start.elapsed();
        if elapsed < frame_interval {
            tokio::time::sleep(frame_interval - elapsed).await;
        }
    }

    let _ = status_tx.send(CaptureStatus {
        source: Some(source),
        ..Default::default()
    });
    info!("Replay finished");
    Ok(())
}

/// Run a frame source to completion or until `stop` is set.
pub async fn run_source(
    source: &FrameSource,
    frame_tx: watch::Sender<Option<Frame>>,
    status_tx: watch::Sender<CaptureStatus>,
    frame_interval: Duration,
    stop: Arc<AtomicBool>,
) -> Result<()> {
    match source {
        FrameSource::Images(dir) => {
            replay_loop(dir, frame_tx, status_tx, frame_interval, stop).await
        }
        #[cfg(feature = "video")]
        FrameSource::Video(path) => {
            video::video_loop(path, frame_tx, status_tx, frame_interval, stop).await
        }
        #[cfg(not(feature = "video"))]
        FrameSource::Video(path) => anyhow::bail!(
            "{} is not a directory and video decoding was not compiled in (enable the `video` feature)",
            path.display()
        ),
    }
}
