use crate::{now_ms, CaptureStatus, FpsCounter, Frame, FrameSource};
use anyhow::Context;
use image::RgbaImage;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

/// A decoded picture and its presentation time, if the container has one.
type Decoded = (RgbaImage, Option<u64>);

/// Decode a video file and send frames through the watch channel,
/// with the same interface as `replay_loop`.
pub async fn video_loop(
    path: &Path,
    frame_tx: watch::Sender<Option<Frame>>,
    status_tx: watch::Sender<CaptureStatus>,
    frame_interval: Duration,
    stop: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let source = FrameSource::Video(path.to_path_buf()).name();
    info!("Video loop starting: {}", path.display());

    let path_owned = path.to_path_buf();
    let (decode_tx, mut decode_rx) = mpsc::channel::<Decoded>(2);

    let stop_decode = stop.clone();
    let decode_handle =
        tokio::task::spawn_blocking(move || decode_video(&path_owned, decode_tx, stop_decode));

    let mut fps = FpsCounter::default();
    let mut number = 0u64;

    loop {
        if stop.load(Ordering::Relaxed) {
            info!("Video loop stopping (stop signal)");
            break;
        }
        let tick_start = Instant::now();

        let Some((image, pts_ms)) = decode_rx.recv().await else {
            info!("Video decode complete");
            break;
        };

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
            timestamp_ms: pts_ms.unwrap_or(number * frame_interval.as_millis() as u64),
            image: Arc::new(image),
        }));
        number += 1;

        let elapsed = tick_start.elapsed();
        if elapsed < frame_interval {
            tokio::time::sleep(frame_interval - elapsed).await;
        }
    }

    // Unblock the decoder if it is waiting on a full channel
    drop(decode_rx);
    match decode_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Video decode error: {:#}", e),
        Err(e) => warn!("Video decode thread panicked: {}", e),
    }

    let _ = status_tx.send(CaptureStatus {
        source: Some(source),
        ..Default::default()
    });
    info!("Video loop stopped");
    Ok(())
}

struct Rgba {
    scaler: ffmpeg_next::software::scaling::Context,
    width: u32,
    height: u32,
    /// Milliseconds per pts tick
    tick_ms: f64,
}

impl Rgba {
    fn convert(&mut self, decoded: &ffmpeg_next::frame::Video) -> anyhow::Result<Option<Decoded>> {
        let mut rgba = ffmpeg_next::frame::Video::empty();
        self.scaler.run(decoded, &mut rgba)?;

        let data = rgba.data(0);
        let stride = rgba.stride(0);
        let row_len = self.width as usize * 4;
        // Rows may be padded past width * 4
        let mut pixels = Vec::with_capacity(row_len * self.height as usize);
        for y in 0..self.height as usize {
            let start = y * stride;
            pixels.extend_from_slice(&data[start..start + row_len]);
        }

        let pts_ms = decoded
            .timestamp()
            .filter(|pts| *pts >= 0)
            .map(|pts| (pts as f64 * self.tick_ms) as u64);
        Ok(RgbaImage::from_raw(self.width, self.height, pixels).map(|img| (img, pts_ms)))
    }
}

/// Send every frame the decoder has ready. Returns false once the receiver is gone.
fn drain(
    decoder: &mut ffmpeg_next::decoder::Video,
    rgba: &mut Rgba,
    tx: &mpsc::Sender<Decoded>,
    stop: &AtomicBool,
) -> anyhow::Result<bool> {
    let mut decoded = ffmpeg_next::frame::Video::empty();
    while decoder.receive_frame(&mut decoded).is_ok() {
        if stop.load(Ordering::Relaxed) {
            return Ok(false);
        }
        if let Some(frame) = rgba.convert(&decoded)? {
            if tx.blocking_send(frame).is_err() {
                return Ok(false);
            }
        }
    }
    Ok(true)
}

/// Blocking video decode using ffmpeg-next.
fn decode_video(path: &Path, tx: mpsc::Sender<Decoded>, stop: Arc<AtomicBool>) -> anyhow::Result<()> {
    ffmpeg_next::init()?;

    let mut ictx = ffmpeg_next::format::input(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    let video_stream = ictx
        .streams()
        .best(ffmpeg_next::media::Type::Video)
        .ok_or_else(|| anyhow::anyhow!("No video stream found"))?;

    let stream_index = video_stream.index();
    let time_base = video_stream.time_base();
    let decoder_ctx =
        ffmpeg_next::codec::context::Context::from_parameters(video_stream.parameters())?;
    let mut decoder = decoder_ctx.decoder().video()?;

    let scaler = ffmpeg_next::software::scaling::Context::get(
        decoder.format(),
        decoder.width(),
        decoder.height(),
        ffmpeg_next::format::Pixel::RGBA,
        decoder.width(),
        decoder.height(),
        ffmpeg_next::software::scaling::Flags::BILINEAR,
    )?;

    info!(
        "Video opened: {}x{}, format {:?}",
        decoder.width(),
        decoder.height(),
        decoder.format()
    );

    let mut rgba = Rgba {
        scaler,
        width: decoder.width(),
        height: decoder.height(),
        tick_ms: 1000.0 * time_base.numerator() as f64 / time_base.denominator().max(1) as f64,
    };

    for (stream, packet) in ictx.packets() {
        if stop.load(Ordering::Relaxed) {
            return Ok(());
        }
        if stream.index() != stream_index {
            continue;
        }
        decoder.send_packet(&packet)?;
        if !drain(&mut decoder, &mut rgba, &tx, &stop)? {
            return Ok(());
        }
    }

    decoder.send_eof()?;
    drain(&mut decoder, &mut rgba, &tx, &stop)?;
    Ok(())
}
