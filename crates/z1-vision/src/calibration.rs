use image::{Rgba, RgbaImage};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use z1_capture::ScreenRegion;
use z1_data::{CANONICAL_HEIGHT, CANONICAL_WIDTH};

use crate::layout::{A_BOX_X, BOX_TOP_Y, B_BOX_X, LIFE_H, LIFE_X, LIFE_Y, VIEWPORT_Y};

/// Largest accepted ratio between the horizontal and vertical scale.
pub const MAX_SCALE_RATIO: f32 = 1.6;
/// Calibrations below this confidence are rejected.
pub const MIN_CONFIDENCE: f32 = 0.65;
/// Relative scale difference above which the two heuristics are considered in conflict.
pub const CROSS_CHECK_TOLERANCE: f32 = 0.10;

/// Minimum red run length (stream pixels) counted toward the LIFE glyph.
const MIN_RED_RUN: u32 = 2;
/// Channel value below which a pixel counts as letterbox black.
const NEAR_BLACK: u8 = 24;
/// Mean row brightness that marks the start of the playfield.
const PLAYFIELD_BRIGHTNESS: f32 = 40.0;

/// Affine map between canonical NES coordinates and stream pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationMapping {
    pub crop_x: f32,
    pub crop_y: f32,
    pub scale_x: f32,
    pub scale_y: f32,
    /// Sub-pixel grid offset in canonical pixels
    pub grid_dx: f32,
    pub grid_dy: f32,
    pub video_width: u32,
    pub video_height: u32,
    pub confidence: f32,
}

impl CalibrationMapping {
    /// Stream position of the top-left corner of a canonical pixel.
    pub fn to_stream(&self, nes_x: f32, nes_y: f32) -> (f32, f32) {
        (
            self.crop_x + (nes_x + self.grid_dx) * self.scale_x,
            self.crop_y + (nes_y + self.grid_dy) * self.scale_y,
        )
    }

    /// Canonical position of a stream pixel.
    pub fn to_canonical(&self, stream_x: f32, stream_y: f32) -> (f32, f32) {
        (
            (stream_x - self.crop_x) / self.scale_x - self.grid_dx,
            (stream_y - self.crop_y) / self.scale_y - self.grid_dy,
        )
    }

    /// Stream pixel sampled for a canonical pixel: the centre of its footprint,
    /// clamped into the frame.
    pub fn sample_point(&self, nes_x: f32, nes_y: f32, width: u32, height: u32) -> (u32, u32) {
        let sx = self.crop_x + (nes_x + 0.5 + self.grid_dx) * self.scale_x;
        let sy = self.crop_y + (nes_y + 0.5 + self.grid_dy) * self.scale_y;
        (
            sx.clamp(0.0, width.saturating_sub(1) as f32) as u32,
            sy.clamp(0.0, height.saturating_sub(1) as f32) as u32,
        )
    }

    /// True if this mapping was computed for a frame of this size.
    pub fn matches(&self, width: u32, height: u32) -> bool {
        self.video_width == width && self.video_height == height
    }

    /// Normalized frame region covering a canonical rectangle.
    pub fn region(&self, nes_x: f32, nes_y: f32, width: u32, height: u32) -> ScreenRegion {
        let (x0, y0) = self.to_stream(nes_x, nes_y);
        let (x1, y1) = self.to_stream(nes_x + width as f32, nes_y + height as f32);
        let (fw, fh) = (self.video_width as f64, self.video_height as f64);
        ScreenRegion {
            x: x0 as f64 / fw,
            y: y0 as f64 / fh,
            width: (x1 - x0) as f64 / fw,
            height: (y1 - y0) as f64 / fh,
        }
    }

    fn from_anchor(
        anchor: (f32, f32),
        canonical: (f32, f32),
        scale: (f32, f32),
        frame: &RgbaImage,
    ) -> Result<Self, CalibrationError> {
        let (scale_x, scale_y) = scale;
        if scale_x <= 0.0 || scale_y <= 0.0 {
            return Err(CalibrationError::AspectMismatch {
                ratio: f32::INFINITY,
                max: MAX_SCALE_RATIO,
            });
        }
        let ratio = scale_x.max(scale_y) / scale_x.min(scale_y);
        if ratio > MAX_SCALE_RATIO {
            return Err(CalibrationError::AspectMismatch {
                ratio,
                max: MAX_SCALE_RATIO,
            });
        }
        let confidence = 1.0 / ratio;
        if confidence < MIN_CONFIDENCE {
            return Err(CalibrationError::LowConfidence {
                confidence,
                min: MIN_CONFIDENCE,
            });
        }
        Ok(Self {
            crop_x: anchor.0 - canonical.0 * scale_x,
            crop_y: anchor.1 - canonical.1 * scale_y,
            scale_x,
            scale_y,
            grid_dx: 0.0,
            grid_dy: 0.0,
            video_width: frame.width(),
            video_height: frame.height(),
            confidence,
        })
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CalibrationError {
    #[error("frame {width}x{height} is too small to contain a NES picture")]
    FrameTooSmall { width: u32, height: u32 },
    #[error("no LIFE glyph found in the upper part of the frame")]
    NoGlyph,
    #[error("no B/A item box borders found")]
    NoItemBoxes,
    #[error("scale ratio {ratio:.2} exceeds {max:.2}")]
    AspectMismatch { ratio: f32, max: f32 },
    #[error("confidence {confidence:.2} below {min:.2}")]
    LowConfidence { confidence: f32, min: f32 },
    #[error(
        "LIFE glyph scale ({primary_x:.3}, {primary_y:.3}) disagrees with item-box scale ({fallback_x:.3}, {fallback_y:.3})"
    )]
    Ambiguous {
        primary_x: f32,
        primary_y: f32,
        fallback_x: f32,
        fallback_y: f32,
    },
}

/// Locate the NES picture inside a stream frame.
///
/// The LIFE glyph is the primary anchor. The B/A item boxes are a fallback
/// and, when both succeed, a cross-check.
pub fn calibrate(frame: &RgbaImage) -> Result<CalibrationMapping, CalibrationError> {
    let (w, h) = frame.dimensions();
    if w < CANONICAL_WIDTH / 2 || h < CANONICAL_HEIGHT / 2 {
        return Err(CalibrationError::FrameTooSmall {
            width: w,
            height: h,
        });
    }

    let primary = calibrate_life_glyph(frame);
    let fallback = calibrate_item_boxes(frame);

    let mapping = match (primary, fallback) {
        (Ok(p), Ok(f)) => cross_check(p, &f)?,
        (Ok(p), Err(e)) => {
            debug!("Item-box cross-check unavailable: {}", e);
            p
        }
        (Err(e), Ok(f)) => {
            info!("LIFE glyph calibration failed ({}), using item boxes", e);
            f
        }
        (Err(e), Err(fallback_err)) => {
            debug!("Item-box fallback also failed: {}", fallback_err);
            return Err(e);
        }
    };

    info!(
        "Calibrated {}x{}: crop=({:.1}, {:.1}) scale=({:.3}, {:.3}) confidence={:.2}",
        w, h, mapping.crop_x, mapping.crop_y, mapping.scale_x, mapping.scale_y, mapping.confidence
    );
    Ok(mapping)
}

/// Keep the primary mapping unless the fallback disagrees on scale.
pub fn cross_check(
    primary: CalibrationMapping,
    fallback: &CalibrationMapping,
) -> Result<CalibrationMapping, CalibrationError> {
    let dx = (primary.scale_x - fallback.scale_x).abs() / primary.scale_x;
    let dy = (primary.scale_y - fallback.scale_y).abs() / primary.scale_y;
    if dx.max(dy) > CROSS_CHECK_TOLERANCE {
        return Err(CalibrationError::Ambiguous {
            primary_x: primary.scale_x,
            primary_y: primary.scale_y,
            fallback_x: fallback.scale_x,
            fallback_y: fallback.scale_y,
        });
    }
    Ok(primary)
}

fn is_red(px: &Rgba<u8>) -> bool {
    let (r, g, b) = (px[0] as u32, px[1] as u32, px[2] as u32);
    r > 50 && r > 2 * g && r > 2 * b
}

fn is_box_border(px: &Rgba<u8>) -> bool {
    let (r, g, b) = (px[0] as u32, px[1] as u32, px[2] as u32);
    b > 100 && b > 2 * r && b > 2 * g
}

fn is_near_black(px: &Rgba<u8>) -> bool {
    px[0].max(px[1]).max(px[2]) <= NEAR_BLACK
}

/// A block of consecutive rows containing overlapping red runs.
#[derive(Debug, Clone)]
struct GlyphBand {
    top: u32,
    height: u32,
    left: u32,
    right: u32,
}

impl GlyphBand {
    fn overlaps(&self, left: u32, right: u32, slack: u32) -> bool {
        left <= self.right + slack && right + slack >= self.left
    }
}

/// Red runs of at least `MIN_RED_RUN` pixels in a row, merged across small gaps.
fn red_segments(frame: &RgbaImage, y: u32, max_gap: u32) -> Vec<(u32, u32)> {
    let mut segments: Vec<(u32, u32)> = Vec::new();
    let mut run_start: Option<u32> = None;
    let w = frame.width();
    for x in 0..=w {
        let red = x < w && is_red(frame.get_pixel(x, y));
        match (red, run_start) {
            (true, None) => run_start = Some(x),
            (false, Some(start)) => {
                run_start = None;
                if x - start < MIN_RED_RUN {
                    continue;
                }
                match segments.last_mut() {
                    Some(last) if start - last.1 <= max_gap => last.1 = x,
                    _ => segments.push((start, x)),
                }
            }
            _ => {}
        }
    }
    segments
}

/// Group red segments in the top 40% of the frame into bands, top to bottom.
fn find_glyph_bands(frame: &RgbaImage) -> Vec<GlyphBand> {
    let (w, h) = frame.dimensions();
    let max_gap = (w / 80).max(4);
    let mut open: Vec<(GlyphBand, bool)> = Vec::new();
    let mut closed = Vec::new();

    for y in 0..h * 2 / 5 {
        for (_, touched) in open.iter_mut() {
            *touched = false;
        }
        for (left, right) in red_segments(frame, y, max_gap) {
            match open
                .iter_mut()
                .find(|(band, _)| band.overlaps(left, right, max_gap))
            {
                Some((band, touched)) => {
                    if !*touched {
                        band.height += 1;
                        *touched = true;
                    }
                    band.left = band.left.min(left);
                    band.right = band.right.max(right);
                }
                None => open.push((
                    GlyphBand {
                        top: y,
                        height: 1,
                        left,
                        right,
                    },
                    true,
                )),
            }
        }
        let (still_open, done): (Vec<_>, Vec<_>) = open.into_iter().partition(|(_, t)| *t);
        closed.extend(done.into_iter().map(|(band, _)| band));
        open = still_open;
    }
    closed.extend(open.into_iter().map(|(band, _)| band));

    closed.sort_by_key(|b| (b.top, b.left));
    closed
}

/// Right edge of the game picture: median over rows of the first non-black
/// column scanning in from the right.
fn find_right_edge(frame: &RgbaImage, band: &GlyphBand, scale_y: f32) -> Option<u32> {
    let (w, h) = frame.dimensions();
    let start = band.top + band.height;
    let end = (band.top as f32 + (CANONICAL_HEIGHT as f32 - LIFE_Y) * scale_y) as u32;
    let end = end.min(h);
    let step = ((end.saturating_sub(start)) / 120).max(1);

    let mut edges = Vec::new();
    let mut y = start;
    while y < end {
        if let Some(x) = (band.left..w)
            .rev()
            .find(|&x| !is_near_black(frame.get_pixel(x, y)))
        {
            edges.push(x + 1);
        }
        y += step;
    }
    if edges.is_empty() {
        return None;
    }
    edges.sort_unstable();
    let edge = edges[edges.len() / 2];
    (edge > band.right).then_some(edge)
}

/// Primary heuristic: the red "-LIFE-" glyph gives the vertical scale and the
/// left anchor, the picture's right edge gives the horizontal scale.
pub fn calibrate_life_glyph(frame: &RgbaImage) -> Result<CalibrationMapping, CalibrationError> {
    let bands = find_glyph_bands(frame);
    debug!("Found {} red band candidate(s)", bands.len());

    let mut last_err = CalibrationError::NoGlyph;
    for band in &bands {
        let width = band.right - band.left;
        // The glyph is much wider than tall at any plausible aspect
        if band.height < 4 || width < band.height * 3 {
            continue;
        }
        let scale_y = band.height as f32 / LIFE_H as f32;
        let Some(right_edge) = find_right_edge(frame, band, scale_y) else {
            continue;
        };
        let scale_x = (right_edge - band.left) as f32 / (CANONICAL_WIDTH as f32 - LIFE_X);
        debug!(
            "  band y={} h={} x={}..{} right_edge={} scale=({:.3}, {:.3})",
            band.top, band.height, band.left, band.right, right_edge, scale_x, scale_y
        );
        match CalibrationMapping::from_anchor(
            (band.left as f32, band.top as f32),
            (LIFE_X, LIFE_Y),
            (scale_x, scale_y),
            frame,
        ) {
            Ok(mapping) => return Ok(mapping),
            Err(e) => last_err = e,
        }
    }
    Err(last_err)
}

/// Vertical blue border column: (x, top of its longest run).
#[derive(Debug, Clone, Copy)]
struct BorderColumn {
    x: u32,
    top: u32,
}

fn find_border_columns(frame: &RgbaImage) -> Vec<BorderColumn> {
    let (w, h) = frame.dimensions();
    let scan_bottom = h * 2 / 5;
    let min_run = (h / 60).max(8);

    let mut clusters: Vec<BorderColumn> = Vec::new();
    let mut prev_x: Option<u32> = None;
    for x in 0..w {
        let mut best = (0u32, 0u32);
        let mut run = 0u32;
        for y in 0..scan_bottom {
            if is_box_border(frame.get_pixel(x, y)) {
                run += 1;
                if run > best.0 {
                    best = (run, y + 1 - run);
                }
            } else {
                run = 0;
            }
        }
        if best.0 < min_run {
            continue;
        }
        match (clusters.last_mut(), prev_x) {
            (Some(last), Some(px)) if px + 1 == x => last.top = last.top.min(best.1),
            _ => clusters.push(BorderColumn { x, top: best.1 }),
        }
        prev_x = Some(x);
    }
    clusters
}

/// First row below the HUD whose brightness marks the playfield.
fn find_playfield_top(frame: &RgbaImage, from_y: u32, left: f32, right: f32) -> Option<u32> {
    let (w, h) = frame.dimensions();
    let x0 = left.max(0.0) as u32;
    let x1 = (right as u32).min(w);
    if x0 >= x1 {
        return None;
    }
    let step = ((x1 - x0) / 64).max(1);
    (from_y..h).find(|&y| {
        let mut sum = 0.0;
        let mut n = 0u32;
        let mut x = x0;
        while x < x1 {
            let px = frame.get_pixel(x, y);
            sum += z1_data::luma([px[0], px[1], px[2]]) * 255.0;
            n += 1;
            x += step;
        }
        n > 0 && sum / n as f32 > PLAYFIELD_BRIGHTNESS
    })
}

/// Fallback heuristic: the left borders of the B and A boxes give the
/// horizontal scale, the box top and the HUD/playfield boundary the vertical.
pub fn calibrate_item_boxes(frame: &RgbaImage) -> Result<CalibrationMapping, CalibrationError> {
    let columns = find_border_columns(frame);
    debug!("Found {} box border column(s)", columns.len());

    // Each box contributes a left and a right border of equal width apart
    let boxes = columns.windows(4).find(|c| {
        let b_width = c[1].x - c[0].x;
        let a_width = c[3].x - c[2].x;
        b_width.abs_diff(a_width) <= 2 && c[2].x - c[0].x > b_width
    });
    let Some(boxes) = boxes else {
        return Err(CalibrationError::NoItemBoxes);
    };

    let scale_x = (boxes[2].x - boxes[0].x) as f32 / (A_BOX_X - B_BOX_X);
    let box_top = boxes[0].top;
    let crop_x = boxes[0].x as f32 - B_BOX_X * scale_x;
    let hud_span = VIEWPORT_Y - BOX_TOP_Y;
    let search_from = box_top + (hud_span * scale_x * 0.5) as u32;

    let Some(boundary) = find_playfield_top(
        frame,
        search_from,
        crop_x,
        crop_x + CANONICAL_WIDTH as f32 * scale_x,
    ) else {
        return Err(CalibrationError::NoItemBoxes);
    };
    let scale_y = (boundary - box_top) as f32 / hud_span;
    debug!(
        "  boxes at x={} and x={}, top={} playfield={} scale=({:.3}, {:.3})",
        boxes[0].x, boxes[2].x, box_top, boundary, scale_x, scale_y
    );

    CalibrationMapping::from_anchor(
        (boxes[0].x as f32, box_top as f32),
        (B_BOX_X, BOX_TOP_Y),
        (scale_x, scale_y),
        frame,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const RED: Rgba<u8> = Rgba([200, 30, 30, 255]);
    const BLUE: Rgba<u8> = Rgba([40, 40, 200, 255]);
    const FIELD: Rgba<u8> = Rgba([90, 160, 90, 255]);

    fn fill(img: &mut RgbaImage, x0: u32, y0: u32, x1: u32, y1: u32, color: Rgba<u8>) {
        for y in y0..y1 {
            for x in x0..x1 {
                img.put_pixel(x, y, color);
            }
        }
    }

    /// 640x480 stream with a 1:1 NES picture whose top-left sits at (344, 24).
    fn unscaled_frame() -> RgbaImage {
        let mut img = RgbaImage::from_pixel(640, 480, Rgba([0, 0, 0, 255]));
        fill(&mut img, 528, 40, 568, 48, RED);
        fill(&mut img, 344, 88, 600, 264, FIELD);
        img
    }

    #[test]
    fn test_life_glyph_unscaled() {
        let mapping = calibrate(&unscaled_frame()).unwrap();
        assert!((mapping.scale_y - 1.0).abs() < 1e-6);
        assert!((mapping.scale_x - 1.0).abs() < 0.02, "scale_x {}", mapping.scale_x);
        assert!((mapping.confidence - 1.0).abs() < 0.02);
        assert!((mapping.crop_y - 24.0).abs() < 1e-3);
        assert!((mapping.crop_x - 344.0).abs() < 2.0, "crop_x {}", mapping.crop_x);
        assert_eq!((mapping.video_width, mapping.video_height), (640, 480));
    }

    #[test]
    fn test_overlay_band_above_glyph_is_skipped() {
        let mut img = unscaled_frame();
        // A red timer overlay far from the picture
        fill(&mut img, 10, 5, 50, 13, RED);
        let mapping = calibrate(&img).unwrap();
        assert!((mapping.crop_x - 344.0).abs() < 2.0);
        assert!((mapping.scale_y - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_no_anchor_fails_closed() {
        let img = RgbaImage::from_pixel(640, 480, Rgba([20, 20, 20, 255]));
        assert_eq!(calibrate(&img), Err(CalibrationError::NoGlyph));
    }

    #[test]
    fn test_tiny_frame() {
        let img = RgbaImage::new(64, 64);
        assert!(matches!(
            calibrate(&img),
            Err(CalibrationError::FrameTooSmall { .. })
        ));
    }

    #[test]
    fn test_item_box_fallback() {
        // 2x picture at (40, 20)
        let mut img = RgbaImage::from_pixel(640, 520, Rgba([0, 0, 0, 255]));
        for x in [280, 310, 328, 358] {
            fill(&mut img, x, 52, x + 2, 116, BLUE);
        }
        fill(&mut img, 40, 148, 552, 500, FIELD);

        let mapping = calibrate(&img).unwrap();
        assert!((mapping.scale_x - 2.0).abs() < 1e-3, "scale_x {}", mapping.scale_x);
        assert!((mapping.scale_y - 2.0).abs() < 1e-3, "scale_y {}", mapping.scale_y);
        assert!((mapping.crop_x - 40.0).abs() < 1e-3);
        assert!((mapping.crop_y - 20.0).abs() < 1e-3);
    }

    #[test]
    fn test_cross_check_disagreement() {
        let primary = calibrate(&unscaled_frame()).unwrap();
        let mut fallback = primary;
        fallback.scale_x *= 1.2;
        assert!(matches!(
            cross_check(primary, &fallback),
            Err(CalibrationError::Ambiguous { .. })
        ));
        fallback.scale_x = primary.scale_x * 1.05;
        assert_eq!(cross_check(primary, &fallback), Ok(primary));
    }

    #[test]
    fn test_aspect_rejected() {
        let img = RgbaImage::new(640, 480);
        let result = CalibrationMapping::from_anchor((0.0, 0.0), (0.0, 0.0), (3.0, 1.0), &img);
        assert!(matches!(result, Err(CalibrationError::AspectMismatch { .. })));
    }

    #[test]
    fn test_mapping_round_trip() {
        let mapping = calibrate(&unscaled_frame()).unwrap();
        let (sx, sy) = mapping.to_stream(LIFE_X, LIFE_Y);
        let (nx, ny) = mapping.to_canonical(sx, sy);
        assert!((nx - LIFE_X).abs() < 1e-3 && (ny - LIFE_Y).abs() < 1e-3);
        assert!(mapping.matches(640, 480));
        assert!(!mapping.matches(1280, 720));
    }
}
