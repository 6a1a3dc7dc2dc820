//! Run a saved stream frame through calibration, correlation and interpretation.
//! Usage: cargo run -p z1-vision --features cli --bin analyze_frame -- <frame.png> --data-dir data

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use z1_data::TemplateAtlas;
use z1_vision::{analyze, calibration::CalibrationMapping, Landmark, TileLayout};

#[derive(Parser, Debug)]
#[command(about = "Analyze one stream frame and dump HUD tile crops")]
struct Args {
    /// Frame to analyze
    image: PathBuf,
    /// Asset root containing templates/
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,
    /// JSON list of {label, x, y, w, h} landmark overrides
    #[arg(long)]
    landmarks: Option<PathBuf>,
    /// Where tile crops are written
    #[arg(long, default_value = "./debug_output")]
    output_dir: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("z1_vision=debug")),
        )
        .init();

    let args = Args::parse();
    std::fs::create_dir_all(&args.output_dir)
        .with_context(|| format!("Failed to create {}", args.output_dir.display()))?;

    println!("Loading image: {}", args.image.display());
    let img = image::open(&args.image)
        .with_context(|| format!("Failed to open {}", args.image.display()))?
        .to_rgba8();
    println!("Image size: {}x{}", img.width(), img.height());

    let landmarks: Vec<Landmark> = match &args.landmarks {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&text).context("Invalid landmarks file")?
        }
        None => Vec::new(),
    };

    let atlas = Arc::new(TemplateAtlas::load(&args.data_dir)?);
    println!("Templates: {}", atlas.template_count());

    let diag = analyze(&img, atlas, &landmarks)?;
    let m: &CalibrationMapping = &diag.mapping;

    println!("\n=== Calibration ===");
    println!(
        "crop=({:.1}, {:.1}) scale=({:.3}, {:.3}) confidence={:.2}",
        m.crop_x, m.crop_y, m.scale_x, m.scale_y, m.confidence
    );

    println!("\n=== Aggregates ===");
    let a = &diag.aggregates;
    println!("brightness:  {:.1}", a.brightness);
    println!("red ratio:   {:.1}%", a.red_ratio);
    println!("gold pixels: {}", a.gold_pixels);

    println!("\n=== Tiles ===");
    let layout = TileLayout::with_landmarks(m, &landmarks);
    for t in &diag.tiles {
        println!(
            "  {:<8} {:<18} {:.3}",
            t.tile.as_str(),
            t.template.as_deref().unwrap_or("-"),
            t.score
        );
        if let Some(def) = layout.get(t.tile) {
            let region = m.region(def.nes_x, def.nes_y, 8, def.size.height());
            let crop = z1_capture::crop_region(&img, &region);
            let _ = crop.save(args.output_dir.join(format!("tile_{}.png", t.tile.as_str())));
        }
    }
    if let Some(room) = &diag.best_room {
        println!("best room: {:?} {} ({:.3})", room.mode, room.room, room.score);
    }

    println!("\n=== State ===");
    println!("{}", serde_json::to_string_pretty(&diag.state)?);
    println!("\nDebug images saved to: {}", args.output_dir.display());
    Ok(())
}
