use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use racewatch::{init_tracing, Monitor, MonitorConfig};
use z1_data::TemplateAtlas;

#[derive(Parser, Debug)]
#[command(name = "racewatch", about = "Game state and events from racer stream video")]
struct Cli {
    /// Monitor configuration file
    #[arg(long, default_value = "racewatch.json")]
    config: PathBuf,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Calibrate and read a single saved frame
    Calibrate {
        image: PathBuf,
        /// Asset root; defaults to the config's data_dir
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Some(Command::Calibrate { image, data_dir }) => {
            let data_dir = match data_dir {
                Some(dir) => dir,
                None => MonitorConfig::load(&cli.config)
                    .map(|c| c.data_dir)
                    .unwrap_or_else(|_| PathBuf::from("data")),
            };
            calibrate_frame(image, data_dir).await
        }
        None => run_monitor(MonitorConfig::load(&cli.config)?).await,
    }
}

async fn calibrate_frame(image: PathBuf, data_dir: PathBuf) -> Result<()> {
    let diagnostics = tokio::task::spawn_blocking(move || -> Result<_> {
        let frame = image::open(&image)
            .with_context(|| format!("Failed to open {}", image.display()))?
            .to_rgba8();
        let atlas = Arc::new(TemplateAtlas::load(&data_dir)?);
        z1_vision::analyze(&frame, atlas, &[])
    })
    .await??;
    println!("{}", serde_json::to_string_pretty(&diagnostics)?);
    Ok(())
}

async fn run_monitor(config: MonitorConfig) -> Result<()> {
    let mut monitor = Monitor::new(&config).await?;
    let mut events = monitor.subscribe();

    for racer in &config.racers {
        if let Err(e) = monitor.add_racer(racer).await {
            error!("[{}] Not monitored: {:#}", racer.id, e);
        }
    }
    let ids = monitor.racer_ids();
    if ids.is_empty() {
        anyhow::bail!("No racer could be calibrated");
    }
    info!("Monitoring {} racer(s)", ids.len());

    // One printer per racer; each ends when its pipeline stops publishing
    let mut printers = JoinSet::new();
    for id in &ids {
        let Some(mut rx) = monitor.watch_racer(id) else {
            continue;
        };
        printers.spawn(async move {
            while rx.changed().await.is_ok() {
                let update = rx.borrow_and_update().clone();
                if let Some(update) = update {
                    println!("{}", json!({ "type": "state", "update": update }));
                }
            }
        });
    }

    loop {
        tokio::select! {
            received = events.recv() => match received {
                Ok(event) => println!("{}", json!({ "type": "event", "event": event })),
                Err(RecvError::Lagged(n)) => warn!("Dropped {} event(s)", n),
                Err(RecvError::Closed) => break,
            },
            finished = printers.join_next() => {
                if finished.is_none() || printers.is_empty() {
                    info!("All sources finished");
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping");
                break;
            }
        }
    }
    while let Ok(event) = events.try_recv() {
        println!("{}", json!({ "type": "event", "event": event }));
    }

    monitor.shutdown();
    Ok(())
}
