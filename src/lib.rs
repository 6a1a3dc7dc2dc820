pub mod config;
pub mod monitor;
pub mod pipeline;

pub use config::{Backend, MonitorConfig, RacerConfig};
pub use monitor::Monitor;
pub use pipeline::{RacerPipeline, RacerUpdate, SharedAssets};

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "racewatch=debug,z1_vision=debug,z1_capture=debug".into()),
        )
        .init();
}
