use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use z1_capture::FrameSource;
use z1_state::StabilizerConfig;
use z1_vision::Landmark;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// wgpu compute, falling back to the CPU when no adapter is found
    #[default]
    Gpu,
    Cpu,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RacerConfig {
    pub id: String,
    /// Image-sequence directory or video file
    pub source: PathBuf,
    /// Stream-pixel positions overriding the default HUD layout
    #[serde(default)]
    pub landmarks: Vec<Landmark>,
}

impl RacerConfig {
    pub fn frame_source(&self) -> FrameSource {
        FrameSource::from_path(&self.source)
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_frame_interval_ms() -> u64 {
    // ~60 fps
    16
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub backend: Backend,
    /// Pacing for replayed sources
    #[serde(default = "default_frame_interval_ms")]
    pub frame_interval_ms: u64,
    #[serde(default)]
    pub stabilizer: StabilizerConfig,
    pub racers: Vec<RacerConfig>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            backend: Backend::default(),
            frame_interval_ms: default_frame_interval_ms(),
            stabilizer: StabilizerConfig::default(),
            racers: Vec::new(),
        }
    }
}

impl MonitorConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config: MonitorConfig = serde_json::from_str(
            r#"{
                "racers": [
                    {"id": "alice", "source": "/tmp/alice"},
                    {"id": "bob", "source": "/tmp/bob.mp4",
                     "landmarks": [{"label": "rupees", "x": 200, "y": 40, "w": 48, "h": 16}]}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(config.data_dir, PathBuf::from("data"));
        assert_eq!(config.backend, Backend::Gpu);
        assert_eq!(config.frame_interval(), Duration::from_millis(16));
        assert_eq!(config.stabilizer, StabilizerConfig::default());
        assert_eq!(config.racers.len(), 2);
        assert_eq!(config.racers[1].landmarks[0].label, "rupees");
        assert!(config.racers[0].landmarks.is_empty());
    }

    #[test]
    fn test_partial_stabilizer_thresholds() {
        let config: MonitorConfig = serde_json::from_str(
            r#"{"backend": "cpu", "stabilizer": {"rupees": 5}, "racers": []}"#,
        )
        .unwrap();
        assert_eq!(config.backend, Backend::Cpu);
        assert_eq!(config.stabilizer.rupees, 5);
        assert_eq!(config.stabilizer.screen, StabilizerConfig::default().screen);
    }

    #[test]
    fn test_missing_racers_rejected() {
        assert!(serde_json::from_str::<MonitorConfig>(r#"{"backend": "gpu"}"#).is_err());
    }
}
