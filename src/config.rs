//! Configuration loading and types for earshot
//!
//! Configuration is loaded from a TOML file layered over built-in
//! defaults. The embedding application decides where the file lives; the
//! defaults match the original deployment (30 second split window,
//! 64 kbps channels, 30 second default lookback).

use crate::error::EarshotError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default configuration file content
pub const DEFAULT_CONFIG: &str = r#"# earshot configuration

[storage]
# SQLite database for sessions, privacy flags, and the audit log.
# "auto" uses the platform data directory.
db_path = "auto"

[recording]
# Seconds of audio a session may buffer before it is split into a
# successor session.
split_window_secs = 30

# Channel bitrate assumed when the transport does not report one (bps).
default_bitrate = 64000

# Hard override for the split threshold in bytes. Omit to derive it from
# the channel bitrate and split window.
# max_segment_bytes = 240000

[recall]
# Lookback used when a recall request does not name one.
default_lookback = "30s"

# Path to the ffmpeg binary. Omit to search PATH and common locations.
# ffmpeg_path = "/usr/bin/ffmpeg"
"#;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub recording: RecordingConfig,
    pub recall: RecallConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Database path; "auto" resolves to the platform data directory.
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("auto"),
        }
    }
}

impl StorageConfig {
    /// Resolve the configured database path.
    pub fn resolve_db_path(&self) -> PathBuf {
        if self.db_path == Path::new("auto") {
            default_db_path()
        } else {
            self.db_path.clone()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub split_window_secs: u32,
    pub default_bitrate: u32,
    pub max_segment_bytes: Option<usize>,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            split_window_secs: 30,
            default_bitrate: 64_000,
            max_segment_bytes: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecallConfig {
    pub default_lookback: String,
    pub ffmpeg_path: Option<PathBuf>,
}

impl Default for RecallConfig {
    fn default() -> Self {
        Self {
            default_lookback: "30s".to_string(),
            ffmpeg_path: None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, or defaults when it is absent.
    pub fn load(path: &Path) -> Result<Self, EarshotError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| EarshotError::Config(format!("{}: {}", path.display(), e)))
    }
}

fn default_db_path() -> PathBuf {
    directories::ProjectDirs::from("", "", "earshot")
        .map(|dirs| dirs.data_dir().join("sessions.db"))
        .unwrap_or_else(|| PathBuf::from("earshot-sessions.db"))
}
