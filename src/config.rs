// Global configuration management

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::engine::{
    EncoderSettings, FilterOrder, OutputId, OutputMode, OutputOptions, StageSettings,
    VideoOptions, default_exit_timeout,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub encoder: EncoderConfig,

    #[serde(default = "default_outputs")]
    pub outputs: Vec<OutputEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// Path or name of the FFmpeg-compatible binary
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,

    /// Value passed to -loglevel
    #[serde(default = "default_loglevel")]
    pub loglevel: String,

    /// Demuxer forced on the stdin input (e.g. "h264"); probed when unset
    #[serde(default)]
    pub input_format: Option<String>,

    #[serde(default)]
    pub mode: OutputMode,

    #[serde(default)]
    pub filter_order: FilterOrder,

    /// Seconds to wait for the encoder to exit after input closed.
    /// Unset means the mode default (30 combined, unbounded multi-sink).
    #[serde(default)]
    pub exit_timeout_secs: Option<u64>,

    /// Directory for named pipes in multi-sink mode (fresh temp dir when unset)
    #[serde(default)]
    pub fifo_dir: Option<PathBuf>,

    /// Bytes per read on output pipes and per write chunk of file input
    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: usize,
}

/// One `[[outputs]]` entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputEntry {
    pub id: OutputId,

    #[serde(flatten)]
    pub options: OutputOptions,
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_loglevel() -> String {
    "quiet".to_string()
}

fn default_read_chunk_size() -> usize {
    64 * 1024
}

fn default_outputs() -> Vec<OutputEntry> {
    vec![
        OutputEntry {
            id: OutputId(0x100),
            options: OutputOptions::Video(VideoOptions::default()),
        },
        OutputEntry {
            id: OutputId(0x101),
            options: OutputOptions::Video(VideoOptions {
                width: 640,
                height: 360,
                bitrate_kbps: 800,
                profile: "main".to_string(),
                ..VideoOptions::default()
            }),
        },
    ]
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            loglevel: default_loglevel(),
            input_format: None,
            mode: OutputMode::default(),
            filter_order: FilterOrder::default(),
            exit_timeout_secs: None,
            fifo_dir: None,
            read_chunk_size: default_read_chunk_size(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            encoder: EncoderConfig::default(),
            outputs: default_outputs(),
        }
    }
}

impl EncoderConfig {
    /// Stage settings for `mode`, falling back to the configured mode
    pub fn stage_settings(&self, mode: Option<OutputMode>) -> StageSettings {
        let mode = mode.unwrap_or(self.mode);
        StageSettings {
            mode,
            encoder: EncoderSettings {
                ffmpeg_path: self.ffmpeg_path.clone(),
                loglevel: self.loglevel.clone(),
                input_format: self.input_format.clone(),
                filter_order: self.filter_order,
            },
            exit_timeout: self
                .exit_timeout_secs
                .map(Duration::from_secs)
                .or_else(|| default_exit_timeout(mode)),
            fifo_dir: self.fifo_dir.clone(),
            read_chunk_size: self.read_chunk_size.max(1),
        }
    }
}

impl Config {
    /// Get the path to the config file
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Could not determine config directory")?
            .join("ffladder");

        Ok(config_dir.join("config.toml"))
    }

    /// Load config from the default location, or built-in defaults if missing
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            Ok(Config::default())
        }
    }

    /// Load config from an explicit path
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<PathBuf> {
        let config_path = Self::config_path()?;
        self.save_to(&config_path)?;
        Ok(config_path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }
}
