//! Configuration loading for framepipe.
//!
//! Everything here is fixed for the lifetime of the process: where the
//! producer rendezvous socket lives, how chatty the logs are, and the
//! timing knobs of the capture/encode loop.
//!
//! # Usage
//!
//! ```rust,no_run
//! use frameconf::FrameConfig;
//!
//! let config = FrameConfig::load().expect("Failed to load config");
//! println!("socket: {}", config.paths.socket_path().display());
//! println!("keyframe interval: {:?}", config.pipeline.keyframe_interval());
//! ```
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/framepipe/config.toml` (system)
//! 2. `~/.config/framepipe/config.toml` (user)
//! 3. `./framepipe.toml` (local override, or the path given on the command line)
//! 4. Environment variables (`FRAMEPIPE_*`, `RUST_LOG`)
//!
//! # Example Config
//!
//! ```toml
//! [paths]
//! runtime_dir = "$XDG_RUNTIME_DIR"
//! socket_name = "alvr-ipc"
//!
//! [telemetry]
//! log_level = "info"
//!
//! [pipeline]
//! read_poll_us = 100
//! accept_poll_ms = 15
//! stall_warning_ms = 2000
//! keyframe_interval_ms = 2000
//! restart_sessions = true
//! ```

pub mod infra;
pub mod loader;
pub mod pipeline;

pub use infra::{PathsConfig, TelemetryConfig};
pub use loader::{discover_config_files_with_override, ConfigSources};
pub use pipeline::PipelineConfig;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Complete framepipe configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct FrameConfig {
    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,
}

impl FrameConfig {
    /// Load configuration from all sources.
    ///
    /// Load order (later wins):
    /// 1. Compiled defaults
    /// 2. `/etc/framepipe/config.toml`
    /// 3. `~/.config/framepipe/config.toml`
    /// 4. `./framepipe.toml`
    /// 5. Environment variables
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration from optional path and return information about sources.
    pub fn load_with_sources_from(
        config_path: Option<&std::path::Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let files = loader::discover_config_files_with_override(config_path);
        let (mut config, mut sources) = loader::load_files(&files)?;

        loader::apply_env_overrides(&mut config, &mut sources, |key| std::env::var(key).ok());

        Ok((config, sources))
    }

    /// Serialize config to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        let body = toml::to_string_pretty(self)?;
        Ok(format!("# framepipe configuration\n\n{}", body))
    }
}
