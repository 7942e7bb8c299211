//! Infrastructure configuration - paths and telemetry.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Where the producer rendezvous socket lives.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PathsConfig {
    /// Directory holding the rendezvous socket.
    /// Default: $XDG_RUNTIME_DIR, falling back to the system temp dir
    #[serde(default = "PathsConfig::default_runtime_dir")]
    pub runtime_dir: PathBuf,

    /// File name of the socket inside `runtime_dir`.
    /// Default: alvr-ipc
    #[serde(default = "PathsConfig::default_socket_name")]
    pub socket_name: String,

    /// Full socket path; wins over `runtime_dir` + `socket_name` when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<PathBuf>,
}

impl PathsConfig {
    fn default_runtime_dir() -> PathBuf {
        directories::BaseDirs::new()
            .and_then(|dirs| dirs.runtime_dir().map(|d| d.to_path_buf()))
            .unwrap_or_else(std::env::temp_dir)
    }

    fn default_socket_name() -> String {
        "alvr-ipc".to_string()
    }

    /// Resolved rendezvous socket path.
    pub fn socket_path(&self) -> PathBuf {
        match &self.socket_path {
            Some(path) => path.clone(),
            None => self.runtime_dir.join(&self.socket_name),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            runtime_dir: Self::default_runtime_dir(),
            socket_name: Self::default_socket_name(),
            socket_path: None,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetryConfig {
    /// Log filter (trace, debug, info, warn, error, or an EnvFilter directive).
    /// Default: info
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_path_joins_runtime_dir() {
        let paths = PathsConfig {
            runtime_dir: PathBuf::from("/run/user/1000"),
            socket_name: "alvr-ipc".to_string(),
            socket_path: None,
        };
        assert_eq!(paths.socket_path(), PathBuf::from("/run/user/1000/alvr-ipc"));
    }

    #[test]
    fn test_explicit_socket_path_wins() {
        let paths = PathsConfig {
            socket_path: Some(PathBuf::from("/tmp/custom.sock")),
            ..PathsConfig::default()
        };
        assert_eq!(paths.socket_path(), PathBuf::from("/tmp/custom.sock"));
    }
}
