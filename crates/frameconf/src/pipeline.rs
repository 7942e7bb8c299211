//! Capture/encode loop timing.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Poll granularity and keyframe policy for the encoder thread.
///
/// Zero disables the optional intervals (`stall_warning_ms`, `keyframe_interval_ms`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    /// Poll timeout while waiting for producer bytes, in microseconds.
    /// Default: 100
    #[serde(default = "PipelineConfig::default_read_poll_us")]
    pub read_poll_us: u64,

    /// Poll timeout while waiting for a producer to connect, in milliseconds.
    /// Default: 15
    #[serde(default = "PipelineConfig::default_accept_poll_ms")]
    pub accept_poll_ms: u64,

    /// Warn when no producer bytes arrive for this long, in milliseconds.
    /// Default: 2000
    #[serde(default = "PipelineConfig::default_stall_warning_ms")]
    pub stall_warning_ms: u64,

    /// Force a keyframe at least this often, in milliseconds.
    /// Default: 2000
    #[serde(default = "PipelineConfig::default_keyframe_interval_ms")]
    pub keyframe_interval_ms: u64,

    /// Go back to listening after a session ends on its own.
    /// Default: true
    #[serde(default = "PipelineConfig::default_restart_sessions")]
    pub restart_sessions: bool,
}

impl PipelineConfig {
    fn default_read_poll_us() -> u64 {
        100
    }

    fn default_accept_poll_ms() -> u64 {
        15
    }

    fn default_stall_warning_ms() -> u64 {
        2000
    }

    fn default_keyframe_interval_ms() -> u64 {
        2000
    }

    fn default_restart_sessions() -> bool {
        true
    }

    pub fn read_poll_interval(&self) -> Duration {
        Duration::from_micros(self.read_poll_us)
    }

    pub fn accept_poll_interval(&self) -> Duration {
        Duration::from_millis(self.accept_poll_ms)
    }

    pub fn stall_warning(&self) -> Option<Duration> {
        (self.stall_warning_ms > 0).then(|| Duration::from_millis(self.stall_warning_ms))
    }

    pub fn keyframe_interval(&self) -> Option<Duration> {
        (self.keyframe_interval_ms > 0).then(|| Duration::from_millis(self.keyframe_interval_ms))
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            read_poll_us: Self::default_read_poll_us(),
            accept_poll_ms: Self::default_accept_poll_ms(),
            stall_warning_ms: Self::default_stall_warning_ms(),
            keyframe_interval_ms: Self::default_keyframe_interval_ms(),
            restart_sessions: Self::default_restart_sessions(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_disables_intervals() {
        let config = PipelineConfig {
            stall_warning_ms: 0,
            keyframe_interval_ms: 0,
            ..PipelineConfig::default()
        };
        assert_eq!(config.stall_warning(), None);
        assert_eq!(config.keyframe_interval(), None);
    }

    #[test]
    fn test_accept_waits_longer_than_read() {
        let config = PipelineConfig::default();
        assert!(config.accept_poll_interval() > config.read_poll_interval());
    }
}
