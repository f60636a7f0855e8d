//! Engine composition-root configuration.
//!
//! The engine never reads its own configuration from the process
//! environment or argv — the host builds an [`EngineConfig`] however it
//! likes (TOML file, env vars, hardcoded) and passes it to
//! [`crate::engine::Engine::new`].

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::orchestrator::retry::RetryPreset;

fn default_stty_binary() -> PathBuf {
    PathBuf::from("stty")
}

fn default_socat_binary() -> PathBuf {
    PathBuf::from("socat")
}

fn default_max_concurrent_tasks() -> usize {
    4
}

fn default_event_queue_capacity() -> usize {
    256
}

fn default_task_reap_age() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

/// Composition-root configuration for an [`crate::engine::Engine`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory containing `SerialPortProfiles/`, `SocatProfiles/`,
    /// `PowerSupplyProfiles/`, `JobProfiles/`.
    pub profiles_base_path: PathBuf,

    #[serde(default = "default_stty_binary")]
    pub stty_binary: PathBuf,

    #[serde(default = "default_socat_binary")]
    pub socat_binary: PathBuf,

    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,

    #[serde(default)]
    pub retry_preset: RetryPreset,

    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,

    #[serde(default = "default_task_reap_age", with = "humantime_serde")]
    pub task_reap_age: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            profiles_base_path: PathBuf::from("./s7tools-profiles"),
            stty_binary: default_stty_binary(),
            socat_binary: default_socat_binary(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            retry_preset: RetryPreset::default(),
            event_queue_capacity: default_event_queue_capacity(),
            task_reap_age: default_task_reap_age(),
        }
    }
}

impl EngineConfig {
    pub fn new(profiles_base_path: impl Into<PathBuf>) -> Self {
        Self {
            profiles_base_path: profiles_base_path.into(),
            ..Self::default()
        }
    }

    /// Runs once at `Engine::new`. Checked here rather than scattered
    /// across call sites so a bad config fails loudly before any task is
    /// ever scheduled.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_tasks == 0 {
            return Err(Error::validation_field(
                "max_concurrent_tasks",
                "must be at least 1",
            ));
        }
        if self.event_queue_capacity == 0 {
            return Err(Error::validation_field(
                "event_queue_capacity",
                "must be at least 1",
            ));
        }
        if let Some(parent) = self.profiles_base_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                return Err(Error::validation_field(
                    "profiles_base_path",
                    format!("parent directory {} does not exist", parent.display()),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = EngineConfig::new("/tmp/s7tools-profiles-test");
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.max_concurrent_tasks, 4);
        assert_eq!(cfg.stty_binary, PathBuf::from("stty"));
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let mut cfg = EngineConfig::new("/tmp/s7tools-profiles-test");
        cfg.max_concurrent_tasks = 0;
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.property(), Some("max_concurrent_tasks"));
    }

    #[test]
    fn json_round_trip() {
        let cfg = EngineConfig::new("/tmp/s7tools-profiles-test");
        let json = serde_json::to_string(&cfg).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.max_concurrent_tasks, back.max_concurrent_tasks);
    }
}
