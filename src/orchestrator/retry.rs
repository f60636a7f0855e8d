//! Retry/backoff configuration.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// The class of operation a retry budget applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationClass {
    Connection,
    Handshake,
    PayloadInstallation,
    MemoryRead,
    PowerControl,
    Network,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffShape {
    Linear,
    Exponential,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ClassRetryConfig {
    pub max_retries: u32,
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    pub multiplier: f64,
    pub shape: BackoffShape,
}

impl ClassRetryConfig {
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let raw_ms = match self.shape {
            BackoffShape::Linear => base_ms * (attempt as f64 + 1.0),
            BackoffShape::Exponential => base_ms * self.multiplier.powi(attempt as i32),
        };
        let capped_ms = raw_ms.min(self.max_delay.as_millis() as f64);
        // +/-10% jitter so concurrently-retrying tasks don't lockstep.
        let jitter = rand::thread_rng().gen_range(0.9..1.1);
        Duration::from_millis((capped_ms * jitter).max(0.0) as u64)
    }
}

/// A named bundle of per-class retry budgets plus which error kinds are
/// retryable for each class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfiguration {
    pub connection: ClassRetryConfig,
    pub handshake: ClassRetryConfig,
    pub payload_installation: ClassRetryConfig,
    pub memory_read: ClassRetryConfig,
    pub power_control: ClassRetryConfig,
    pub network: ClassRetryConfig,
}

impl RetryConfiguration {
    fn config_for(&self, class: OperationClass) -> &ClassRetryConfig {
        match class {
            OperationClass::Connection => &self.connection,
            OperationClass::Handshake => &self.handshake,
            OperationClass::PayloadInstallation => &self.payload_installation,
            OperationClass::MemoryRead => &self.memory_read,
            OperationClass::PowerControl => &self.power_control,
            OperationClass::Network => &self.network,
        }
    }

    pub fn max_retries(&self, class: OperationClass) -> u32 {
        self.config_for(class).max_retries
    }

    pub fn delay_for(&self, class: OperationClass, attempt: u32) -> Duration {
        self.config_for(class).delay_for_attempt(attempt)
    }

    /// A retry is attempted only when the error's kind is retryable in
    /// general — the class-level cap decides how many times, not which
    /// kinds qualify.
    pub fn should_retry(&self, class: OperationClass, error: &Error, attempt: u32) -> bool {
        error.is_retryable_kind() && attempt < self.max_retries(class)
    }
}

fn preset_class(max_retries: u32, initial_ms: u64, max_ms: u64, multiplier: f64) -> ClassRetryConfig {
    ClassRetryConfig {
        max_retries,
        initial_delay: Duration::from_millis(initial_ms),
        max_delay: Duration::from_millis(max_ms),
        multiplier,
        shape: BackoffShape::Exponential,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPreset {
    #[default]
    Default,
    Conservative,
    Aggressive,
}

impl RetryPreset {
    pub fn configuration(self) -> RetryConfiguration {
        match self {
            RetryPreset::Default => RetryConfiguration {
                connection: preset_class(3, 250, 5_000, 2.0),
                handshake: preset_class(3, 200, 2_000, 2.0),
                payload_installation: preset_class(2, 500, 5_000, 2.0),
                memory_read: preset_class(1, 500, 5_000, 2.0),
                power_control: preset_class(3, 500, 8_000, 2.0),
                network: preset_class(3, 250, 5_000, 2.0),
            },
            RetryPreset::Conservative => RetryConfiguration {
                connection: preset_class(1, 500, 2_000, 1.5),
                handshake: preset_class(1, 500, 2_000, 1.5),
                payload_installation: preset_class(1, 500, 2_000, 1.5),
                memory_read: preset_class(0, 0, 0, 1.0),
                power_control: preset_class(1, 1_000, 4_000, 1.5),
                network: preset_class(1, 500, 2_000, 1.5),
            },
            RetryPreset::Aggressive => RetryConfiguration {
                connection: preset_class(6, 100, 10_000, 2.0),
                handshake: preset_class(6, 100, 5_000, 2.0),
                payload_installation: preset_class(5, 250, 10_000, 2.0),
                memory_read: preset_class(3, 250, 10_000, 2.0),
                power_control: preset_class(6, 250, 15_000, 2.0),
                network: preset_class(6, 100, 10_000, 2.0),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_preset_caps_handshake_retries() {
        let retry = RetryPreset::Default.configuration();
        assert_eq!(retry.max_retries(OperationClass::Handshake), 3);
    }

    #[test]
    fn cancelled_errors_are_never_retryable() {
        let retry = RetryPreset::Default.configuration();
        let err = Error::cancelled("user requested cancel");
        assert!(!retry.should_retry(OperationClass::Handshake, &err, 0));
    }
}
