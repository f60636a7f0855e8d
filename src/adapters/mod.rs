//! Subprocess and device adapters (C4): narrow, independently testable
//! wrappers around `stty`, `socat`, and Modbus-TCP.

pub mod power;
pub mod serial;
pub mod socat;

/// Result of running an external command: exit code plus captured
/// output, used uniformly by the `stty` and `socat` adapters.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: std::time::Duration,
}
