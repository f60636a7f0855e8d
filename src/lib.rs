//! S7Tools back-end engine.
//!
//! A Linux-hosted engine that configures a serial connection to a PLC
//! bootloader, bridges it onto a TCP port, power-cycles the unit over
//! Modbus-TCP, and drives a length-prefixed handshake/install/dump
//! protocol against the exposed bootloader, all under a priority task
//! scheduler with cooperative cancellation and all-or-nothing resource
//! locking. See [`engine::Engine`] for the composition root.

pub mod adapters;
pub mod config;
pub mod engine;
pub mod error;
pub mod orchestrator;
pub mod plc;
pub mod profiles;
pub mod resources;
pub mod tasks;

pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{Error, ErrorKind, Result, ValidationReport};
