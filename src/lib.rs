//! Manufacturing test fixture for a motorized wheel unit with an IMU.
//!
//! The library holds the bring-up pipeline and its transports; `main.rs`
//! wires them to real hardware behind a small CLI.

pub mod config;
pub mod correlator;
pub mod error;
pub mod evaluator;
pub mod logging;
pub mod orchestrator;
pub mod port_detect;
pub mod report;
pub mod retry;
pub mod serial_link;
pub mod telemetry;
pub mod types;
pub mod wifi;
