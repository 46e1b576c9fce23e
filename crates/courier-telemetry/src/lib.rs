//! # Courier Telemetry
//!
//! Structured logging for Courier processes.
//!
//! Every Courier crate logs through `tracing` macros with structured fields;
//! this crate installs the subscriber that renders them.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use courier_telemetry::{init_logging, TelemetryConfig};
//!
//! let config = TelemetryConfig::from_env();
//! init_logging(&config)?;
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `COURIER_SERVICE_NAME` | `courier` | Service name attached to the root span |
//! | `COURIER_LOG_LEVEL` / `RUST_LOG` | `info` | Log level filter |
//! | `COURIER_JSON_LOGS` | `false` | Emit JSON lines instead of pretty output |

mod config;
mod logging;

pub use config::TelemetryConfig;
pub use logging::init_logging;

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Invalid log filter '{filter}': {reason}")]
    InvalidFilter { filter: String, reason: String },

    #[error("A global subscriber is already installed")]
    AlreadyInitialized,
}
