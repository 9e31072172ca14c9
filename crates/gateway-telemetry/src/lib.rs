//! # Gateway Telemetry
//!
//! Logging for the completion gateway:
//! - `tracing-subscriber` registry with `EnvFilter`
//! - JSON, pretty or compact output

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod logging;

// Re-export main types
pub use logging::{init_logging, LogFormat, LoggingConfig, LoggingError};
