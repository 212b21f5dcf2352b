//! # windump Utilities
//!
//! Shared utilities for the windump workspace.
//!
//! This crate provides the logging set-up used by the command-line harness,
//! built on `tracing`, `tracing-subscriber` and `tracing-appender`.

pub mod logging;

// Re-export commonly used logging functions for convenience
pub use logging::{init_logging, init_logging_with_level, LogFormat, LogLevel, LogSettings, LoggingError, LoggingGuard};
pub use tracing::{debug, error, info, trace, warn};
