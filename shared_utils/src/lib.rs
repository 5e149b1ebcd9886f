//! Shared utilities for tether components.
//!
//! Configuration loading and logging setup used by both the client and the
//! tunnel service.

pub mod config;
pub mod logging;

// Re-export commonly used items for convenience
pub use config::{Config, ConfigError};
pub use logging::{LogOptions, init_logging, init_logging_from_config};
