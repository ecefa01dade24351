//! Shared library for the anime metadata fetchers.
//!
//! This crate provides common functionality used by the binary crates:
//! - Configuration management
//! - File path utilities
//! - Logging infrastructure

pub mod config;
pub mod logging;
pub mod paths;

// Re-export commonly used types
pub use config::{BurstWindowMode, Config, FetchConfig, RateLimitConfig};
pub use logging::LogConfig;
pub use paths::DataPaths;

/// Common result type using anyhow::Error
pub type Result<T> = anyhow::Result<T>;
