//! File path utilities for organizing fetched data.
//!
//! Raw response bodies are grouped per upstream so a rerun against one
//! provider never touches another provider's files.

use crate::config::Config;
use std::path::{Path, PathBuf};

/// File path manager for data files
#[derive(Debug, Clone)]
pub struct DataPaths {
    root: PathBuf,
    raw: PathBuf,
    logs: PathBuf,
}

impl DataPaths {
    /// Layout taken from the configuration file
    pub fn from_config(config: &Config) -> Self {
        Self {
            root: config.data_dir(),
            raw: config.raw_dir(),
            logs: config.log_dir(),
        }
    }

    /// Get the root data directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the raw response directory for one upstream
    pub fn raw_dir(&self, provider: &str) -> PathBuf {
        self.raw.join(provider)
    }

    /// Get the logs directory
    pub fn logs_dir(&self) -> &Path {
        &self.logs
    }

    /// Create the directories used by a run against `provider`
    pub fn create_dirs(&self, provider: &str) -> std::io::Result<()> {
        for dir in [self.raw_dir(provider), self.logs.clone()] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}
