//! On-disk store of raw response bodies.
//!
//! Bodies are written exactly as received so reruns with `--skip-existing`
//! can avoid hitting the upstream again.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Raw response store for one upstream
pub struct ResponseCache {
    /// Directory holding this upstream's bodies
    cache_dir: PathBuf,
    /// File extension of stored bodies (`json`, `xml`)
    extension: &'static str,
    /// Whether storing is enabled
    enabled: bool,
}

impl ResponseCache {
    /// Create a new response cache
    pub fn new(cache_dir: impl AsRef<Path>, extension: &'static str, enabled: bool) -> Result<Self> {
        let cache_dir = cache_dir.as_ref().to_path_buf();

        if enabled {
            std::fs::create_dir_all(&cache_dir).with_context(|| {
                format!("Failed to create cache directory: {}", cache_dir.display())
            })?;
            info!(cache_dir = %cache_dir.display(), "Response cache initialized");
        }

        Ok(Self {
            cache_dir,
            extension,
            enabled,
        })
    }

    /// Get a stored body if it exists
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if !self.enabled {
            return Ok(None);
        }

        let path = self.cache_path(key);
        if !path.exists() {
            debug!(key = key, "Cache miss");
            return Ok(None);
        }

        let body = std::fs::read(&path)
            .with_context(|| format!("Failed to read cache file: {}", path.display()))?;

        debug!(key = key, "Cache hit");
        Ok(Some(body))
    }

    /// Store a body
    pub fn set(&self, key: &str, body: &[u8]) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        let path = self.cache_path(key);
        std::fs::write(&path, body)
            .with_context(|| format!("Failed to write cache file: {}", path.display()))?;

        debug!(key = key, path = %path.display(), bytes = body.len(), "Cache stored");
        Ok(())
    }

    /// Check if a body is stored under `key`
    pub fn exists(&self, key: &str) -> bool {
        self.enabled && self.cache_path(key).exists()
    }

    fn cache_path(&self, key: &str) -> PathBuf {
        // Sanitize key to create valid filename
        let safe_key = key
            .replace(['/', '\\', ':', '*', '?', '"', '<', '>', '|'], "_")
            .replace("__", "_");

        self.cache_dir.join(format!("{}.{}", safe_key, self.extension))
    }

    /// Remove every stored body
    pub fn clear(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        if self.cache_dir.exists() {
            std::fs::remove_dir_all(&self.cache_dir).with_context(|| {
                format!("Failed to remove cache directory: {}", self.cache_dir.display())
            })?;
            std::fs::create_dir_all(&self.cache_dir).with_context(|| {
                format!("Failed to recreate cache directory: {}", self.cache_dir.display())
            })?;
            info!("Cache cleared");
        }

        Ok(())
    }

    /// Get cache statistics
    pub fn stats(&self) -> Result<CacheStats> {
        if !self.enabled || !self.cache_dir.exists() {
            return Ok(CacheStats::default());
        }

        let mut stats = CacheStats::default();
        for entry in std::fs::read_dir(&self.cache_dir)? {
            let entry = entry?;
            if entry.path().is_file() {
                stats.total_files += 1;
                stats.total_size_bytes += entry.metadata()?.len();
            }
        }

        Ok(stats)
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub total_files: usize,
    pub total_size_bytes: u64,
}
