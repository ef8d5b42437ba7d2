//! Streaming configuration
//!
//! Stored as pretty JSON next to the project so tools and the runtime agree on
//! budget and cache location.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::{Error, Result};

/// Tunables for [`StreamingScheduler`](crate::streaming::StreamingScheduler)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Hard cap on resident texture bytes across all streaming textures
    pub budget_bytes: u64,
    /// Background worker threads; zero means requests only drain through
    /// `process_pending`
    pub worker_count: usize,
    /// How long an idle worker sleeps before re-checking the queue
    pub idle_sleep_ms: u64,
    /// Directory holding generated mip blobs
    pub cache_dir: PathBuf,
    /// Evict least-recently-used textures when the queue head does not fit
    pub evict_under_pressure: bool,
    /// Textures touched within this many frames are never evicted for space
    pub eviction_grace_frames: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            budget_bytes: 256 * 1024 * 1024,
            worker_count: 2,
            idle_sleep_ms: 2,
            cache_dir: PathBuf::from("cache/mips"),
            evict_under_pressure: true,
            eviction_grace_frames: 2,
        }
    }
}

impl StreamingConfig {
    /// Default configuration with a different budget
    pub fn with_budget(budget_bytes: u64) -> Self {
        Self {
            budget_bytes,
            ..Default::default()
        }
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }

    /// Reject settings the scheduler cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.budget_bytes == 0 {
            return Err(Error::Config("budget_bytes must be greater than zero".into()));
        }
        if self.idle_sleep_ms == 0 {
            return Err(Error::Config("idle_sleep_ms must be greater than zero".into()));
        }
        Ok(())
    }

    /// Save to file (sync)
    pub fn save_sync(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load from file (sync); missing fields take their defaults
    pub fn load_sync(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}
