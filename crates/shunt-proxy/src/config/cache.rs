//! Response cache configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Keep entries from a previous run instead of wiping the folder.
    /// Implies `enabled`.
    #[serde(default)]
    pub use_existing: bool,
    #[serde(default = "default_cache_folder")]
    pub folder: PathBuf,
    /// Entry lifetime; `None` keeps entries forever
    #[serde(default)]
    pub ttl_secs: Option<u64>,
    #[serde(default = "default_max_size")]
    pub max_size_bytes: u64,
}

impl CacheConfig {
    pub fn is_enabled(&self) -> bool {
        self.enabled || self.use_existing
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_secs.map(Duration::from_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            use_existing: false,
            folder: default_cache_folder(),
            ttl_secs: None,
            max_size_bytes: default_max_size(),
        }
    }
}

fn default_cache_folder() -> PathBuf {
    PathBuf::from(".proxy-cache")
}

fn default_max_size() -> u64 {
    10 * 1024 * 1024 * 1024
}
