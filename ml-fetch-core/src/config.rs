//! Fetcher configuration

use serde::{Deserialize, Serialize};

use crate::error::{FetchError, Result};

/// Configuration shared by all fetchers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetcherConfig {
    /// Number of batches kept fetched but not yet consumed
    pub prefetch_batches: usize,

    /// Whether the device-placement function runs on each batch
    pub store_on_device: bool,

    /// Whether sources are instrumented to emit progress tokens
    pub capture_progress: bool,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            prefetch_batches: 1,
            store_on_device: true,
            capture_progress: false,
        }
    }
}

impl FetcherConfig {
    /// Configuration with the given look-ahead depth and defaults elsewhere
    pub fn with_prefetch_batches(prefetch_batches: usize) -> Self {
        Self {
            prefetch_batches,
            ..Self::default()
        }
    }

    /// Enable or disable progress capture
    pub fn capture_progress(mut self, enabled: bool) -> Self {
        self.capture_progress = enabled;
        self
    }

    /// Enable or disable device placement
    pub fn store_on_device(mut self, enabled: bool) -> Self {
        self.store_on_device = enabled;
        self
    }

    /// Parse a configuration from JSON, filling absent fields with defaults
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Check the look-ahead depth against the minimum a strategy needs
    pub fn validate(&self, min_prefetch: usize) -> Result<()> {
        if self.prefetch_batches < min_prefetch {
            return Err(FetchError::InvalidConfiguration(format!(
                "`prefetch_batches` should at least be {min_prefetch}, got {}",
                self.prefetch_batches
            )));
        }
        Ok(())
    }
}
