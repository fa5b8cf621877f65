// Audiobook Offline - Offline downloads for self-hosted audiobook servers
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! Offline subsystem configuration
//!
//! All fields have defaults, so a TOML file only needs the keys it changes:
//! ```toml
//! downloads_directory = "/data/audiobooks"
//! max_concurrent_downloads = 2
//! ```

use crate::error::{OfflineError, Result};
use crate::file::paths::default_downloads_path;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Free space required before a download may start (500 MB)
pub const DEFAULT_MIN_FREE_SPACE_BYTES: u64 = 500 * 1024 * 1024;

/// Configuration for the download subsystem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
    /// Root directory holding one directory per downloaded book
    pub downloads_directory: PathBuf,

    /// Maximum concurrent book downloads
    pub max_concurrent_downloads: usize,

    /// Free space required before a download may start
    pub min_free_space_bytes: u64,

    /// Total attempts per chapter for transient network failures
    pub retry_attempts: u32,

    /// First backoff delay; doubles on every retry
    pub initial_backoff_ms: u64,

    /// Per-request timeout
    pub request_timeout_secs: u64,

    /// Interval between healing sweeps
    pub healing_interval_secs: u64,

    /// How long a finished/failed record stays observable
    pub terminal_state_grace_ms: u64,

    /// Minimum interval between intermediate progress events
    pub progress_interval_ms: u64,

    pub user_agent: String,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            downloads_directory: default_downloads_path(),
            max_concurrent_downloads: 3,
            min_free_space_bytes: DEFAULT_MIN_FREE_SPACE_BYTES,
            retry_attempts: 3,
            initial_backoff_ms: 500,
            request_timeout_secs: 30,
            healing_interval_secs: 15 * 60,
            terminal_state_grace_ms: 3_000,
            progress_interval_ms: 200,
            user_agent: format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
        }
    }
}

impl OfflineConfig {
    pub fn builder() -> OfflineConfigBuilder {
        OfflineConfigBuilder::new()
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: OfflineConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            OfflineError::InvalidConfiguration(format!(
                "Failed to read config {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&text)
    }

    /// Reject values the subsystem cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_downloads == 0 {
            return Err(OfflineError::InvalidConfiguration(
                "max_concurrent_downloads must be at least 1".to_string(),
            ));
        }
        if self.retry_attempts == 0 {
            return Err(OfflineError::InvalidConfiguration(
                "retry_attempts must be at least 1".to_string(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(OfflineError::InvalidConfiguration(
                "request_timeout_secs must be positive".to_string(),
            ));
        }
        if self.healing_interval_secs == 0 {
            return Err(OfflineError::InvalidConfiguration(
                "healing_interval_secs must be positive".to_string(),
            ));
        }
        if self.downloads_directory.as_os_str().is_empty() {
            return Err(OfflineError::InvalidConfiguration(
                "downloads_directory is empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn healing_interval(&self) -> Duration {
        Duration::from_secs(self.healing_interval_secs)
    }

    pub fn terminal_state_grace(&self) -> Duration {
        Duration::from_millis(self.terminal_state_grace_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

/// Builder for OfflineConfig
#[derive(Debug)]
pub struct OfflineConfigBuilder {
    config: OfflineConfig,
}

impl OfflineConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: OfflineConfig::default(),
        }
    }

    pub fn downloads_directory<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.config.downloads_directory = path.into();
        self
    }

    pub fn max_concurrent_downloads(mut self, max: usize) -> Self {
        self.config.max_concurrent_downloads = max;
        self
    }

    pub fn min_free_space_bytes(mut self, bytes: u64) -> Self {
        self.config.min_free_space_bytes = bytes;
        self
    }

    pub fn retry_attempts(mut self, attempts: u32) -> Self {
        self.config.retry_attempts = attempts;
        self
    }

    pub fn initial_backoff(mut self, backoff: Duration) -> Self {
        self.config.initial_backoff_ms = backoff.as_millis() as u64;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn healing_interval(mut self, interval: Duration) -> Self {
        self.config.healing_interval_secs = interval.as_secs().max(1);
        self
    }

    pub fn terminal_state_grace(mut self, grace: Duration) -> Self {
        self.config.terminal_state_grace_ms = grace.as_millis() as u64;
        self
    }

    pub fn progress_interval(mut self, interval: Duration) -> Self {
        self.config.progress_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn user_agent<S: Into<String>>(mut self, user_agent: S) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    pub fn build(self) -> Result<OfflineConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for OfflineConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
