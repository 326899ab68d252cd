//! Configuration for path watching.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WatcherError};

/// Default settle delay, in milliseconds.
pub const DEFAULT_SETTLE_DELAY_MS: u64 = 100;

/// Configuration for a [`WatchManager`](crate::WatchManager).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// How long the notify backend holds create/change notifications for
    /// coalescing, and how long it waits for the second half of a rename.
    pub settle_delay_ms: u64,

    /// Share a running ancestor watch instead of opening a narrower one.
    pub consolidate: bool,

    /// Resolve symbolic links in watched targets.
    pub follow_symlinks: bool,
}

impl WatchConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self {
            settle_delay_ms: DEFAULT_SETTLE_DELAY_MS,
            consolidate: true,
            follow_symlinks: true,
        }
    }

    /// Set the settle delay.
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Give every watch root its own native watcher.
    pub fn without_consolidation(mut self) -> Self {
        self.consolidate = false;
        self
    }

    /// Track targets by their absolute path instead of their resolved path.
    pub fn without_symlink_resolution(mut self) -> Self {
        self.follow_symlinks = false;
        self
    }

    /// The settle delay as a [`Duration`].
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&contents)
    }

    fn validate(&self) -> Result<()> {
        if self.settle_delay_ms == 0 {
            return Err(WatcherError::Config(
                "settle_delay_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_config_builder() {
        let config = WatchConfig::new()
            .with_settle_delay(Duration::from_millis(250))
            .without_consolidation();

        assert_eq!(config.settle_delay(), Duration::from_millis(250));
        assert!(!config.consolidate);
        assert!(config.follow_symlinks);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = WatchConfig::from_json_str(r#"{ "consolidate": false }"#).unwrap();

        assert_eq!(config.settle_delay_ms, DEFAULT_SETTLE_DELAY_MS);
        assert!(!config.consolidate);
    }

    #[test]
    fn test_zero_settle_delay_rejected() {
        let err = WatchConfig::from_json_str(r#"{ "settle_delay_ms": 0 }"#).unwrap_err();
        assert!(matches!(err, WatcherError::Config(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "settle_delay_ms": 40, "follow_symlinks": false }}"#).unwrap();

        let config = WatchConfig::load(file.path()).unwrap();
        assert_eq!(config.settle_delay_ms, 40);
        assert!(!config.follow_symlinks);
    }
}
