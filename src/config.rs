//! Relay configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Default directory scanned for service manifests.
pub const DEFAULT_SERVICES_DIR: &str = "/etc/hookrelay.d";

/// Configuration for a [`crate::registry::Registry`] and its watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Directory holding service manifests.
    pub services_dir: PathBuf,
    /// Manifest file extension, without the dot.
    pub manifest_extension: String,
    /// Create empty environment files that do not exist yet, so the watcher
    /// has something to observe.
    pub create_missing_env_files: bool,
    /// Quiet period before a burst of file events is reported once.
    pub watch_debounce: Duration,
    /// Max queued file-change notifications.
    pub watch_queue_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            services_dir: PathBuf::from(DEFAULT_SERVICES_DIR),
            manifest_extension: "yaml".to_string(),
            create_missing_env_files: true,
            watch_debounce: Duration::from_millis(200),
            watch_queue_capacity: 1024,
        }
    }
}

impl RelayConfig {
    /// Default configuration reading manifests from `dir`.
    #[must_use]
    pub fn with_services_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            services_dir: dir.into(),
            ..Self::default()
        }
    }
}
