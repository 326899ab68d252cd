//! Process-wide default manager.
//!
//! Convenience for callers that do not need an isolated [`WatchManager`].
//! The manager is created on first use with the notify backend and default
//! configuration.

use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;

use crate::config::WatchConfig;
use crate::error::Result;
use crate::event::ChangeEvent;
use crate::manager::WatchManager;
use crate::path_watcher::PathWatcher;

static DEFAULT_MANAGER: OnceCell<WatchManager> = OnceCell::new();

/// The shared manager, created on first call.
pub fn default_manager() -> Result<&'static WatchManager> {
    DEFAULT_MANAGER.get_or_try_init(|| WatchManager::with_notify(WatchConfig::default()))
}

/// Watch `path` with the shared manager.
pub fn watch(
    path: impl AsRef<Path>,
    callback: impl Fn(&ChangeEvent) + Send + Sync + 'static,
) -> Result<PathWatcher> {
    default_manager()?.watch(path, callback)
}

/// Close everything opened through the shared manager.
pub fn close_all_watchers() {
    if let Some(manager) = DEFAULT_MANAGER.get() {
        manager.close_all_watchers();
    }
}

pub fn watched_paths() -> Vec<PathBuf> {
    DEFAULT_MANAGER
        .get()
        .map(WatchManager::watched_paths)
        .unwrap_or_default()
}

pub fn native_watcher_count() -> usize {
    DEFAULT_MANAGER
        .get()
        .map_or(0, WatchManager::native_watcher_count)
}
