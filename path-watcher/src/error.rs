//! Error types for the path watcher.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Result type alias for watcher operations.
pub type Result<T> = std::result::Result<T, WatcherError>;

/// Errors that can occur while watching paths.
#[derive(Error, Debug)]
pub enum WatcherError {
    /// The target could not be watched, usually because it does not exist.
    #[error("Unable to watch path")]
    UnableToWatch {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The native binding reported an action name we do not understand.
    #[error("unknown watcher action: {0}")]
    UnknownAction(String),

    /// The native binding reported a failure for one of its handles.
    #[error("native binding error: {0}")]
    Binding(String),

    /// Notify error.
    #[error("notify error: {0}")]
    Notify(#[from] notify::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// A watcher handle outlived the manager that created it.
    #[error("watch manager has been dropped")]
    ManagerDropped,

    /// The watcher was closed before its attachment completed.
    #[error("watcher was closed before attachment completed")]
    AttachCancelled,

    /// The blocking attachment task panicked or was cancelled.
    #[error("attachment task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl WatcherError {
    pub(crate) fn unable_to_watch(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::UnableToWatch {
            path: path.into(),
            source,
        }
    }

    /// POSIX-style error code (`ENOENT`, `EACCES`, ...) when one applies.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            Self::UnableToWatch { source, .. } | Self::Io(source) => Some(io_error_code(source)),
            _ => None,
        }
    }

    /// The path the error concerns, if any.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::UnableToWatch { path, .. } => Some(path),
            _ => None,
        }
    }
}

fn io_error_code(err: &io::Error) -> &'static str {
    match err.kind() {
        io::ErrorKind::NotFound => "ENOENT",
        io::ErrorKind::PermissionDenied => "EACCES",
        io::ErrorKind::NotADirectory => "ENOTDIR",
        _ => "EIO",
    }
}
