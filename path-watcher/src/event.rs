//! Events flowing from the native binding to subscribers.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::WatcherError;

/// Action reported by the native binding.
///
/// The `Child*` variants describe something happening inside the watched
/// directory rather than to the directory itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RawAction {
    Create,
    Change,
    Rename,
    Delete,
    ChildCreate,
    ChildChange,
    ChildRename,
    ChildDelete,
}

impl RawAction {
    /// Build the self or child variant of an action.
    pub fn scoped(action: Action, child: bool) -> Self {
        match (action, child) {
            (Action::Create, false) => Self::Create,
            (Action::Change, false) => Self::Change,
            (Action::Rename, false) => Self::Rename,
            (Action::Delete, false) => Self::Delete,
            (Action::Create, true) => Self::ChildCreate,
            (Action::Change, true) => Self::ChildChange,
            (Action::Rename, true) => Self::ChildRename,
            (Action::Delete, true) => Self::ChildDelete,
        }
    }

    /// The action with its scope stripped.
    pub fn kind(self) -> Action {
        match self {
            Self::Create | Self::ChildCreate => Action::Create,
            Self::Change | Self::ChildChange => Action::Change,
            Self::Rename | Self::ChildRename => Action::Rename,
            Self::Delete | Self::ChildDelete => Action::Delete,
        }
    }

    /// Whether the action concerns an entry inside the watched directory.
    pub fn is_child(self) -> bool {
        matches!(
            self,
            Self::ChildCreate | Self::ChildChange | Self::ChildRename | Self::ChildDelete
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Change => "change",
            Self::Rename => "rename",
            Self::Delete => "delete",
            Self::ChildCreate => "child-create",
            Self::ChildChange => "child-change",
            Self::ChildRename => "child-rename",
            Self::ChildDelete => "child-delete",
        }
    }
}

impl FromStr for RawAction {
    type Err = WatcherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "create" => Self::Create,
            "change" => Self::Change,
            "rename" => Self::Rename,
            "delete" => Self::Delete,
            "child-create" => Self::ChildCreate,
            "child-change" => Self::ChildChange,
            "child-rename" => Self::ChildRename,
            "child-delete" => Self::ChildDelete,
            other => return Err(WatcherError::UnknownAction(other.to_string())),
        })
    }
}

impl fmt::Display for RawAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A raw notification from the native binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatcherEvent {
    /// What happened.
    pub action: RawAction,

    /// Current location of the affected entry.
    pub path: PathBuf,

    /// Previous location, for rename actions only.
    pub old_path: Option<PathBuf>,
}

impl WatcherEvent {
    /// Create a new event. The path is lexically normalized.
    pub fn new(action: RawAction, path: impl AsRef<Path>) -> Self {
        Self {
            action,
            path: normalize(path.as_ref()),
            old_path: None,
        }
    }

    /// Create a rename event from `old_path` to `path`.
    pub fn renamed(action: RawAction, old_path: impl AsRef<Path>, path: impl AsRef<Path>) -> Self {
        Self::new(action, path).with_old_path(old_path)
    }

    /// Attach the previous location.
    pub fn with_old_path(mut self, old_path: impl AsRef<Path>) -> Self {
        self.old_path = Some(normalize(old_path.as_ref()));
        self
    }

    /// Build an event from the string form used at the binding boundary.
    ///
    /// An empty `old_path` is treated as absent.
    pub fn parse(
        action: &str,
        path: impl AsRef<Path>,
        old_path: Option<&Path>,
    ) -> Result<Self, WatcherError> {
        let event = Self::new(action.parse()?, path);
        Ok(match old_path {
            Some(old) if !old.as_os_str().is_empty() => event.with_old_path(old),
            _ => event,
        })
    }
}

/// Action delivered to consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Create,
    Change,
    Rename,
    Delete,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Change => "change",
            Self::Rename => "rename",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A reconciled notification for one subscription.
///
/// `path` is `None` for deletes, empty when the entity did not move, and the
/// new absolute location when it did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub action: Action,
    pub path: Option<PathBuf>,
}

impl ChangeEvent {
    /// An event for an entity that stayed where it was.
    pub fn in_place(action: Action) -> Self {
        Self {
            action,
            path: Some(PathBuf::new()),
        }
    }

    /// The watched entity is gone.
    pub fn deleted() -> Self {
        Self {
            action: Action::Delete,
            path: None,
        }
    }

    /// The watched entity now lives at `path`.
    pub fn moved(action: Action, path: impl Into<PathBuf>) -> Self {
        Self {
            action,
            path: Some(path.into()),
        }
    }

    /// Whether the event carries the "no path change" marker.
    pub fn is_in_place(&self) -> bool {
        self.path
            .as_deref()
            .is_some_and(|path| path.as_os_str().is_empty())
    }

    /// The new location, when the entity moved.
    pub fn new_path(&self) -> Option<&Path> {
        self.path
            .as_deref()
            .filter(|path| !path.as_os_str().is_empty())
    }
}

/// Lexically normalize a path: drop `.` components and trailing separators.
pub(crate) fn normalize(path: &Path) -> PathBuf {
    path.components().collect()
}
