//! Translation of raw subtree events into per-subscription change events.
//!
//! A native watcher reports everything that happens under its directory. Each
//! subscription only cares about one entity: a directory, or a single file
//! observed through its parent. [`reconcile`] filters a raw event down to that
//! entity and decides what, if anything, the subscriber should hear.
//!
//! | raw event                                  | file mode          | directory mode     |
//! |--------------------------------------------|--------------------|--------------------|
//! | create of the target (already known)       | suppressed         | suppressed         |
//! | create of the target (previously deleted)  | `create`, `""`     | `create`, `""`     |
//! | change of the target                       | `change`, `""`     | `change`, `""`     |
//! | delete of the target or an ancestor        | `delete`, `None`   | `delete`, `None`   |
//! | rename of the target, still reachable      | `rename`, new path | `rename`, new path |
//! | rename of the target, out of reach / trash | `delete`, `None`   | `delete`, `None`   |
//! | something renamed onto the target          | `change` / `create`| `change` / `create`|
//! | anything about an entry inside the target  | n/a                | `change`, `""`     |
//! | anything about a sibling                   | discarded          | n/a                |

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::event::{Action, ChangeEvent, WatcherEvent};

/// What a subscription watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchMode {
    /// A single file, observed through its parent directory.
    File,
    /// A directory and everything inside it.
    Directory,
}

/// The entity tracked by one subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Current canonical location of the entity.
    pub path: PathBuf,
    /// Directory whose events can concern the entity.
    pub watch_root: PathBuf,
    pub mode: WatchMode,
    /// Whether the entity is believed to exist right now.
    pub known_to_exist: bool,
}

impl Target {
    /// Track an entity that exists at `path`.
    pub fn new(path: impl Into<PathBuf>, mode: WatchMode) -> Self {
        let path = path.into();
        Self {
            watch_root: watch_root_for(&path, mode),
            path,
            mode,
            known_to_exist: true,
        }
    }

    fn relocate(&mut self, path: PathBuf) -> PathBuf {
        self.watch_root = watch_root_for(&path, self.mode);
        std::mem::replace(&mut self.path, path)
    }
}

fn watch_root_for(path: &Path, mode: WatchMode) -> PathBuf {
    match mode {
        WatchMode::Directory => path.to_path_buf(),
        WatchMode::File => path
            .parent()
            .map_or_else(|| path.to_path_buf(), Path::to_path_buf),
    }
}

/// How an event path relates to the tracked entity.
enum Relation {
    Tracked,
    /// An ancestor; carries the target's path relative to it.
    Ancestor(PathBuf),
    Descendant,
    Unrelated,
}

fn relation(target: &Path, path: &Path) -> Relation {
    if path == target {
        Relation::Tracked
    } else if let Ok(rest) = target.strip_prefix(path) {
        Relation::Ancestor(rest.to_path_buf())
    } else if path.starts_with(target) {
        Relation::Descendant
    } else {
        Relation::Unrelated
    }
}

/// Reconcile one raw event against `target`.
///
/// `reachable` is the directory of the native watcher delivering the event:
/// a renamed target is followed only while it stays beneath it. The target is
/// updated in place when the entity moves, disappears or reappears.
pub fn reconcile(
    target: &mut Target,
    reachable: &Path,
    event: &WatcherEvent,
) -> Option<ChangeEvent> {
    let new_path = event.path.as_path();
    let old_path = event.old_path.as_deref();

    let new_in_scope = new_path.starts_with(&target.watch_root);
    let old_in_scope = old_path.is_some_and(|old| old.starts_with(&target.watch_root));
    if !new_in_scope && !old_in_scope {
        return None;
    }

    match event.action.kind() {
        Action::Rename => {
            let from = old_path.map(|old| relation(&target.path, old));
            let to = relation(&target.path, new_path);
            match (from, to) {
                (Some(Relation::Tracked), Relation::Tracked) => {
                    target.known_to_exist = true;
                    Some(ChangeEvent::in_place(Action::Change))
                }
                (Some(Relation::Tracked), _) => {
                    move_target(target, reachable, new_path.to_path_buf())
                }
                (Some(Relation::Ancestor(rest)), _) => {
                    move_target(target, reachable, new_path.join(rest))
                }
                (_, Relation::Tracked) => {
                    // A sibling replacing the target is a content change.
                    let action = if old_in_scope && target.known_to_exist {
                        Action::Change
                    } else {
                        Action::Create
                    };
                    target.known_to_exist = true;
                    Some(finalize(action, new_path, &target.path))
                }
                (Some(Relation::Descendant), _) | (_, Relation::Descendant) => {
                    descendant(target)
                }
                _ => None,
            }
        }
        Action::Create => match relation(&target.path, new_path) {
            Relation::Tracked if target.known_to_exist => None,
            Relation::Tracked => {
                target.known_to_exist = true;
                Some(finalize(Action::Create, new_path, &target.path))
            }
            Relation::Descendant => descendant(target),
            _ => None,
        },
        Action::Change => match relation(&target.path, new_path) {
            Relation::Tracked => {
                target.known_to_exist = true;
                Some(finalize(Action::Change, new_path, &target.path))
            }
            Relation::Descendant => descendant(target),
            _ => None,
        },
        Action::Delete => match relation(&target.path, new_path) {
            Relation::Tracked | Relation::Ancestor(_) => vanish(target),
            Relation::Descendant => descendant(target),
            Relation::Unrelated => None,
        },
    }
}

fn move_target(target: &mut Target, reachable: &Path, destination: PathBuf) -> Option<ChangeEvent> {
    if !destination.starts_with(reachable) || is_trashed(&destination) {
        return vanish(target);
    }
    let previous = target.relocate(destination);
    target.known_to_exist = true;
    Some(finalize(Action::Rename, &target.path, &previous))
}

fn vanish(target: &mut Target) -> Option<ChangeEvent> {
    if !target.known_to_exist {
        return None;
    }
    target.known_to_exist = false;
    Some(ChangeEvent::deleted())
}

fn descendant(target: &Target) -> Option<ChangeEvent> {
    match target.mode {
        WatchMode::Directory => Some(ChangeEvent::in_place(Action::Change)),
        WatchMode::File => None,
    }
}

/// Deletes carry no path; anything that did not move carries the empty marker.
fn finalize(action: Action, effective: &Path, previous: &Path) -> ChangeEvent {
    match action {
        Action::Delete => ChangeEvent::deleted(),
        _ if effective == previous => ChangeEvent::in_place(action),
        _ => ChangeEvent::moved(action, effective),
    }
}

/// Whether `path` lies inside a desktop trash directory.
fn is_trashed(path: &Path) -> bool {
    path.components().any(|component| {
        matches!(component, Component::Normal(name) if name == ".Trash" || name == ".Trashes")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::RawAction;
    use pretty_assertions::assert_eq;

    fn file_target() -> Target {
        Target::new("/d/file", WatchMode::File)
    }

    fn dir_target() -> Target {
        Target::new("/d", WatchMode::Directory)
    }

    fn event(action: RawAction, path: &str) -> WatcherEvent {
        WatcherEvent::new(action, path)
    }

    fn rename(action: RawAction, from: &str, to: &str) -> WatcherEvent {
        WatcherEvent::renamed(action, from, to)
    }

    #[test]
    fn test_watch_root_by_mode() {
        assert_eq!(file_target().watch_root, PathBuf::from("/d"));
        assert_eq!(dir_target().watch_root, PathBuf::from("/d"));
    }

    #[test]
    fn test_file_change_is_in_place() {
        let mut target = file_target();
        let change = reconcile(&mut target, Path::new("/d"), &event(RawAction::ChildChange, "/d/file"));
        assert_eq!(change, Some(ChangeEvent::in_place(Action::Change)));
    }

    #[test]
    fn test_siblings_are_discarded_in_file_mode() {
        let mut target = file_target();
        let reachable = Path::new("/d");

        assert_eq!(reconcile(&mut target, reachable, &event(RawAction::ChildChange, "/d/other")), None);
        assert_eq!(reconcile(&mut target, reachable, &event(RawAction::ChildCreate, "/d/file2")), None);
        assert_eq!(
            reconcile(&mut target, reachable, &rename(RawAction::ChildRename, "/d/a", "/d/b")),
            None
        );
    }

    #[test]
    fn test_out_of_scope_events_are_discarded() {
        let mut target = file_target();
        let change = reconcile(&mut target, Path::new("/"), &event(RawAction::ChildChange, "/elsewhere/file"));
        assert_eq!(change, None);
    }

    #[test]
    fn test_known_target_create_is_suppressed() {
        let mut target = file_target();
        let change = reconcile(&mut target, Path::new("/d"), &event(RawAction::ChildCreate, "/d/file"));
        assert_eq!(change, None);
    }

    #[test]
    fn test_delete_then_create() {
        let mut target = file_target();
        let reachable = Path::new("/d");

        let deleted = reconcile(&mut target, reachable, &event(RawAction::ChildDelete, "/d/file"));
        assert_eq!(deleted, Some(ChangeEvent::deleted()));
        assert!(!target.known_to_exist);

        let again = reconcile(&mut target, reachable, &event(RawAction::ChildDelete, "/d/file"));
        assert_eq!(again, None);

        let created = reconcile(&mut target, reachable, &event(RawAction::ChildCreate, "/d/file"));
        assert_eq!(created, Some(ChangeEvent::in_place(Action::Create)));
        assert!(target.known_to_exist);
    }

    #[test]
    fn test_rename_within_reach_follows_target() {
        let mut target = file_target();
        let reachable = Path::new("/d");

        let change = reconcile(
            &mut target,
            reachable,
            &rename(RawAction::ChildRename, "/d/file", "/d/sub/renamed"),
        );

        assert_eq!(change, Some(ChangeEvent::moved(Action::Rename, "/d/sub/renamed")));
        assert_eq!(target.path, PathBuf::from("/d/sub/renamed"));
        assert_eq!(target.watch_root, PathBuf::from("/d/sub"));

        let follow_up = reconcile(&mut target, reachable, &event(RawAction::ChildChange, "/d/sub/renamed"));
        assert_eq!(follow_up, Some(ChangeEvent::in_place(Action::Change)));

        let stale = reconcile(&mut target, reachable, &event(RawAction::ChildChange, "/d/file"));
        assert_eq!(stale, None);
    }

    #[test]
    fn test_rename_out_of_reach_is_delete() {
        let mut target = file_target();
        let change = reconcile(
            &mut target,
            Path::new("/d"),
            &rename(RawAction::ChildRename, "/d/file", "/elsewhere/file"),
        );

        assert_eq!(change, Some(ChangeEvent::deleted()));
        assert_eq!(target.path, PathBuf::from("/d/file"));
        assert!(!target.known_to_exist);
    }

    #[test]
    fn test_rename_into_trash_is_delete() {
        let mut target = Target::new("/Users/me/file", WatchMode::File);
        let change = reconcile(
            &mut target,
            Path::new("/Users/me"),
            &rename(RawAction::ChildRename, "/Users/me/file", "/Users/me/.Trash/file"),
        );
        assert_eq!(change, Some(ChangeEvent::deleted()));
    }

    #[test]
    fn test_sibling_renamed_onto_target_is_change() {
        let mut target = file_target();
        let change = reconcile(
            &mut target,
            Path::new("/d"),
            &rename(RawAction::ChildRename, "/d/.file.swp", "/d/file"),
        );
        assert_eq!(change, Some(ChangeEvent::in_place(Action::Change)));
    }

    #[test]
    fn test_arrival_from_outside_scope_is_create() {
        let mut target = file_target();
        let change = reconcile(
            &mut target,
            Path::new("/"),
            &rename(RawAction::ChildRename, "/tmp/download", "/d/file"),
        );
        assert_eq!(change, Some(ChangeEvent::in_place(Action::Create)));
    }

    #[test]
    fn test_parent_rename_carries_target_along() {
        let mut target = file_target();
        let change = reconcile(
            &mut target,
            Path::new("/"),
            &rename(RawAction::ChildRename, "/d", "/e"),
        );

        assert_eq!(change, Some(ChangeEvent::moved(Action::Rename, "/e/file")));
        assert_eq!(target.watch_root, PathBuf::from("/e"));
    }

    #[test]
    fn test_parent_delete_is_target_delete() {
        let mut target = file_target();
        let change = reconcile(&mut target, Path::new("/d"), &event(RawAction::Delete, "/d"));
        assert_eq!(change, Some(ChangeEvent::deleted()));
    }

    #[test]
    fn test_directory_entries_collapse_to_change() {
        let mut target = dir_target();
        let reachable = Path::new("/d");

        for raw in [
            event(RawAction::ChildCreate, "/d/new"),
            event(RawAction::ChildDelete, "/d/new"),
            event(RawAction::ChildChange, "/d/deep/nested/file"),
            rename(RawAction::ChildRename, "/d/a", "/d/b"),
            rename(RawAction::ChildRename, "/d/a", "/outside/a"),
        ] {
            assert_eq!(
                reconcile(&mut target, reachable, &raw),
                Some(ChangeEvent::in_place(Action::Change)),
                "{raw:?}"
            );
        }
    }

    #[test]
    fn test_directory_self_events() {
        let mut target = dir_target();
        let reachable = Path::new("/d");

        assert_eq!(reconcile(&mut target, reachable, &event(RawAction::Create, "/d")), None);
        assert_eq!(
            reconcile(&mut target, reachable, &event(RawAction::Delete, "/d")),
            Some(ChangeEvent::deleted())
        );
    }

    #[test]
    fn test_directory_rename_under_shared_ancestor() {
        let mut target = Target::new("/root/d", WatchMode::Directory);
        let change = reconcile(
            &mut target,
            Path::new("/root"),
            &rename(RawAction::ChildRename, "/root/d", "/root/e"),
        );

        assert_eq!(change, Some(ChangeEvent::moved(Action::Rename, "/root/e")));
        assert_eq!(target.watch_root, PathBuf::from("/root/e"));
    }

    #[test]
    fn test_trash_detection() {
        assert!(is_trashed(Path::new("/Volumes/x/.Trashes/501/file")));
        assert!(!is_trashed(Path::new("/home/me/Trash/file")));
    }
}
