//! End-to-end tests against the real filesystem through the notify backend.
//!
//! OS notification latency varies, so every wait is generous.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use codex_path_watcher::{Action, ChangeEvent, WatchConfig, WatchManager, global};
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);
const QUIET_PERIOD: Duration = Duration::from_millis(500);

fn manager() -> WatchManager {
    WatchManager::with_notify(WatchConfig::default()).unwrap()
}

fn scratch() -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();
    let root = dunce::canonicalize(dir.path()).unwrap();
    (dir, root)
}

async fn next_change(changes: &mut UnboundedReceiver<ChangeEvent>) -> Option<ChangeEvent> {
    timeout(EVENT_TIMEOUT, changes.recv()).await.ok().flatten()
}

async fn assert_quiet(changes: &mut UnboundedReceiver<ChangeEvent>) {
    let extra = timeout(QUIET_PERIOD, changes.recv()).await;
    assert!(extra.is_err(), "unexpected extra event: {extra:?}");
}

#[tokio::test]
async fn test_overwriting_file_reports_one_change() {
    let manager = manager();
    let (_dir, root) = scratch();
    let file = root.join("file");
    fs::write(&file, "").unwrap();

    let watcher = manager.watch(&file, |_| {}).unwrap();
    let mut changes = watcher.subscribe();

    fs::write(&file, "new contents").unwrap();

    assert_eq!(
        next_change(&mut changes).await,
        Some(ChangeEvent::in_place(Action::Change))
    );
    assert_quiet(&mut changes).await;
}

#[tokio::test]
async fn test_directory_entries_report_change() {
    let manager = manager();
    let (_dir, root) = scratch();

    let watcher = manager.watch(&root, |_| {}).unwrap();
    let mut changes = watcher.subscribe();

    let entry = root.join("newfile");
    fs::write(&entry, "").unwrap();
    assert_eq!(
        next_change(&mut changes).await,
        Some(ChangeEvent::in_place(Action::Change))
    );

    fs::remove_file(&entry).unwrap();
    assert_eq!(
        next_change(&mut changes).await,
        Some(ChangeEvent::in_place(Action::Change))
    );
}

#[tokio::test]
async fn test_deleting_file_reports_delete() {
    let manager = manager();
    let (_dir, root) = scratch();
    let file = root.join("file");
    fs::write(&file, "").unwrap();

    let watcher = manager.watch(&file, |_| {}).unwrap();
    let mut changes = watcher.subscribe();

    fs::remove_file(&file).unwrap();

    assert_eq!(next_change(&mut changes).await, Some(ChangeEvent::deleted()));
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_renamed_file_is_followed() {
    let manager = manager();
    let (_dir, root) = scratch();
    let file = root.join("file");
    let renamed = root.join("renamed");
    fs::write(&file, "").unwrap();

    let watcher = manager.watch(&file, |_| {}).unwrap();
    let mut changes = watcher.subscribe();

    fs::rename(&file, &renamed).unwrap();
    assert_eq!(
        next_change(&mut changes).await,
        Some(ChangeEvent::moved(Action::Rename, &renamed))
    );
    assert_eq!(watcher.path(), renamed);

    fs::write(&renamed, "after rename").unwrap();
    assert_eq!(
        next_change(&mut changes).await,
        Some(ChangeEvent::in_place(Action::Change))
    );
}

#[tokio::test]
async fn test_change_pending_during_consolidation_is_delivered_once() {
    let manager = manager();
    let (_dir, root) = scratch();
    let sub = root.join("sub");
    fs::create_dir(&sub).unwrap();
    let file = sub.join("file");
    fs::write(&file, "").unwrap();

    let watcher = manager.watch(&file, |_| {}).unwrap();
    let mut changes = watcher.subscribe();

    // Still inside the settle window when the parent watch takes over.
    fs::write(&file, "new contents").unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    let _root_watch = manager.watch(&root, |_| {}).unwrap();
    assert_eq!(watcher.native_path(), Some(root.clone()));
    assert_eq!(manager.watched_paths(), vec![root.clone()]);

    assert_eq!(
        next_change(&mut changes).await,
        Some(ChangeEvent::in_place(Action::Change))
    );
    assert_quiet(&mut changes).await;
}

#[tokio::test]
async fn test_closed_watcher_stops_native_watch() {
    let manager = manager();
    let (_dir, root) = scratch();
    let file = root.join("file");
    fs::write(&file, "").unwrap();

    let watcher = manager.watch(&file, |_| {}).unwrap();
    let mut changes = watcher.subscribe();
    assert_eq!(manager.watched_paths(), vec![root.clone()]);

    watcher.close();
    fs::write(&file, "ignored").unwrap();

    assert_eq!(manager.native_watcher_count(), 0);
    assert_eq!(next_change(&mut changes).await, None);
}

#[test]
fn test_missing_path_is_enoent() {
    let manager = manager();
    let (_dir, root) = scratch();

    let err = manager.watch(root.join("missing"), |_| {}).unwrap_err();
    assert_eq!(err.code(), Some("ENOENT"));
}

#[test]
fn test_global_manager() {
    let (_dir, root) = scratch();

    let watcher = global::watch(&root, |_| {}).unwrap();
    assert_eq!(global::watched_paths(), vec![root.clone()]);
    assert_eq!(global::native_watcher_count(), 1);

    global::close_all_watchers();

    assert!(watcher.is_closed());
    assert!(global::watched_paths().is_empty());
    assert_eq!(global::native_watcher_count(), 0);
}
