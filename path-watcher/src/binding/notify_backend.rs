//! Native binding backed by the `notify` crate.
//!
//! Each handle owns one recursive [`RecommendedWatcher`]. Raw notify events
//! are funneled through a single pump thread which:
//!
//! - classifies each path as the watched root itself or one of its children,
//! - pairs the two halves of a rename by their tracker cookie,
//! - coalesces bursts of create/change notifications per path until they have
//!   been quiet for the settle delay,
//! - hands whatever is still pending for a released handle to the handle that
//!   superseded it.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use indexmap::IndexMap;
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use super::{BindingMessage, DispatchFn, NativeBinding, NativeHandle};
use crate::error::{Result, WatcherError};
use crate::event::{Action, RawAction, WatcherEvent, normalize};

/// How long the pump sleeps when nothing is pending.
const IDLE_POLL: Duration = Duration::from_secs(1);

enum PumpMessage {
    Event {
        handle: NativeHandle,
        root: Arc<PathBuf>,
        result: notify::Result<Event>,
    },
    Superseded {
        handle: NativeHandle,
        successor: NativeHandle,
        root: Arc<PathBuf>,
    },
    Released(NativeHandle),
}

struct ActiveWatch {
    watcher: RecommendedWatcher,
    root: Arc<PathBuf>,
}

/// Binding over the platform's recommended notify backend.
pub struct NotifyBinding {
    watchers: Mutex<HashMap<NativeHandle, ActiveWatch>>,
    next_handle: AtomicU64,
    callback: Arc<RwLock<Option<DispatchFn>>>,
    tx: Sender<PumpMessage>,
}

impl NotifyBinding {
    /// Create the binding and start its pump thread.
    pub fn new(settle_delay: Duration) -> Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let callback = Arc::new(RwLock::new(None));
        let pump_callback = Arc::clone(&callback);

        thread::Builder::new()
            .name("path-watcher-pump".to_string())
            .spawn(move || run_pump(rx, pump_callback, settle_delay))?;

        Ok(Self {
            watchers: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            callback,
            tx,
        })
    }
}

impl NativeBinding for NotifyBinding {
    fn set_callback(&self, callback: DispatchFn) {
        *self.callback.write() = Some(callback);
    }

    fn watch(&self, directory: &Path) -> Result<NativeHandle> {
        let root = Arc::new(normalize(directory));
        let handle = NativeHandle::new(self.next_handle.fetch_add(1, Ordering::Relaxed));

        let tx = self.tx.clone();
        let event_root = Arc::clone(&root);
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            let message = PumpMessage::Event {
                handle,
                root: Arc::clone(&event_root),
                result,
            };
            if tx.send(message).is_err() {
                trace!("Pump stopped; dropping notify event for handle {handle}");
            }
        })
        .map_err(|err| watch_error(&root, err))?;

        watcher
            .watch(root.as_path(), RecursiveMode::Recursive)
            .map_err(|err| watch_error(&root, err))?;

        self.watchers.lock().insert(
            handle,
            ActiveWatch {
                watcher,
                root: Arc::clone(&root),
            },
        );
        debug!("Watching {} as handle {handle}", root.display());
        Ok(handle)
    }

    fn unwatch(&self, handle: NativeHandle) {
        let active = self.watchers.lock().remove(&handle);
        if let Some(active) = active {
            drop(active.watcher);
            let _ = self.tx.send(PumpMessage::Released(handle));
            debug!("Released handle {handle}");
        }
    }

    fn supersede(&self, handle: NativeHandle, successor: NativeHandle) {
        let root = self
            .watchers
            .lock()
            .get(&successor)
            .map(|active| Arc::clone(&active.root));
        let Some(root) = root else {
            trace!("Ignoring supersession of handle {handle} by unknown handle {successor}");
            return;
        };
        debug!("Handle {successor} on {} supersedes handle {handle}", root.display());
        let _ = self.tx.send(PumpMessage::Superseded {
            handle,
            successor,
            root,
        });
    }
}

fn watch_error(path: &Path, err: notify::Error) -> WatcherError {
    let kind = match &err.kind {
        notify::ErrorKind::PathNotFound => Some(io::ErrorKind::NotFound),
        notify::ErrorKind::Io(io_err) => Some(io_err.kind()),
        _ => None,
    };
    match kind {
        Some(kind) => WatcherError::unable_to_watch(path, io::Error::new(kind, err.to_string())),
        None => WatcherError::Notify(err),
    }
}

fn run_pump(
    rx: Receiver<PumpMessage>,
    callback: Arc<RwLock<Option<DispatchFn>>>,
    settle_delay: Duration,
) {
    let mut settler = Settler::new(settle_delay);

    loop {
        let timeout = settler.next_deadline().map_or(IDLE_POLL, |deadline| {
            deadline.saturating_duration_since(Instant::now())
        });

        match rx.recv_timeout(timeout) {
            Ok(PumpMessage::Event {
                handle,
                root,
                result,
            }) => match result {
                Ok(event) => settler.ingest(handle, &root, event, Instant::now()),
                Err(err) => settler.push_error(handle, err),
            },
            Ok(PumpMessage::Superseded {
                handle,
                successor,
                root,
            }) => settler.supersede(handle, successor, root),
            Ok(PumpMessage::Released(handle)) => settler.release(handle),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        let ready = settler.drain_ready(Instant::now());
        if ready.is_empty() {
            continue;
        }

        let dispatch = callback.read().clone();
        let Some(dispatch) = dispatch else {
            trace!("No dispatch callback installed; dropping {} messages", ready.len());
            continue;
        };
        for (handle, message) in ready {
            dispatch(handle, message);
        }
    }

    debug!("Notify pump stopped");
}

struct Pending {
    action: RawAction,
    last_seen: Instant,
}

struct PendingRename {
    root: PathBuf,
    path: PathBuf,
    since: Instant,
}

/// Rename pairing and per-path settling, independent of any OS watcher.
struct Settler {
    delay: Duration,
    /// Coalesced create/change notifications, in arrival order.
    pending: IndexMap<(NativeHandle, PathBuf), Pending>,
    /// First halves of renames waiting for their partner.
    renames: HashMap<(NativeHandle, usize), PendingRename>,
    /// Trackers already reported through From/To pairing.
    paired: HashMap<(NativeHandle, usize), Instant>,
    /// Handles whose subtree is covered by a broader handle, with its root.
    successors: HashMap<NativeHandle, (NativeHandle, Arc<PathBuf>)>,
    ready: VecDeque<(NativeHandle, BindingMessage)>,
}

impl Settler {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: IndexMap::new(),
            renames: HashMap::new(),
            paired: HashMap::new(),
            successors: HashMap::new(),
            ready: VecDeque::new(),
        }
    }

    fn ingest(&mut self, handle: NativeHandle, root: &Path, event: Event, now: Instant) {
        let tracker = event.tracker();
        let kind = event.kind;
        let paths = event.paths;

        match kind {
            EventKind::Create(_) => {
                for path in paths {
                    self.settle(handle, root, Action::Create, path, now);
                }
            }
            EventKind::Remove(_) => {
                for path in paths {
                    self.delete(handle, root, path);
                }
            }
            EventKind::Modify(ModifyKind::Name(mode)) => {
                self.ingest_rename(handle, root, mode, tracker, paths, now);
            }
            EventKind::Modify(_) | EventKind::Any => {
                for path in paths {
                    self.settle(handle, root, Action::Change, path, now);
                }
            }
            other => trace!("Ignoring notify event {other:?} for handle {handle}"),
        }
    }

    fn ingest_rename(
        &mut self,
        handle: NativeHandle,
        root: &Path,
        mode: RenameMode,
        tracker: Option<usize>,
        paths: Vec<PathBuf>,
        now: Instant,
    ) {
        match mode {
            RenameMode::Both => {
                if let Some(tracker) = tracker {
                    self.renames.remove(&(handle, tracker));
                    if self.paired.remove(&(handle, tracker)).is_some() {
                        return;
                    }
                }
                match paths.as_slice() {
                    [from, to] => self.rename(handle, root, from, to),
                    _ => warn!("Rename event for handle {handle} without a path pair: {paths:?}"),
                }
            }
            RenameMode::From => {
                for path in paths {
                    match tracker {
                        Some(tracker) => {
                            self.renames.insert(
                                (handle, tracker),
                                PendingRename {
                                    root: root.to_path_buf(),
                                    path,
                                    since: now,
                                },
                            );
                        }
                        None => self.delete(handle, root, path),
                    }
                }
            }
            RenameMode::To => {
                for path in paths {
                    let partner = tracker.and_then(|tracker| {
                        self.renames
                            .remove(&(handle, tracker))
                            .map(|from| (tracker, from))
                    });
                    match partner {
                        Some((tracker, from)) => {
                            self.paired.insert((handle, tracker), now);
                            self.rename(handle, root, &from.path, &path);
                        }
                        None => self.settle(handle, root, Action::Create, path, now),
                    }
                }
            }
            _ => {
                // Backends that cannot tell the two halves apart.
                for path in paths {
                    if path.exists() {
                        self.settle(handle, root, Action::Create, path, now);
                    } else {
                        self.delete(handle, root, path);
                    }
                }
            }
        }
    }

    fn settle(&mut self, handle: NativeHandle, root: &Path, action: Action, path: PathBuf, now: Instant) {
        let path = normalize(&path);
        let raw = RawAction::scoped(action, path.as_path() != root);
        let entry = self.pending.entry((handle, path)).or_insert(Pending {
            action: raw,
            last_seen: now,
        });
        // A creation absorbs the writes that follow it.
        if action == Action::Create {
            entry.action = raw;
        }
        entry.last_seen = entry.last_seen.max(now);
    }

    fn delete(&mut self, handle: NativeHandle, root: &Path, path: PathBuf) {
        let key = (handle, normalize(&path));
        if self
            .pending
            .get(&key)
            .is_some_and(|pending| pending.action.kind() == Action::Change)
        {
            self.pending.shift_remove(&key);
        }
        self.flush_handle(handle);

        let (_, path) = key;
        let action = RawAction::scoped(Action::Delete, path.as_path() != root);
        self.ready
            .push_back((handle, Ok(WatcherEvent::new(action, path))));
    }

    fn rename(&mut self, handle: NativeHandle, root: &Path, from: &Path, to: &Path) {
        self.flush_handle(handle);
        let action = RawAction::scoped(Action::Rename, normalize(from).as_path() != root);
        self.ready
            .push_back((handle, Ok(WatcherEvent::renamed(action, from, to))));
    }

    fn push_error(&mut self, handle: NativeHandle, err: notify::Error) {
        warn!("Notify error for handle {handle}: {err}");
        self.flush_handle(handle);
        self.ready
            .push_back((handle, Err(WatcherError::Notify(err))));
    }

    /// Move every pending notification for `handle` to the ready queue.
    fn flush_handle(&mut self, handle: NativeHandle) {
        let ready = &mut self.ready;
        self.pending.retain(|(owner, path), pending| {
            if *owner != handle {
                return true;
            }
            ready.push_back((*owner, Ok(WatcherEvent::new(pending.action, path))));
            false
        });
    }

    fn supersede(&mut self, handle: NativeHandle, successor: NativeHandle, root: Arc<PathBuf>) {
        self.successors.insert(handle, (successor, root));
    }

    /// The OS watch for `handle` is gone. Its undelivered state moves to the
    /// successor if there is one, and is discarded otherwise.
    fn release(&mut self, handle: NativeHandle) {
        let successor = self.successors.remove(&handle);
        self.successors.retain(|_, (next, _)| *next != handle);
        match successor {
            Some((successor, root)) => self.hand_over(handle, successor, &root),
            None => self.forget(handle),
        }
    }

    fn hand_over(&mut self, handle: NativeHandle, successor: NativeHandle, root: &Path) {
        let mut moved = Vec::new();
        self.pending.retain(|(owner, path), pending| {
            if *owner != handle {
                return true;
            }
            moved.push((path.clone(), pending.action.kind(), pending.last_seen));
            false
        });
        // Same-path entries merge with the successor's own reports.
        for (path, action, last_seen) in moved {
            self.settle(successor, root, action, path, last_seen);
        }

        self.renames = std::mem::take(&mut self.renames)
            .into_iter()
            .map(|((owner, tracker), rename)| {
                if owner != handle {
                    return ((owner, tracker), rename);
                }
                let rename = PendingRename {
                    root: root.to_path_buf(),
                    ..rename
                };
                ((successor, tracker), rename)
            })
            .collect();
        self.paired.retain(|(owner, _), _| *owner != handle);
    }

    fn forget(&mut self, handle: NativeHandle) {
        self.pending.retain(|(owner, _), _| *owner != handle);
        self.renames.retain(|(owner, _), _| *owner != handle);
        self.paired.retain(|(owner, _), _| *owner != handle);
    }

    fn next_deadline(&self) -> Option<Instant> {
        let pending = self
            .pending
            .values()
            .map(|pending| pending.last_seen + self.delay);
        let renames = self.renames.values().map(|rename| rename.since + self.delay);
        pending.chain(renames).min()
    }

    fn drain_ready(&mut self, now: Instant) -> Vec<(NativeHandle, BindingMessage)> {
        let delay = self.delay;

        // A rename whose partner never showed up left the watched tree.
        let (expired, waiting): (HashMap<_, _>, HashMap<_, _>) = std::mem::take(&mut self.renames)
            .into_iter()
            .partition(|(_, rename)| now.duration_since(rename.since) >= delay);
        self.renames = waiting;
        for ((handle, _), rename) in expired {
            self.delete(handle, &rename.root, rename.path);
        }

        self.paired
            .retain(|_, paired_at| now.duration_since(*paired_at) < delay * 10);

        let ready = &mut self.ready;
        self.pending.retain(|(handle, path), pending| {
            if now.duration_since(pending.last_seen) < delay {
                return true;
            }
            ready.push_back((*handle, Ok(WatcherEvent::new(pending.action, path))));
            false
        });

        self.ready.drain(..).collect()
    }
}
