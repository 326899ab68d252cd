//! The per-subscription watch handle.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::disposable::{Disposable, ObserverList, dispose_all};
use crate::error::{Result, WatcherError};
use crate::event::{ChangeEvent, WatcherEvent};
use crate::manager::ManagerInner;
use crate::native::{NativeWatcher, StopReason};
use crate::reconcile::{Target, WatchMode, reconcile};

type ChangeCallback = dyn Fn(&ChangeEvent) + Send + Sync;
type ErrorCallback = dyn Fn(&WatcherError) + Send + Sync;

/// Observable lifecycle of a [`PathWatcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatcherState {
    /// Waiting for a native watcher.
    Created,
    /// Receiving events from a native watcher.
    Attached,
    /// Closed; terminal.
    Closed,
}

enum Lifecycle {
    Created,
    Attached {
        native: Arc<NativeWatcher>,
        subscriptions: Vec<Disposable>,
    },
    Closed,
}

#[derive(Default)]
struct PathObservers {
    did_change: ObserverList<ChangeCallback>,
    did_error: ObserverList<ErrorCallback>,
}

pub(crate) struct PathWatcherInner {
    manager: Weak<ManagerInner>,
    requested_path: PathBuf,
    target: Mutex<Target>,
    state: Mutex<Lifecycle>,
    observers: Mutex<PathObservers>,
}

impl PathWatcherInner {
    pub(crate) fn new(manager: Weak<ManagerInner>, requested_path: PathBuf, target: Target) -> Arc<Self> {
        Arc::new(Self {
            manager,
            requested_path,
            target: Mutex::new(target),
            state: Mutex::new(Lifecycle::Created),
            observers: Mutex::new(PathObservers::default()),
        })
    }

    pub(crate) fn watch_root(&self) -> PathBuf {
        self.target.lock().watch_root.clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        matches!(*self.state.lock(), Lifecycle::Closed)
    }

    fn native(&self) -> Option<Arc<NativeWatcher>> {
        match &*self.state.lock() {
            Lifecycle::Attached { native, .. } => Some(Arc::clone(native)),
            Lifecycle::Created | Lifecycle::Closed => None,
        }
    }

    /// Subscribe to `native` and release whatever we were bound to before.
    pub(crate) fn bind(self: &Arc<Self>, native: &Arc<NativeWatcher>) -> Result<()> {
        if self.is_closed() {
            return Err(WatcherError::AttachCancelled);
        }

        let watcher = Arc::downgrade(self);
        let mut subscriptions = Vec::with_capacity(4);

        // Disposal runs in this order, so lifecycle hooks are gone before the
        // change subscription can stop the native watcher.
        let stopped = Arc::downgrade(native);
        subscriptions.push(native.on_did_stop({
            let watcher = watcher.clone();
            move |reason| {
                if let Some(watcher) = watcher.upgrade() {
                    watcher.native_stopped(&stopped, reason);
                }
            }
        }));
        subscriptions.push(native.on_should_detach({
            let watcher = watcher.clone();
            move |replacement| {
                if let Some(watcher) = watcher.upgrade() {
                    watcher.reattach_to(replacement);
                }
            }
        }));
        subscriptions.push(native.on_did_error({
            let watcher = watcher.clone();
            move |err| {
                if let Some(watcher) = watcher.upgrade() {
                    watcher.emit_error(err);
                }
            }
        }));
        let change = native.on_did_change(move |event| {
            if let Some(watcher) = watcher.upgrade() {
                watcher.handle_event(event);
            }
        });
        match change {
            Ok(subscription) => subscriptions.push(subscription),
            Err(err) => {
                dispose_all(&mut subscriptions);
                return Err(err);
            }
        }

        let previous = {
            let mut state = self.state.lock();
            if matches!(*state, Lifecycle::Closed) {
                None
            } else {
                Some(std::mem::replace(
                    &mut *state,
                    Lifecycle::Attached {
                        native: Arc::clone(native),
                        subscriptions: std::mem::take(&mut subscriptions),
                    },
                ))
            }
        };

        match previous {
            None => {
                dispose_all(&mut subscriptions);
                Err(WatcherError::AttachCancelled)
            }
            Some(Lifecycle::Attached {
                subscriptions: mut old,
                ..
            }) => {
                dispose_all(&mut old);
                Ok(())
            }
            Some(Lifecycle::Created | Lifecycle::Closed) => Ok(()),
        }
    }

    fn handle_event(&self, event: &WatcherEvent) {
        let Some(native) = self.native() else {
            return;
        };
        let change = reconcile(&mut self.target.lock(), native.path(), event);
        if let Some(change) = change {
            self.emit_change(&change);
        }
    }

    fn emit_change(&self, change: &ChangeEvent) {
        let observers = self.observers.lock().did_change.snapshot();
        for observer in observers {
            if self.is_closed() {
                break;
            }
            observer(change);
        }
    }

    fn emit_error(&self, err: &WatcherError) {
        let observers = self.observers.lock().did_error.snapshot();
        for observer in observers {
            if self.is_closed() {
                break;
            }
            observer(err);
        }
    }

    fn reattach_to(self: &Arc<Self>, replacement: &Arc<NativeWatcher>) {
        let tearing_down = self
            .manager
            .upgrade()
            .is_some_and(|manager| manager.is_tearing_down());
        if tearing_down {
            return;
        }
        let Some(current) = self.native() else {
            return;
        };
        if Arc::ptr_eq(&current, replacement) {
            return;
        }

        debug!(
            "Moving watch of {} from {} to {}",
            self.requested_path.display(),
            current.path().display(),
            replacement.path().display()
        );
        if let Err(err) = self.bind(replacement) {
            self.emit_error(&err);
        }
    }

    fn native_stopped(self: &Arc<Self>, stopped: &Weak<NativeWatcher>, reason: StopReason) {
        let current = self
            .native()
            .is_some_and(|native| std::ptr::eq(stopped.as_ptr(), Arc::as_ptr(&native)));
        if !current {
            return;
        }

        match reason {
            StopReason::Shutdown => self.close(),
            StopReason::Abandoned => {
                let Some(manager) = self.manager.upgrade() else {
                    self.emit_error(&WatcherError::ManagerDropped);
                    return;
                };
                if let Err(err) = manager.attach(self) {
                    self.emit_error(&err);
                }
            }
            StopReason::Idle => {}
        }
    }

    pub(crate) fn close(&self) {
        let manager = self.manager.upgrade();
        // Waits for an in-flight dispatch; re-entrant on the dispatching thread.
        let _dispatch = manager.as_ref().map(|manager| manager.dispatch_lock.lock());

        let previous = std::mem::replace(&mut *self.state.lock(), Lifecycle::Closed);
        if let Lifecycle::Attached {
            native,
            mut subscriptions,
        } = previous
        {
            dispose_all(&mut subscriptions);
            debug!(
                "Closed watch of {} on {}",
                self.requested_path.display(),
                native.path().display()
            );
        }

        let mut observers = self.observers.lock();
        observers.did_change.clear();
        observers.did_error.clear();
    }
}

/// A live subscription to changes of one file or directory.
///
/// Created by [`WatchManager::watch`](crate::WatchManager::watch). Dropping
/// the watcher closes it.
pub struct PathWatcher {
    pub(crate) inner: Arc<PathWatcherInner>,
}

impl PathWatcher {
    pub(crate) fn from_inner(inner: Arc<PathWatcherInner>) -> Self {
        Self { inner }
    }

    /// Register another change callback. Callbacks run in registration order.
    pub fn on_did_change(&self, callback: impl Fn(&ChangeEvent) + Send + Sync + 'static) -> Disposable {
        if self.is_closed() {
            return Disposable::empty();
        }
        let id = self.inner.observers.lock().did_change.add(Arc::new(callback));
        let inner = Arc::downgrade(&self.inner);
        Disposable::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.observers.lock().did_change.remove(id);
            }
        })
    }

    /// Register an error callback. Binding errors for the native watcher
    /// backing this subscription are delivered here.
    pub fn on_did_error(&self, callback: impl Fn(&WatcherError) + Send + Sync + 'static) -> Disposable {
        if self.is_closed() {
            return Disposable::empty();
        }
        let id = self.inner.observers.lock().did_error.add(Arc::new(callback));
        let inner = Arc::downgrade(&self.inner);
        Disposable::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.observers.lock().did_error.remove(id);
            }
        })
    }

    /// Receive change events over a channel instead of a callback.
    ///
    /// The channel closes when the watcher does. Dropping the receiver
    /// unregisters the channel on the next event.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ChangeEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let registration: Arc<Mutex<Option<Disposable>>> = Arc::default();
        let slot = Arc::clone(&registration);
        let subscription = self.on_did_change(move |change| {
            if tx.send(change.clone()).is_err() {
                let subscription = slot.lock().take();
                if let Some(mut subscription) = subscription {
                    subscription.dispose();
                }
            }
        });
        *registration.lock() = Some(subscription);
        rx
    }

    /// Stop receiving events. Idempotent.
    ///
    /// No callback runs after this returns, including for events already in
    /// flight.
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn state(&self) -> WatcherState {
        match &*self.inner.state.lock() {
            Lifecycle::Created => WatcherState::Created,
            Lifecycle::Attached { .. } => WatcherState::Attached,
            Lifecycle::Closed => WatcherState::Closed,
        }
    }

    /// Current location of the watched entity, updated when it is renamed.
    pub fn path(&self) -> PathBuf {
        self.inner.target.lock().path.clone()
    }

    /// The path as given to `watch`, made absolute.
    pub fn requested_path(&self) -> &Path {
        &self.inner.requested_path
    }

    pub fn watch_root(&self) -> PathBuf {
        self.inner.watch_root()
    }

    pub fn mode(&self) -> WatchMode {
        self.inner.target.lock().mode
    }

    /// Directory of the native watcher serving this subscription.
    pub fn native_path(&self) -> Option<PathBuf> {
        self.inner
            .native()
            .map(|native| native.path().to_path_buf())
    }
}

impl Drop for PathWatcher {
    fn drop(&mut self) {
        self.inner.close();
    }
}

impl fmt::Debug for PathWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PathWatcher")
            .field("path", &self.path())
            .field("mode", &self.mode())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::ManualBinding;
    use crate::config::WatchConfig;
    use crate::event::{Action, RawAction};
    use crate::manager::WatchManager;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn change_observers(watcher: &PathWatcher) -> usize {
        watcher.inner.observers.lock().did_change.len()
    }

    #[test]
    fn test_dropped_receiver_is_unregistered() {
        let binding = ManualBinding::new();
        let manager = WatchManager::new(binding.clone(), WatchConfig::default());
        let dir = TempDir::new().unwrap();
        let root = dunce::canonicalize(dir.path()).unwrap();
        let file = root.join("file");
        std::fs::write(&file, "").unwrap();

        let watcher = manager.watch(&file, |_| {}).unwrap();
        let mut kept = watcher.subscribe();
        drop(watcher.subscribe());
        assert_eq!(change_observers(&watcher), 3);

        binding.emit_for(&root, WatcherEvent::new(RawAction::ChildChange, &file));

        assert_eq!(change_observers(&watcher), 2);
        assert_eq!(kept.try_recv().unwrap(), ChangeEvent::in_place(Action::Change));

        binding.emit_for(&root, WatcherEvent::new(RawAction::ChildChange, &file));
        assert_eq!(change_observers(&watcher), 2);
        assert_eq!(kept.try_recv().unwrap(), ChangeEvent::in_place(Action::Change));
    }
}
