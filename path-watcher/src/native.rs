//! Native watcher: one binding handle for one directory subtree, shared by
//! every subscription that needs it.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::binding::{NativeBinding, NativeHandle};
use crate::disposable::{Disposable, ObserverList};
use crate::error::{Result, WatcherError};
use crate::event::WatcherEvent;
use crate::manager::ManagerInner;

/// Why a native watcher released its handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StopReason {
    /// The last change subscriber went away.
    Idle,
    /// Global teardown.
    Shutdown,
    /// The binding handed our handle to another watcher.
    Abandoned,
}

type ChangeObserver = dyn Fn(&WatcherEvent) + Send + Sync;
type ErrorObserver = dyn Fn(&WatcherError) + Send + Sync;
type DetachObserver = dyn Fn(&Arc<NativeWatcher>) + Send + Sync;
type LifecycleObserver = dyn Fn() + Send + Sync;
type StopObserver = dyn Fn(StopReason) + Send + Sync;

#[derive(Default)]
struct NativeObservers {
    did_change: ObserverList<ChangeObserver>,
    did_error: ObserverList<ErrorObserver>,
    should_detach: ObserverList<DetachObserver>,
    did_start: ObserverList<LifecycleObserver>,
    will_stop: ObserverList<LifecycleObserver>,
    did_stop: ObserverList<StopObserver>,
}

impl NativeObservers {
    fn clear(&mut self) {
        self.did_change.clear();
        self.did_error.clear();
        self.should_detach.clear();
        self.did_start.clear();
        self.will_stop.clear();
        self.did_stop.clear();
    }
}

/// Owns at most one binding handle for a normalized directory path.
///
/// The handle is acquired when the first change subscriber arrives and
/// released when the last one leaves. Events are fanned out unfiltered;
/// scoping them is up to each subscriber.
pub struct NativeWatcher {
    path: PathBuf,
    binding: Arc<dyn NativeBinding>,
    manager: Weak<ManagerInner>,
    handle: Mutex<Option<NativeHandle>>,
    observers: Mutex<NativeObservers>,
}

impl NativeWatcher {
    pub(crate) fn new(
        path: PathBuf,
        binding: Arc<dyn NativeBinding>,
        manager: Weak<ManagerInner>,
    ) -> Arc<Self> {
        Arc::new(Self {
            path,
            binding,
            manager,
            handle: Mutex::new(None),
            observers: Mutex::new(NativeObservers::default()),
        })
    }

    /// The watched directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The binding handle, while running.
    pub fn handle(&self) -> Option<NativeHandle> {
        *self.handle.lock()
    }

    pub fn is_running(&self) -> bool {
        self.handle.lock().is_some()
    }

    /// Number of change subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.observers.lock().did_change.len()
    }

    /// Subscribe to raw events, starting the watcher if needed.
    ///
    /// Disposing the returned handle stops the watcher once no change
    /// subscribers remain.
    pub fn on_did_change(
        self: &Arc<Self>,
        observer: impl Fn(&WatcherEvent) + Send + Sync + 'static,
    ) -> Result<Disposable> {
        let id = self.observers.lock().did_change.add(Arc::new(observer));
        if let Err(err) = self.start() {
            self.observers.lock().did_change.remove(id);
            return Err(err);
        }

        let native = Arc::downgrade(self);
        Ok(Disposable::new(move || {
            if let Some(native) = native.upgrade() {
                native.unsubscribe(id);
            }
        }))
    }

    pub fn on_did_error(
        self: &Arc<Self>,
        observer: impl Fn(&WatcherError) + Send + Sync + 'static,
    ) -> Disposable {
        self.register::<ErrorObserver>(|observers| &mut observers.did_error, Arc::new(observer))
    }

    /// Called with the replacement when a broader watcher takes over this
    /// subtree.
    pub fn on_should_detach(
        self: &Arc<Self>,
        observer: impl Fn(&Arc<NativeWatcher>) + Send + Sync + 'static,
    ) -> Disposable {
        self.register::<DetachObserver>(|observers| &mut observers.should_detach, Arc::new(observer))
    }

    pub fn on_did_start(self: &Arc<Self>, observer: impl Fn() + Send + Sync + 'static) -> Disposable {
        self.register::<LifecycleObserver>(|observers| &mut observers.did_start, Arc::new(observer))
    }

    pub fn on_will_stop(self: &Arc<Self>, observer: impl Fn() + Send + Sync + 'static) -> Disposable {
        self.register::<LifecycleObserver>(|observers| &mut observers.will_stop, Arc::new(observer))
    }

    pub fn on_did_stop(
        self: &Arc<Self>,
        observer: impl Fn(StopReason) + Send + Sync + 'static,
    ) -> Disposable {
        self.register::<StopObserver>(|observers| &mut observers.did_stop, Arc::new(observer))
    }

    fn register<F: ?Sized + Send + Sync + 'static>(
        self: &Arc<Self>,
        list: fn(&mut NativeObservers) -> &mut ObserverList<F>,
        observer: Arc<F>,
    ) -> Disposable {
        let id = list(&mut self.observers.lock()).add(observer);
        let native = Arc::downgrade(self);
        Disposable::new(move || {
            if let Some(native) = native.upgrade() {
                list(&mut native.observers.lock()).remove(id);
            }
        })
    }

    fn unsubscribe(&self, id: u64) {
        let idle = {
            let mut observers = self.observers.lock();
            observers.did_change.remove(id) && observers.did_change.is_empty()
        };
        if idle {
            self.stop(StopReason::Idle);
        }
    }

    fn start(self: &Arc<Self>) -> Result<()> {
        let handle = {
            let mut slot = self.handle.lock();
            if slot.is_some() {
                return Ok(());
            }
            let handle = self.binding.watch(&self.path)?;
            *slot = Some(handle);
            handle
        };
        debug!("Started native watcher for {} (handle {handle})", self.path.display());

        let stale = self
            .manager
            .upgrade()
            .and_then(|manager| manager.register_handle(handle, self));
        if let Some(stale) = stale {
            error!(
                "Native handle {handle} for {} collides with running watcher for {}; closing the stale watcher",
                self.path.display(),
                stale.path().display()
            );
            stale.stop(StopReason::Abandoned);
        }

        let observers = self.observers.lock().did_start.snapshot();
        for observer in observers {
            observer();
        }
        Ok(())
    }

    /// Release the binding handle. Does nothing when not running.
    pub(crate) fn stop(&self, reason: StopReason) {
        let Some(handle) = self.handle.lock().take() else {
            return;
        };

        let will_stop = self.observers.lock().will_stop.snapshot();
        for observer in will_stop {
            observer();
        }

        // An abandoned handle now belongs to another watcher.
        if reason != StopReason::Abandoned {
            self.binding.unwatch(handle);
        }
        debug!(
            "Stopped native watcher for {} (handle {handle}, {reason:?})",
            self.path.display()
        );

        if let Some(manager) = self.manager.upgrade() {
            manager.release_native(handle, self, reason);
        }

        let did_stop = self.observers.lock().did_stop.snapshot();
        for observer in did_stop {
            observer(reason);
        }

        if reason == StopReason::Shutdown {
            self.observers.lock().clear();
        }
    }

    /// Fan a raw event out to every change subscriber.
    pub(crate) fn on_event(&self, event: &WatcherEvent) {
        let observers = self.observers.lock().did_change.snapshot();
        for observer in observers {
            observer(event);
        }
    }

    pub(crate) fn emit_error(&self, err: &WatcherError) {
        let observers = self.observers.lock().did_error.snapshot();
        if observers.is_empty() {
            warn!("Unobserved error on native watcher for {}: {err}", self.path.display());
        }
        for observer in observers {
            observer(err);
        }
    }

    /// Ask every dependent to move over to `replacement`.
    pub(crate) fn request_detach(&self, replacement: &Arc<NativeWatcher>) {
        let observers = self.observers.lock().should_detach.snapshot();
        for observer in observers {
            observer(replacement);
        }
    }
}

impl fmt::Debug for NativeWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeWatcher")
            .field("path", &self.path)
            .field("handle", &self.handle())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
