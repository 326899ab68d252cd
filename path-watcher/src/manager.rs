//! The watch manager: owns the handle index, the registry and dispatch.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex};
use tracing::{debug, info, trace, warn};

use crate::binding::{BindingMessage, NativeBinding, NativeHandle, NotifyBinding};
use crate::config::WatchConfig;
use crate::error::{Result, WatcherError};
use crate::event::{ChangeEvent, normalize};
use crate::native::{NativeWatcher, StopReason};
use crate::path_watcher::{PathWatcher, PathWatcherInner};
use crate::reconcile::{Target, WatchMode};
use crate::registry::WatcherRegistry;

struct ManagerState {
    /// Running native watchers by binding handle.
    index: HashMap<NativeHandle, Arc<NativeWatcher>>,
    /// Released handles whose late messages belong to a consolidated watcher.
    forwards: HashMap<NativeHandle, Arc<NativeWatcher>>,
    registry: WatcherRegistry,
    tearing_down: bool,
}

pub(crate) struct ManagerInner {
    binding: Arc<dyn NativeBinding>,
    config: WatchConfig,
    state: Mutex<ManagerState>,
    /// Serializes event dispatch, attachment and teardown.
    pub(crate) dispatch_lock: ReentrantMutex<()>,
}

impl ManagerInner {
    fn dispatch(&self, handle: NativeHandle, message: BindingMessage) {
        let _dispatch = self.dispatch_lock.lock();
        let native = {
            let state = self.state.lock();
            state
                .index
                .get(&handle)
                .or_else(|| state.forwards.get(&handle))
                .cloned()
        };
        let Some(native) = native else {
            trace!("Dropping message for unknown handle {handle}");
            return;
        };

        match message {
            Ok(event) => native.on_event(&event),
            Err(err) => {
                warn!(
                    "Native watcher for {} reported an error: {err}",
                    native.path().display()
                );
                native.emit_error(&err);
            }
        }
    }

    /// Bind `watcher` to the native watcher that should serve it.
    pub(crate) fn attach(self: &Arc<Self>, watcher: &Arc<PathWatcherInner>) -> Result<()> {
        let _dispatch = self.dispatch_lock.lock();
        let root = watcher.watch_root();

        let resolution = self.state.lock().registry.resolve(&root, |path| {
            NativeWatcher::new(path.to_path_buf(), Arc::clone(&self.binding), Arc::downgrade(self))
        });
        if resolution.created {
            debug!("Created native watcher for {}", root.display());
        } else {
            debug!(
                "Sharing native watcher for {} with {}",
                resolution.native.path().display(),
                root.display()
            );
        }

        if let Err(err) = watcher.bind(&resolution.native) {
            if resolution.created && !resolution.native.is_running() {
                self.state
                    .lock()
                    .registry
                    .remove(resolution.native.path(), &resolution.native);
            }
            return Err(err);
        }

        for superseded in &resolution.superseded {
            debug!(
                "Consolidating native watcher for {} into {}",
                superseded.path().display(),
                resolution.native.path().display()
            );
            if let (Some(handle), Some(successor)) = (superseded.handle(), resolution.native.handle()) {
                self.binding.supersede(handle, successor);
                self.state
                    .lock()
                    .forwards
                    .insert(handle, Arc::clone(&resolution.native));
            }
            superseded.request_detach(&resolution.native);
        }
        Ok(())
    }

    /// Record a freshly started watcher. Returns the watcher previously
    /// registered under the same handle, if it is a different one.
    pub(crate) fn register_handle(
        &self,
        handle: NativeHandle,
        native: &Arc<NativeWatcher>,
    ) -> Option<Arc<NativeWatcher>> {
        let previous = {
            let mut state = self.state.lock();
            state.forwards.remove(&handle);
            state.index.insert(handle, Arc::clone(native))
        };
        previous.filter(|previous| !Arc::ptr_eq(previous, native))
    }

    pub(crate) fn release_native(&self, handle: NativeHandle, native: &NativeWatcher, reason: StopReason) {
        let mut state = self.state.lock();
        if state.tearing_down {
            return;
        }
        // An abandoned watcher's handle already belongs to its successor.
        let indexed = state
            .index
            .get(&handle)
            .is_some_and(|current| std::ptr::eq(current.as_ref(), native));
        if reason != StopReason::Abandoned && indexed {
            state.index.remove(&handle);
        }
        state
            .forwards
            .retain(|_, successor| !std::ptr::eq(successor.as_ref(), native));
        state.registry.remove(native.path(), native);
    }

    pub(crate) fn is_tearing_down(&self) -> bool {
        self.state.lock().tearing_down
    }

    fn close_all(&self) {
        let _dispatch = self.dispatch_lock.lock();
        let natives: Vec<Arc<NativeWatcher>> = {
            let mut state = self.state.lock();
            if state.tearing_down {
                return;
            }
            state.tearing_down = true;
            state.index.values().cloned().collect()
        };

        if !natives.is_empty() {
            info!("Closing {} native watchers", natives.len());
        }
        for native in &natives {
            native.stop(StopReason::Shutdown);
        }

        let mut state = self.state.lock();
        state.index.clear();
        state.forwards.clear();
        state.registry.reset();
        state.tearing_down = false;
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        self.close_all();
    }
}

/// Entry point for watching paths.
///
/// Owns the binding and all bookkeeping. Cloning yields another handle to the
/// same manager.
#[derive(Clone)]
pub struct WatchManager {
    inner: Arc<ManagerInner>,
}

impl WatchManager {
    /// Create a manager over `binding`, installing its dispatch callback.
    pub fn new(binding: Arc<dyn NativeBinding>, config: WatchConfig) -> Self {
        let inner = Arc::new(ManagerInner {
            binding,
            state: Mutex::new(ManagerState {
                index: HashMap::new(),
                forwards: HashMap::new(),
                registry: WatcherRegistry::new(config.consolidate),
                tearing_down: false,
            }),
            config,
            dispatch_lock: ReentrantMutex::new(()),
        });

        let manager = Arc::downgrade(&inner);
        inner.binding.set_callback(Arc::new(move |handle, message| {
            if let Some(manager) = manager.upgrade() {
                manager.dispatch(handle, message);
            }
        }));

        Self { inner }
    }

    /// Create a manager over the platform's notify backend.
    pub fn with_notify(config: WatchConfig) -> Result<Self> {
        let binding = NotifyBinding::new(config.settle_delay())?;
        Ok(Self::new(Arc::new(binding), config))
    }

    /// Watch `path`, calling `callback` for every change.
    ///
    /// Fails with [`WatcherError::UnableToWatch`] (code `ENOENT`) when the
    /// path does not exist.
    pub fn watch(
        &self,
        path: impl AsRef<Path>,
        callback: impl Fn(&ChangeEvent) + Send + Sync + 'static,
    ) -> Result<PathWatcher> {
        let watcher = self.prepare(path.as_ref(), callback)?;
        self.inner.attach(&watcher.inner)?;
        Ok(watcher)
    }

    /// Like [`watch`](Self::watch), resolving the native watcher on the
    /// blocking pool.
    pub async fn watch_async(
        &self,
        path: impl AsRef<Path>,
        callback: impl Fn(&ChangeEvent) + Send + Sync + 'static,
    ) -> Result<PathWatcher> {
        let watcher = self.prepare(path.as_ref(), callback)?;
        let manager = Arc::clone(&self.inner);
        let inner = Arc::clone(&watcher.inner);
        tokio::task::spawn_blocking(move || manager.attach(&inner)).await??;
        Ok(watcher)
    }

    fn prepare(
        &self,
        path: &Path,
        callback: impl Fn(&ChangeEvent) + Send + Sync + 'static,
    ) -> Result<PathWatcher> {
        let requested =
            std::path::absolute(path).map_err(|err| WatcherError::unable_to_watch(path, err))?;
        let metadata = std::fs::metadata(&requested)
            .map_err(|err| WatcherError::unable_to_watch(&requested, err))?;
        let tracked = if self.inner.config.follow_symlinks {
            dunce::canonicalize(&requested)
                .map_err(|err| WatcherError::unable_to_watch(&requested, err))?
        } else {
            normalize(&requested)
        };
        let mode = if metadata.is_dir() {
            WatchMode::Directory
        } else {
            WatchMode::File
        };

        let inner = PathWatcherInner::new(
            Arc::downgrade(&self.inner),
            requested,
            Target::new(tracked, mode),
        );
        let watcher = PathWatcher::from_inner(inner);
        let _registration = watcher.on_did_change(callback);
        Ok(watcher)
    }

    /// Stop every native watcher and close every subscription. Idempotent.
    pub fn close_all_watchers(&self) {
        self.inner.close_all();
    }

    /// Directories backed by a running native watcher, sorted.
    pub fn watched_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self
            .inner
            .state
            .lock()
            .index
            .values()
            .map(|native| native.path().to_path_buf())
            .collect();
        paths.sort();
        paths.dedup();
        paths
    }

    /// Number of running native watchers.
    pub fn native_watcher_count(&self) -> usize {
        self.inner.state.lock().index.len()
    }

    /// Running native watchers, ordered by path.
    pub fn native_watchers(&self) -> Vec<Arc<NativeWatcher>> {
        let mut natives: Vec<Arc<NativeWatcher>> =
            self.inner.state.lock().index.values().cloned().collect();
        natives.sort_by(|a, b| a.path().cmp(b.path()));
        natives
    }

    pub fn config(&self) -> &WatchConfig {
        &self.inner.config
    }
}

impl std::fmt::Debug for WatchManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchManager")
            .field("config", &self.inner.config)
            .field("watched_paths", &self.watched_paths())
            .finish()
    }
}
