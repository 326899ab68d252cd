//! A binding driven entirely by explicit calls.
//!
//! Nothing touches the OS: `watch` hands out handles, and events only arrive
//! when the owner calls one of the `emit*` methods. Events are dispatched
//! synchronously on the calling thread.

use std::collections::{BTreeMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::{BindingMessage, DispatchFn, NativeBinding, NativeHandle};
use crate::error::{Result, WatcherError};
use crate::event::{WatcherEvent, normalize};

#[derive(Default)]
struct ManualState {
    next_handle: u64,
    active: BTreeMap<NativeHandle, PathBuf>,
    callback: Option<DispatchFn>,
    reuse_next: Option<NativeHandle>,
    refused: HashSet<PathBuf>,
    watch_calls: usize,
    unwatch_calls: usize,
    supersessions: Vec<(NativeHandle, NativeHandle)>,
}

/// In-process binding.
#[derive(Default)]
pub struct ManualBinding {
    state: Mutex<ManualState>,
}

impl ManualBinding {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Deliver an event for `handle`.
    pub fn emit(&self, handle: NativeHandle, event: WatcherEvent) {
        self.deliver(handle, Ok(event));
    }

    /// Deliver an event given in its string form. Unknown action names reach
    /// the dispatcher as [`WatcherError::UnknownAction`].
    pub fn emit_raw(&self, handle: NativeHandle, action: &str, path: &Path, old_path: Option<&Path>) {
        self.deliver(handle, WatcherEvent::parse(action, path, old_path));
    }

    /// Report a binding failure for `handle`.
    pub fn emit_error(&self, handle: NativeHandle, message: impl Into<String>) {
        self.deliver(handle, Err(WatcherError::Binding(message.into())));
    }

    /// Deliver an event to whichever handle watches `root`.
    ///
    /// Returns false when nothing is watching `root`.
    pub fn emit_for(&self, root: &Path, event: WatcherEvent) -> bool {
        match self.handle_for(root) {
            Some(handle) => {
                self.emit(handle, event);
                true
            }
            None => false,
        }
    }

    /// The active handle watching `path`, if any.
    pub fn handle_for(&self, path: &Path) -> Option<NativeHandle> {
        let path = normalize(path);
        self.state
            .lock()
            .active
            .iter()
            .find(|(_, watched)| **watched == path)
            .map(|(handle, _)| *handle)
    }

    /// Directories currently watched, in handle order.
    pub fn active_paths(&self) -> Vec<PathBuf> {
        self.state.lock().active.values().cloned().collect()
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().active.len()
    }

    pub fn watch_calls(&self) -> usize {
        self.state.lock().watch_calls
    }

    pub fn unwatch_calls(&self) -> usize {
        self.state.lock().unwatch_calls
    }

    /// `(handle, successor)` pairs reported through `supersede`, oldest first.
    pub fn supersessions(&self) -> Vec<(NativeHandle, NativeHandle)> {
        self.state.lock().supersessions.clone()
    }

    /// Make the next `watch` call return `handle` even if it is in use.
    pub fn reuse_handle_next(&self, handle: NativeHandle) {
        self.state.lock().reuse_next = Some(handle);
    }

    /// Make `watch` fail for `path` with a permission error.
    pub fn refuse(&self, path: &Path) {
        self.state.lock().refused.insert(normalize(path));
    }

    fn deliver(&self, handle: NativeHandle, message: BindingMessage) {
        let callback = self.state.lock().callback.clone();
        match callback {
            Some(callback) => callback(handle, message),
            None => debug!("No dispatch callback installed; dropping message for handle {handle}"),
        }
    }
}

impl NativeBinding for ManualBinding {
    fn set_callback(&self, callback: DispatchFn) {
        self.state.lock().callback = Some(callback);
    }

    fn watch(&self, directory: &Path) -> Result<NativeHandle> {
        let directory = normalize(directory);
        let mut state = self.state.lock();
        state.watch_calls += 1;

        if state.refused.contains(&directory) {
            return Err(WatcherError::unable_to_watch(
                directory,
                io::Error::from(io::ErrorKind::PermissionDenied),
            ));
        }

        let handle = match state.reuse_next.take() {
            Some(handle) => handle,
            None => {
                state.next_handle += 1;
                NativeHandle::new(state.next_handle)
            }
        };
        state.active.insert(handle, directory);
        Ok(handle)
    }

    fn unwatch(&self, handle: NativeHandle) {
        let mut state = self.state.lock();
        state.unwatch_calls += 1;
        state.active.remove(&handle);
    }

    fn supersede(&self, handle: NativeHandle, successor: NativeHandle) {
        self.state.lock().supersessions.push((handle, successor));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::RawAction;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_watch_allocates_distinct_handles() {
        let binding = ManualBinding::new();
        let a = binding.watch(Path::new("/a")).unwrap();
        let b = binding.watch(Path::new("/b/")).unwrap();

        assert_ne!(a, b);
        assert_eq!(binding.handle_for(Path::new("/b")), Some(b));
        assert_eq!(binding.active_paths(), vec![PathBuf::from("/a"), PathBuf::from("/b")]);

        binding.unwatch(a);
        assert_eq!(binding.active_count(), 1);
        assert_eq!(binding.unwatch_calls(), 1);
    }

    #[test]
    fn test_refused_path_fails_with_code() {
        let binding = ManualBinding::new();
        binding.refuse(Path::new("/locked"));

        let err = binding.watch(Path::new("/locked")).unwrap_err();
        assert_eq!(err.code(), Some("EACCES"));
    }

    #[test]
    fn test_emit_reaches_callback() {
        let binding = ManualBinding::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        binding.set_callback(Arc::new(move |handle, message| {
            sink.lock().push((handle, message.map(|event| event.action).ok()));
        }));

        let handle = binding.watch(Path::new("/a")).unwrap();
        binding.emit(handle, WatcherEvent::new(RawAction::ChildChange, "/a/file"));
        binding.emit_raw(handle, "bogus", Path::new("/a/file"), None);

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], (handle, Some(RawAction::ChildChange)));
        assert_eq!(seen[1], (handle, None));
    }
}
