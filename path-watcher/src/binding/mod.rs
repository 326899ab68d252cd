//! Boundary to the OS-level watch primitive.
//!
//! A binding watches one directory subtree per handle and reports every raw
//! change through a single dispatch callback installed by the
//! [`WatchManager`](crate::WatchManager).

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::event::WatcherEvent;

pub mod manual;
pub mod notify_backend;

pub use manual::ManualBinding;
pub use notify_backend::NotifyBinding;

/// Opaque token identifying one active subtree watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NativeHandle(u64);

impl NativeHandle {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One report from a binding: an event, or an error for the handle.
pub type BindingMessage = Result<WatcherEvent>;

/// Process-wide dispatch entry point.
pub type DispatchFn = Arc<dyn Fn(NativeHandle, BindingMessage) + Send + Sync>;

/// Platform watch primitive.
pub trait NativeBinding: Send + Sync {
    /// Install the dispatch entry point, replacing any previous one.
    fn set_callback(&self, callback: DispatchFn);

    /// Start a recursive watch of `directory`.
    fn watch(&self, directory: &Path) -> Result<NativeHandle>;

    /// Release a handle returned by [`watch`](Self::watch). Unknown handles
    /// are ignored.
    fn unwatch(&self, handle: NativeHandle);

    /// Record that `successor` now covers the subtree of `handle`.
    ///
    /// Notifications for `handle` that are still undelivered when it is
    /// released must be reported under `successor` instead of dropped.
    /// Bindings that deliver synchronously have nothing to hand over.
    fn supersede(&self, _handle: NativeHandle, _successor: NativeHandle) {}
}
