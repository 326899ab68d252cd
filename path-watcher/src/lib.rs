//! # Path Watcher
//!
//! Filesystem change notification for the Codex workspace. A caller watches a
//! file or directory and receives `create`, `change`, `rename` and `delete`
//! events for it, while the crate shares a small number of recursive OS
//! watches across every subscription.
//!
//! ## Features
//!
//! - **Deduplication**: one native watch per directory, however many
//!   subscribers
//! - **Consolidation**: subscriptions beneath a running watch reuse it
//! - **Rename following**: a renamed file keeps reporting at its new location
//! - **Settling**: bursts of raw notifications collapse into one event
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        WatchManager                             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  NativeBinding ──► dispatch ──► NativeWatcher ──► PathWatcher   │
//! │  (notify/manual)      │            │                  │         │
//! │                       ▼            ▼                  ▼         │
//! │                 handle index   WatcherRegistry    reconcile     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use codex_path_watcher::{WatchConfig, WatchManager};
//!
//! # fn main() -> codex_path_watcher::Result<()> {
//! let manager = WatchManager::with_notify(WatchConfig::default())?;
//! let watcher = manager.watch("Cargo.toml", |change| {
//!     println!("{} {:?}", change.action, change.path);
//! })?;
//! # drop(watcher);
//! # Ok(())
//! # }
//! ```

pub mod binding;
pub mod config;
pub mod disposable;
pub mod error;
pub mod event;
pub mod global;
pub mod manager;
pub mod native;
pub mod path_watcher;
pub mod reconcile;
mod registry;

pub use binding::{ManualBinding, NativeBinding, NativeHandle, NotifyBinding};
pub use config::WatchConfig;
pub use disposable::Disposable;
pub use error::{Result, WatcherError};
pub use event::{Action, ChangeEvent, RawAction, WatcherEvent};
pub use manager::WatchManager;
pub use native::{NativeWatcher, StopReason};
pub use path_watcher::{PathWatcher, WatcherState};
pub use reconcile::{Target, WatchMode, reconcile};
