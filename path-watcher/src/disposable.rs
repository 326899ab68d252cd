//! Subscription handles and typed observer lists.

use std::fmt;
use std::sync::Arc;

/// Handle returned by every `on_*` registration.
///
/// Calling [`dispose`](Self::dispose) removes the registration. Dropping the
/// handle without disposing it leaves the registration in place.
#[must_use = "dropping a Disposable keeps the subscription alive until its owner closes"]
pub struct Disposable {
    dispose: Option<Box<dyn FnOnce() + Send>>,
}

impl Disposable {
    pub fn new(dispose: impl FnOnce() + Send + 'static) -> Self {
        Self {
            dispose: Some(Box::new(dispose)),
        }
    }

    /// A handle with nothing to release.
    pub fn empty() -> Self {
        Self { dispose: None }
    }

    /// Release the registration. Subsequent calls do nothing.
    pub fn dispose(&mut self) {
        if let Some(dispose) = self.dispose.take() {
            dispose();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.dispose.is_none()
    }
}

impl fmt::Debug for Disposable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Disposable")
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

pub(crate) fn dispose_all(disposables: &mut Vec<Disposable>) {
    for mut disposable in disposables.drain(..) {
        disposable.dispose();
    }
}

/// Observers for one event kind, kept in registration order.
pub(crate) struct ObserverList<F: ?Sized> {
    next_id: u64,
    entries: Vec<(u64, Arc<F>)>,
}

impl<F: ?Sized> ObserverList<F> {
    pub(crate) fn add(&mut self, observer: Arc<F>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push((id, observer));
        id
    }

    pub(crate) fn remove(&mut self, id: u64) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry, _)| *entry != id);
        self.entries.len() != before
    }

    /// Clone the current observers so they can be invoked without holding a lock.
    pub(crate) fn snapshot(&self) -> Vec<Arc<F>> {
        self.entries
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}

impl<F: ?Sized> Default for ObserverList<F> {
    fn default() -> Self {
        Self {
            next_id: 0,
            entries: Vec::new(),
        }
    }
}
