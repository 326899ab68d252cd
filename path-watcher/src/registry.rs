//! Decides which native watcher services a watch root.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::native::NativeWatcher;

/// Outcome of [`WatcherRegistry::resolve`].
pub(crate) struct Resolution {
    pub(crate) native: Arc<NativeWatcher>,
    pub(crate) created: bool,
    /// Running watchers strictly beneath a newly created root.
    pub(crate) superseded: Vec<Arc<NativeWatcher>>,
}

/// Native watchers keyed by normalized directory path.
///
/// With consolidation enabled a watch root is served by the broadest running
/// watcher covering it. A new root supersedes the running watchers beneath it;
/// a broad watcher is never split back into narrower ones.
pub(crate) struct WatcherRegistry {
    natives: BTreeMap<PathBuf, Arc<NativeWatcher>>,
    consolidate: bool,
}

impl WatcherRegistry {
    pub(crate) fn new(consolidate: bool) -> Self {
        Self {
            natives: BTreeMap::new(),
            consolidate,
        }
    }

    /// Find the watcher for `root`, creating one with `create` when nothing
    /// covers it.
    pub(crate) fn resolve(
        &mut self,
        root: &Path,
        create: impl FnOnce(&Path) -> Arc<NativeWatcher>,
    ) -> Resolution {
        let existing = if self.consolidate {
            self.covering(root)
        } else {
            None
        };
        if let Some(native) = existing.or_else(|| self.natives.get(root).cloned()) {
            return Resolution {
                native,
                created: false,
                superseded: Vec::new(),
            };
        }

        let native = create(root);
        self.natives.insert(root.to_path_buf(), Arc::clone(&native));

        let superseded = if self.consolidate {
            self.natives
                .iter()
                .filter(|(path, watcher)| {
                    path.as_path() != root && path.starts_with(root) && watcher.is_running()
                })
                .map(|(_, watcher)| Arc::clone(watcher))
                .collect()
        } else {
            Vec::new()
        };

        Resolution {
            native,
            created: true,
            superseded,
        }
    }

    /// The broadest running watcher whose path is `root` or one of its
    /// ancestors.
    pub(crate) fn covering(&self, root: &Path) -> Option<Arc<NativeWatcher>> {
        // Ancestors sort before their descendants.
        self.natives
            .iter()
            .find(|(path, watcher)| root.starts_with(path) && watcher.is_running())
            .map(|(_, watcher)| Arc::clone(watcher))
    }

    /// Forget `native`, if it is still the entry for `path`.
    pub(crate) fn remove(&mut self, path: &Path, native: &NativeWatcher) {
        let current = self
            .natives
            .get(path)
            .is_some_and(|entry| std::ptr::eq(entry.as_ref(), native));
        if current {
            self.natives.remove(path);
        }
    }

    pub(crate) fn reset(&mut self) {
        self.natives.clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.natives.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::ManualBinding;
    use crate::disposable::Disposable;
    use pretty_assertions::assert_eq;
    use std::sync::Weak;

    struct Fixture {
        binding: Arc<ManualBinding>,
        registry: WatcherRegistry,
        subscriptions: Vec<Disposable>,
    }

    impl Fixture {
        fn new(consolidate: bool) -> Self {
            Self {
                binding: ManualBinding::new(),
                registry: WatcherRegistry::new(consolidate),
                subscriptions: Vec::new(),
            }
        }

        /// Resolve `root` and start whatever comes back.
        fn open(&mut self, root: &str) -> Resolution {
            let binding = self.binding.clone();
            let resolution = self.registry.resolve(Path::new(root), |path| {
                NativeWatcher::new(path.to_path_buf(), binding, Weak::new())
            });
            self.subscriptions
                .push(resolution.native.on_did_change(|_| {}).unwrap());
            resolution
        }
    }

    #[test]
    fn test_same_root_is_shared() {
        let mut fixture = Fixture::new(true);
        let first = fixture.open("/a");
        let second = fixture.open("/a");

        assert!(first.created);
        assert!(!second.created);
        assert!(Arc::ptr_eq(&first.native, &second.native));
        assert_eq!(fixture.binding.watch_calls(), 1);
    }

    #[test]
    fn test_descendant_reuses_running_ancestor() {
        let mut fixture = Fixture::new(true);
        let parent = fixture.open("/a");
        let child = fixture.open("/a/b/c");

        assert!(!child.created);
        assert!(Arc::ptr_eq(&parent.native, &child.native));
        assert_eq!(fixture.registry.len(), 1);
    }

    #[test]
    fn test_broadest_ancestor_wins() {
        let mut fixture = Fixture::new(false);
        let outer = fixture.open("/a");
        fixture.open("/a/b");

        fixture.registry.consolidate = true;
        let resolved = fixture.registry.covering(Path::new("/a/b/c"));

        assert!(resolved.is_some_and(|native| Arc::ptr_eq(&native, &outer.native)));
    }

    #[test]
    fn test_new_ancestor_supersedes_running_descendants() {
        let mut fixture = Fixture::new(true);
        let left = fixture.open("/a/left");
        let right = fixture.open("/a/right");
        fixture.open("/other");

        let parent = fixture.open("/a");

        assert!(parent.created);
        let superseded: Vec<&Path> = parent.superseded.iter().map(|n| n.path()).collect();
        assert_eq!(superseded, vec![Path::new("/a/left"), Path::new("/a/right")]);
        assert!(Arc::ptr_eq(&parent.superseded[0], &left.native));
        assert!(Arc::ptr_eq(&parent.superseded[1], &right.native));
    }

    #[test]
    fn test_sibling_prefix_is_not_an_ancestor() {
        let mut fixture = Fixture::new(true);
        fixture.open("/a/b");
        let sibling = fixture.open("/a/bc");

        assert!(sibling.created);
        assert!(sibling.superseded.is_empty());
    }

    #[test]
    fn test_without_consolidation_each_root_is_dedicated() {
        let mut fixture = Fixture::new(false);
        let parent = fixture.open("/a");
        let child = fixture.open("/a/b");

        assert!(child.created);
        assert!(!Arc::ptr_eq(&parent.native, &child.native));
        assert_eq!(fixture.binding.watch_calls(), 2);
    }

    #[test]
    fn test_remove_requires_same_instance() {
        let mut fixture = Fixture::new(true);
        let first = fixture.open("/a");
        let impostor = NativeWatcher::new(PathBuf::from("/a"), fixture.binding.clone(), Weak::new());

        fixture.registry.remove(Path::new("/a"), &impostor);
        assert_eq!(fixture.registry.len(), 1);

        fixture.registry.remove(Path::new("/a"), &first.native);
        assert_eq!(fixture.registry.len(), 0);

        fixture.open("/b");
        fixture.registry.reset();
        assert_eq!(fixture.registry.len(), 0);
    }
}
