//! Deferred process-exit cleanup.
//!
//! Sandbox containers are shared by every workspace that uses the same image,
//! so they are never stopped when a single workspace is cleaned up. Instead
//! the sandbox registers a function here, and the CLI runs all registered
//! functions once right before it exits.

use std::sync::{Mutex, MutexGuard};

use tracing::{debug, warn};

/// Arguments passed through [`ShutdownRegistry::shutdown`] to every
/// registered function. Their meaning is up to each function.
pub type ShutdownArgs = [String];

/// A cleanup function. Returns `true` if it did its work and can be
/// forgotten, `false` to stay registered for a later shutdown call.
pub type ShutdownFn = Box<dyn FnMut(&ShutdownArgs) -> bool + Send>;

struct Entry {
    key: Option<String>,
    f: ShutdownFn,
}

/// Holds cleanup functions until shutdown.
#[derive(Default)]
pub struct ShutdownRegistry {
    entries: Mutex<Vec<Entry>>,
}

impl std::fmt::Debug for ShutdownRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownRegistry")
            .field("entries", &self.lock().len())
            .finish()
    }
}

impl ShutdownRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Entry>> {
        // A panic inside a shutdown function happens outside the lock, so a
        // poisoned mutex still holds a consistent list.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register `f` to run at shutdown.
    pub fn register(&self, f: impl FnMut(&ShutdownArgs) -> bool + Send + 'static) {
        self.lock().push(Entry {
            key: None,
            f: Box::new(f),
        });
    }

    /// Register `f` unless a function was already registered under `key`.
    /// Returns whether `f` was registered.
    pub fn register_unique(
        &self,
        key: impl Into<String>,
        f: impl FnMut(&ShutdownArgs) -> bool + Send + 'static,
    ) -> bool {
        let key = key.into();
        let mut entries = self.lock();
        if entries.iter().any(|e| e.key.as_deref() == Some(key.as_str())) {
            return false;
        }
        debug!(key = %key, "registered shutdown function");
        entries.push(Entry {
            key: Some(key),
            f: Box::new(f),
        });
        true
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every registered function with `args`.
    ///
    /// The functions run without the registry lock held, so they may register
    /// new functions. Those that return `false` stay registered, ahead of
    /// anything registered while they ran.
    pub fn shutdown(&self, args: &ShutdownArgs) {
        let entries = std::mem::take(&mut *self.lock());
        if entries.is_empty() {
            return;
        }

        let mut retained = Vec::new();
        for mut entry in entries {
            if (entry.f)(args) {
                continue;
            }
            if let Some(key) = &entry.key {
                warn!(key = %key, "shutdown function did not complete, keeping it registered");
            }
            retained.push(entry);
        }

        let mut current = self.lock();
        if !retained.is_empty() {
            let added = std::mem::take(&mut *current);
            retained.extend(added);
            *current = retained;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_completed_functions_are_removed() {
        let registry = ShutdownRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let c = calls.clone();
        registry.register(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            true
        });
        let c = calls.clone();
        registry.register(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            false
        });

        registry.shutdown(&[]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(registry.len(), 1);

        registry.shutdown(&[]);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_register_unique() {
        let registry = ShutdownRegistry::new();
        assert!(registry.register_unique("skiff-postgres-16", |_| true));
        assert!(!registry.register_unique("skiff-postgres-16", |_| true));
        assert!(registry.register_unique("skiff-postgres-17", |_| true));
        assert_eq!(registry.len(), 2);

        registry.shutdown(&[]);
        assert!(registry.is_empty());
        // the key is free again once its function completed
        assert!(registry.register_unique("skiff-postgres-16", |_| true));
    }

    #[test]
    fn test_args_are_passed_through() {
        let registry = ShutdownRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        registry.register(move |args| {
            s.lock().unwrap().extend(args.iter().cloned());
            args.first().is_some_and(|a| a == "skiff-")
        });

        registry.shutdown(&["other-".to_string()]);
        assert_eq!(registry.len(), 1);
        registry.shutdown(&["skiff-".to_string()]);
        assert!(registry.is_empty());
        assert_eq!(*seen.lock().unwrap(), vec!["other-", "skiff-"]);
    }

    #[test]
    fn test_functions_may_register_during_shutdown() {
        let registry = Arc::new(ShutdownRegistry::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let r = registry.clone();
        let o = order.clone();
        registry.register(move |_| {
            o.lock().unwrap().push("first");
            let o2 = o.clone();
            r.register(move |_| {
                o2.lock().unwrap().push("added");
                true
            });
            false
        });

        registry.shutdown(&[]);
        assert_eq!(registry.len(), 2);

        // the retained entry runs before the one added while it ran
        registry.shutdown(&[]);
        let order = order.lock().unwrap().clone();
        assert_eq!(order, vec!["first", "first", "added"]);
    }
}
