//! Backend registry.
//!
//! # Responsibilities
//! - Hold the set of known backends in registration order
//! - Reject duplicate identifiers, report unknown ones
//! - Notify observers (circuit breaker, connection pool) on removal
//! - Hand out point-in-time snapshots for selection and listing
//!
//! Readers load the current list without locking; writers serialize on a
//! small mutex and publish a new list.

use std::sync::{Arc, Mutex};
use arc_swap::ArcSwap;
use crate::error::ProxyError;
use crate::load_balancer::backend::{Backend, BackendInfo};

/// Per-backend state owners that must forget a backend when it is removed.
pub trait BackendObserver: Send + Sync {
    fn backend_removed(&self, id: &str);
}

pub struct BackendRegistry {
    backends: ArcSwap<Vec<Arc<Backend>>>,
    write_lock: Mutex<()>,
    observers: Mutex<Vec<Arc<dyn BackendObserver>>>,
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.len())
            .finish()
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            backends: ArcSwap::from_pointee(Vec::new()),
            write_lock: Mutex::new(()),
            observers: Mutex::new(Vec::new()),
        }
    }

    /// Register an observer that is told about removals.
    pub fn subscribe(&self, observer: Arc<dyn BackendObserver>) {
        self.observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(observer);
    }

    /// Register a backend. Fails if the identifier is taken.
    pub fn add(&self, backend: Backend) -> Result<Arc<Backend>, ProxyError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.backends.load();
        if current.iter().any(|b| b.id == backend.id) {
            return Err(ProxyError::DuplicateBackend(backend.id));
        }

        let backend = Arc::new(backend);
        let mut next = Vec::with_capacity(current.len() + 1);
        next.extend(current.iter().cloned());
        next.push(backend.clone());
        self.backends.store(Arc::new(next));

        tracing::info!(backend = %backend.id, address = %backend.address, "Backend registered");
        Ok(backend)
    }

    /// Deregister a backend and discard its per-backend state elsewhere.
    pub fn remove(&self, id: &str) -> Result<Arc<Backend>, ProxyError> {
        let removed = {
            let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
            let current = self.backends.load();
            let Some(pos) = current.iter().position(|b| b.id == id) else {
                return Err(ProxyError::NotFound(id.to_string()));
            };
            let mut next: Vec<_> = current.iter().cloned().collect();
            let removed = next.remove(pos);
            self.backends.store(Arc::new(next));

            // Observers run under the write lock so a re-add of the same id
            // cannot interleave with the cleanup.
            let observers = self.observers.lock().unwrap_or_else(|e| e.into_inner()).clone();
            for observer in observers {
                observer.backend_removed(id);
            }
            removed
        };

        tracing::info!(backend = %id, "Backend deregistered");
        Ok(removed)
    }

    /// Toggle administrative availability.
    pub fn set_active(&self, id: &str, active: bool) -> Result<(), ProxyError> {
        let backend = self.get(id).ok_or_else(|| ProxyError::NotFound(id.to_string()))?;
        backend.set_active(active);
        tracing::info!(backend = %id, active, "Backend availability changed");
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<Backend>> {
        self.backends.load().iter().find(|b| b.id == id).cloned()
    }

    /// Shared handles to every backend, in registration order.
    pub fn all(&self) -> Arc<Vec<Arc<Backend>>> {
        self.backends.load_full()
    }

    /// Owned snapshot of every backend.
    pub fn list(&self) -> Vec<BackendInfo> {
        self.backends.load().iter().map(|b| b.info()).collect()
    }

    pub fn len(&self) -> usize {
        self.backends.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use url::Url;

    fn backend(id: &str) -> Backend {
        Backend::new(id, Url::parse("http://127.0.0.1:9000").unwrap(), 1)
    }

    #[derive(Default)]
    struct CountingObserver(AtomicUsize);

    impl BackendObserver for CountingObserver {
        fn backend_removed(&self, _id: &str) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_add_remove() {
        let registry = BackendRegistry::new();
        let observer = Arc::new(CountingObserver::default());
        registry.subscribe(observer.clone());

        registry.add(backend("a")).unwrap();
        registry.add(backend("b")).unwrap();
        assert!(matches!(registry.add(backend("a")), Err(ProxyError::DuplicateBackend(id)) if id == "a"));

        let ids: Vec<_> = registry.list().into_iter().map(|b| b.id).collect();
        assert_eq!(ids, vec!["a", "b"]);

        registry.remove("a").unwrap();
        assert!(matches!(registry.remove("a"), Err(ProxyError::NotFound(_))));
        assert_eq!(observer.0.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);

        // Same id can be registered again after removal.
        registry.add(backend("a")).unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_list_is_a_snapshot() {
        let registry = BackendRegistry::new();
        registry.add(backend("a")).unwrap();

        let before = registry.list();
        registry.set_active("a", false).unwrap();
        assert!(before[0].active);
        assert!(!registry.list()[0].active);

        assert!(matches!(registry.set_active("zzz", true), Err(ProxyError::NotFound(_))));
    }
}
