//! Listener traits and the registries that hold them.
//!
//! Registries keep listeners in insertion order and notify a snapshot
//! taken under the lock, so a listener may (un)register from inside a
//! callback.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::Link;

/// Receives subject-tagged payloads arriving on any link of a transport.
pub trait DataListener: Send + Sync {
    fn data_arrived(&self, subject: &str, link: &Link, payload: &[u8]);
}

/// Receives link lifecycle events from a transport.
pub trait ConnectivityListener: Send + Sync {
    fn link_opened(&self, link: &Link);
    /// Link shut down cleanly, by either side.
    fn link_closed(&self, link: &Link);
    /// Link lost without a clean shutdown.
    fn link_crashed(&self, link: &Link);
}

/// Ordered set of listeners, deduplicated by pointer identity.
pub struct ListenerSet<L: ?Sized> {
    listeners: Mutex<Vec<Arc<L>>>,
}

impl<L: ?Sized> Default for ListenerSet<L> {
    fn default() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
        }
    }
}

impl<L: ?Sized> ListenerSet<L> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the listener was already registered.
    pub fn add(&self, listener: Arc<L>) -> bool {
        let mut listeners = self.listeners.lock();
        if listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            return false;
        }
        listeners.push(listener);
        true
    }

    pub fn remove(&self, listener: &Arc<L>) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    pub fn snapshot(&self) -> Vec<Arc<L>> {
        self.listeners.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.lock().is_empty()
    }
}

/// Key → ordered listener set.
pub struct ListenerRegistry<K, L: ?Sized> {
    by_key: Mutex<HashMap<K, Vec<Arc<L>>>>,
}

impl<K, L: ?Sized> Default for ListenerRegistry<K, L> {
    fn default() -> Self {
        Self {
            by_key: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone, L: ?Sized> ListenerRegistry<K, L> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if this is the first listener for `key`.
    pub fn add(&self, key: K, listener: Arc<L>) -> bool {
        let mut by_key = self.by_key.lock();
        let listeners = by_key.entry(key).or_default();
        let first = listeners.is_empty();
        if !listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            listeners.push(listener);
        }
        first
    }

    /// Returns `true` if `key` has no listener left.
    pub fn remove(&self, key: &K, listener: &Arc<L>) -> bool {
        let mut by_key = self.by_key.lock();
        match by_key.get_mut(key) {
            Some(listeners) => {
                listeners.retain(|l| !Arc::ptr_eq(l, listener));
                if listeners.is_empty() {
                    by_key.remove(key);
                    true
                } else {
                    false
                }
            }
            None => true,
        }
    }

    pub fn snapshot(&self, key: &K) -> Vec<Arc<L>> {
        self.by_key.lock().get(key).cloned().unwrap_or_default()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.by_key.lock().contains_key(key)
    }

    pub fn keys(&self) -> Vec<K> {
        self.by_key.lock().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Named: Send + Sync {
        fn name(&self) -> &str;
    }

    struct N(&'static str);

    impl Named for N {
        fn name(&self) -> &str {
            self.0
        }
    }

    #[test]
    fn set_dedups_by_identity() {
        let set: ListenerSet<dyn Named> = ListenerSet::new();
        let a: Arc<dyn Named> = Arc::new(N("a"));
        let b: Arc<dyn Named> = Arc::new(N("a"));
        assert!(set.add(a.clone()));
        assert!(!set.add(a.clone()));
        assert!(set.add(b));
        assert_eq!(set.len(), 2);
        assert!(set.remove(&a));
        assert_eq!(set.snapshot()[0].name(), "a");
    }

    #[test]
    fn registry_reports_first_and_last() {
        let reg: ListenerRegistry<String, dyn Named> = ListenerRegistry::new();
        let a: Arc<dyn Named> = Arc::new(N("a"));
        let b: Arc<dyn Named> = Arc::new(N("b"));
        assert!(reg.add("publish".into(), a.clone()));
        assert!(!reg.add("publish".into(), b.clone()));

        let names: Vec<_> = reg
            .snapshot(&"publish".to_string())
            .iter()
            .map(|l| l.name().to_string())
            .collect();
        assert_eq!(names, vec!["a", "b"]);

        assert!(!reg.remove(&"publish".to_string(), &a));
        assert!(reg.remove(&"publish".to_string(), &b));
        assert!(!reg.contains_key(&"publish".to_string()));
        assert!(reg.snapshot(&"publish".to_string()).is_empty());
    }
}
