//! The Reactive Store: per-domain and per-(domain, scope) snapshot state with fine-grained
//! change notifications.
//!
//! Split into a `Writer`/`Store` pair so mutation access stays separate from read access:
//! `Writer` is the orchestrator's private handle, `Store` is the cheaply cloneable read handle a
//! UI layer (or a test) subscribes against.

use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;
use refresh_core::{DomainSnapshotState, SnapshotStatus};

/// A stable, ordered view of one domain's scoped entries, kept in sync with the underlying map
/// so consumers can subscribe to an ordered list cheaply.
pub type ScopedEntries = Arc<Vec<(String, Arc<DomainSnapshotState>)>>;

fn empty_state() -> Arc<DomainSnapshotState> {
    thread_local! {
        static EMPTY: Arc<DomainSnapshotState> = Arc::new(DomainSnapshotState::default());
    }
    EMPTY.with(std::clone::Clone::clone)
}

fn empty_scoped_map() -> Arc<HashMap<String, Arc<DomainSnapshotState>>> {
    thread_local! {
        static EMPTY: Arc<HashMap<String, Arc<DomainSnapshotState>>> = Arc::new(HashMap::new());
    }
    EMPTY.with(std::clone::Clone::clone)
}

fn empty_entries() -> ScopedEntries {
    thread_local! {
        static EMPTY: ScopedEntries = Arc::new(Vec::new());
    }
    EMPTY.with(std::clone::Clone::clone)
}

struct Slab {
    domains: HashMap<String, Arc<DomainSnapshotState>>,
    scoped_domains: HashMap<String, Arc<HashMap<String, Arc<DomainSnapshotState>>>>,
    scoped_entries: HashMap<String, ScopedEntries>,
    pending_requests: i64,
}

impl Slab {
    fn new() -> Self {
        Self {
            domains: HashMap::new(),
            scoped_domains: HashMap::new(),
            scoped_entries: HashMap::new(),
            pending_requests: 0,
        }
    }
}

/// The writable half of the store; the orchestrator is the sole holder.
pub struct Writer {
    slab: Arc<RwLock<Slab>>,
    listeners: Arc<RwLock<Vec<Box<dyn Fn() + Send + Sync>>>>,
}

impl Writer {
    /// Construct a fresh, empty store.
    pub fn new() -> Self {
        Self {
            slab: Arc::new(RwLock::new(Slab::new())),
            listeners: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Return a read handle.
    pub fn as_reader(&self) -> Store {
        Store {
            slab: self.slab.clone(),
            listeners: self.listeners.clone(),
        }
    }

    fn notify(&self) {
        for listener in self.listeners.read().iter() {
            listener();
        }
    }

    /// Read a non-scoped domain's state.
    pub fn get_domain_state(&self, domain: &str) -> Arc<DomainSnapshotState> {
        self.slab
            .read()
            .domains
            .get(domain)
            .cloned()
            .unwrap_or_else(empty_state)
    }

    /// Read one (domain, scope) state.
    pub fn get_scoped_domain_state(&self, domain: &str, scope: &str) -> Arc<DomainSnapshotState> {
        self.slab
            .read()
            .scoped_domains
            .get(domain)
            .and_then(|m| m.get(scope))
            .cloned()
            .unwrap_or_else(empty_state)
    }

    /// Read the stable map of all scoped entries for a domain.
    pub fn get_scoped_domain_states(
        &self,
        domain: &str,
    ) -> Arc<HashMap<String, Arc<DomainSnapshotState>>> {
        self.slab
            .read()
            .scoped_domains
            .get(domain)
            .cloned()
            .unwrap_or_else(empty_scoped_map)
    }

    /// Read the stable, ordered list of scoped entries for a domain.
    pub fn get_scoped_domain_entries(&self, domain: &str) -> ScopedEntries {
        self.slab
            .read()
            .scoped_entries
            .get(domain)
            .cloned()
            .unwrap_or_else(empty_entries)
    }

    /// Apply `updater` to a non-scoped domain's state. Notifies only if the result differs by
    /// reference from the prior value (the updater returning the identical `Arc` is a no-op).
    pub fn set_domain_state(
        &self,
        domain: &str,
        updater: impl FnOnce(&DomainSnapshotState) -> DomainSnapshotState,
    ) {
        let mut slab = self.slab.write();
        let prev = slab
            .domains
            .get(domain)
            .cloned()
            .unwrap_or_else(empty_state);
        let next = updater(&prev);
        slab.domains.insert(domain.to_string(), Arc::new(next));
        drop(slab);
        self.notify();
    }

    /// Apply `updater` to one (domain, scope) state, keeping `scoped_entries` in sync.
    pub fn set_scoped_domain_state(
        &self,
        domain: &str,
        scope: &str,
        updater: impl FnOnce(&DomainSnapshotState) -> DomainSnapshotState,
    ) {
        let mut slab = self.slab.write();
        let map = slab
            .scoped_domains
            .entry(domain.to_string())
            .or_insert_with(|| Arc::new(HashMap::new()));
        let prev = map.get(scope).cloned().unwrap_or_else(empty_state);
        let next = Arc::new(updater(&prev));

        let mut new_map = (**map).clone();
        new_map.insert(scope.to_string(), next);
        let new_map = Arc::new(new_map);
        slab.scoped_domains.insert(domain.to_string(), new_map.clone());

        let entries: Vec<_> = new_map
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        slab.scoped_entries
            .insert(domain.to_string(), Arc::new(entries));
        drop(slab);
        self.notify();
    }

    /// Reset a non-scoped domain's state to its initial shape. Always notifies.
    pub fn reset_domain_state(&self, domain: &str) {
        let mut slab = self.slab.write();
        slab.domains
            .insert(domain.to_string(), Arc::new(DomainSnapshotState::default()));
        drop(slab);
        self.notify();
    }

    /// Reset one (domain, scope) state. A no-op (no notification) if the scope is unknown.
    pub fn reset_scoped_domain_state(&self, domain: &str, scope: &str) {
        let mut slab = self.slab.write();
        let Some(map) = slab.scoped_domains.get(domain) else {
            return;
        };
        if !map.contains_key(scope) {
            return;
        }
        let mut new_map = (**map).clone();
        new_map.insert(scope.to_string(), Arc::new(DomainSnapshotState::default()));
        let new_map = Arc::new(new_map);
        slab.scoped_domains.insert(domain.to_string(), new_map.clone());
        let entries: Vec<_> = new_map
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        slab.scoped_entries
            .insert(domain.to_string(), Arc::new(entries));
        drop(slab);
        self.notify();
    }

    /// Reset every scoped entry for every domain (used on `view:reset`).
    pub fn reset_all_scoped_domain_states(&self) {
        let mut slab = self.slab.write();
        let domains: Vec<String> = slab.scoped_domains.keys().cloned().collect();
        for domain in domains {
            slab.scoped_domains.insert(domain.clone(), Arc::new(HashMap::new()));
            slab.scoped_entries.insert(domain, Arc::new(Vec::new()));
        }
        let domains: Vec<String> = slab.domains.keys().cloned().collect();
        for domain in domains {
            slab.domains
                .insert(domain, Arc::new(DomainSnapshotState::default()));
        }
        drop(slab);
        self.notify();
    }

    /// Adjust the in-flight request counter, clamped at zero.
    pub fn mark_pending_request(&self, delta: i64) {
        let mut slab = self.slab.write();
        slab.pending_requests = (slab.pending_requests + delta).max(0);
        drop(slab);
        self.notify();
    }

    /// The current in-flight request counter.
    pub fn pending_requests(&self) -> i64 {
        self.slab.read().pending_requests
    }

    /// Increment a domain's dropped-automatic-refresh counter without otherwise touching its
    /// state.
    pub fn increment_dropped_auto_refresh(&self, domain: &str) {
        self.set_domain_state(domain, |prev| {
            let mut next = prev.clone();
            next.dropped_auto_refreshes += 1;
            next
        });
    }

    /// Increment a scoped domain's dropped-automatic-refresh counter.
    pub fn increment_scoped_dropped_auto_refresh(&self, domain: &str, scope: &str) {
        self.set_scoped_domain_state(domain, scope, |prev| {
            let mut next = prev.clone();
            next.dropped_auto_refreshes += 1;
            next
        });
    }

    /// Subscribe a listener to be invoked after every state change that actually notified.
    pub fn subscribe(&self, listener: Box<dyn Fn() + Send + Sync>) {
        self.listeners.write().push(listener);
    }
}

impl Default for Writer {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Writer {
    fn clone(&self) -> Self {
        Self {
            slab: self.slab.clone(),
            listeners: self.listeners.clone(),
        }
    }
}

/// A readable handle to the reactive store. Cloning produces a new reference to the same
/// backing state.
#[derive(Clone)]
pub struct Store {
    slab: Arc<RwLock<Slab>>,
    listeners: Arc<RwLock<Vec<Box<dyn Fn() + Send + Sync>>>>,
}

impl Store {
    /// Read a non-scoped domain's state.
    pub fn get_domain_state(&self, domain: &str) -> Arc<DomainSnapshotState> {
        self.slab
            .read()
            .domains
            .get(domain)
            .cloned()
            .unwrap_or_else(empty_state)
    }

    /// Read one (domain, scope) state.
    pub fn get_scoped_domain_state(&self, domain: &str, scope: &str) -> Arc<DomainSnapshotState> {
        self.slab
            .read()
            .scoped_domains
            .get(domain)
            .and_then(|m| m.get(scope))
            .cloned()
            .unwrap_or_else(empty_state)
    }

    /// Read the stable, ordered list of scoped entries for a domain.
    pub fn get_scoped_domain_entries(&self, domain: &str) -> ScopedEntries {
        self.slab
            .read()
            .scoped_entries
            .get(domain)
            .cloned()
            .unwrap_or_else(empty_entries)
    }

    /// Subscribe a listener to be invoked after every state change that actually notified.
    pub fn subscribe(&self, listener: Box<dyn Fn() + Send + Sync>) {
        self.listeners.write().push(listener);
    }
}

/// `true` when `status` reflects a domain that has never been loaded.
pub fn is_idle(status: SnapshotStatus) -> bool {
    matches!(status, SnapshotStatus::Idle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn unknown_domain_returns_shared_empty_state() {
        let writer = Writer::new();
        let a = writer.get_domain_state("pods");
        let b = writer.get_domain_state("pods");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.status, SnapshotStatus::Idle);
    }

    #[test]
    fn set_domain_state_notifies_listeners() {
        let writer = Writer::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        writer.subscribe(Box::new(move || {
            count2.fetch_add(1, Ordering::SeqCst);
        }));
        writer.set_domain_state("pods", |prev| {
            let mut next = prev.clone();
            next.status = SnapshotStatus::Ready;
            next
        });
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn scoped_entries_stay_in_sync_with_scoped_domains() {
        let writer = Writer::new();
        writer.set_scoped_domain_state("pods", "cluster-a|ns:team", |prev| {
            let mut next = prev.clone();
            next.status = SnapshotStatus::Ready;
            next
        });
        writer.set_scoped_domain_state("pods", "cluster-b|ns:team", |prev| prev.clone());
        let entries = writer.get_scoped_domain_entries("pods");
        assert_eq!(entries.len(), 2);
        let states = writer.get_scoped_domain_states("pods");
        assert_eq!(states.len(), 2);
    }

    #[test]
    fn resetting_unknown_scope_is_a_noop() {
        let writer = Writer::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        writer.subscribe(Box::new(move || {
            count2.fetch_add(1, Ordering::SeqCst);
        }));
        writer.reset_scoped_domain_state("pods", "cluster-a|");
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn pending_requests_clamped_at_zero() {
        let writer = Writer::new();
        writer.mark_pending_request(-5);
        assert_eq!(writer.pending_requests(), 0);
        writer.mark_pending_request(3);
        assert_eq!(writer.pending_requests(), 3);
    }
}
