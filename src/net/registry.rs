//! Identity -> session map.
//!
//! At most one session per peer IP. Accepting a new session for an
//! identity that already has one evicts the old one inside the same
//! critical section, so two sessions can never both be registered.
//! Removal is guarded by generation: a late teardown of an evicted session
//! cannot unregister its successor.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::canvas::ServerStats;

use super::session::ClientHandle;

/// Registry of live sessions, keyed by peer IP.
#[derive(Debug)]
pub struct ConnectionRegistry {
    sessions: Mutex<HashMap<IpAddr, ClientHandle>>,
    next_generation: AtomicU64,
    stats: Arc<ServerStats>,
}

impl ConnectionRegistry {
    /// Create an empty registry that keeps `stats.clients` current.
    pub fn new(stats: Arc<ServerStats>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            stats,
        }
    }

    /// Allocate a generation number for a new session.
    pub fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    /// Register `handle` under its identity.
    ///
    /// If another session held the identity it is evicted (asked to close)
    /// and returned so the caller can wait for its socket to close.
    pub fn accept(&self, handle: ClientHandle) -> Option<ClientHandle> {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = sessions.insert(handle.identity(), handle);
        if let Some(old) = &previous {
            old.evict();
        }
        self.stats.set_clients(sessions.len());
        previous
    }

    /// Unregister `identity` if it is still held by `generation`.
    ///
    /// Returns whether an entry was removed.
    pub fn remove(&self, identity: IpAddr, generation: u64) -> bool {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let owned = sessions
            .get(&identity)
            .is_some_and(|h| h.generation() == generation);
        if owned {
            sessions.remove(&identity);
            self.stats.set_clients(sessions.len());
        }
        owned
    }

    /// Session currently registered for `identity`.
    pub fn get(&self, identity: IpAddr) -> Option<ClientHandle> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&identity)
            .cloned()
    }

    /// Snapshot of all registered sessions.
    pub fn handles(&self) -> Vec<ClientHandle> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Number of registered sessions.
    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no session is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio_util::sync::CancellationToken;

    fn handle(registry: &ConnectionRegistry, addr: &str) -> ClientHandle {
        let peer: SocketAddr = addr.parse().unwrap();
        let (h, _rx) = ClientHandle::new(peer, registry.next_generation(), CancellationToken::new());
        h
    }

    #[test]
    fn test_accept_and_remove() {
        let stats = Arc::new(ServerStats::default());
        let registry = ConnectionRegistry::new(Arc::clone(&stats));
        let a = handle(&registry, "10.0.0.1:5000");
        assert!(registry.accept(a.clone()).is_none());
        assert_eq!(stats.clients(), 1);
        assert!(registry.get(a.identity()).is_some());

        assert!(registry.remove(a.identity(), a.generation()));
        assert!(registry.is_empty());
        assert_eq!(stats.clients(), 0);
    }

    #[test]
    fn test_same_ip_evicts_previous() {
        let stats = Arc::new(ServerStats::default());
        let registry = ConnectionRegistry::new(Arc::clone(&stats));
        let first = handle(&registry, "10.0.0.1:5000");
        let second = handle(&registry, "10.0.0.1:6000");

        registry.accept(first.clone());
        let evicted = registry.accept(second.clone()).expect("first should be evicted");
        assert!(evicted.same_session(&first));
        assert_eq!(registry.len(), 1);
        assert_eq!(stats.clients(), 1);

        // The evicted session's teardown must not unregister its successor.
        assert!(!registry.remove(first.identity(), first.generation()));
        let current = registry.get(second.identity()).unwrap();
        assert!(current.same_session(&second));
    }

    #[test]
    fn test_distinct_ips_coexist() {
        let registry = ConnectionRegistry::new(Arc::new(ServerStats::default()));
        registry.accept(handle(&registry, "10.0.0.1:5000"));
        registry.accept(handle(&registry, "10.0.0.2:5000"));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.handles().len(), 2);
    }

    #[test]
    fn test_generations_increase() {
        let registry = ConnectionRegistry::new(Arc::new(ServerStats::default()));
        let a = registry.next_generation();
        let b = registry.next_generation();
        assert!(b > a);
    }
}
