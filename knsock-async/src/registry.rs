//! Registry of live server connections
//!
//! Confined to the listener's `LocalSet`: a clonable `Rc` handle with no
//! locking. Shutdown does not go through the registry; every connection
//! observes the listener's shutdown channel on its own.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Instant;

/// Listener-assigned connection identifier
pub type ConnectionId = u64;

/// One registered connection
#[derive(Debug, Clone)]
pub struct Entry {
    /// Remote address
    pub peer_addr: Option<SocketAddr>,
    /// Request target of the upgrade request
    pub resource: String,
    /// When the handshake completed
    pub connected_at: Instant,
}

/// Connections currently served by one listener
#[derive(Debug, Clone)]
pub struct Registry {
    connections: Rc<RefCell<HashMap<ConnectionId, Entry>>>,
    next_id: Rc<Cell<ConnectionId>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            connections: Rc::new(RefCell::new(HashMap::new())),
            next_id: Rc::new(Cell::new(1)),
        }
    }
}

impl Registry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection and return its id
    pub fn register(&self, peer_addr: Option<SocketAddr>, resource: impl Into<String>) -> ConnectionId {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        let entry = Entry {
            peer_addr,
            resource: resource.into(),
            connected_at: Instant::now(),
        };
        self.connections.borrow_mut().insert(id, entry);
        id
    }

    /// Remove a connection
    pub fn remove(&self, id: ConnectionId) -> Option<Entry> {
        self.connections.borrow_mut().remove(&id)
    }

    /// Look up a connection by id
    pub fn get(&self, id: ConnectionId) -> Option<Entry> {
        self.connections.borrow().get(&id).cloned()
    }

    /// Number of registered connections
    pub fn len(&self) -> usize {
        self.connections.borrow().len()
    }

    /// Whether no connection is registered
    pub fn is_empty(&self) -> bool {
        self.connections.borrow().is_empty()
    }

    /// Registered ids in ascending order
    pub fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.connections.borrow().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Registered ids with their remote addresses
    pub fn peers(&self) -> Vec<(ConnectionId, Option<SocketAddr>)> {
        let mut peers: Vec<_> = self
            .connections
            .borrow()
            .iter()
            .map(|(id, entry)| (*id, entry.peer_addr))
            .collect();
        peers.sort_unstable_by_key(|(id, _)| *id);
        peers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_remove() {
        let registry = Registry::new();
        let peer: SocketAddr = "127.0.0.1:4000".parse().unwrap();

        let id1 = registry.register(Some(peer), "/chat");
        let id2 = registry.register(None, "/");
        assert_ne!(id1, id2);
        assert_eq!(registry.ids(), vec![id1, id2]);
        assert_eq!(registry.peers(), vec![(id1, Some(peer)), (id2, None)]);
        assert_eq!(registry.get(id1).unwrap().resource, "/chat");

        assert!(registry.remove(id1).is_some());
        assert!(registry.remove(id1).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_clones_share_state() {
        let registry = Registry::new();
        let shared = registry.clone();

        let id = shared.register(None, "/");
        assert_eq!(registry.len(), 1);
        registry.remove(id);
        assert!(shared.is_empty());
    }
}
