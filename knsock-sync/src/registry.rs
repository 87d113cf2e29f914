//! Registry of live server connections
//!
//! Owned by the listener and shared with handlers through their
//! [`Context`](crate::listener::Context). One lock guards the whole map; it is
//! never held while a connection does I/O.

use crate::connection::Connection;
use crate::transport::Transport;
use knsock_core::message::Message;
use knsock_core::protocol::CloseCode;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Listener-assigned connection identifier
pub type ConnectionId = u64;

/// One registered connection
#[derive(Debug)]
pub struct Entry<T: Transport = TcpStream> {
    /// Remote address
    pub peer_addr: Option<SocketAddr>,
    /// Request target of the upgrade request
    pub resource: String,
    /// When the handshake completed
    pub connected_at: Instant,
    connection: Connection<T>,
}

impl<T: Transport> Entry<T> {
    /// Handle to the registered connection
    pub fn connection(&self) -> &Connection<T> {
        &self.connection
    }
}

/// Connections currently served by one listener
#[derive(Debug)]
pub struct Registry<T: Transport = TcpStream> {
    connections: Mutex<HashMap<ConnectionId, Entry<T>>>,
    next_id: AtomicU64,
}

impl<T: Transport> Default for Registry<T> {
    fn default() -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<T: Transport> Registry<T> {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection and return its id
    pub fn register(&self, connection: &Connection<T>) -> ConnectionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = Entry {
            peer_addr: connection.peer_addr(),
            resource: connection.resource().to_string(),
            connected_at: Instant::now(),
            connection: connection.clone(),
        };
        self.connections.lock().insert(id, entry);
        id
    }

    /// Remove a connection
    pub fn remove(&self, id: ConnectionId) -> Option<Entry<T>> {
        self.connections.lock().remove(&id)
    }

    /// Look up a connection by id
    pub fn get(&self, id: ConnectionId) -> Option<Connection<T>> {
        self.connections
            .lock()
            .get(&id)
            .map(|entry| entry.connection.clone())
    }

    /// Number of registered connections
    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    /// Whether no connection is registered
    pub fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }

    /// Registered ids in ascending order
    pub fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.connections.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Registered ids with their remote addresses
    pub fn peers(&self) -> Vec<(ConnectionId, Option<SocketAddr>)> {
        let mut peers: Vec<_> = self
            .connections
            .lock()
            .iter()
            .map(|(id, entry)| (*id, entry.peer_addr))
            .collect();
        peers.sort_unstable_by_key(|(id, _)| *id);
        peers
    }

    /// Send a message to every registered connection except `except`
    ///
    /// Returns how many sends succeeded.
    pub fn broadcast(&self, message: &Message, except: Option<ConnectionId>) -> usize {
        self.snapshot()
            .into_iter()
            .filter(|(id, _)| Some(*id) != except)
            .filter(|(id, connection)| match connection.send(message.clone()) {
                Ok(()) => true,
                Err(err) => {
                    tracing::debug!(id, error = %err, "broadcast send failed");
                    false
                }
            })
            .count()
    }

    /// Run the close handshake on every registered connection
    ///
    /// Connections close in parallel, so the whole call is bounded by one
    /// close timeout rather than one per connection.
    pub fn close_all(&self, code: CloseCode, reason: &str) {
        let connections = self.snapshot();
        std::thread::scope(|scope| {
            for (id, connection) in &connections {
                scope.spawn(move || {
                    if let Err(err) = connection.close(code, reason) {
                        tracing::warn!(id, error = %err, "failed to close connection");
                    }
                });
            }
        });
    }

    fn snapshot(&self) -> Vec<(ConnectionId, Connection<T>)> {
        self.connections
            .lock()
            .iter()
            .map(|(id, entry)| (*id, entry.connection.clone()))
            .collect()
    }
}
