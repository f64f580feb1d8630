//! Registry of live server-side connections
//!
//! Every insert, delete and iteration goes through one RwLock, so the
//! accept task and any number of closing connections can race here safely.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::conn::Connection;

/// Maps connection ID to connection for every client between handshake
/// completion and close completion
pub struct Registry {
    clients: RwLock<HashMap<Uuid, Arc<Connection>>>,
}

impl Registry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Register a connection; returns the new client count
    pub async fn insert(&self, conn: Arc<Connection>) -> usize {
        let mut clients = self.clients.write().await;
        clients.insert(conn.id(), conn);
        clients.len()
    }

    /// Deregister a connection; returns the remaining client count.
    /// Removing an absent ID is a no-op.
    pub async fn remove(&self, id: Uuid) -> usize {
        let mut clients = self.clients.write().await;
        clients.remove(&id);
        clients.len()
    }

    /// Look up a connection by ID
    pub async fn get(&self, id: Uuid) -> Option<Arc<Connection>> {
        self.clients.read().await.get(&id).cloned()
    }

    /// Check whether a connection is registered
    pub async fn contains(&self, id: Uuid) -> bool {
        self.clients.read().await.contains_key(&id)
    }

    /// Snapshot of every registered connection.
    ///
    /// The lock is released before returning, so callers may close or write
    /// to the connections without holding it.
    pub async fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.clients.read().await.values().cloned().collect()
    }

    /// Number of registered connections
    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Whether the registry is empty
    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
