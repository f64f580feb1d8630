//! Namespaces
//!
//! A namespace is a named subset of connections with named child
//! namespaces beneath it. Broadcasting to a namespace reaches its own
//! members and, recursively, the members of every descendant. Membership is
//! independent of connection lifecycle: closing a connection does not remove
//! it from any namespace.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::conn::Connection;
use crate::protocol::Opcode;

/// A named group of connections arranged in a tree
pub struct Namespace {
    name: String,
    clients: RwLock<HashMap<Uuid, Arc<Connection>>>,
    children: RwLock<HashMap<String, Arc<Namespace>>>,
}

impl Namespace {
    /// Create an empty namespace
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            clients: RwLock::new(HashMap::new()),
            children: RwLock::new(HashMap::new()),
        })
    }

    /// Get the namespace name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a direct member
    pub async fn add_client(&self, conn: &Arc<Connection>) {
        self.clients.write().await.insert(conn.id(), Arc::clone(conn));
    }

    /// Remove a direct member; returns whether it was present
    pub async fn remove_client(&self, conn: &Connection) -> bool {
        self.clients.write().await.remove(&conn.id()).is_some()
    }

    /// Check direct membership
    pub async fn contains_client(&self, id: Uuid) -> bool {
        self.clients.read().await.contains_key(&id)
    }

    /// Number of direct members
    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Attach `child` under its name, replacing any child of the same name
    pub async fn add_child(&self, child: Arc<Namespace>) {
        self.children.write().await.insert(child.name.clone(), child);
    }

    /// Detach the child named `name` together with its whole subtree.
    /// Members of the subtree are left untouched.
    pub async fn remove_child(&self, name: &str) -> Option<Arc<Namespace>> {
        self.children.write().await.remove(name)
    }

    /// Look up a direct child by name
    pub async fn child(&self, name: &str) -> Option<Arc<Namespace>> {
        self.children.read().await.get(name).cloned()
    }

    /// Broadcast `message` as a Binary frame; see [`Namespace::broadcast`]
    pub async fn write(&self, message: &[u8]) -> usize {
        self.broadcast(Opcode::Binary, message).await
    }

    /// Broadcast `message` as a Text frame; see [`Namespace::broadcast`]
    pub async fn write_text(&self, message: &str) -> usize {
        self.broadcast(Opcode::Text, message.as_bytes()).await
    }

    /// Send one frame to every member of this namespace and of every
    /// descendant, each on its own task.
    ///
    /// Deliveries are per membership path: a connection that belongs to
    /// this namespace and to a descendant receives the message once for
    /// each, as do members of a namespace reachable through two parents.
    /// A namespace that is its own ancestor is not entered again.
    /// Returns the number of deliveries started.
    pub async fn broadcast(&self, opcode: Opcode, message: &[u8]) -> usize {
        let payload: Arc<[u8]> = Arc::from(message);
        let root = self as *const Namespace as usize;
        let mut delivered = self.send_to_members(opcode, &payload).await;

        // Each pending node carries the path of ancestors that led to it
        let mut pending: Vec<(Arc<Namespace>, Vec<usize>)> = self
            .children
            .read()
            .await
            .values()
            .map(|child| (Arc::clone(child), vec![root]))
            .collect();

        while let Some((node, mut path)) = pending.pop() {
            let ptr = Arc::as_ptr(&node) as usize;
            if path.contains(&ptr) {
                continue;
            }
            delivered += node.send_to_members(opcode, &payload).await;

            path.push(ptr);
            for child in node.children.read().await.values() {
                pending.push((Arc::clone(child), path.clone()));
            }
        }

        debug!("Namespace {} broadcast to {} members", self.name, delivered);
        delivered
    }

    async fn send_to_members(&self, opcode: Opcode, payload: &Arc<[u8]>) -> usize {
        let members: Vec<Arc<Connection>> = self.clients.read().await.values().cloned().collect();
        for conn in &members {
            let conn = Arc::clone(conn);
            let payload = Arc::clone(payload);
            tokio::spawn(async move {
                if let Err(e) = conn.write_frame(opcode, &payload).await {
                    warn!("Namespace write to connection {} failed: {}", conn.id(), e);
                }
            });
        }
        members.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::conn::Incoming;
    use crate::protocol::Role;
    use std::time::Duration;

    /// Server-role member plus the client end that observes its writes
    fn member() -> (Arc<Connection>, Arc<Connection>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (
            Connection::from_stream(a, Role::Server, ConnectionConfig::default()),
            Connection::from_stream(b, Role::Client, ConnectionConfig::default()),
        )
    }

    async fn expect_message(observer: &Arc<Connection>, expected: &[u8]) {
        let incoming = tokio::time::timeout(Duration::from_secs(2), observer.read_message())
            .await
            .expect("no message delivered")
            .unwrap();
        assert_eq!(incoming, Incoming::Message(expected.to_vec()));
    }

    #[tokio::test]
    async fn test_membership() {
        let ns = Namespace::new("lobby");
        let (conn, _observer) = member();

        ns.add_client(&conn).await;
        assert!(ns.contains_client(conn.id()).await);
        assert_eq!(ns.client_count().await, 1);

        assert!(ns.remove_client(&conn).await);
        assert!(!ns.remove_client(&conn).await);
        assert_eq!(ns.client_count().await, 0);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_descendants() {
        let root = Namespace::new("root");
        let child = Namespace::new("child");
        let grandchild = Namespace::new("grandchild");
        child.add_child(Arc::clone(&grandchild)).await;
        root.add_child(Arc::clone(&child)).await;

        let (a, observer_a) = member();
        let (b, observer_b) = member();
        root.add_client(&a).await;
        grandchild.add_client(&b).await;

        assert_eq!(root.write(b"hello").await, 2);
        expect_message(&observer_a, b"hello").await;
        expect_message(&observer_b, b"hello").await;

        // Broadcasting to a child does not reach the parent
        assert_eq!(grandchild.write(b"deep").await, 1);
        expect_message(&observer_b, b"deep").await;
    }

    #[tokio::test]
    async fn test_double_membership_receives_twice() {
        let parent = Namespace::new("parent");
        let child = Namespace::new("child");
        parent.add_child(Arc::clone(&child)).await;

        let (conn, observer) = member();
        parent.add_client(&conn).await;
        child.add_client(&conn).await;

        assert_eq!(parent.write(b"twice").await, 2);
        expect_message(&observer, b"twice").await;
        expect_message(&observer, b"twice").await;
    }

    #[tokio::test]
    async fn test_remove_child_detaches_subtree() {
        let root = Namespace::new("root");
        let child = Namespace::new("child");
        let grandchild = Namespace::new("grandchild");
        child.add_child(Arc::clone(&grandchild)).await;
        root.add_child(Arc::clone(&child)).await;

        let (conn, _observer) = member();
        grandchild.add_client(&conn).await;

        let removed = root.remove_child("child").await.unwrap();
        assert_eq!(removed.name(), "child");
        assert!(root.child("child").await.is_none());
        assert_eq!(root.write(b"nobody").await, 0);

        // The detached subtree keeps its own members
        assert!(grandchild.contains_client(conn.id()).await);
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_shared_child_receives_once_per_parent() {
        let root = Namespace::new("root");
        let left = Namespace::new("left");
        let right = Namespace::new("right");
        let shared = Namespace::new("shared");
        left.add_child(Arc::clone(&shared)).await;
        right.add_child(Arc::clone(&shared)).await;
        root.add_child(Arc::clone(&left)).await;
        root.add_child(Arc::clone(&right)).await;

        let (conn, observer) = member();
        shared.add_client(&conn).await;

        assert_eq!(root.write(b"both ways").await, 2);
        expect_message(&observer, b"both ways").await;
        expect_message(&observer, b"both ways").await;
    }

    #[tokio::test]
    async fn test_cyclic_tree_terminates() {
        let a = Namespace::new("a");
        let b = Namespace::new("b");
        a.add_child(Arc::clone(&b)).await;
        b.add_child(Arc::clone(&a)).await;

        let (conn, _observer) = member();
        b.add_client(&conn).await;
        assert_eq!(a.write(b"loop").await, 1);

        // Break the cycle so both nodes can be dropped
        b.remove_child("a").await;
    }
}
