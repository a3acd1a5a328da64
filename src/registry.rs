//! Connection registry
//!
//! Tracks every admitted connection, keyed by `ConnId`. Only the event
//! loop mutates it, between and during its phases; iteration always goes
//! through a `snapshot` of ids so removals never invalidate it.

use std::collections::HashMap;

use crate::connection::Connection;
use crate::types::ConnId;

/// Set of admitted connections
///
/// Invariant: every member completed a presence handshake and has not
/// been closed.
#[derive(Debug, Default)]
pub struct Registry {
    /// All admitted connections: ConnId -> (admission order, Connection)
    connections: HashMap<ConnId, (u64, Connection)>,
    /// Admission counter
    next_seq: u64,
}

impl Registry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a connection
    ///
    /// Returns false if a connection with the same id is already present.
    pub fn add(&mut self, conn: Connection) -> bool {
        if self.connections.contains_key(&conn.id) {
            return false;
        }
        self.connections.insert(conn.id, (self.next_seq, conn));
        self.next_seq += 1;
        true
    }

    /// Remove a connection, handing it back to the caller
    ///
    /// Idempotent: removing an absent id is a no-op returning `None`.
    /// Dropping the returned value closes the socket.
    pub fn remove(&mut self, id: &ConnId) -> Option<Connection> {
        self.connections.remove(id).map(|(_, conn)| conn)
    }

    /// Point-in-time copy of member ids, in admission order
    pub fn snapshot(&self) -> Vec<ConnId> {
        let mut members: Vec<(u64, ConnId)> = self
            .connections
            .iter()
            .map(|(id, (seq, _))| (*seq, *id))
            .collect();
        members.sort_unstable();
        members.into_iter().map(|(_, id)| id).collect()
    }

    pub fn get(&self, id: &ConnId) -> Option<&Connection> {
        self.connections.get(id).map(|(_, conn)| conn)
    }

    pub fn get_mut(&mut self, id: &ConnId) -> Option<&mut Connection> {
        self.connections.get_mut(id).map(|(_, conn)| conn)
    }

    pub fn contains(&self, id: &ConnId) -> bool {
        self.connections.contains_key(id)
    }

    /// Get the number of admitted connections
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::pair;

    #[tokio::test]
    async fn test_add_and_get() {
        let mut registry = Registry::new();
        let (conn, _client) = pair("alice").await;
        let id = conn.id;

        assert!(registry.add(conn));
        assert!(registry.contains(&id));
        assert_eq!(registry.get(&id).unwrap().display_name(), "alice");
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let mut registry = Registry::new();
        let (first, _c1) = pair("alice").await;
        let (mut second, _c2) = pair("bob").await;
        second.id = first.id;

        assert!(registry.add(first));
        assert!(!registry.add(second));
        let only = registry.snapshot();
        assert_eq!(only.len(), 1);
        assert_eq!(registry.get(&only[0]).unwrap().display_name(), "alice");
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let mut registry = Registry::new();
        let (conn, _client) = pair("alice").await;
        let (other, _other_client) = pair("bob").await;
        let id = conn.id;
        let other_id = other.id;
        registry.add(conn);
        registry.add(other);

        assert!(registry.remove(&id).is_some());
        let after_once = registry.snapshot();
        assert!(registry.remove(&id).is_none());
        assert_eq!(registry.snapshot(), after_once);
        assert_eq!(after_once, vec![other_id]);
    }

    #[tokio::test]
    async fn test_snapshot_survives_mutation() {
        let mut registry = Registry::new();
        let mut clients = Vec::new();
        for name in ["a", "b", "c"] {
            let (conn, client) = pair(name).await;
            registry.add(conn);
            clients.push(client);
        }

        let snapshot = registry.snapshot();
        let names: Vec<String> = snapshot
            .iter()
            .map(|id| registry.get(id).unwrap().display_name().to_string())
            .collect();
        assert_eq!(names, ["a", "b", "c"]);

        for id in &snapshot {
            registry.remove(id);
        }
        assert!(registry.is_empty());
        assert_eq!(snapshot.len(), 3);
    }

    #[tokio::test]
    async fn test_remove_closes_socket() {
        use tokio::io::AsyncReadExt;

        let mut registry = Registry::new();
        let (conn, mut client) = pair("alice").await;
        let id = conn.id;
        registry.add(conn);

        drop(registry.remove(&id));
        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }
}
