//! Registry of live connections.
//!
//! Backed by a slab so every connection gets a stable identifier that doubles
//! as its readiness token. Only the event loop thread touches it.

use crate::runtime::connection::Connection;
use slab::Slab;
use std::time::Instant;

/// Registry of active connections using slab allocation.
///
/// Provides O(1) insert, lookup, and remove operations.
pub struct ConnectionRegistry<S> {
    connections: Slab<Connection<S>>,
}

impl<S> ConnectionRegistry<S> {
    /// Create a new registry sized for `capacity` connections.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            connections: Slab::with_capacity(capacity),
        }
    }

    /// Insert a connection, returning its identifier.
    pub fn insert(&mut self, conn: Connection<S>) -> usize {
        self.connections.insert(conn)
    }

    /// Identifier the next `insert` will hand out.
    pub fn next_id(&self) -> usize {
        self.connections.vacant_key()
    }

    /// Get a mutable reference to a connection.
    pub fn get_mut(&mut self, id: usize) -> Option<&mut Connection<S>> {
        self.connections.get_mut(id)
    }

    /// Remove a connection. Returns `None` if it was already removed.
    pub fn remove(&mut self, id: usize) -> Option<Connection<S>> {
        self.connections.try_remove(id)
    }

    /// Check if a connection exists.
    #[cfg(test)]
    pub fn contains(&self, id: usize) -> bool {
        self.connections.contains(id)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Check if there are no connections.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Identifiers of every live connection.
    pub fn ids(&self) -> Vec<usize> {
        self.connections.iter().map(|(id, _)| id).collect()
    }

    /// Earliest read deadline among all connections.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.connections
            .iter()
            .filter_map(|(_, conn)| conn.deadline())
            .min()
    }

    /// Identifiers of connections whose read deadline has passed at `now`.
    pub fn expired(&self, now: Instant) -> Vec<usize> {
        self.connections
            .iter()
            .filter(|(_, conn)| conn.deadline().is_some_and(|deadline| now >= deadline))
            .map(|(id, _)| id)
            .collect()
    }
}
