//! Live connection bookkeeping for admission control and introspection.
//!
//! Connections are tracked in a `DashMap` keyed by a registry-assigned id.
//! Registration hands back a [`ConnectionGuard`] that removes the entry when
//! the connection task finishes, however it finishes.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;

/// Registry-assigned connection number, shown in logs and `_usage`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

/// Immutable facts about an accepted connection.
#[derive(Debug)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    pub connected_at: Instant,
    requests: AtomicU64,
}

impl ConnectionInfo {
    #[must_use]
    pub fn new(id: ConnectionId, peer: SocketAddr) -> Self {
        Self {
            id,
            peer,
            connected_at: Instant::now(),
            requests: AtomicU64::new(0),
        }
    }

    /// Counts one more request served on this connection.
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of requests served so far.
    #[must_use]
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }
}

/// Thread-safe registry of all admitted connections.
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<ConnectionInfo>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    /// Ids are handed out from 1; 0 never names a live connection.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Admits a connection and returns the guard that owns its slot.
    pub fn register(self: &Arc<Self>, peer: SocketAddr) -> ConnectionGuard {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let info = Arc::new(ConnectionInfo::new(id, peer));
        self.connections.insert(id, Arc::clone(&info));
        ConnectionGuard {
            info,
            registry: Arc::clone(self),
        }
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<ConnectionInfo>> {
        self.connections.get(&id).map(|r| r.value().clone())
    }

    /// Returns the number of admitted connections still open.
    #[must_use]
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Snapshot of open connections, oldest first.
    #[must_use]
    pub fn connections(&self) -> Vec<Arc<ConnectionInfo>> {
        let mut all: Vec<_> = self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        all.sort_by_key(|info| info.id);
        all
    }

    fn remove(&self, id: ConnectionId) {
        self.connections.remove(&id);
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Holds a connection's registry slot; dropping it frees the slot.
#[derive(Debug)]
pub struct ConnectionGuard {
    info: Arc<ConnectionInfo>,
    registry: Arc<ConnectionRegistry>,
}

impl ConnectionGuard {
    #[must_use]
    pub fn info(&self) -> &Arc<ConnectionInfo> {
        &self.info
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.registry.remove(self.info.id);
    }
}
