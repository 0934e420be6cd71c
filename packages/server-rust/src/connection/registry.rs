//! Connection registry and per-connection send handle.
//!
//! Adapted from the teacher's WebSocket connection registry: bounded
//! mpsc channel per connection for backpressure, lock-free `DashMap` for
//! concurrent tracking. The protocol and metadata differ -- this
//! registry frames raw binary messages rather than MsgPack frames, and a
//! connection is either a client or an unauthenticated-until-`SERVERHELLO`
//! cluster peer, tracked by the stable [`ConnId`] instead of a
//! `ConnectionId` newtype, so buckets and the node registry can hold the
//! id without borrowing the registry (spec §9).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{mpsc, RwLock};

use crate::ids::{ConnId, NodeId};

/// Classifies a connection as either a client or a cluster peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    /// A client application connection (`GET`/`SET`/`DELETE`).
    Client,
    /// An inter-node cluster peer connection (`HELLO`/`SERVERHELLO`
    /// onward).
    Peer,
}

/// A framed outbound message: either a fully encoded wire frame, or a
/// request to close the socket.
#[derive(Debug)]
pub enum OutboundMessage {
    Frame(Vec<u8>),
    Close,
}

/// Error returned when sending a message to a connection fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    Timeout,
    Disconnected,
}

/// Handle to a single connection: the sender half of its outbound
/// channel plus mutable metadata. The receiver half is held by the
/// socket's write loop.
#[derive(Debug)]
pub struct ConnectionHandle {
    pub id: ConnId,
    pub tx: mpsc::Sender<OutboundMessage>,
    pub metadata: Arc<RwLock<ConnectionMetadata>>,
    pub connected_at: Instant,
    pub kind: ConnectionKind,
}

impl ConnectionHandle {
    /// Enqueues a message without blocking. Returns `false` if the
    /// channel is full or the connection is closed.
    #[must_use]
    pub fn try_send(&self, msg: OutboundMessage) -> bool {
        self.tx.try_send(msg).is_ok()
    }

    pub async fn send_timeout(&self, msg: OutboundMessage, timeout: Duration) -> Result<(), SendError> {
        match tokio::time::timeout(timeout, self.tx.send(msg)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SendError::Disconnected),
            Err(_) => Err(SendError::Timeout),
        }
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Mutable per-connection state: authentication and liveness tracking
/// (spec §4.8, §5).
#[derive(Debug)]
pub struct ConnectionMetadata {
    /// `true` once a client has sent `HELLO`, or a peer has completed
    /// the `SERVERHELLO` auth-secret exchange.
    pub authenticated: bool,
    /// For a peer connection, the remote node's stable id once known.
    pub peer_node_id: Option<NodeId>,
    /// Last time any message (including `PING`) was received.
    pub last_activity: Instant,
    /// Outstanding request userids awaiting a reply, for timeout
    /// tracking (spec §5).
    pub in_flight: u32,
}

impl Default for ConnectionMetadata {
    fn default() -> Self {
        Self { authenticated: false, peer_node_id: None, last_activity: Instant::now(), in_flight: 0 }
    }
}

/// Registry of every open connection, client or peer.
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnId, Arc<ConnectionHandle>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    /// Connection ids start at 1; 0 is reserved as "no connection"
    /// (mirrors node ids, spec §9).
    #[must_use]
    pub fn new() -> Self {
        Self { connections: DashMap::new(), next_id: AtomicU64::new(1) }
    }

    pub fn register(&self, kind: ConnectionKind, channel_capacity: usize) -> (Arc<ConnectionHandle>, mpsc::Receiver<OutboundMessage>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(channel_capacity);
        let handle = Arc::new(ConnectionHandle {
            id,
            tx,
            metadata: Arc::new(RwLock::new(ConnectionMetadata::default())),
            connected_at: Instant::now(),
            kind,
        });
        self.connections.insert(id, Arc::clone(&handle));
        (handle, rx)
    }

    pub fn remove(&self, id: ConnId) -> Option<Arc<ConnectionHandle>> {
        self.connections.remove(&id).map(|(_, handle)| handle)
    }

    #[must_use]
    pub fn get(&self, id: ConnId) -> Option<Arc<ConnectionHandle>> {
        self.connections.get(&id).map(|r| Arc::clone(r.value()))
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn count_by_kind(&self, kind: ConnectionKind) -> usize {
        self.connections.iter().filter(|entry| entry.value().kind == kind).count()
    }

    #[must_use]
    pub fn connections(&self) -> Vec<Arc<ConnectionHandle>> {
        self.connections.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    /// Removes and returns every connection, for graceful shutdown.
    pub fn drain_all(&self) -> Vec<Arc<ConnectionHandle>> {
        let keys: Vec<ConnId> = self.connections.iter().map(|e| *e.key()).collect();
        keys.into_iter().filter_map(|key| self.connections.remove(&key).map(|(_, h)| h)).collect()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_assigns_ids_starting_at_one() {
        let registry = ConnectionRegistry::new();
        let (h1, _rx1) = registry.register(ConnectionKind::Client, 8);
        let (h2, _rx2) = registry.register(ConnectionKind::Peer, 8);
        assert_eq!(h1.id, 1);
        assert_eq!(h2.id, 2);
        assert_eq!(registry.count(), 2);
        assert_eq!(registry.count_by_kind(ConnectionKind::Client), 1);
        assert_eq!(registry.count_by_kind(ConnectionKind::Peer), 1);
    }

    #[test]
    fn remove_and_get() {
        let registry = ConnectionRegistry::new();
        let (h, _rx) = registry.register(ConnectionKind::Client, 8);
        assert!(registry.get(h.id).is_some());
        assert!(registry.remove(h.id).is_some());
        assert!(registry.get(h.id).is_none());
        assert!(registry.remove(h.id).is_none());
    }

    #[test]
    fn try_send_fails_once_channel_is_full_or_closed() {
        let registry = ConnectionRegistry::new();
        let (handle, rx) = registry.register(ConnectionKind::Client, 1);
        assert!(handle.try_send(OutboundMessage::Frame(vec![1])));
        assert!(!handle.try_send(OutboundMessage::Frame(vec![2])));
        drop(rx);
        assert!(!handle.try_send(OutboundMessage::Frame(vec![3])));
        assert!(!handle.is_connected());
    }

    #[tokio::test]
    async fn send_timeout_reports_disconnect() {
        let registry = ConnectionRegistry::new();
        let (handle, rx) = registry.register(ConnectionKind::Client, 1);
        drop(rx);
        let result = handle.send_timeout(OutboundMessage::Frame(vec![1]), Duration::from_millis(10)).await;
        assert_eq!(result, Err(SendError::Disconnected));
    }

    #[test]
    fn drain_all_empties_the_registry() {
        let registry = ConnectionRegistry::new();
        let (_h1, _rx1) = registry.register(ConnectionKind::Client, 8);
        let (_h2, _rx2) = registry.register(ConnectionKind::Peer, 8);
        let drained = registry.drain_all();
        assert_eq!(drained.len(), 2);
        assert_eq!(registry.count(), 0);
    }
}
