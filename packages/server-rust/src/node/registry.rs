//! Node state machine and registry.
//!
//! Grounded on the teacher's `cluster/types.rs` `MemberInfo`/`NodeState`
//! shape (a `DashMap` of per-member records plus a name index) and
//! `cluster/failure_detector.rs`'s `DeadlineFailureDetector` idiom,
//! adapted to spec §4.8's explicit state machine (`unknown ->
//! initialized -> connecting -> authenticating -> authenticated ->
//! ready`) and §5's fixed idle-timeout liveness model rather than the
//! teacher's phi-accrual statistics, which this spec does not call for.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use opencluster_core::ConnInfo;
use parking_lot::RwLock;

use crate::ids::{ConnId, NodeId};

/// A peer's connection state machine (spec §4.8).
///
/// Valid forward transitions are `Unknown -> Initialized -> Connecting
/// -> Authenticating -> Authenticated -> Ready`. The only backward edge
/// is `Connecting -> Unknown`, taken on a refused or timed-out connect
/// attempt, after which the node-wait backoff timer retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Unknown,
    Initialized,
    Connecting,
    Authenticating,
    Authenticated,
    Ready,
}

impl NodeState {
    /// `true` for `Ready`, the only state from which a peer participates
    /// in loadlevel gossip and migration.
    #[must_use]
    pub const fn is_ready(self) -> bool {
        matches!(self, Self::Ready)
    }
}

/// Cached loadlevel gossip for a peer (spec §4.3): `{primary_count,
/// secondary_count, bucket_transfer_flag}`, as carried by a
/// `LOADLEVELS` reply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadLevel {
    pub primary_count: u32,
    pub secondary_count: u32,
    pub transferring: bool,
}

impl LoadLevel {
    #[must_use]
    pub const fn total(self) -> u32 {
        self.primary_count + self.secondary_count
    }
}

/// Mutable per-node bookkeeping, behind a lock since it's updated from
/// the connection-read path and read from the migration decision tick.
#[derive(Debug)]
pub struct NodeMutable {
    pub state: NodeState,
    pub conn_id: Option<ConnId>,
    pub loadlevel: LoadLevel,
    pub last_contact: Instant,
    pub retry_count: u32,
}

/// A single known peer: stable id, conninfo, and its current state.
#[derive(Debug)]
pub struct NodeHandle {
    pub id: NodeId,
    pub conninfo: ConnInfo,
    inner: RwLock<NodeMutable>,
}

impl NodeHandle {
    #[must_use]
    pub fn state(&self) -> NodeState {
        self.inner.read().state
    }

    pub fn set_state(&self, state: NodeState) {
        self.inner.write().state = state;
    }

    #[must_use]
    pub fn conn_id(&self) -> Option<ConnId> {
        self.inner.read().conn_id
    }

    pub fn set_conn_id(&self, conn_id: Option<ConnId>) {
        self.inner.write().conn_id = conn_id;
    }

    #[must_use]
    pub fn loadlevel(&self) -> LoadLevel {
        self.inner.read().loadlevel
    }

    pub fn record_loadlevel(&self, loadlevel: LoadLevel) {
        let mut inner = self.inner.write();
        inner.loadlevel = loadlevel;
        inner.last_contact = Instant::now();
    }

    /// Marks this peer as just having contacted us (any message, not
    /// just a loadlevel reply), resetting retry backoff.
    pub fn touch(&self) {
        let mut inner = self.inner.write();
        inner.last_contact = Instant::now();
        inner.retry_count = 0;
    }

    #[must_use]
    pub fn last_contact(&self) -> Instant {
        self.inner.read().last_contact
    }

    /// Moves `Connecting -> Unknown` and bumps the retry counter, per
    /// spec §4.8's backoff-and-retry edge.
    pub fn mark_connect_failed(&self) {
        let mut inner = self.inner.write();
        inner.state = NodeState::Unknown;
        inner.conn_id = None;
        inner.retry_count += 1;
    }

    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.inner.read().retry_count
    }
}

/// Registry of every known peer, keyed by stable [`NodeId`] and indexed
/// by normalized conninfo name for idempotent re-registration (spec §9
/// Open Question (b): conninfo equality is byte-equality of the
/// normalized string).
#[derive(Debug)]
pub struct NodeRegistry {
    nodes: DashMap<NodeId, Arc<NodeHandle>>,
    by_name: DashMap<String, NodeId>,
    next_id: AtomicU64,
}

impl NodeRegistry {
    /// Peer ids start at 1; 0 is [`crate::ids::LOCAL_NODE_ID`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: DashMap::new(),
            by_name: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a peer by conninfo, returning its existing id if one
    /// is already known (matched by normalized conninfo string) or
    /// allocating a fresh one in `Unknown` state.
    pub fn register(&self, conninfo: ConnInfo) -> Arc<NodeHandle> {
        let name = conninfo.normalized();
        if let Some(id) = self.by_name.get(&name) {
            if let Some(handle) = self.nodes.get(&*id) {
                return Arc::clone(&handle);
            }
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = Arc::new(NodeHandle {
            id,
            conninfo,
            inner: RwLock::new(NodeMutable {
                state: NodeState::Unknown,
                conn_id: None,
                loadlevel: LoadLevel::default(),
                last_contact: Instant::now(),
                retry_count: 0,
            }),
        });
        self.nodes.insert(id, Arc::clone(&handle));
        self.by_name.insert(name, id);
        handle
    }

    #[must_use]
    pub fn get(&self, id: NodeId) -> Option<Arc<NodeHandle>> {
        self.nodes.get(&id).map(|r| Arc::clone(r.value()))
    }

    #[must_use]
    pub fn by_name(&self, name: &str) -> Option<Arc<NodeHandle>> {
        let id = *self.by_name.get(name)?;
        self.get(id)
    }

    #[must_use]
    pub fn by_conn_id(&self, conn_id: ConnId) -> Option<Arc<NodeHandle>> {
        self.nodes.iter().find(|e| e.value().conn_id() == Some(conn_id)).map(|e| Arc::clone(e.value()))
    }

    pub fn remove(&self, id: NodeId) -> Option<Arc<NodeHandle>> {
        let removed = self.nodes.remove(&id).map(|(_, handle)| handle);
        if let Some(handle) = &removed {
            self.by_name.remove(&handle.conninfo.normalized());
        }
        removed
    }

    /// All peers currently in [`NodeState::Ready`].
    #[must_use]
    pub fn ready_peers(&self) -> Vec<Arc<NodeHandle>> {
        self.nodes.iter().filter(|e| e.value().state().is_ready()).map(|e| Arc::clone(e.value())).collect()
    }

    /// Every known peer, regardless of state, for the reconnect loop.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<NodeHandle>> {
        self.nodes.iter().map(|e| Arc::clone(e.value())).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Total active node count `N` used by the migration decision
    /// procedure (spec §4.4): every ready peer, plus this node itself.
    #[must_use]
    pub fn active_node_count(&self) -> u32 {
        u32::try_from(self.ready_peers().len()).unwrap_or(u32::MAX).saturating_add(1)
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(name: &str) -> ConnInfo {
        ConnInfo::new(name, "127.0.0.1", Some(13600))
    }

    #[test]
    fn register_assigns_ids_starting_at_one() {
        let registry = NodeRegistry::new();
        let a = registry.register(info("node-a"));
        let b = registry.register(info("node-b"));
        assert_eq!(a.id, 1);
        assert_eq!(b.id, 2);
    }

    #[test]
    fn re_registering_the_same_conninfo_returns_the_same_node() {
        let registry = NodeRegistry::new();
        let a = registry.register(info("node-a"));
        let a2 = registry.register(info("node-a"));
        assert_eq!(a.id, a2.id);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn state_transitions_and_ready_peers() {
        let registry = NodeRegistry::new();
        let a = registry.register(info("node-a"));
        assert_eq!(a.state(), NodeState::Unknown);
        assert!(registry.ready_peers().is_empty());

        a.set_state(NodeState::Ready);
        assert_eq!(registry.ready_peers().len(), 1);
        assert_eq!(registry.active_node_count(), 2); // peer + local
    }

    #[test]
    fn connect_failure_resets_to_unknown_and_counts_retries() {
        let registry = NodeRegistry::new();
        let a = registry.register(info("node-a"));
        a.set_state(NodeState::Connecting);
        a.mark_connect_failed();
        assert_eq!(a.state(), NodeState::Unknown);
        assert_eq!(a.retry_count(), 1);
    }

    #[test]
    fn by_name_and_by_conn_id_lookup() {
        let registry = NodeRegistry::new();
        let a = registry.register(info("node-a"));
        a.set_conn_id(Some(7));
        assert_eq!(registry.by_name("node-a").unwrap().id, a.id);
        assert_eq!(registry.by_conn_id(7).unwrap().id, a.id);
        assert!(registry.by_conn_id(99).is_none());
    }

    #[test]
    fn remove_clears_both_indices() {
        let registry = NodeRegistry::new();
        let a = registry.register(info("node-a"));
        assert!(registry.remove(a.id).is_some());
        assert!(registry.by_name("node-a").is_none());
        assert!(registry.get(a.id).is_none());
    }
}
