//! Stable numeric identifiers for nodes and connections.
//!
//! Spec §9 calls out the original's cyclic pointer graph between
//! buckets/nodes/clients and asks for numeric ids instead: nodes own a
//! stable `NodeId`, connections a `ConnId`, and buckets reference peers
//! by `NodeId` rather than holding a live reference. Lookups go through
//! [`crate::node::NodeRegistry`] / [`crate::connection::ConnectionRegistry`]
//! and tolerate the id being stale (node gone, connection closed).

/// Stable identifier for a cluster node, assigned on first contact.
pub type NodeId = u64;

/// Identifier for a single TCP connection (client or peer).
pub type ConnId = u64;

/// Reserved id for this process itself, so buckets and the hashmask
/// table can name "the local node" as an ordinary [`NodeId`] rather than
/// an `Option<NodeId>` special case. Peers are assigned ids starting at
/// 1 by [`crate::node::NodeRegistry::register`].
pub const LOCAL_NODE_ID: NodeId = 0;
