//! OpenCluster server -- a peer-to-peer, in-memory key-value daemon
//! sharded across a dynamic set of nodes (spec §1).
//!
//! The bucket-management subsystem is the focus: bucket ownership and
//! hashmask distribution ([`bucket`], [`hashmask`]), loadlevel gossip
//! and the migration decision procedure ([`migration`]), the migration
//! protocol's accept/stream/finalize state machine ([`migration`],
//! [`dispatch`]), primary/secondary promotion, and the per-bucket
//! value store with its chained-old-generation split structure
//! ([`store`]). [`node`] and [`connection`] track peers and sockets by
//! stable numeric id (spec §9) rather than by live reference, and
//! [`lifecycle`] sequences startup, the settle timer, background ticks,
//! and shutdown across all of it.

pub mod bucket;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod hashmask;
pub mod ids;
pub mod lifecycle;
pub mod migration;
pub mod node;
pub mod stats;
pub mod store;

pub use config::ServerConfig;
pub use error::{DispatchError, MigrationError, ServerError};
pub use ids::{ConnId, NodeId, LOCAL_NODE_ID};
pub use lifecycle::Server;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crate_loads() {
        assert_eq!(LOCAL_NODE_ID, 0);
    }
}
