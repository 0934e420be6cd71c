//! The settle timer (spec §3/§9, grounded on `server/settle.c`).
//!
//! When the daemon starts, it does not yet know whether it is the first
//! node in a fresh cluster or a joiner connecting to an existing one.
//! It waits [`crate::config::SETTLE_TIMEOUT`]; if no peer has reached
//! [`crate::node::NodeState::Ready`] by then, it assumes the former and
//! claims every bucket under `STARTING_MASK` as a local primary
//! (`founder` in the original).

use std::sync::Arc;

use tracing::info;

use crate::bucket::BucketTable;
use crate::config::SETTLE_TIMEOUT;
use crate::ids::LOCAL_NODE_ID;
use crate::node::NodeRegistry;

/// Runs the settle wait and, if no peer connected in time, founds a new
/// cluster. Returns the resulting bucket table generation -- callers
/// swap it into the shared `Arc<BucketTable>` slot used by the rest of
/// the daemon.
///
/// If a peer becomes `Ready` before the timeout, `buckets` is returned
/// unmodified (empty): ownership of existing buckets is established by
/// the migration protocol instead, once this node requests a share of
/// the cluster's keyspace.
pub async fn settle(buckets: &Arc<BucketTable>, nodes: &Arc<NodeRegistry>) -> bool {
    tokio::time::sleep(SETTLE_TIMEOUT).await;
    if !nodes.ready_peers().is_empty() {
        info!("settle timeout: peer connections present, not founding a new cluster");
        return false;
    }
    info!("settle timeout: no node connections, founding a new cluster");
    let founded = BucketTable::founder(LOCAL_NODE_ID);
    for entry in founded.iter() {
        buckets.insert(entry.value().clone());
    }
    buckets.set_mask(founded.mask());
    true
}
