//! Periodic statistics collation (spec §9, grounded on
//! `server/stats.c`).
//!
//! The original logs a line only when something changed and resets its
//! byte counters every tick; this keeps that behavior but reports
//! through `tracing` + `metrics` instead of a custom logger, per the
//! ambient-stack crates already used throughout this crate.

use std::sync::atomic::{AtomicU64, Ordering};

use metrics::gauge;
use tracing::info;

use crate::bucket::BucketTable;
use crate::connection::{ConnectionKind, ConnectionRegistry};
use crate::ids::LOCAL_NODE_ID;
use crate::node::NodeRegistry;

/// Running byte counters, updated from the connection read/write loops
/// and drained every tick (`stats_bytes_in`/`stats_bytes_out` in the
/// original).
#[derive(Debug, Default)]
pub struct ByteCounters {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

impl ByteCounters {
    pub fn record_in(&self, n: u64) {
        self.bytes_in.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_out(&self, n: u64) {
        self.bytes_out.fetch_add(n, Ordering::Relaxed);
    }

    fn take(&self) -> (u64, u64) {
        (self.bytes_in.swap(0, Ordering::Relaxed), self.bytes_out.swap(0, Ordering::Relaxed))
    }
}

/// A point-in-time snapshot, returned by [`Stats::tick`] for tests and
/// for the `SIGHUP` dump (spec's ambient stats section).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub active_nodes: u32,
    pub clients: u32,
    pub primary_buckets: u32,
    pub secondary_buckets: u32,
    pub bucket_transfer: bool,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

/// Last-reported values, used to decide whether a tick produced
/// anything worth logging (mirrors the original's `_stats.last`).
#[derive(Debug, Default)]
struct LastReported {
    active_nodes: u32,
    clients: u32,
}

/// Owns the byte counters and last-reported state; one instance per
/// daemon, shared with connection tasks via `Arc`.
#[derive(Debug, Default)]
pub struct Stats {
    counters: ByteCounters,
    last: parking_lot::Mutex<LastReported>,
}

impl Stats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn counters(&self) -> &ByteCounters {
        &self.counters
    }

    /// Runs one stats tick (spec's ambient stats section, `stats_handler`
    /// in the original): gathers current counts, logs a line at `INFO`
    /// only if something changed, publishes `metrics` gauges
    /// unconditionally, and resets the byte counters.
    pub fn tick(&self, buckets: &BucketTable, nodes: &NodeRegistry, connections: &ConnectionRegistry) -> Snapshot {
        let active_nodes = nodes.active_node_count();
        let clients = u32::try_from(connections.count_by_kind(ConnectionKind::Client)).unwrap_or(u32::MAX);
        let primary_buckets = u32::try_from(buckets.primary_count(LOCAL_NODE_ID)).unwrap_or(u32::MAX);
        let secondary_buckets = u32::try_from(buckets.secondary_count(LOCAL_NODE_ID)).unwrap_or(u32::MAX);
        let bucket_transfer = buckets.bucket_transfer_active();
        let (bytes_in, bytes_out) = self.counters.take();

        let mut last = self.last.lock();
        let changed = last.active_nodes != active_nodes || last.clients != clients || bytes_in > 0 || bytes_out > 0;
        if changed {
            info!(active_nodes, clients, bytes_in, bytes_out, "stats");
        }
        last.active_nodes = active_nodes;
        last.clients = clients;
        drop(last);

        gauge!("opencluster_active_nodes").set(f64::from(active_nodes));
        gauge!("opencluster_clients").set(f64::from(clients));
        gauge!("opencluster_primary_buckets").set(f64::from(primary_buckets));
        gauge!("opencluster_secondary_buckets").set(f64::from(secondary_buckets));
        gauge!("opencluster_bucket_transfer").set(if bucket_transfer { 1.0 } else { 0.0 });
        gauge!("opencluster_bytes_in").set(bytes_in as f64);
        gauge!("opencluster_bytes_out").set(bytes_out as f64);

        Snapshot { active_nodes, clients, primary_buckets, secondary_buckets, bucket_transfer, bytes_in, bytes_out }
    }
}
