//! Server orchestration: startup, the settle timer, background timers,
//! and graceful shutdown (spec §3, §9).
//!
//! Unlike the teacher's pluggable per-partition `ServiceRegistry` (a
//! dynamic cohort of named services resolved by `TypeId`), this daemon's
//! components are fixed and known at compile time -- one bucket table,
//! one node registry, one connection registry, one migration
//! controller, a handful of background timers. Startup/shutdown
//! ordering is expressed directly as a sequence in [`Server::run`]
//! rather than through a registry, but the shutdown signaling idiom
//! ([`shutdown::ShutdownController`]) is carried over unchanged.

mod settle;
mod shutdown;

pub use shutdown::{HealthState, InFlightGuard, ShutdownController};

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::codec::Framed;

use futures_util::{SinkExt, StreamExt};
use tracing::{error, info, warn};

use opencluster_core::ConnInfo;

use crate::bucket::BucketTable;
use crate::config::{ServerConfig, NODE_RETRY_BACKOFF, SECONDS_TICK, STATS_TICK};
use crate::connection::{ConnectionKind, ConnectionRegistry, OutboundMessage};
use crate::dispatch::{encode_frame, Dispatcher, FrameCodec, Message};
use crate::error::ServerError;
use crate::hashmask::HashmaskTable;
use crate::migration::{MigrationController, LOADLEVEL_INTERVAL};
use crate::node::{NodeRegistry, NodeState};
use crate::stats::Stats;

/// Every shared subsystem plus the CLI configuration, bundled so it can
/// be cloned cheaply (all fields are `Arc`) into each connection task.
#[derive(Clone)]
pub struct Server {
    pub config: Arc<ServerConfig>,
    pub local_conninfo: ConnInfo,
    pub buckets: Arc<BucketTable>,
    pub hashmask: Arc<HashmaskTable>,
    pub nodes: Arc<NodeRegistry>,
    pub connections: Arc<ConnectionRegistry>,
    pub migration: Arc<MigrationController>,
    pub stats: Arc<Stats>,
    pub shutdown: Arc<ShutdownController>,
}

impl Server {
    /// Builds a fresh `Server` from parsed CLI configuration.
    ///
    /// # Errors
    /// Returns [`ServerError`] if the local conninfo file cannot be
    /// read or parsed.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let local_conninfo = config.load_local_conninfo()?;
        Ok(Self {
            config: Arc::new(config),
            local_conninfo,
            buckets: Arc::new(BucketTable::empty()),
            hashmask: Arc::new(HashmaskTable::new()),
            nodes: Arc::new(NodeRegistry::new()),
            connections: Arc::new(ConnectionRegistry::new()),
            migration: Arc::new(MigrationController::new()),
            stats: Arc::new(Stats::new()),
            shutdown: Arc::new(ShutdownController::new()),
        })
    }

    fn dispatcher(&self) -> Dispatcher {
        Dispatcher {
            local_conninfo: self.local_conninfo.clone(),
            local_secret: Arc::new(self.config.cluster_secret.clone().into_bytes()),
            buckets: Arc::clone(&self.buckets),
            hashmask: Arc::clone(&self.hashmask),
            nodes: Arc::clone(&self.nodes),
            connections: Arc::clone(&self.connections),
            migration: Arc::clone(&self.migration),
        }
    }

    /// Runs the daemon until a shutdown signal (`SIGINT`/`SIGTERM`, or
    /// an externally triggered [`ShutdownController`]) arrives.
    ///
    /// # Errors
    /// Returns [`ServerError`] if the listen socket cannot be bound.
    pub async fn run(self) -> Result<(), ServerError> {
        let addr: SocketAddr = (std::net::IpAddr::V4(self.local_conninfo.ip.parse().unwrap_or(std::net::Ipv4Addr::UNSPECIFIED)), self.local_conninfo.port).into();
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "listening");

        self.shutdown.set_settling();
        self.connect_configured_peers();

        let settle_handle = {
            let buckets = Arc::clone(&self.buckets);
            let nodes = Arc::clone(&self.nodes);
            let shutdown = Arc::clone(&self.shutdown);
            tokio::spawn(async move {
                settle::settle(&buckets, &nodes).await;
                shutdown.set_ready();
            })
        };

        let loadlevel_handle = self.spawn_loadlevel_tick();
        let seconds_handle = self.spawn_seconds_tick();
        let stats_handle = self.spawn_stats_tick();

        let mut shutdown_rx = self.shutdown.shutdown_receiver();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, peer_addr)) => {
                            let server = self.clone();
                            tokio::spawn(async move { server.serve_connection(socket, peer_addr, false).await; });
                        }
                        Err(e) => warn!(error = %e, "accept failed"),
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        info!("draining connections");
        for handle in self.connections.drain_all() {
            let _ = handle.try_send(OutboundMessage::Close);
        }
        self.shutdown.wait_for_drain(std::time::Duration::from_secs(5)).await;

        settle_handle.abort();
        loadlevel_handle.abort();
        seconds_handle.abort();
        stats_handle.abort();
        Ok(())
    }

    /// Signals an externally-initiated graceful shutdown (e.g. from a
    /// `SIGINT` handler in `bin/ocd.rs`).
    pub fn shutdown(&self) {
        self.shutdown.trigger_shutdown();
    }

    fn connect_configured_peers(&self) {
        for peer_info in self.config.load_peer_conninfos() {
            self.nodes.register(peer_info);
        }
        // Actual outbound dialing happens lazily: the node-wait backoff
        // timer below picks up every `Unknown` peer on its next tick.
        let nodes = Arc::clone(&self.nodes);
        let server = self.clone();
        tokio::spawn(async move {
            loop {
                for node in nodes.all() {
                    if node.state() == NodeState::Unknown {
                        node.set_state(NodeState::Connecting);
                        if let Err(e) = server.dial_peer(&node.conninfo).await {
                            warn!(error = %e, peer = %node.conninfo, "peer connect failed");
                            node.mark_connect_failed();
                        }
                    }
                }
                tokio::time::sleep(NODE_RETRY_BACKOFF).await;
                if server.shutdown.health_state() == HealthState::Draining || server.shutdown.health_state() == HealthState::Stopped {
                    break;
                }
            }
        });
    }

    async fn dial_peer(&self, conninfo: &ConnInfo) -> Result<(), ServerError> {
        let addr: SocketAddr = (std::net::IpAddr::V4(conninfo.ip.parse().unwrap_or(std::net::Ipv4Addr::LOCALHOST)), conninfo.port).into();
        let socket = tokio::net::TcpStream::connect(addr).await?;
        let server = self.clone();
        let peer_addr = socket.peer_addr().unwrap_or(addr);
        tokio::spawn(async move { server.serve_connection(socket, peer_addr, true).await; });
        Ok(())
    }

    fn spawn_loadlevel_tick(&self) -> tokio::task::JoinHandle<()> {
        let nodes = Arc::clone(&self.nodes);
        let connections = Arc::clone(&self.connections);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(LOADLEVEL_INTERVAL).await;
                for peer in nodes.ready_peers() {
                    let Some(conn_id) = peer.conn_id() else { continue };
                    let Some(handle) = connections.get(conn_id) else { continue };
                    let frame = Message::Loadlevels.into_request_frame(0);
                    let _ = handle.try_send(OutboundMessage::Frame(encode_frame(frame)));
                }
            }
        })
    }

    fn spawn_seconds_tick(&self) -> tokio::task::JoinHandle<()> {
        let buckets = Arc::clone(&self.buckets);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(SECONDS_TICK).await;
                #[allow(clippy::cast_possible_truncation)]
                let now = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_secs() as u32)
                    .unwrap_or(0);
                for entry in buckets.iter() {
                    entry.data.evict_expired(now);
                    entry.data.drain_one_old_item_matching(entry.index, buckets.mask());
                }
            }
        })
    }

    fn spawn_stats_tick(&self) -> tokio::task::JoinHandle<()> {
        let buckets = Arc::clone(&self.buckets);
        let nodes = Arc::clone(&self.nodes);
        let connections = Arc::clone(&self.connections);
        let stats = Arc::clone(&self.stats);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(STATS_TICK).await;
                stats.tick(&buckets, &nodes, &connections);
            }
        })
    }

    /// Per-connection read/dispatch/write loop. A client connection ends
    /// when the peer disconnects or sends a malformed frame (spec §7);
    /// a peer connection additionally updates its [`NodeHandle`](crate::node::NodeHandle)'s
    /// liveness on every message.
    async fn serve_connection(&self, socket: tokio::net::TcpStream, peer_addr: SocketAddr, initiator: bool) {
        let _guard = self.shutdown.in_flight_guard();
        let (handle, mut outbound_rx) = self.connections.register(ConnectionKind::Peer, crate::config::CONNECTION_CHANNEL_CAPACITY);
        let mut framed = Framed::new(socket, FrameCodec);
        let dispatcher = self.dispatcher();
        let conn_id = handle.id;
        let mut peer_node = None;

        if initiator {
            let hello = Message::ServerHello {
                conninfo: self.local_conninfo.normalized(),
                secret: self.config.cluster_secret.clone().into_bytes(),
            };
            if framed.send(hello.into_request_frame(0)).await.is_err() {
                self.connections.remove(conn_id);
                return;
            }
        }

        loop {
            tokio::select! {
                outbound = outbound_rx.recv() => {
                    match outbound {
                        Some(OutboundMessage::Frame(bytes)) => {
                            if tokio::io::AsyncWriteExt::write_all(framed.get_mut(), &bytes).await.is_err() {
                                break;
                            }
                        }
                        Some(OutboundMessage::Close) | None => break,
                    }
                }
                incoming = framed.next() => {
                    match incoming {
                        Some(Ok(frame)) => {
                            self.stats.counters().record_in(u64::from(frame.header.length) + u64::from(opencluster_core::HEADER_LEN as u32));
                            match Message::decode(&frame.header, &frame.payload) {
                                Ok(msg) => {
                                    let reply = dispatcher.handle(conn_id, peer_node, msg);
                                    peer_node = dispatcher.nodes.by_conn_id(conn_id).map(|n| n.id);
                                    if let Some(reply) = reply {
                                        let out = reply.into_reply_frame(frame.header.userid);
                                        self.stats.counters().record_out(u64::from(out.header.length) + u64::from(opencluster_core::HEADER_LEN as u32));
                                        if framed.send(out).await.is_err() {
                                            break;
                                        }
                                    }
                                }
                                Err(e) => {
                                    warn!(conn_id, error = %e, peer = %peer_addr, "malformed frame, closing connection");
                                    break;
                                }
                            }
                        }
                        Some(Err(e)) => {
                            error!(conn_id, error = %e, "frame decode error");
                            break;
                        }
                        None => break,
                    }
                }
            }
        }

        if let Some(node) = peer_node.and_then(|id| self.nodes.get(id)) {
            node.mark_connect_failed();
        }
        self.migration.clear_if_peer(conn_id);
        self.connections.remove(conn_id);
    }
}

