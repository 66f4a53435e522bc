//! P2P server
//!
//! [`Server`] is a cheap, cloneable handle. Peer membership, the ban list and
//! outbound group counts are owned by a single actor task ([`actor`]) which
//! applies every change serially; the handle only sends it messages. A second
//! task ([`rebroadcast`]) owns the set of inventory to re-announce until it is
//! confirmed.

pub mod actor;
pub mod query;
pub mod rebroadcast;
pub mod registry;
pub mod shutdown;

use crate::config::Settings;
use crate::deps::{ConnReq, Deps, TxDesc};
use crate::logger::Logger;
use crate::peer::session::{self, Transport};
use crate::peer::{Peer, PeerConfig, PeerId, PeerInfo};
use crate::wire::message::{InvVect, Message, MsgVersion, ServiceFlags};
use actor::{PeerHandler, ServerMsg};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::Mutex;
use query::{PeerSelector, Query};
use rebroadcast::{RebroadcastMsg, RebroadcastTimings};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Capacity of the actor's inbox
const SERVER_CHANNEL_CAPACITY: usize = 1024;

/// Capacity of the rebroadcast task's inbox
const REBROADCAST_CHANNEL_CAPACITY: usize = 256;

/// Time allowed for resolving an added node's address
pub const ADDED_NODE_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Server errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServerError {
    #[error("Server is not started")]
    NotStarted,
    #[error("Server is shutting down")]
    ShuttingDown,
    #[error("Max peers reached")]
    MaxPeersReached,
    #[error("Peer already connected")]
    AlreadyConnected,
    #[error("Peer exists as a permanent peer")]
    PermanentPeerExists,
    #[error("Peer not found")]
    PeerNotFound,
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

/// Extra data carried along with relayed inventory
#[derive(Debug, Clone, PartialEq)]
pub enum RelayPayload {
    None,
    /// Lets the relay honour fee filters, bloom filters and subnetworks
    Tx(TxDesc),
}

/// A manually added (persistent) peer
#[derive(Debug, Clone, Serialize)]
pub struct AddedNodeInfo {
    pub added_node: String,
    pub connected: bool,
    pub addresses: Vec<AddedNodeAddress>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AddedNodeAddress {
    pub address: String,
    pub connected: bool,
}

/// Handle to the P2P server
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    settings: Settings,
    deps: Deps,
    log: Logger,
    /// Sent in our Version to detect connections to ourselves
    nonce: u64,
    msg_tx: mpsc::Sender<ServerMsg>,
    rebroadcast_tx: mpsc::Sender<RebroadcastMsg>,
    receivers: Mutex<Option<(mpsc::Receiver<ServerMsg>, mpsc::Receiver<RebroadcastMsg>)>>,
    next_peer_id: AtomicU64,
    started: AtomicBool,
    stopping: AtomicBool,
    shutdown_scheduled: AtomicBool,
    shutdown: CancellationToken,
    stopped: CancellationToken,
    tracker: TaskTracker,
}

impl Server {
    pub fn new(settings: Settings, deps: Deps, log: Logger) -> Self {
        let (msg_tx, msg_rx) = mpsc::channel(SERVER_CHANNEL_CAPACITY);
        let (rebroadcast_tx, rebroadcast_rx) = mpsc::channel(REBROADCAST_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(ServerInner {
                settings,
                deps,
                log,
                nonce: rand::random(),
                msg_tx,
                rebroadcast_tx,
                receivers: Mutex::new(Some((msg_rx, rebroadcast_rx))),
                next_peer_id: AtomicU64::new(1),
                started: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                shutdown_scheduled: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                stopped: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub fn deps(&self) -> &Deps {
        &self.inner.deps
    }

    pub fn logger(&self) -> &Logger {
        &self.inner.log
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.inner.shutdown
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    pub(crate) fn is_local_nonce(&self, nonce: u64) -> bool {
        nonce == self.inner.nonce
    }

    /// Start the actor, the rebroadcast task and the connection manager
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some((msg_rx, rebroadcast_rx)) = self.inner.receivers.lock().take() else {
            return;
        };
        info!(target: self.inner.log.target(), "Starting server");

        let handler = PeerHandler::new(self.clone(), msg_rx);
        self.inner.tracker.spawn(handler.run());
        self.inner.tracker.spawn(rebroadcast::run(
            rebroadcast_rx,
            self.inner.msg_tx.clone(),
            RebroadcastTimings::from_settings(&self.inner.settings),
            self.inner.shutdown.clone(),
            self.inner.log.child("rebroadcast"),
        ));
        self.inner.deps.conn_manager.start();
    }

    /// Disconnect every peer, wait for all server tasks to finish and stop
    /// the connection manager
    pub async fn stop(&self) {
        if self.inner.stopping.swap(true, Ordering::AcqRel) {
            info!(target: self.inner.log.target(), "Server is already in the process of shutting down");
            self.inner.stopped.cancelled().await;
            return;
        }

        warn!(target: self.inner.log.target(), "Server shutting down");
        self.inner.shutdown.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.deps.conn_manager.stop();
        self.inner.stopped.cancel();
        info!(target: self.inner.log.target(), "Server shutdown complete");
    }

    /// Resolves once [`Server::stop`] has completed
    pub async fn wait_for_shutdown(&self) {
        self.inner.stopped.cancelled().await
    }

    // Actor messages

    async fn send(&self, msg: ServerMsg) {
        if self.inner.msg_tx.send(msg).await.is_err() {
            debug!(target: self.inner.log.target(), "Server actor is gone");
        }
    }

    /// Register a peer that completed version negotiation
    pub async fn add_peer(&self, peer: &Arc<Peer>) {
        self.send(ServerMsg::NewPeer(peer.clone())).await
    }

    pub(crate) async fn done_peer(&self, peer: &Arc<Peer>) {
        self.send(ServerMsg::DonePeer(peer.clone())).await
    }

    /// Ban the peer's host for the configured duration
    pub async fn ban_peer(&self, peer: &Arc<Peer>) {
        self.send(ServerMsg::BanPeer(peer.clone())).await
    }

    /// Announce inventory to every connected peer that wants it
    pub async fn relay_inventory(&self, inv: InvVect, payload: RelayPayload) {
        self.send(ServerMsg::RelayInventory { inv, payload }).await
    }

    /// Send a message to every connected peer except `exclude`
    pub async fn broadcast_message(&self, message: Message, exclude: &[PeerId]) {
        self.send(ServerMsg::Broadcast {
            message,
            exclude: exclude.to_vec(),
        })
        .await
    }

    /// Keep relaying the inventory periodically until it is removed
    pub async fn add_rebroadcast_inventory(&self, inv: InvVect, payload: RelayPayload) {
        if self.is_shutting_down() {
            return;
        }
        let _ = self
            .inner
            .rebroadcast_tx
            .send(RebroadcastMsg::Add { inv, payload })
            .await;
    }

    pub async fn remove_rebroadcast_inventory(&self, inv: InvVect) {
        if self.is_shutting_down() {
            return;
        }
        let _ = self.inner.rebroadcast_tx.send(RebroadcastMsg::Remove(inv)).await;
    }

    // Queries

    /// Send a raw query to the actor
    pub async fn query(&self, query: Query) -> Result<(), ServerError> {
        if !self.inner.started.load(Ordering::Acquire) {
            return Err(ServerError::NotStarted);
        }
        self.inner
            .msg_tx
            .send(ServerMsg::Query(query))
            .await
            .map_err(|_| ServerError::ShuttingDown)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Query,
    ) -> Result<T, ServerError> {
        let (reply, rx) = oneshot::channel();
        self.query(make(reply)).await?;
        rx.await.map_err(|_| ServerError::ShuttingDown)
    }

    pub async fn connected_count(&self) -> Result<usize, ServerError> {
        self.request(|reply| Query::ConnectedCount { reply }).await
    }

    /// Number of outbound peers in the given network group
    pub async fn outbound_group_count(&self, key: &str) -> Result<usize, ServerError> {
        self.request(|reply| Query::OutboundGroupCount {
            key: key.to_string(),
            reply,
        })
        .await
    }

    /// True when there are no peers, or every peer is still at genesis
    pub async fn should_mine_on_genesis(&self) -> Result<bool, ServerError> {
        self.request(|reply| Query::ShouldMineOnGenesis { reply }).await
    }

    pub async fn peers(&self) -> Result<Vec<PeerInfo>, ServerError> {
        self.request(|reply| Query::Peers { reply }).await
    }

    pub async fn persistent_peers(&self) -> Result<Vec<Arc<Peer>>, ServerError> {
        self.request(|reply| Query::PersistentPeers { reply }).await
    }

    /// Banned hosts with their ban expiry
    pub async fn banned_hosts(&self) -> Result<Vec<(String, DateTime<Utc>)>, ServerError> {
        self.request(|reply| Query::BannedHosts { reply }).await
    }

    /// Ask the connection manager to connect to `addr` ("host:port")
    pub async fn connect(&self, addr: &str, permanent: bool) -> Result<(), ServerError> {
        let target = self.resolve(addr)?;
        self.request(|reply| Query::Connect {
            addr: addr.to_string(),
            target,
            permanent,
            reply,
        })
        .await?
    }

    /// Drop a persistent peer and forget its connection request
    pub async fn remove_by_addr(&self, addr: &str) -> Result<(), ServerError> {
        let selector = PeerSelector::Addr(addr.to_string());
        self.request(|reply| Query::Remove { selector, reply }).await?
    }

    pub async fn remove_by_id(&self, id: PeerId) -> Result<(), ServerError> {
        let selector = PeerSelector::Id(id);
        self.request(|reply| Query::Remove { selector, reply }).await?
    }

    /// Disconnect a non-persistent peer
    pub async fn disconnect_by_addr(&self, addr: &str) -> Result<(), ServerError> {
        let selector = PeerSelector::Addr(addr.to_string());
        self.request(|reply| Query::Disconnect { selector, reply }).await?
    }

    pub async fn disconnect_by_id(&self, id: PeerId) -> Result<(), ServerError> {
        let selector = PeerSelector::Id(id);
        self.request(|reply| Query::Disconnect { selector, reply }).await?
    }

    /// Persistent peers, optionally with their resolved addresses.
    /// Lookups run here rather than in the actor.
    pub async fn added_node_info(&self, dns: bool) -> Result<Vec<AddedNodeInfo>, ServerError> {
        let peers = self.persistent_peers().await?;
        let mut infos = Vec::with_capacity(peers.len());

        for peer in peers {
            let mut info = AddedNodeInfo {
                added_node: peer.addr().to_string(),
                connected: peer.is_connected(),
                addresses: Vec::new(),
            };
            if dns {
                let host = peer.addr().to_string();
                let lookup = tokio::net::lookup_host(host);
                match tokio::time::timeout(ADDED_NODE_LOOKUP_TIMEOUT, lookup).await {
                    Ok(Ok(resolved)) => {
                        info.addresses = resolved
                            .map(|addr| AddedNodeAddress {
                                address: addr.to_string(),
                                connected: addr == peer.addr() && peer.is_connected(),
                            })
                            .collect();
                    }
                    Ok(Err(e)) => {
                        debug!(target: self.inner.log.target(), "Can't resolve {}: {}", peer.addr(), e)
                    }
                    Err(_) => {
                        debug!(target: self.inner.log.target(), "Resolving {} timed out", peer.addr())
                    }
                }
            }
            infos.push(info);
        }
        Ok(infos)
    }

    fn resolve(&self, addr: &str) -> Result<SocketAddr, ServerError> {
        let invalid = |detail: &str| ServerError::InvalidAddress(format!("{}: {}", addr, detail));
        let (host, port) = addr.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;
        let port: u16 = port.parse().map_err(|_| invalid("bad port"))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');

        let na = self
            .inner
            .deps
            .addr_manager
            .host_to_net_address(host, port, ServiceFlags::NODE_NETWORK)
            .map_err(|e| invalid(&e.to_string()))?;
        Ok(na.socket_addr())
    }

    // Connections

    /// Start a session on an accepted connection
    pub fn inbound_connected<S: Transport>(
        &self,
        stream: S,
        addr: SocketAddr,
    ) -> Result<PeerId, ServerError> {
        if self.is_shutting_down() {
            return Err(ServerError::ShuttingDown);
        }
        let peer = self.start_session(stream, addr, true, None);
        Ok(peer.id())
    }

    /// Hand an established outbound connection to the actor
    pub async fn outbound_connected<S: Transport>(&self, conn_req: ConnReq, stream: S) {
        self.send(ServerMsg::NewOutbound {
            conn_req,
            stream: Box::new(stream),
        })
        .await
    }

    /// Create a peer and watch for its disconnection
    pub(crate) fn new_peer(
        &self,
        addr: SocketAddr,
        inbound: bool,
        conn_req: Option<ConnReq>,
    ) -> (Arc<Peer>, mpsc::UnboundedReceiver<Message>) {
        let id = self.inner.next_peer_id.fetch_add(1, Ordering::Relaxed);
        let config = PeerConfig {
            addr,
            inbound,
            conn_req,
        };
        let (peer, outgoing) = Peer::new(self.clone(), id, config);
        self.inner
            .tracker
            .spawn(peer_done_handler(self.clone(), peer.clone()));
        (peer, outgoing)
    }

    pub(crate) fn start_session<S: Transport>(
        &self,
        stream: S,
        addr: SocketAddr,
        inbound: bool,
        conn_req: Option<ConnReq>,
    ) -> Arc<Peer> {
        let (peer, outgoing) = self.new_peer(addr, inbound, conn_req);
        debug!(target: self.inner.log.target(), "New peer {}", peer);
        peer.queue_message(Message::Version(self.local_version(&peer)));
        session::spawn(peer.clone(), stream, outgoing, &self.inner.tracker);
        peer
    }

    /// Our Version message for the given peer
    pub(crate) fn local_version(&self, peer: &Peer) -> MsgVersion {
        let settings = &self.inner.settings;
        MsgVersion {
            protocol_version: settings.protocol_version,
            services: settings.services,
            timestamp: Utc::now(),
            address: Some(peer.net_address()),
            nonce: self.inner.nonce,
            user_agent: settings.user_agent.clone(),
            selected_tip_hash: self.inner.deps.dag.selected_tip_hash(),
            disable_relay_tx: settings.blocks_only,
            subnetwork_id: settings.subnetwork_id,
        }
    }
}

/// Tear down server-side state once the peer disconnects
async fn peer_done_handler(server: Server, peer: Arc<Peer>) {
    peer.wait_for_disconnect().await;
    server.done_peer(&peer).await;

    if peer.verack_received() {
        let deps = server.deps();
        deps.sync_manager.done_peer(&peer);
        let evicted = deps.mempool.remove_orphans_by_tag(peer.id());
        if evicted > 0 {
            debug!(
                target: server.logger().target(),
                "Evicted {} orphan transactions from {}",
                evicted, peer
            );
        }
    }
    debug!(target: server.logger().target(), "Peer {} done", peer);
}
