//! Server-side peer wrapper
//!
//! A [`Peer`] adds node-local state on top of a connection: ban score, known
//! addresses and inventory, optional bloom filter, relay flags and the
//! processing gates used by block/transaction delivery. The connection itself
//! is driven by the read/write loops in [`session`].

pub mod ban;
pub mod gate;
pub mod known;
pub mod session;

use crate::deps::ConnReq;
use crate::logger::Logger;
use crate::server::Server;
use crate::wire::bloom::BloomFilter;
use crate::wire::hash::{Hash, SubnetworkId};
use crate::wire::message::{InvVect, Message, MsgTx, MsgVersion, NetAddress, ServiceFlags};
use crate::wire::MAX_ADDR_PER_MSG;
use ban::DynamicBanScore;
use chrono::{DateTime, Utc};
use gate::ProcessedGate;
use known::{BoundedSet, MAX_KNOWN_INVENTORY};
use log::{debug, warn};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Numeric peer identifier, unique for the server's lifetime
pub type PeerId = u64;

/// Peer session errors
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Version negotiation timed out")]
    Timeout,
    #[error("Peer disconnected")]
    Disconnected,
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("Protocol version {0} is no longer supported")]
    ObsoleteVersion(u32),
    #[error("Disconnecting peer connected to self")]
    SelfConnection,
}

/// Connection parameters of a new peer
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub addr: SocketAddr,
    pub inbound: bool,
    /// Set for outbound peers created by the connection manager
    pub conn_req: Option<ConnReq>,
}

/// Snapshot of a peer for RPC listings
#[derive(Debug, Clone, Serialize)]
pub struct PeerInfo {
    pub id: PeerId,
    pub addr: String,
    pub services: ServiceFlags,
    pub inbound: bool,
    pub persistent: bool,
    pub whitelisted: bool,
    pub protocol_version: u32,
    pub user_agent: String,
    pub selected_tip_hash: Option<String>,
    pub subnetwork_id: Option<String>,
    pub relay_tx_disabled: bool,
    pub fee_filter: i64,
    pub ban_score: u32,
    /// Where the peer's next block inventory request should resume
    pub continue_hash: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub sync_node: bool,
}

/// A connected remote peer
pub struct Peer {
    id: PeerId,
    addr: SocketAddr,
    inbound: bool,
    conn_req: Option<ConnReq>,
    whitelisted: bool,
    connected_at: DateTime<Utc>,
    server: Server,
    log: Logger,
    outgoing: mpsc::UnboundedSender<Message>,
    quit: CancellationToken,

    version: Mutex<Option<MsgVersion>>,
    selected_tip: Mutex<Option<Hash>>,
    verack_received: AtomicBool,

    ban_score: Mutex<DynamicBanScore>,
    known_addresses: Mutex<HashSet<String>>,
    known_inventory: Mutex<BoundedSet<InvVect>>,
    filter: Mutex<Option<BloomFilter>>,
    relay_tx_disabled: AtomicBool,
    fee_filter: AtomicI64,

    sent_addrs: AtomicBool,
    block_locator_requested: AtomicBool,
    continue_hash: Mutex<Option<Hash>>,

    pub(crate) block_processed: ProcessedGate,
    pub(crate) tx_processed: ProcessedGate,
}

impl Peer {
    /// Create a peer. Messages queued on it come out of the returned receiver.
    pub(crate) fn new(
        server: Server,
        id: PeerId,
        config: PeerConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Message>) {
        let (outgoing, rx) = mpsc::unbounded_channel();
        let whitelisted = server.settings().whitelist.contains(&config.addr.ip());
        let peer = Self {
            id,
            addr: config.addr,
            inbound: config.inbound,
            conn_req: config.conn_req,
            whitelisted,
            connected_at: Utc::now(),
            log: server.logger().child("peer"),
            quit: server.shutdown_token().child_token(),
            server,
            outgoing,
            version: Mutex::new(None),
            selected_tip: Mutex::new(None),
            verack_received: AtomicBool::new(false),
            ban_score: Mutex::new(DynamicBanScore::new()),
            known_addresses: Mutex::new(HashSet::new()),
            known_inventory: Mutex::new(BoundedSet::new(MAX_KNOWN_INVENTORY)),
            filter: Mutex::new(None),
            relay_tx_disabled: AtomicBool::new(false),
            fee_filter: AtomicI64::new(0),
            sent_addrs: AtomicBool::new(false),
            block_locator_requested: AtomicBool::new(false),
            continue_hash: Mutex::new(None),
            block_processed: ProcessedGate::new(),
            tx_processed: ProcessedGate::new(),
        };
        (Arc::new(peer), rx)
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_inbound(&self) -> bool {
        self.inbound
    }

    pub fn is_persistent(&self) -> bool {
        self.conn_req.as_ref().map_or(false, |req| req.permanent)
    }

    pub fn conn_req(&self) -> Option<&ConnReq> {
        self.conn_req.as_ref()
    }

    pub fn is_whitelisted(&self) -> bool {
        self.whitelisted
    }

    pub fn server(&self) -> &Server {
        &self.server
    }

    pub(crate) fn logger(&self) -> &Logger {
        &self.log
    }

    pub(crate) fn quit_token(&self) -> &CancellationToken {
        &self.quit
    }

    // Version negotiation state

    pub fn version(&self) -> Option<MsgVersion> {
        self.version.lock().clone()
    }

    pub fn version_known(&self) -> bool {
        self.version.lock().is_some()
    }

    pub(crate) fn set_version(&self, version: MsgVersion) {
        *self.selected_tip.lock() = Some(version.selected_tip_hash);
        *self.version.lock() = Some(version);
    }

    pub fn services(&self) -> ServiceFlags {
        self.version
            .lock()
            .as_ref()
            .map_or(ServiceFlags::empty(), |v| v.services)
    }

    /// Subnetwork the peer follows; None for full nodes
    pub fn subnetwork_id(&self) -> Option<SubnetworkId> {
        self.version.lock().as_ref().and_then(|v| v.subnetwork_id)
    }

    pub fn verack_received(&self) -> bool {
        self.verack_received.load(Ordering::Acquire)
    }

    /// Returns true if a VerAck had already been received
    pub(crate) fn mark_verack_received(&self) -> bool {
        self.verack_received.swap(true, Ordering::AcqRel)
    }

    /// Network address of the peer with its advertised services
    pub fn net_address(&self) -> NetAddress {
        NetAddress::from_socket_addr(self.addr, self.services())
    }

    pub fn selected_tip_hash(&self) -> Option<Hash> {
        *self.selected_tip.lock()
    }

    /// Record a new selected tip; returns false if it was already known
    pub(crate) fn update_selected_tip_hash(&self, hash: Hash) -> bool {
        let mut tip = self.selected_tip.lock();
        if *tip == Some(hash) {
            return false;
        }
        *tip = Some(hash);
        true
    }

    // Connection control

    pub fn is_connected(&self) -> bool {
        !self.quit.is_cancelled()
    }

    /// Close the session. Idempotent.
    pub fn disconnect(&self) {
        if !self.quit.is_cancelled() {
            debug!(target: self.log.target(), "Disconnecting {}", self);
            self.quit.cancel();
        }
    }

    pub async fn wait_for_disconnect(&self) {
        self.quit.cancelled().await
    }

    /// Queue a message for the write loop. Dropped if the peer is gone.
    pub fn queue_message(&self, msg: Message) {
        if !self.is_connected() {
            return;
        }
        if self.outgoing.send(msg).is_err() {
            debug!(target: self.log.target(), "Write loop of {} is gone", self);
        }
    }

    /// Announce an inventory item unless the peer already knows it
    pub fn queue_inventory(&self, iv: InvVect) {
        if !self.known_inventory.lock().insert(iv) {
            return;
        }
        self.queue_message(Message::Inv(vec![iv]));
    }

    pub fn add_known_inventory(&self, iv: InvVect) {
        self.known_inventory.lock().insert(iv);
    }

    pub fn is_known_inventory(&self, iv: &InvVect) -> bool {
        self.known_inventory.lock().contains(iv)
    }

    // Address exchange

    pub fn add_known_addresses(&self, addresses: &[NetAddress]) {
        let addr_manager = &self.server.deps().addr_manager;
        let mut known = self.known_addresses.lock();
        for na in addresses {
            known.insert(addr_manager.net_address_key(na));
        }
    }

    pub fn is_known_address(&self, na: &NetAddress) -> bool {
        let key = self.server.deps().addr_manager.net_address_key(na);
        self.known_addresses.lock().contains(&key)
    }

    /// Send addresses the peer doesn't know yet, at most [`MAX_ADDR_PER_MSG`]
    /// picked at random. Returns the addresses sent.
    pub fn push_addr_msg(
        &self,
        addresses: &[NetAddress],
        subnetwork_id: Option<SubnetworkId>,
    ) -> Vec<NetAddress> {
        let mut fresh: Vec<NetAddress> = addresses
            .iter()
            .filter(|na| !self.is_known_address(na))
            .cloned()
            .collect();
        if fresh.len() > MAX_ADDR_PER_MSG {
            fresh.shuffle(&mut rand::thread_rng());
            fresh.truncate(MAX_ADDR_PER_MSG);
        }
        if fresh.is_empty() {
            return fresh;
        }

        self.add_known_addresses(&fresh);
        self.queue_message(Message::Addr {
            include_all_subnetworks: false,
            subnetwork_id,
            addresses: fresh.clone(),
        });
        fresh
    }

    /// Returns true if addresses were already sent during this session
    pub(crate) fn mark_addrs_sent(&self) -> bool {
        self.sent_addrs.swap(true, Ordering::AcqRel)
    }

    // Ban scoring

    pub fn ban_score(&self) -> u32 {
        self.ban_score.lock().int()
    }

    /// Increase the ban score. Bans and disconnects the peer once the score
    /// exceeds the configured threshold; returns true in that case.
    ///
    /// Whitelisted peers and nodes running with banning disabled only get a
    /// warning.
    pub async fn add_ban_score(
        self: &Arc<Self>,
        persistent: u32,
        transient: u32,
        reason: &str,
    ) -> bool {
        let settings = self.server.settings();
        let warn_threshold = settings.ban_threshold / 2;

        if settings.disable_banning || self.whitelisted {
            let score = self.ban_score.lock().int();
            if score > warn_threshold {
                warn!(
                    target: self.log.target(),
                    "Misbehaving whitelisted peer {}: {} -- ban score is {}, it was not increased this time",
                    self, reason, score
                );
            }
            return false;
        }

        if persistent == 0 && transient == 0 {
            let score = self.ban_score.lock().int();
            if score > warn_threshold {
                warn!(
                    target: self.log.target(),
                    "Misbehaving peer {}: {} -- ban score is {}",
                    self, reason, score
                );
            }
            return false;
        }

        let score = self.ban_score.lock().increase(persistent, transient);
        if score <= warn_threshold {
            return false;
        }

        warn!(
            target: self.log.target(),
            "Misbehaving peer {}: {} -- ban score increased to {}",
            self, reason, score
        );
        if score > settings.ban_threshold {
            warn!(target: self.log.target(), "Misbehaving peer {} -- banning and disconnecting", self);
            self.server.ban_peer(self).await;
            self.disconnect();
            return true;
        }
        false
    }

    // Relay filtering

    pub fn relay_tx_disabled(&self) -> bool {
        self.relay_tx_disabled.load(Ordering::Acquire)
    }

    pub(crate) fn set_relay_tx_disabled(&self, disabled: bool) {
        self.relay_tx_disabled.store(disabled, Ordering::Release);
    }

    /// Minimum fee rate (sompi/kB) of transactions relayed to this peer
    pub fn fee_filter(&self) -> i64 {
        self.fee_filter.load(Ordering::Acquire)
    }

    pub(crate) fn set_fee_filter(&self, min_fee: i64) {
        self.fee_filter.store(min_fee, Ordering::Release);
    }

    pub fn is_filter_loaded(&self) -> bool {
        self.filter.lock().is_some()
    }

    pub(crate) fn load_filter(&self, filter: BloomFilter) {
        *self.filter.lock() = Some(filter);
    }

    /// Add data to the loaded filter; returns false if none is loaded
    pub(crate) fn filter_add(&self, data: &[u8]) -> bool {
        match self.filter.lock().as_mut() {
            Some(filter) => {
                filter.insert(data);
                true
            }
            None => false,
        }
    }

    /// Remove the loaded filter; returns false if none was loaded
    pub(crate) fn unload_filter(&self) -> bool {
        self.filter.lock().take().is_some()
    }

    /// Whether the transaction passes the peer's filter. Always true
    /// without a loaded filter.
    pub fn filter_matches_tx(&self, tx: &MsgTx) -> bool {
        match self.filter.lock().as_mut() {
            Some(filter) => filter.match_tx_and_update(tx),
            None => true,
        }
    }

    // Sync negotiation

    /// Ask the peer for a block locator between `high_hash` and `low_hash`
    pub fn push_get_block_locator(&self, high_hash: Hash, low_hash: Hash) {
        self.block_locator_requested.store(true, Ordering::Release);
        self.queue_message(Message::GetBlockLocator {
            high_hash,
            low_hash,
        });
    }

    /// Clear the flag, returning whether a locator was outstanding
    pub(crate) fn take_block_locator_requested(&self) -> bool {
        self.block_locator_requested.swap(false, Ordering::AcqRel)
    }

    /// Hash the peer should continue from after a full inventory batch
    pub fn continue_hash(&self) -> Option<Hash> {
        *self.continue_hash.lock()
    }

    pub(crate) fn set_continue_hash(&self, hash: Option<Hash>) {
        *self.continue_hash.lock() = hash;
    }

    pub fn info(&self, sync_node: bool) -> PeerInfo {
        let version = self.version();
        PeerInfo {
            id: self.id,
            addr: self.addr.to_string(),
            services: self.services(),
            inbound: self.inbound,
            persistent: self.is_persistent(),
            whitelisted: self.whitelisted,
            protocol_version: version.as_ref().map_or(0, |v| v.protocol_version),
            user_agent: version.as_ref().map(|v| v.user_agent.clone()).unwrap_or_default(),
            selected_tip_hash: self.selected_tip_hash().map(|h| h.to_string()),
            subnetwork_id: self.subnetwork_id().map(|s| s.to_string()),
            relay_tx_disabled: self.relay_tx_disabled(),
            fee_filter: self.fee_filter(),
            ban_score: self.ban_score(),
            continue_hash: self.continue_hash().map(|h| h.to_string()),
            connected_at: self.connected_at,
            sync_node,
        }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let direction = if self.inbound { "inbound" } else { "outbound" };
        write!(f, "{} ({})", self.addr, direction)
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("inbound", &self.inbound)
            .finish()
    }
}
