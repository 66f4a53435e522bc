//! Test doubles for the server's collaborators

use crate::config::Config;
use crate::deps::{
    AddrManager, BoxError, ConnManager, ConnReq, DagView, Deps, FilterIndex, Mempool, SyncManager,
    TxDesc,
};
use crate::logger::Logger;
use crate::peer::gate::ProcessedSignal;
use crate::peer::{Peer, PeerConfig, PeerId};
use crate::server::Server;
use crate::wire::hash::{Hash, SubnetworkId};
use crate::wire::message::{
    BlockHeader, InvVect, Message, MsgBlock, MsgTx, MsgVersion, NetAddress, Outpoint,
    ServiceFlags, TxIn, TxOut, PROTOCOL_VERSION,
};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn socket(addr: &str) -> SocketAddr {
    addr.parse().expect("socket address")
}

fn group_key(na: &NetAddress) -> String {
    match na.ip {
        IpAddr::V4(ip) => {
            let octets = ip.octets();
            format!("{}.{}", octets[0], octets[1])
        }
        IpAddr::V6(ip) => format!("{:x}", ip.segments()[0]),
    }
}

#[derive(Default)]
pub struct MockAddrManager {
    pub added: Mutex<Vec<(Vec<NetAddress>, Option<SubnetworkId>)>>,
    pub cache: Mutex<Vec<NetAddress>>,
    pub cache_requests: Mutex<Vec<(bool, Option<SubnetworkId>)>>,
    pub local: Mutex<Option<NetAddress>>,
    pub need_more: AtomicBool,
    pub good: Mutex<Vec<NetAddress>>,
    pub attempts: Mutex<Vec<NetAddress>>,
    pub connected: Mutex<Vec<NetAddress>>,
}

impl MockAddrManager {
    pub fn group_key_of(&self, addr: &str) -> String {
        group_key(&NetAddress::from_socket_addr(socket(addr), ServiceFlags::empty()))
    }
}

impl AddrManager for MockAddrManager {
    fn add_addresses(
        &self,
        addrs: &[NetAddress],
        _source: &NetAddress,
        subnetwork_id: Option<&SubnetworkId>,
    ) {
        self.added.lock().push((addrs.to_vec(), subnetwork_id.copied()));
    }

    fn address_cache(
        &self,
        include_all_subnetworks: bool,
        subnetwork_id: Option<&SubnetworkId>,
    ) -> Vec<NetAddress> {
        self.cache_requests
            .lock()
            .push((include_all_subnetworks, subnetwork_id.copied()));
        self.cache.lock().clone()
    }

    fn best_local_address(&self, _remote: &NetAddress) -> Option<NetAddress> {
        self.local.lock().clone()
    }

    fn host_to_net_address(
        &self,
        host: &str,
        port: u16,
        services: ServiceFlags,
    ) -> Result<NetAddress, BoxError> {
        let ip: IpAddr = host.parse()?;
        Ok(NetAddress::new(ip, port, services))
    }

    fn need_more_addresses(&self) -> bool {
        self.need_more.load(Ordering::SeqCst)
    }

    fn good(&self, addr: &NetAddress, _subnetwork_id: Option<&SubnetworkId>) {
        self.good.lock().push(addr.clone());
    }

    fn attempt(&self, addr: &NetAddress) {
        self.attempts.lock().push(addr.clone());
    }

    fn connected(&self, addr: &NetAddress) {
        self.connected.lock().push(addr.clone());
    }

    fn group_key(&self, addr: &NetAddress) -> String {
        group_key(addr)
    }

    fn net_address_key(&self, addr: &NetAddress) -> String {
        addr.key()
    }
}

#[derive(Default)]
pub struct MockSyncManager {
    pub new_peers: Mutex<Vec<PeerId>>,
    pub done_peers: Mutex<Vec<PeerId>>,
    pub blocks: Mutex<Vec<Hash>>,
    pub txs: Mutex<Vec<Hash>>,
    pub invs: Mutex<Vec<Vec<InvVect>>>,
    pub headers: Mutex<Vec<Vec<BlockHeader>>>,
    pub current: AtomicBool,
    pub start_sync_calls: AtomicUsize,
    pub removed_candidates: Mutex<Vec<PeerId>>,
    pub sync_peer: Mutex<Option<PeerId>>,
    /// Keep processing signals back instead of firing them
    pub hold: AtomicBool,
    pub held: Mutex<Vec<ProcessedSignal>>,
}

impl MockSyncManager {
    fn complete(&self, done: ProcessedSignal) {
        if self.hold.load(Ordering::SeqCst) {
            self.held.lock().push(done);
        } else {
            done.signal();
        }
    }

    /// Fire every held signal
    pub fn release(&self) {
        for done in self.held.lock().drain(..) {
            done.signal();
        }
    }
}

impl SyncManager for MockSyncManager {
    fn new_peer(&self, peer: &Arc<Peer>) {
        self.new_peers.lock().push(peer.id());
    }

    fn done_peer(&self, peer: &Arc<Peer>) {
        self.done_peers.lock().push(peer.id());
    }

    fn queue_block(&self, block: MsgBlock, _peer: &Arc<Peer>, done: ProcessedSignal) {
        self.blocks.lock().push(block.block_hash());
        self.complete(done);
    }

    fn queue_tx(&self, tx: MsgTx, _peer: &Arc<Peer>, done: ProcessedSignal) {
        self.txs.lock().push(tx.tx_id());
        self.complete(done);
    }

    fn queue_inv(&self, inv: Vec<InvVect>, _peer: &Arc<Peer>) {
        self.invs.lock().push(inv);
    }

    fn queue_headers(&self, headers: Vec<BlockHeader>, _peer: &Arc<Peer>) {
        self.headers.lock().push(headers);
    }

    fn is_current(&self) -> bool {
        self.current.load(Ordering::SeqCst)
    }

    fn start_sync(&self) {
        self.start_sync_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn remove_from_sync_candidates(&self, peer: &Arc<Peer>) {
        self.removed_candidates.lock().push(peer.id());
    }

    fn sync_peer_id(&self) -> Option<PeerId> {
        *self.sync_peer.lock()
    }
}

pub struct MockDag {
    pub genesis: Hash,
    pub tip: Mutex<Hash>,
    pub known: Mutex<HashSet<Hash>>,
    pub finalized: Mutex<HashSet<Hash>>,
    /// None makes locator construction fail
    pub locator: Mutex<Option<Vec<Hash>>>,
    pub boundaries: Mutex<Option<(Hash, Hash)>>,
    /// None makes the blue block queries fail
    pub blue_hashes: Mutex<Option<Vec<Hash>>>,
    pub blue_headers: Mutex<Vec<BlockHeader>>,
    pub height_range: Mutex<Vec<Hash>>,
    pub range_requests: Mutex<Vec<(u64, usize)>>,
    pub interval_hashes: Mutex<Vec<Hash>>,
    pub blocks: Mutex<HashMap<Hash, MsgBlock>>,
}

impl Default for MockDag {
    fn default() -> Self {
        let genesis = Hash::digest(b"genesis");
        Self {
            genesis,
            tip: Mutex::new(genesis),
            known: Mutex::new(HashSet::from([genesis])),
            finalized: Mutex::new(HashSet::new()),
            locator: Mutex::new(Some(Vec::new())),
            boundaries: Mutex::new(None),
            blue_hashes: Mutex::new(Some(Vec::new())),
            blue_headers: Mutex::new(Vec::new()),
            height_range: Mutex::new(Vec::new()),
            range_requests: Mutex::new(Vec::new()),
            interval_hashes: Mutex::new(Vec::new()),
            blocks: Mutex::new(HashMap::new()),
        }
    }
}

impl DagView for MockDag {
    fn genesis_hash(&self) -> Hash {
        self.genesis
    }

    fn selected_tip_hash(&self) -> Hash {
        *self.tip.lock()
    }

    fn is_in_dag(&self, hash: &Hash) -> bool {
        self.known.lock().contains(hash)
    }

    fn is_known_finalized_block(&self, hash: &Hash) -> bool {
        self.finalized.lock().contains(hash)
    }

    fn block_locator_from_hashes(&self, _high: &Hash, _low: &Hash) -> Result<Vec<Hash>, BoxError> {
        self.locator.lock().clone().ok_or_else(|| "unknown block".into())
    }

    fn find_next_locator_boundaries(&self, _locator: &[Hash]) -> Option<(Hash, Hash)> {
        *self.boundaries.lock()
    }

    fn blue_blocks_hashes_between(
        &self,
        _low: &Hash,
        _high: &Hash,
        max: usize,
    ) -> Result<Vec<Hash>, BoxError> {
        match &*self.blue_hashes.lock() {
            Some(hashes) => Ok(hashes.iter().take(max).copied().collect()),
            None => Err("unknown block".into()),
        }
    }

    fn blue_blocks_headers_between(
        &self,
        _low: &Hash,
        _high: &Hash,
        max: usize,
    ) -> Result<Vec<BlockHeader>, BoxError> {
        if self.blue_hashes.lock().is_none() {
            return Err("unknown block".into());
        }
        Ok(self.blue_headers.lock().iter().take(max).cloned().collect())
    }

    fn height_to_hash_range(
        &self,
        start_height: u64,
        _stop_hash: &Hash,
        max: usize,
    ) -> Result<Vec<Hash>, BoxError> {
        self.range_requests.lock().push((start_height, max));
        Ok(self.height_range.lock().iter().take(max).copied().collect())
    }

    fn interval_block_hashes(
        &self,
        _stop_hash: &Hash,
        _interval: u64,
    ) -> Result<Vec<Hash>, BoxError> {
        Ok(self.interval_hashes.lock().clone())
    }

    fn block_by_hash(&self, hash: &Hash) -> Result<Option<MsgBlock>, BoxError> {
        Ok(self.blocks.lock().get(hash).cloned())
    }
}

#[derive(Default)]
pub struct MockMempool {
    pub descs: Mutex<Vec<TxDesc>>,
    pub removed_tags: Mutex<Vec<PeerId>>,
}

impl MockMempool {
    pub fn add(&self, tx: MsgTx, fee_per_kb: i64) {
        self.descs.lock().push(TxDesc {
            tx,
            fee_per_kb,
            added: Utc::now(),
        });
    }
}

impl Mempool for MockMempool {
    fn tx_descs(&self) -> Vec<TxDesc> {
        self.descs.lock().clone()
    }

    fn fetch_transaction(&self, tx_id: &Hash) -> Option<MsgTx> {
        self.descs
            .lock()
            .iter()
            .find(|desc| desc.tx_id() == *tx_id)
            .map(|desc| desc.tx.clone())
    }

    fn remove_orphans_by_tag(&self, tag: PeerId) -> usize {
        self.removed_tags.lock().push(tag);
        0
    }
}

#[derive(Default)]
pub struct MockConnManager {
    pub started: AtomicBool,
    pub stopped: AtomicBool,
    pub connects: Mutex<Vec<(SocketAddr, bool)>>,
    pub disconnects: Mutex<Vec<u64>>,
    pub removes: Mutex<Vec<u64>>,
    pub completed: Mutex<Vec<u64>>,
}

impl ConnManager for MockConnManager {
    fn start(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn connect(&self, addr: SocketAddr, permanent: bool) {
        self.connects.lock().push((addr, permanent));
    }

    fn disconnect(&self, conn_id: u64) {
        self.disconnects.lock().push(conn_id);
    }

    fn remove(&self, conn_id: u64) {
        self.removes.lock().push(conn_id);
    }

    fn notify_connection_request_complete(&self, req: &ConnReq) {
        self.completed.lock().push(req.id);
    }
}

#[derive(Default)]
pub struct MockFilterIndex {
    pub filters: Mutex<HashMap<Hash, Vec<u8>>>,
    pub filter_hashes: Mutex<HashMap<Hash, Hash>>,
    pub filter_headers: Mutex<HashMap<Hash, Hash>>,
    /// Appended to every cfilter hash lookup
    pub extra_filter_hashes: Mutex<Vec<Hash>>,
}

impl FilterIndex for MockFilterIndex {
    fn filters_by_block_hashes(
        &self,
        hashes: &[Hash],
        _filter_type: u8,
    ) -> Result<Vec<Vec<u8>>, BoxError> {
        let filters = self.filters.lock();
        Ok(hashes
            .iter()
            .map(|h| filters.get(h).cloned().unwrap_or_default())
            .collect())
    }

    fn filter_hashes_by_block_hashes(
        &self,
        hashes: &[Hash],
        _filter_type: u8,
    ) -> Result<Vec<Hash>, BoxError> {
        let filter_hashes = self.filter_hashes.lock();
        Ok(hashes
            .iter()
            .map(|h| filter_hashes.get(h).copied().unwrap_or(Hash::ZERO))
            .chain(self.extra_filter_hashes.lock().iter().copied())
            .collect())
    }

    fn filter_headers_by_block_hashes(
        &self,
        hashes: &[Hash],
        _filter_type: u8,
    ) -> Result<Vec<Hash>, BoxError> {
        let headers = self.filter_headers.lock();
        Ok(hashes
            .iter()
            .map(|h| headers.get(h).copied().unwrap_or(Hash::ZERO))
            .collect())
    }
}

/// A server wired to mock collaborators
pub struct TestNode {
    pub server: Server,
    pub addr_manager: Arc<MockAddrManager>,
    pub sync_manager: Arc<MockSyncManager>,
    pub dag: Arc<MockDag>,
    pub mempool: Arc<MockMempool>,
    pub conn_manager: Arc<MockConnManager>,
    pub filter_index: Arc<MockFilterIndex>,
    next_peer_id: AtomicU64,
    next_conn_id: AtomicU64,
}

impl TestNode {
    pub fn new(config: Config) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let settings = config.validate().expect("valid config");

        let addr_manager = Arc::new(MockAddrManager::default());
        let sync_manager = Arc::new(MockSyncManager::default());
        let dag = Arc::new(MockDag::default());
        let mempool = Arc::new(MockMempool::default());
        let conn_manager = Arc::new(MockConnManager::default());
        let filter_index = Arc::new(MockFilterIndex::default());

        let deps = Deps {
            addr_manager: addr_manager.clone(),
            sync_manager: sync_manager.clone(),
            dag: dag.clone(),
            mempool: mempool.clone(),
            conn_manager: conn_manager.clone(),
            filter_index: Some(filter_index.clone()),
        };
        let server = Server::new(settings, deps, Logger::default());

        Self {
            server,
            addr_manager,
            sync_manager,
            dag,
            mempool,
            conn_manager,
            filter_index,
            next_peer_id: AtomicU64::new(10_000),
            next_conn_id: AtomicU64::new(1),
        }
    }

    pub fn start(config: Config) -> Self {
        let node = Self::new(config);
        node.server.start();
        node
    }

    fn make_peer(
        &self,
        addr: &str,
        inbound: bool,
        permanent: bool,
        watched: bool,
    ) -> (Arc<Peer>, mpsc::UnboundedReceiver<Message>) {
        let addr = socket(addr);
        let conn_req = (!inbound).then(|| ConnReq {
            id: self.next_conn_id.fetch_add(1, Ordering::Relaxed),
            addr,
            permanent,
        });

        let (peer, rx) = if watched {
            self.server.new_peer(addr, inbound, conn_req)
        } else {
            let id = self.next_peer_id.fetch_add(1, Ordering::Relaxed);
            let config = PeerConfig {
                addr,
                inbound,
                conn_req,
            };
            Peer::new(self.server.clone(), id, config)
        };

        let services =
            ServiceFlags::NODE_NETWORK | ServiceFlags::NODE_BLOOM | ServiceFlags::NODE_CF;
        peer.set_version(remote_version(services));
        peer.mark_verack_received();
        (peer, rx)
    }

    /// A negotiated peer the server doesn't know about
    pub fn detached_peer(
        &self,
        addr: &str,
        inbound: bool,
    ) -> (Arc<Peer>, mpsc::UnboundedReceiver<Message>) {
        self.make_peer(addr, inbound, false, false)
    }

    pub fn detached_persistent_peer(
        &self,
        addr: &str,
    ) -> (Arc<Peer>, mpsc::UnboundedReceiver<Message>) {
        self.make_peer(addr, false, true, false)
    }

    /// A negotiated peer handed to the server. The peer may have been
    /// rejected; check `is_connected`.
    pub async fn connected_peer(
        &self,
        addr: &str,
        inbound: bool,
    ) -> (Arc<Peer>, mpsc::UnboundedReceiver<Message>) {
        let (peer, rx) = self.make_peer(addr, inbound, false, true);
        self.server.add_peer(&peer).await;
        self.server.connected_count().await.expect("server running");
        (peer, rx)
    }

    pub async fn connected_persistent_peer(
        &self,
        addr: &str,
    ) -> (Arc<Peer>, mpsc::UnboundedReceiver<Message>) {
        let (peer, rx) = self.make_peer(addr, false, true, true);
        self.server.add_peer(&peer).await;
        self.server.connected_count().await.expect("server running");
        (peer, rx)
    }
}

pub fn remote_version(services: ServiceFlags) -> MsgVersion {
    MsgVersion {
        protocol_version: PROTOCOL_VERSION,
        services,
        timestamp: Utc::now(),
        address: None,
        nonce: rand::random(),
        user_agent: "/remote:0.1.0/".to_string(),
        selected_tip_hash: Hash::digest(b"remote tip"),
        disable_relay_tx: false,
        subnetwork_id: None,
    }
}

/// Everything queued on the peer so far
pub fn drain(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<Message> {
    let mut out = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        out.push(msg);
    }
    out
}

/// Poll `check` for up to two seconds
pub async fn wait_until<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

pub fn sample_tx(seed: u8) -> MsgTx {
    MsgTx {
        version: 1,
        inputs: vec![TxIn {
            previous_outpoint: Outpoint {
                tx_id: Hash::digest(&[seed, 0xaa]),
                index: seed as u32,
            },
            signature_script: vec![seed; 8],
            sequence: u64::MAX,
        }],
        outputs: vec![TxOut {
            value: 1_000 * (seed as u64 + 1),
            script_pub_key: vec![0x76, 0xa9, seed],
        }],
        lock_time: 0,
        subnetwork_id: SubnetworkId::NATIVE,
        gas: 0,
        payload: Vec::new(),
    }
}

pub fn sample_block(seed: u8) -> MsgBlock {
    MsgBlock {
        header: BlockHeader {
            version: 1,
            parent_hashes: vec![Hash::digest(&[seed, 0xbb])],
            hash_merkle_root: Hash::digest(&[seed, 0xcc]),
            timestamp: 1_600_000_000 + seed as i64,
            bits: 0x207f_ffff,
            nonce: seed as u64,
        },
        transactions: vec![sample_tx(seed), sample_tx(seed.wrapping_add(100))],
    }
}
