//! Contracts of the subsystems the P2P server collaborates with
//!
//! The address manager, sync manager, DAG, mempool, connection manager and
//! committed-filter index live outside this crate. The server only needs the
//! narrow surface below. Implementations are expected to be non-blocking
//! relative to the server actor: they are called from the actor loop and from
//! per-peer read tasks.

use crate::peer::gate::ProcessedSignal;
use crate::peer::{Peer, PeerId};
use crate::wire::hash::{Hash, SubnetworkId};
use crate::wire::message::{BlockHeader, InvVect, MsgBlock, MsgTx, NetAddress, ServiceFlags};
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::sync::Arc;

/// Error type returned by collaborators
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A mempool transaction together with its fee rate
#[derive(Debug, Clone, PartialEq)]
pub struct TxDesc {
    pub tx: MsgTx,
    /// Fee rate in sompi per kilobyte
    pub fee_per_kb: i64,
    pub added: DateTime<Utc>,
}

impl TxDesc {
    pub fn tx_id(&self) -> Hash {
        self.tx.tx_id()
    }
}

/// A connection request tracked by the connection manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnReq {
    pub id: u64,
    pub addr: SocketAddr,
    pub permanent: bool,
}

/// Peer address bookkeeping
pub trait AddrManager: Send + Sync {
    /// Merge addresses learned from `source`
    fn add_addresses(
        &self,
        addrs: &[NetAddress],
        source: &NetAddress,
        subnetwork_id: Option<&SubnetworkId>,
    );

    /// Addresses suitable for a GetAddr reply
    fn address_cache(
        &self,
        include_all_subnetworks: bool,
        subnetwork_id: Option<&SubnetworkId>,
    ) -> Vec<NetAddress>;

    /// Our own address that best matches what `remote` can reach
    fn best_local_address(&self, remote: &NetAddress) -> Option<NetAddress>;

    fn host_to_net_address(
        &self,
        host: &str,
        port: u16,
        services: ServiceFlags,
    ) -> Result<NetAddress, BoxError>;

    fn need_more_addresses(&self) -> bool;

    /// Mark an address as a known good peer
    fn good(&self, addr: &NetAddress, subnetwork_id: Option<&SubnetworkId>);

    fn attempt(&self, addr: &NetAddress);

    /// Update the last-seen time of an address
    fn connected(&self, addr: &NetAddress);

    /// Network-topology bucket used to diversify outbound peers
    fn group_key(&self, addr: &NetAddress) -> String;

    fn net_address_key(&self, addr: &NetAddress) -> String;
}

/// Block/transaction download and validation pipeline
pub trait SyncManager: Send + Sync {
    /// Register a peer as a sync candidate
    fn new_peer(&self, peer: &Arc<Peer>);

    fn done_peer(&self, peer: &Arc<Peer>);

    /// Queue a block for validation; `done` must be signalled once processed
    fn queue_block(&self, block: MsgBlock, peer: &Arc<Peer>, done: ProcessedSignal);

    /// Queue a transaction for validation; `done` must be signalled once processed
    fn queue_tx(&self, tx: MsgTx, peer: &Arc<Peer>, done: ProcessedSignal);

    fn queue_inv(&self, inv: Vec<InvVect>, peer: &Arc<Peer>);

    fn queue_headers(&self, headers: Vec<BlockHeader>, peer: &Arc<Peer>);

    /// Whether the node believes it is synced with the network
    fn is_current(&self) -> bool;

    /// Restart sync negotiation with the best candidate
    fn start_sync(&self);

    fn remove_from_sync_candidates(&self, peer: &Arc<Peer>);

    fn sync_peer_id(&self) -> Option<PeerId>;
}

/// Read-only queries against the blockDAG
pub trait DagView: Send + Sync {
    fn genesis_hash(&self) -> Hash;

    fn selected_tip_hash(&self) -> Hash;

    fn is_in_dag(&self, hash: &Hash) -> bool;

    /// Whether the block is known and below the finality point
    fn is_known_finalized_block(&self, hash: &Hash) -> bool;

    fn block_locator_from_hashes(&self, high: &Hash, low: &Hash) -> Result<Vec<Hash>, BoxError>;

    /// Next (high, low) pair to narrow a peer's locator, or None if no hash
    /// in the locator can be resolved
    fn find_next_locator_boundaries(&self, locator: &[Hash]) -> Option<(Hash, Hash)>;

    fn blue_blocks_hashes_between(
        &self,
        low: &Hash,
        high: &Hash,
        max: usize,
    ) -> Result<Vec<Hash>, BoxError>;

    /// Headers of the blue blocks between `low` and `high`, at most `max`
    fn blue_blocks_headers_between(
        &self,
        low: &Hash,
        high: &Hash,
        max: usize,
    ) -> Result<Vec<BlockHeader>, BoxError>;

    /// Hashes from `start_height` up to `stop_hash`, at most `max`
    fn height_to_hash_range(
        &self,
        start_height: u64,
        stop_hash: &Hash,
        max: usize,
    ) -> Result<Vec<Hash>, BoxError>;

    /// Every `interval`-th block hash up to `stop_hash`
    fn interval_block_hashes(&self, stop_hash: &Hash, interval: u64)
        -> Result<Vec<Hash>, BoxError>;

    fn block_by_hash(&self, hash: &Hash) -> Result<Option<MsgBlock>, BoxError>;
}

/// Transaction memory pool
pub trait Mempool: Send + Sync {
    fn tx_descs(&self) -> Vec<TxDesc>;

    fn fetch_transaction(&self, tx_id: &Hash) -> Option<MsgTx>;

    /// Evict orphans received from the given peer; returns how many
    fn remove_orphans_by_tag(&self, tag: PeerId) -> usize;
}

/// Outbound connection lifecycle
pub trait ConnManager: Send + Sync {
    fn start(&self);

    fn stop(&self);

    /// Request a new outbound connection
    fn connect(&self, addr: SocketAddr, permanent: bool);

    /// Close the connection and retry it later if permanent
    fn disconnect(&self, conn_id: u64);

    /// Close the connection and forget it
    fn remove(&self, conn_id: u64);

    /// The request's connection was accepted by the server
    fn notify_connection_request_complete(&self, req: &ConnReq);
}

/// Committed (BIP 157 style) filter index
pub trait FilterIndex: Send + Sync {
    fn filters_by_block_hashes(
        &self,
        hashes: &[Hash],
        filter_type: u8,
    ) -> Result<Vec<Vec<u8>>, BoxError>;

    fn filter_hashes_by_block_hashes(
        &self,
        hashes: &[Hash],
        filter_type: u8,
    ) -> Result<Vec<Hash>, BoxError>;

    fn filter_headers_by_block_hashes(
        &self,
        hashes: &[Hash],
        filter_type: u8,
    ) -> Result<Vec<Hash>, BoxError>;
}

/// Bundle of collaborators handed to the server
#[derive(Clone)]
pub struct Deps {
    pub addr_manager: Arc<dyn AddrManager>,
    pub sync_manager: Arc<dyn SyncManager>,
    pub dag: Arc<dyn DagView>,
    pub mempool: Arc<dyn Mempool>,
    pub conn_manager: Arc<dyn ConnManager>,
    /// Only present when committed filters are served
    pub filter_index: Option<Arc<dyn FilterIndex>>,
}
