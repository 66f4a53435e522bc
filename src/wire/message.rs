//! Network message types for P2P communication
//!
//! Defines every message exchanged between blockDAG peers. The byte-level
//! encoding of a message is the serde representation produced by
//! [`Message::to_bytes`]; framing lives in [`crate::wire::codec`].

use crate::wire::hash::{Hash, SubnetworkId};
use bitflags::bitflags;
use bytes::BufMut;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Lowest protocol version we will talk to
pub const MIN_PROTOCOL_VERSION: u32 = 1;

/// Magic bytes for message framing
pub const MAGIC: [u8; 4] = [0x44, 0x41, 0x47, 0x4E]; // "DAGN"

/// Maximum serialized payload of a single message
pub const MAX_MESSAGE_SIZE: usize = 32 * 1024 * 1024;

/// Maximum addresses in a single Addr message
pub const MAX_ADDR_PER_MSG: usize = 1000;

/// Maximum inventory vectors in a single Inv/GetData/NotFound message
pub const MAX_INV_PER_MSG: usize = 1 << 17;

/// Maximum headers in a single Headers message
pub const MAX_BLOCK_HEADERS_PER_MSG: usize = 2000;

/// Maximum hashes in a BlockLocator message
pub const MAX_BLOCK_LOCATORS_PER_MSG: usize = 500;

/// Maximum user agent length accepted in a Version message
pub const MAX_USER_AGENT_LEN: usize = 256;

/// Maximum hash functions a FilterLoad may request
pub const MAX_FILTER_LOAD_HASH_FUNCS: u32 = 50;

/// Maximum FilterLoad filter size in bytes
pub const MAX_FILTER_LOAD_FILTER_SIZE: usize = 36_000;

/// Maximum FilterAdd data element size in bytes
pub const MAX_FILTER_ADD_DATA_SIZE: usize = 520;

/// Maximum block range of a GetCFilters request
pub const MAX_GET_CFILTERS_REQ_RANGE: usize = 1000;

/// Maximum filter hashes in a CFHeaders message
pub const MAX_CF_HEADERS_PER_MSG: usize = 2000;

/// Block interval between committed-filter checkpoints
pub const CF_CHECKPT_INTERVAL: u64 = 1000;

/// Regular (basic) committed filter type
pub const FILTER_TYPE_REGULAR: u8 = 0;

/// Smallest currency unit per coin
pub const SOMPI_PER_COIN: i64 = 100_000_000;

/// Maximum amount of sompi that can ever exist
pub const MAX_SOMPI: i64 = 21_000_000 * SOMPI_PER_COIN;

bitflags! {
    /// Services a node advertises in its Version message
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ServiceFlags: u64 {
        /// Full node serving the whole blockDAG
        const NODE_NETWORK = 1;
        /// Supports bloom filtering (FilterLoad/FilterAdd/FilterClear/MemPool)
        const NODE_BLOOM = 1 << 2;
        /// Serves committed filters
        const NODE_CF = 1 << 6;
    }
}

/// A peer network address with its last-seen timestamp
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetAddress {
    pub timestamp: DateTime<Utc>,
    pub services: ServiceFlags,
    pub ip: IpAddr,
    pub port: u16,
}

impl NetAddress {
    pub fn new(ip: IpAddr, port: u16, services: ServiceFlags) -> Self {
        Self {
            timestamp: Utc::now(),
            services,
            ip,
            port,
        }
    }

    pub fn from_socket_addr(addr: SocketAddr, services: ServiceFlags) -> Self {
        Self::new(addr.ip(), addr.port(), services)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Key used to de-duplicate addresses ("ip:port")
    pub fn key(&self) -> String {
        self.socket_addr().to_string()
    }

    /// Whether the address is reachable from the public internet
    pub fn is_routable(&self) -> bool {
        if self.port == 0 {
            return false;
        }
        match self.ip {
            IpAddr::V4(ip) => {
                !(ip.is_private()
                    || ip.is_loopback()
                    || ip.is_link_local()
                    || ip.is_broadcast()
                    || ip.is_documentation()
                    || ip.is_unspecified())
            }
            IpAddr::V6(ip) => !(ip.is_loopback() || ip.is_unspecified()),
        }
    }
}

impl fmt::Display for NetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

/// Kind of object an inventory vector refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvType {
    Error,
    Tx,
    Block,
    FilteredBlock,
    /// Block announced during initial sync
    SyncBlock,
}

/// Inventory vector: announces an object without its payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvVect {
    pub inv_type: InvType,
    pub hash: Hash,
}

impl InvVect {
    pub fn new(inv_type: InvType, hash: Hash) -> Self {
        Self { inv_type, hash }
    }

    pub fn tx(hash: Hash) -> Self {
        Self::new(InvType::Tx, hash)
    }

    pub fn block(hash: Hash) -> Self {
        Self::new(InvType::Block, hash)
    }

    pub fn is_tx(&self) -> bool {
        self.inv_type == InvType::Tx
    }
}

impl fmt::Display for InvVect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {}", self.inv_type, self.hash)
    }
}

/// Reference to a previous transaction output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Outpoint {
    pub tx_id: Hash,
    pub index: u32,
}

impl Outpoint {
    /// Serialized form used for bloom filter matching
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(36);
        buf.put_slice(self.tx_id.as_bytes());
        buf.put_u32_le(self.index);
        buf
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxIn {
    pub previous_outpoint: Outpoint,
    pub signature_script: Vec<u8>,
    pub sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOut {
    pub value: u64,
    pub script_pub_key: Vec<u8>,
}

/// A transaction as it travels on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgTx {
    pub version: i32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u64,
    pub subnetwork_id: SubnetworkId,
    pub gas: u64,
    pub payload: Vec<u8>,
}

impl MsgTx {
    /// Transaction id: double SHA-256 of the canonical encoding
    pub fn tx_id(&self) -> Hash {
        let mut buf = Vec::new();
        buf.put_i32_le(self.version);
        buf.put_u64_le(self.inputs.len() as u64);
        for input in &self.inputs {
            buf.put_slice(&input.previous_outpoint.to_bytes());
            put_var_bytes(&mut buf, &input.signature_script);
            buf.put_u64_le(input.sequence);
        }
        buf.put_u64_le(self.outputs.len() as u64);
        for output in &self.outputs {
            buf.put_u64_le(output.value);
            put_var_bytes(&mut buf, &output.script_pub_key);
        }
        buf.put_u64_le(self.lock_time);
        buf.put_slice(&self.subnetwork_id.0);
        buf.put_u64_le(self.gas);
        put_var_bytes(&mut buf, &self.payload);
        Hash::digest(&buf)
    }

    /// Whether a node following `subnetwork` (None = full node) should see this tx
    pub fn is_subnetwork_compatible(&self, subnetwork: Option<&SubnetworkId>) -> bool {
        match subnetwork {
            None => true,
            Some(id) => self.subnetwork_id.is_built_in() || self.subnetwork_id == *id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: i32,
    pub parent_hashes: Vec<Hash>,
    pub hash_merkle_root: Hash,
    pub timestamp: i64,
    pub bits: u32,
    pub nonce: u64,
}

impl BlockHeader {
    pub fn block_hash(&self) -> Hash {
        let mut buf = Vec::new();
        buf.put_i32_le(self.version);
        buf.put_u64_le(self.parent_hashes.len() as u64);
        for parent in &self.parent_hashes {
            buf.put_slice(parent.as_bytes());
        }
        buf.put_slice(self.hash_merkle_root.as_bytes());
        buf.put_i64_le(self.timestamp);
        buf.put_u32_le(self.bits);
        buf.put_u64_le(self.nonce);
        Hash::digest(&buf)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgBlock {
    pub header: BlockHeader,
    pub transactions: Vec<MsgTx>,
}

impl MsgBlock {
    pub fn block_hash(&self) -> Hash {
        self.header.block_hash()
    }
}

/// A block reduced to the transactions matching a peer's bloom filter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgMerkleBlock {
    pub header: BlockHeader,
    pub total_transactions: u32,
    pub matched_tx_ids: Vec<Hash>,
}

/// First message each side sends after connecting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgVersion {
    pub protocol_version: u32,
    pub services: ServiceFlags,
    pub timestamp: DateTime<Utc>,
    /// Address of the receiving peer as seen by the sender
    pub address: Option<NetAddress>,
    pub nonce: u64,
    pub user_agent: String,
    pub selected_tip_hash: Hash,
    pub disable_relay_tx: bool,
    /// None for full nodes
    pub subnetwork_id: Option<SubnetworkId>,
}

/// How a loaded bloom filter is updated when an output matches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BloomUpdateType {
    None,
    All,
    P2PubkeyOnly,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgFilterLoad {
    pub filter: Vec<u8>,
    pub hash_funcs: u32,
    pub tweak: u32,
    pub flags: BloomUpdateType,
}

/// Network message types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    Version(MsgVersion),
    VerAck,
    Ping(u64),
    Pong(u64),

    GetAddr {
        include_all_subnetworks: bool,
        subnetwork_id: Option<SubnetworkId>,
    },
    Addr {
        include_all_subnetworks: bool,
        subnetwork_id: Option<SubnetworkId>,
        addresses: Vec<NetAddress>,
    },

    Inv(Vec<InvVect>),
    GetData(Vec<InvVect>),
    NotFound(Vec<InvVect>),

    Block(MsgBlock),
    MerkleBlock(MsgMerkleBlock),
    Tx(MsgTx),

    GetBlockLocator {
        high_hash: Hash,
        low_hash: Hash,
    },
    BlockLocator(Vec<Hash>),
    GetBlockInvs {
        low_hash: Hash,
        high_hash: Hash,
    },

    GetHeaders {
        low_hash: Hash,
        high_hash: Hash,
    },
    Headers(Vec<BlockHeader>),

    FeeFilter(i64),
    FilterLoad(MsgFilterLoad),
    FilterAdd(Vec<u8>),
    FilterClear,
    MemPool,

    GetSelectedTip,
    SelectedTip(Hash),

    GetCFilters {
        filter_type: u8,
        start_height: u64,
        stop_hash: Hash,
    },
    CFilter {
        filter_type: u8,
        block_hash: Hash,
        data: Vec<u8>,
    },
    GetCFHeaders {
        filter_type: u8,
        start_height: u64,
        stop_hash: Hash,
    },
    CFHeaders {
        filter_type: u8,
        stop_hash: Hash,
        prev_filter_header: Hash,
        filter_hashes: Vec<Hash>,
    },
    GetCFCheckpt {
        filter_type: u8,
        stop_hash: Hash,
    },
    CFCheckpt {
        filter_type: u8,
        stop_hash: Hash,
        filter_headers: Vec<Hash>,
    },
}

impl Message {
    /// Serialize message to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize message from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    /// Command name for logging
    pub fn command(&self) -> &'static str {
        match self {
            Message::Version(_) => "version",
            Message::VerAck => "verack",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::GetAddr { .. } => "getaddr",
            Message::Addr { .. } => "addr",
            Message::Inv(_) => "inv",
            Message::GetData(_) => "getdata",
            Message::NotFound(_) => "notfound",
            Message::Block(_) => "block",
            Message::MerkleBlock(_) => "merkleblock",
            Message::Tx(_) => "tx",
            Message::GetBlockLocator { .. } => "getlocator",
            Message::BlockLocator(_) => "locator",
            Message::GetBlockInvs { .. } => "getblockinvs",
            Message::GetHeaders { .. } => "getheaders",
            Message::Headers(_) => "headers",
            Message::FeeFilter(_) => "feefilter",
            Message::FilterLoad(_) => "filterload",
            Message::FilterAdd(_) => "filteradd",
            Message::FilterClear => "filterclear",
            Message::MemPool => "mempool",
            Message::GetSelectedTip => "getseltip",
            Message::SelectedTip(_) => "seltip",
            Message::GetCFilters { .. } => "getcfilters",
            Message::CFilter { .. } => "cfilter",
            Message::GetCFHeaders { .. } => "getcfheaders",
            Message::CFHeaders { .. } => "cfheaders",
            Message::GetCFCheckpt { .. } => "getcfcheckpt",
            Message::CFCheckpt { .. } => "cfcheckpt",
        }
    }
}

fn put_var_bytes(buf: &mut Vec<u8>, data: &[u8]) {
    buf.put_u64_le(data.len() as u64);
    buf.put_slice(data);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn sample_tx(subnetwork_id: SubnetworkId) -> MsgTx {
        MsgTx {
            version: 1,
            inputs: vec![TxIn {
                previous_outpoint: Outpoint {
                    tx_id: Hash::digest(b"prev"),
                    index: 0,
                },
                signature_script: vec![1, 2, 3],
                sequence: u64::MAX,
            }],
            outputs: vec![TxOut {
                value: 5_000,
                script_pub_key: vec![0xaa; 25],
            }],
            lock_time: 0,
            subnetwork_id,
            gas: 0,
            payload: Vec::new(),
        }
    }

    #[test]
    fn test_message_serialization() {
        let msg = Message::Ping(12345);
        let bytes = msg.to_bytes().unwrap();
        let decoded = Message::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, Message::Ping(12345));
    }

    #[test]
    fn test_tx_id_depends_on_contents() {
        let tx = sample_tx(SubnetworkId::NATIVE);
        let mut other = tx.clone();
        other.outputs[0].value += 1;

        assert_eq!(tx.tx_id(), tx.clone().tx_id());
        assert_ne!(tx.tx_id(), other.tx_id());
    }

    #[test]
    fn test_subnetwork_compatibility() {
        let mut partial = [0u8; 20];
        partial[0] = 7;
        let partial = SubnetworkId(partial);

        let native = sample_tx(SubnetworkId::NATIVE);
        let custom = sample_tx(partial);

        assert!(custom.is_subnetwork_compatible(None));
        assert!(custom.is_subnetwork_compatible(Some(&partial)));
        assert!(native.is_subnetwork_compatible(Some(&partial)));

        let mut other = [0u8; 20];
        other[0] = 8;
        assert!(!custom.is_subnetwork_compatible(Some(&SubnetworkId(other))));
    }

    #[test]
    fn test_routable_addresses() {
        let na = |ip: Ipv4Addr| NetAddress::new(IpAddr::V4(ip), 16111, ServiceFlags::NODE_NETWORK);
        let public = na(Ipv4Addr::new(8, 8, 8, 8));
        let private = na(Ipv4Addr::new(10, 0, 0, 1));
        let loopback = na(Ipv4Addr::LOCALHOST);

        assert!(public.is_routable());
        assert!(!private.is_routable());
        assert!(!loopback.is_routable());
        assert_eq!(public.key(), "8.8.8.8:16111");
    }
}
