//! Wire protocol types
//!
//! Message definitions, identifiers, framing and peer bloom filters.

pub mod bloom;
pub mod codec;
pub mod hash;
pub mod message;

pub use bloom::BloomFilter;
pub use codec::MessageCodec;
pub use hash::{Hash, HashParseError, SubnetworkId};
pub use message::{
    BlockHeader, BloomUpdateType, InvType, InvVect, Message, MsgBlock, MsgFilterLoad,
    MsgMerkleBlock, MsgTx, MsgVersion, NetAddress, Outpoint, ServiceFlags, TxIn, TxOut,
    MAX_ADDR_PER_MSG, MAX_INV_PER_MSG, MAX_SOMPI, PROTOCOL_VERSION,
};
