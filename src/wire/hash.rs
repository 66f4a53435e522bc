//! Hash and subnetwork identifiers
//!
//! Block hashes, transaction ids and subnetwork ids used on the wire.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Size of a block or transaction hash in bytes
pub const HASH_SIZE: usize = 32;

/// Size of a subnetwork id in bytes
pub const SUBNETWORK_ID_SIZE: usize = 20;

/// Errors parsing hex-encoded identifiers
#[derive(Error, Debug, PartialEq)]
pub enum HashParseError {
    #[error("Invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
    #[error("Invalid length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

/// Computes SHA-256 hash of the input data
pub fn sha256(data: &[u8]) -> [u8; HASH_SIZE] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Computes double SHA-256 hash (SHA-256 of SHA-256)
pub fn double_sha256(data: &[u8]) -> [u8; HASH_SIZE] {
    sha256(&sha256(data))
}

/// A 32-byte block hash or transaction id
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Hash(pub [u8; HASH_SIZE]);

impl Hash {
    pub const ZERO: Hash = Hash([0u8; HASH_SIZE]);

    /// Hash arbitrary bytes with double SHA-256
    pub fn digest(data: &[u8]) -> Self {
        Hash(double_sha256(data))
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; HASH_SIZE]
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self)
    }
}

impl FromStr for Hash {
    type Err = HashParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Hash(decode_fixed::<HASH_SIZE>(s)?))
    }
}

/// Identifies the subnetwork a transaction belongs to
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SubnetworkId(pub [u8; SUBNETWORK_ID_SIZE]);

impl SubnetworkId {
    /// Subnetwork of ordinary transfers
    pub const NATIVE: SubnetworkId = SubnetworkId([0u8; SUBNETWORK_ID_SIZE]);

    /// Subnetwork of coinbase transactions
    pub const COINBASE: SubnetworkId = {
        let mut id = [0u8; SUBNETWORK_ID_SIZE];
        id[0] = 1;
        SubnetworkId(id)
    };

    /// Subnetwork of subnetwork-registry transactions
    pub const REGISTRY: SubnetworkId = {
        let mut id = [0u8; SUBNETWORK_ID_SIZE];
        id[0] = 2;
        SubnetworkId(id)
    };

    /// Built-in subnetworks are relayed to every node, partial or full
    pub fn is_built_in(&self) -> bool {
        *self == Self::NATIVE || *self == Self::COINBASE || *self == Self::REGISTRY
    }
}

impl fmt::Display for SubnetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for SubnetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubnetworkId({})", self)
    }
}

impl FromStr for SubnetworkId {
    type Err = HashParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(SubnetworkId(decode_fixed::<SUBNETWORK_ID_SIZE>(s)?))
    }
}

fn decode_fixed<const N: usize>(s: &str) -> Result<[u8; N], HashParseError> {
    let bytes = hex::decode(s)?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| HashParseError::InvalidLength {
            expected: N,
            actual: bytes.len(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_double_sha256() {
        let hash = double_sha256(b"hello world");
        assert_eq!(hash.len(), 32);
        assert_ne!(hash, sha256(b"hello world"));
    }

    #[test]
    fn test_hash_hex_parse() {
        let hash = Hash::digest(b"block");
        let parsed: Hash = hash.to_string().parse().unwrap();
        assert_eq!(parsed, hash);

        assert!(matches!(
            "abcd".parse::<Hash>(),
            Err(HashParseError::InvalidLength { expected: 32, actual: 2 })
        ));
        assert!("zz".parse::<Hash>().is_err());
    }

    #[test]
    fn test_built_in_subnetworks() {
        assert!(SubnetworkId::NATIVE.is_built_in());
        assert!(SubnetworkId::COINBASE.is_built_in());
        assert!(SubnetworkId::REGISTRY.is_built_in());

        let mut custom = [0u8; SUBNETWORK_ID_SIZE];
        custom[0] = 9;
        assert!(!SubnetworkId(custom).is_built_in());
    }
}
