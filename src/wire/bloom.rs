//! Peer-side bloom filters (BIP 37 style)
//!
//! A remote peer loads a filter with FilterLoad and only receives
//! transactions that match it. Matching can update the filter so that
//! later spends of matched outputs are also relayed.

use crate::wire::message::{
    BloomUpdateType, MsgFilterLoad, MsgTx, Outpoint, MAX_FILTER_LOAD_FILTER_SIZE,
    MAX_FILTER_LOAD_HASH_FUNCS,
};
use sha2::{Digest, Sha256};

/// Length of a pay-to-pubkey script: push(33) + pubkey + OP_CHECKSIG
const P2PK_SCRIPT_LEN: usize = 35;
const OP_CHECKSIG: u8 = 0xac;

/// Bloom filter loaded by a remote peer
#[derive(Debug, Clone)]
pub struct BloomFilter {
    /// Filter data (bit array)
    data: Vec<u8>,
    /// Number of hash functions
    hash_funcs: u32,
    /// Tweak for hash randomization
    tweak: u32,
    /// Update behaviour on output matches
    flags: BloomUpdateType,
}

impl BloomFilter {
    /// Build a filter from a FilterLoad message, clamping to protocol limits
    pub fn from_load(msg: &MsgFilterLoad) -> Self {
        let mut data = msg.filter.clone();
        data.truncate(MAX_FILTER_LOAD_FILTER_SIZE);
        Self {
            data,
            hash_funcs: msg.hash_funcs.min(MAX_FILTER_LOAD_HASH_FUNCS),
            tweak: msg.tweak,
            flags: msg.flags,
        }
    }

    /// Create an empty filter with the given size
    pub fn new(size_bytes: usize, hash_funcs: u32, tweak: u32, flags: BloomUpdateType) -> Self {
        Self {
            data: vec![0u8; size_bytes.clamp(1, MAX_FILTER_LOAD_FILTER_SIZE)],
            hash_funcs: hash_funcs.min(MAX_FILTER_LOAD_HASH_FUNCS),
            tweak,
            flags,
        }
    }

    /// Add data to the filter
    pub fn insert(&mut self, data: &[u8]) {
        if self.data.is_empty() {
            return;
        }
        for i in 0..self.hash_funcs {
            let idx = self.hash(data, i);
            self.set_bit(idx);
        }
    }

    /// Check if data might be in the filter
    pub fn contains(&self, data: &[u8]) -> bool {
        if self.data.is_empty() {
            return false;
        }
        (0..self.hash_funcs).all(|i| self.get_bit(self.hash(data, i)))
    }

    /// Check a transaction against the filter, inserting matched outpoints
    /// according to the update flags
    pub fn match_tx_and_update(&mut self, tx: &MsgTx) -> bool {
        let tx_id = tx.tx_id();
        let mut matched = self.contains(tx_id.as_bytes());

        for (index, output) in tx.outputs.iter().enumerate() {
            if !self.contains(&output.script_pub_key) {
                continue;
            }
            matched = true;

            let outpoint = Outpoint {
                tx_id,
                index: index as u32,
            };
            match self.flags {
                BloomUpdateType::All => self.insert(&outpoint.to_bytes()),
                BloomUpdateType::P2PubkeyOnly if is_pay_to_pubkey(&output.script_pub_key) => {
                    self.insert(&outpoint.to_bytes())
                }
                _ => {}
            }
        }

        if matched {
            return true;
        }

        tx.inputs.iter().any(|input| {
            self.contains(&input.previous_outpoint.to_bytes())
                || (!input.signature_script.is_empty() && self.contains(&input.signature_script))
        })
    }

    /// Get filter size in bytes
    pub fn size(&self) -> usize {
        self.data.len()
    }

    // Private helpers

    fn hash(&self, data: &[u8], n: u32) -> usize {
        let seed = n.wrapping_mul(0xFBA4_C795).wrapping_add(self.tweak);
        let mut hasher = Sha256::new();
        hasher.update(seed.to_le_bytes());
        hasher.update(data);
        let hash = hasher.finalize();

        let idx = u32::from_le_bytes([hash[0], hash[1], hash[2], hash[3]]);
        (idx as usize) % (self.data.len() * 8)
    }

    fn set_bit(&mut self, idx: usize) {
        self.data[idx / 8] |= 1 << (idx % 8);
    }

    fn get_bit(&self, idx: usize) -> bool {
        (self.data[idx / 8] & (1 << (idx % 8))) != 0
    }
}

fn is_pay_to_pubkey(script: &[u8]) -> bool {
    script.len() == P2PK_SCRIPT_LEN && script[0] == 33 && script[P2PK_SCRIPT_LEN - 1] == OP_CHECKSIG
}
