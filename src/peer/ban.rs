//! Dynamic ban scoring
//!
//! A ban score has a persistent part that never decays and a transient part
//! that decays exponentially with a one minute half-life. Transient scores
//! older than the lifetime are dropped entirely.

use chrono::Utc;
use std::fmt;

/// Half-life of the transient score in seconds
pub const HALFLIFE_SECS: i64 = 60;

/// Transient scores older than this are forgotten
pub const LIFETIME_SECS: i64 = 1800;

// Penalties for specific misbehaviour.
pub const BAN_SCORE_NON_VERSION_FIRST_MESSAGE: u32 = 1;
pub const BAN_SCORE_DUPLICATE_VERSION: u32 = 1;
pub const BAN_SCORE_DUPLICATE_VERACK: u32 = 1;
pub const BAN_SCORE_SENT_TOO_MANY_ADDRESSES: u32 = 20;
pub const BAN_SCORE_MSG_ADDR_WITH_INVALID_SUBNETWORK: u32 = 10;
pub const BAN_SCORE_SENT_TX_TO_BLOCKS_ONLY: u32 = 20;
pub const BAN_SCORE_NODE_BLOOM_FLAG_VIOLATION: u32 = 100;
pub const BAN_SCORE_INVALID_FILTER: u32 = 100;
pub const BAN_SCORE_NO_FILTER_LOADED: u32 = 5;
pub const BAN_SCORE_INVALID_MSG_GET_BLOCK_INVS: u32 = 10;
pub const BAN_SCORE_INVALID_MSG_BLOCK_LOCATOR: u32 = 100;
pub const BAN_SCORE_EMPTY_BLOCK_LOCATOR: u32 = 100;
pub const BAN_SCORE_UNREQUESTED_BLOCK_LOCATOR: u32 = 100;

/// Transient penalty for each MemPool request
pub const BAN_SCORE_MEMPOOL_REQUEST: u32 = 33;

/// Transient penalty for a GetData of the maximum size
pub const BAN_SCORE_MAX_GET_DATA: u32 = 99;

fn decay_factor(elapsed_secs: i64) -> f64 {
    let lambda = std::f64::consts::LN_2 / HALFLIFE_SECS as f64;
    (-lambda * elapsed_secs as f64).exp()
}

/// Ban score with a persistent and a decaying transient component
#[derive(Debug, Clone, Default)]
pub struct DynamicBanScore {
    persistent: u32,
    transient: f64,
    /// Unix time of the last transient update
    last_unix: i64,
}

impl DynamicBanScore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current score
    pub fn int(&self) -> u32 {
        self.int_at(Utc::now().timestamp())
    }

    /// Add to both components and return the new score
    pub fn increase(&mut self, persistent: u32, transient: u32) -> u32 {
        self.increase_at(persistent, transient, Utc::now().timestamp())
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub(crate) fn int_at(&self, now: i64) -> u32 {
        let elapsed = now - self.last_unix;
        if self.transient < 1.0 || elapsed < 0 || elapsed > LIFETIME_SECS {
            return self.persistent;
        }
        self.persistent
            .saturating_add((self.transient * decay_factor(elapsed)) as u32)
    }

    pub(crate) fn increase_at(&mut self, persistent: u32, transient: u32, now: i64) -> u32 {
        self.persistent = self.persistent.saturating_add(persistent);
        if transient > 0 {
            let elapsed = now - self.last_unix;
            if elapsed > LIFETIME_SECS {
                self.transient = 0.0;
            } else if self.transient > 1.0 && elapsed > 0 {
                self.transient *= decay_factor(elapsed);
            }
            self.transient += f64::from(transient);
            self.last_unix = now;
        }
        self.persistent.saturating_add(self.transient as u32)
    }
}

impl fmt::Display for DynamicBanScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let now = Utc::now().timestamp();
        write!(
            f,
            "persistent {} + transient {} at {} = {} as of now",
            self.persistent,
            self.transient,
            self.last_unix,
            self.int_at(now)
        )
    }
}
