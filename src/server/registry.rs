//! Peer registry owned by the server actor
//!
//! Every registered peer lives in exactly one of the inbound, outbound or
//! persistent maps. The registry also holds the ban list and the number of
//! outbound peers per network group.

use crate::peer::{Peer, PeerId};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;

/// Which map a peer belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerClass {
    Inbound,
    Outbound,
    Persistent,
}

impl PeerClass {
    pub fn of(peer: &Peer) -> Self {
        if peer.is_persistent() {
            PeerClass::Persistent
        } else if peer.is_inbound() {
            PeerClass::Inbound
        } else {
            PeerClass::Outbound
        }
    }
}

#[derive(Default)]
pub struct PeerRegistry {
    inbound: HashMap<PeerId, Arc<Peer>>,
    outbound: HashMap<PeerId, Arc<Peer>>,
    persistent: HashMap<PeerId, Arc<Peer>>,
    banned: HashMap<String, DateTime<Utc>>,
    outbound_groups: HashMap<String, usize>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered peers
    pub fn count(&self) -> usize {
        self.inbound.len() + self.outbound.len() + self.persistent.len()
    }

    pub fn inbound_count(&self) -> usize {
        self.inbound.len()
    }

    pub fn peers(&self) -> impl Iterator<Item = &Arc<Peer>> {
        self.inbound
            .values()
            .chain(self.outbound.values())
            .chain(self.persistent.values())
    }

    pub fn persistent_peers(&self) -> impl Iterator<Item = &Arc<Peer>> {
        self.persistent.values()
    }

    pub fn contains(&self, id: PeerId) -> bool {
        self.inbound.contains_key(&id)
            || self.outbound.contains_key(&id)
            || self.persistent.contains_key(&id)
    }

    fn map_mut(&mut self, class: PeerClass) -> &mut HashMap<PeerId, Arc<Peer>> {
        match class {
            PeerClass::Inbound => &mut self.inbound,
            PeerClass::Outbound => &mut self.outbound,
            PeerClass::Persistent => &mut self.persistent,
        }
    }

    /// Insert a peer; outbound peers count towards `group_key`
    pub fn insert(&mut self, peer: Arc<Peer>, group_key: Option<String>) {
        if let Some(key) = group_key {
            *self.outbound_groups.entry(key).or_insert(0) += 1;
        }
        self.map_mut(PeerClass::of(&peer)).insert(peer.id(), peer);
    }

    /// Remove a peer, decrementing `group_key` if it was present.
    /// Returns false if the peer wasn't registered.
    pub fn remove(&mut self, peer: &Peer, group_key: Option<&str>) -> bool {
        let removed = self
            .map_mut(PeerClass::of(peer))
            .remove(&peer.id())
            .is_some();
        if removed {
            if let Some(key) = group_key {
                self.decrement_group(key);
            }
        }
        removed
    }

    /// Remove and return the first peer of `class` matching `pred`
    pub fn take_matching(
        &mut self,
        class: PeerClass,
        pred: impl Fn(&Peer) -> bool,
    ) -> Option<Arc<Peer>> {
        let map = self.map_mut(class);
        let id = map.values().find(|peer| pred(peer))?.id();
        map.remove(&id)
    }

    pub fn outbound_group_count(&self, key: &str) -> usize {
        self.outbound_groups.get(key).copied().unwrap_or(0)
    }

    pub fn decrement_group(&mut self, key: &str) {
        if let Some(count) = self.outbound_groups.get_mut(key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.outbound_groups.remove(key);
            }
        }
    }

    pub fn ban(&mut self, host: String, until: DateTime<Utc>) {
        self.banned.insert(host, until);
    }

    /// Ban expiry of `host` if it is still banned at `now`. Expired bans are
    /// purged.
    pub fn banned_until(&mut self, host: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let until = *self.banned.get(host)?;
        if now < until {
            return Some(until);
        }
        self.banned.remove(host);
        None
    }

    pub fn banned(&self) -> impl Iterator<Item = (&String, &DateTime<Utc>)> {
        self.banned.iter()
    }
}
