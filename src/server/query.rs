//! Generic queries answered by the server actor
//!
//! Used by the RPC layer for peer listings and manual peer management. Each
//! query carries a oneshot reply channel.

use crate::peer::{Peer, PeerId, PeerInfo};
use crate::server::actor::PeerHandler;
use crate::server::registry::PeerClass;
use crate::server::ServerError;
use chrono::{DateTime, Utc};
use log::debug;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Selects a peer by address ("ip:port") or id
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerSelector {
    Addr(String),
    Id(PeerId),
}

impl PeerSelector {
    pub fn matches(&self, peer: &Peer) -> bool {
        match self {
            PeerSelector::Addr(addr) => peer.addr().to_string() == *addr,
            PeerSelector::Id(id) => peer.id() == *id,
        }
    }
}

pub enum Query {
    ConnectedCount {
        reply: oneshot::Sender<usize>,
    },
    OutboundGroupCount {
        key: String,
        reply: oneshot::Sender<usize>,
    },
    ShouldMineOnGenesis {
        reply: oneshot::Sender<bool>,
    },
    Peers {
        reply: oneshot::Sender<Vec<PeerInfo>>,
    },
    PersistentPeers {
        reply: oneshot::Sender<Vec<Arc<Peer>>>,
    },
    BannedHosts {
        reply: oneshot::Sender<Vec<(String, DateTime<Utc>)>>,
    },
    /// Ask the connection manager for a new outbound connection
    Connect {
        addr: String,
        target: SocketAddr,
        permanent: bool,
        reply: oneshot::Sender<Result<(), ServerError>>,
    },
    /// Drop a persistent peer and forget its connection request
    Remove {
        selector: PeerSelector,
        reply: oneshot::Sender<Result<(), ServerError>>,
    },
    /// Disconnect an inbound or outbound peer
    Disconnect {
        selector: PeerSelector,
        reply: oneshot::Sender<Result<(), ServerError>>,
    },
}

impl PeerHandler {
    pub(super) fn handle_query(&mut self, query: Query) {
        // A dropped reply receiver just means the caller stopped waiting
        match query {
            Query::ConnectedCount { reply } => {
                let count = self.registry.peers().filter(|p| p.is_connected()).count();
                let _ = reply.send(count);
            }
            Query::OutboundGroupCount { key, reply } => {
                let _ = reply.send(self.registry.outbound_group_count(&key));
            }
            Query::ShouldMineOnGenesis { reply } => {
                let _ = reply.send(self.should_mine_on_genesis());
            }
            Query::Peers { reply } => {
                let sync_peer = self.server.deps().sync_manager.sync_peer_id();
                let mut peers: Vec<PeerInfo> = self
                    .registry
                    .peers()
                    .filter(|p| p.is_connected())
                    .map(|p| p.info(Some(p.id()) == sync_peer))
                    .collect();
                peers.sort_by_key(|info| info.id);
                let _ = reply.send(peers);
            }
            Query::PersistentPeers { reply } => {
                let _ = reply.send(self.registry.persistent_peers().cloned().collect());
            }
            Query::BannedHosts { reply } => {
                let now = Utc::now();
                let banned = self
                    .registry
                    .banned()
                    .filter(|(_, until)| **until > now)
                    .map(|(host, until)| (host.clone(), *until))
                    .collect();
                let _ = reply.send(banned);
            }
            Query::Connect {
                addr,
                target,
                permanent,
                reply,
            } => {
                let _ = reply.send(self.connect(&addr, target, permanent));
            }
            Query::Remove { selector, reply } => {
                let _ = reply.send(self.remove(&selector));
            }
            Query::Disconnect { selector, reply } => {
                let _ = reply.send(self.disconnect(&selector));
            }
        }
    }

    fn should_mine_on_genesis(&self) -> bool {
        if self.registry.count() == 0 {
            return true;
        }
        let genesis = self.server.deps().dag.genesis_hash();
        self.registry
            .peers()
            .all(|p| p.selected_tip_hash() == Some(genesis))
    }

    fn connect(&self, addr: &str, target: SocketAddr, permanent: bool) -> Result<(), ServerError> {
        if self.registry.count() >= self.server.settings().max_peers() {
            return Err(ServerError::MaxPeersReached);
        }
        let exists = self
            .registry
            .persistent_peers()
            .any(|p| p.addr() == target || p.addr().to_string() == addr);
        if exists {
            return Err(if permanent {
                ServerError::AlreadyConnected
            } else {
                ServerError::PermanentPeerExists
            });
        }

        debug!(target: self.target(), "Requesting connection to {} (permanent: {})", target, permanent);
        self.server.deps().conn_manager.connect(target, permanent);
        Ok(())
    }

    fn remove(&mut self, selector: &PeerSelector) -> Result<(), ServerError> {
        let peer = self
            .registry
            .take_matching(PeerClass::Persistent, |p| selector.matches(p))
            .ok_or(ServerError::PeerNotFound)?;
        if !peer.is_inbound() {
            let key = self
                .server
                .deps()
                .addr_manager
                .group_key(&peer.net_address());
            self.registry.decrement_group(&key);
        }
        if let Some(req) = peer.conn_req() {
            self.server.deps().conn_manager.remove(req.id);
        }
        peer.disconnect();
        Ok(())
    }

    fn disconnect(&mut self, selector: &PeerSelector) -> Result<(), ServerError> {
        if let Some(peer) = self
            .registry
            .take_matching(PeerClass::Inbound, |p| selector.matches(p))
        {
            peer.disconnect();
            return Ok(());
        }

        // Several outbound connections may share an address
        let mut found = false;
        while let Some(peer) = self
            .registry
            .take_matching(PeerClass::Outbound, |p| selector.matches(p))
        {
            let key = self
                .server
                .deps()
                .addr_manager
                .group_key(&peer.net_address());
            self.registry.decrement_group(&key);
            peer.disconnect();
            found = true;
        }

        if found {
            Ok(())
        } else {
            Err(ServerError::PeerNotFound)
        }
    }
}
