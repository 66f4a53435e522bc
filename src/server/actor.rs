//! Server actor
//!
//! A single task owns the [`PeerRegistry`] and applies every membership, ban,
//! relay and query message in arrival order. Nothing else touches the
//! registry, so none of it needs locking.

use crate::deps::ConnReq;
use crate::peer::session::Transport;
use crate::peer::{Peer, PeerId};
use crate::server::query::Query;
use crate::server::registry::PeerRegistry;
use crate::server::{RelayPayload, Server};
use crate::wire::message::{InvVect, Message};
use chrono::{DateTime, Utc};
use log::{debug, info};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Messages consumed by the actor
pub(crate) enum ServerMsg {
    NewPeer(Arc<Peer>),
    DonePeer(Arc<Peer>),
    BanPeer(Arc<Peer>),
    RelayInventory {
        inv: InvVect,
        payload: RelayPayload,
    },
    Broadcast {
        message: Message,
        exclude: Vec<PeerId>,
    },
    Query(Query),
    NewOutbound {
        conn_req: ConnReq,
        stream: Box<dyn Transport>,
    },
}

pub(crate) struct PeerHandler {
    pub(super) server: Server,
    pub(super) registry: PeerRegistry,
    rx: mpsc::Receiver<ServerMsg>,
}

impl PeerHandler {
    pub(crate) fn new(server: Server, rx: mpsc::Receiver<ServerMsg>) -> Self {
        Self {
            server,
            registry: PeerRegistry::new(),
            rx,
        }
    }

    pub(super) fn target(&self) -> &str {
        self.server.logger().target()
    }

    pub(crate) async fn run(mut self) {
        let shutdown = self.server.shutdown_token().clone();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                msg = self.rx.recv() => match msg {
                    Some(msg) => self.handle(msg),
                    None => break,
                },
            }
        }

        info!(target: self.target(), "Disconnecting {} peers", self.registry.count());
        for peer in self.registry.peers() {
            peer.disconnect();
        }

        // Drop whatever is left so query callers see the shutdown
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
        debug!(target: self.target(), "Peer handler done");
    }

    fn handle(&mut self, msg: ServerMsg) {
        match msg {
            ServerMsg::NewPeer(peer) => {
                self.handle_add_peer(peer);
            }
            ServerMsg::DonePeer(peer) => self.handle_done_peer(&peer),
            ServerMsg::BanPeer(peer) => self.handle_ban_peer(&peer),
            ServerMsg::RelayInventory { inv, payload } => {
                self.handle_relay_inventory(inv, &payload)
            }
            ServerMsg::Broadcast { message, exclude } => self.handle_broadcast(&message, &exclude),
            ServerMsg::Query(query) => self.handle_query(query),
            ServerMsg::NewOutbound { conn_req, stream } => {
                self.handle_new_outbound(conn_req, stream)
            }
        }
    }

    /// Register a negotiated peer; returns false if it was rejected
    fn handle_add_peer(&mut self, peer: Arc<Peer>) -> bool {
        // Its done handler may already have run
        if !peer.is_connected() {
            debug!(target: self.target(), "Peer {} disconnected before it was added", peer);
            return false;
        }

        if self.server.is_shutting_down() {
            info!(target: self.target(), "New peer {} ignored - server is shutting down", peer);
            peer.disconnect();
            return false;
        }

        let host = peer.addr().ip().to_string();
        let now = Utc::now();
        if let Some(until) = self.registry.banned_until(&host, now) {
            debug!(
                target: self.target(),
                "Peer {} is banned for another {}s - disconnecting",
                host,
                (until - now).num_seconds()
            );
            peer.disconnect();
            return false;
        }

        let settings = self.server.settings();
        if peer.is_inbound() && self.registry.inbound_count() >= settings.max_inbound_peers {
            info!(
                target: self.target(),
                "Max peers reached [{}] - disconnecting peer {}",
                settings.max_inbound_peers,
                peer
            );
            peer.disconnect();
            return false;
        }

        debug!(target: self.target(), "New peer {}", peer);
        let group_key = if peer.is_inbound() {
            None
        } else {
            Some(self.server.deps().addr_manager.group_key(&peer.net_address()))
        };
        if let Some(req) = peer.conn_req() {
            self.server
                .deps()
                .conn_manager
                .notify_connection_request_complete(req);
        }
        self.registry.insert(peer, group_key);
        true
    }

    fn handle_done_peer(&mut self, peer: &Arc<Peer>) {
        let deps = self.server.deps();
        let group_key = (!peer.is_inbound() && peer.version_known())
            .then(|| deps.addr_manager.group_key(&peer.net_address()));

        if self.registry.remove(peer, group_key.as_deref()) {
            debug!(target: self.target(), "Removed peer {}", peer);
        }

        if let Some(req) = peer.conn_req() {
            deps.conn_manager.disconnect(req.id);
        }

        // Update the address manager's last seen time
        if peer.verack_received() && peer.version_known() {
            deps.addr_manager.connected(&peer.net_address());
        }
    }

    fn handle_ban_peer(&mut self, peer: &Peer) {
        let host = peer.addr().ip().to_string();
        let duration = self.server.settings().ban_duration;
        let until = chrono::Duration::from_std(duration)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        info!(target: self.target(), "Banned peer {} for {:?}", host, duration);
        self.registry.ban(host, until);
    }

    fn handle_relay_inventory(&self, inv: InvVect, payload: &RelayPayload) {
        for peer in self.registry.peers() {
            if !peer.is_connected() {
                continue;
            }

            if let (RelayPayload::Tx(desc), true) = (payload, inv.is_tx()) {
                if peer.relay_tx_disabled() {
                    continue;
                }
                let fee_filter = peer.fee_filter();
                if fee_filter > 0 && desc.fee_per_kb < fee_filter {
                    continue;
                }
                if !peer.filter_matches_tx(&desc.tx) {
                    continue;
                }
                if !desc.tx.is_subnetwork_compatible(peer.subnetwork_id().as_ref()) {
                    continue;
                }
            }

            peer.queue_inventory(inv);
        }
    }

    fn handle_broadcast(&self, message: &Message, exclude: &[PeerId]) {
        for peer in self.registry.peers() {
            if exclude.contains(&peer.id()) || !peer.is_connected() {
                continue;
            }
            peer.queue_message(message.clone());
        }
    }

    fn handle_new_outbound(&mut self, conn_req: ConnReq, stream: Box<dyn Transport>) {
        if self.server.is_shutting_down() {
            return;
        }
        let addr = conn_req.addr;
        let peer = self.server.start_session(stream, addr, false, Some(conn_req));
        self.server
            .deps()
            .addr_manager
            .attempt(&peer.net_address());
    }
}
