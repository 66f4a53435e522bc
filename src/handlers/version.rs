use crate::peer::Peer;
use crate::wire::message::{Message, MsgVersion};
use log::debug;
use std::sync::Arc;

/// Finish negotiation: register the peer with the sync manager, exchange
/// addresses with outbound peers and hand the peer to the server.
pub(super) async fn on_version(peer: &Arc<Peer>, msg: &MsgVersion) {
    let server = peer.server();
    let settings = server.settings();
    let deps = server.deps();

    deps.sync_manager.new_peer(peer);

    // Until a FilterLoad arrives, relay follows the peer's preference
    peer.set_relay_tx_disabled(msg.disable_relay_tx);

    // Simnet only connects to explicitly configured peers
    if !settings.simnet && !peer.is_inbound() {
        if !settings.disable_listen && deps.sync_manager.is_current() {
            if let Some(local) = deps.addr_manager.best_local_address(&peer.net_address()) {
                if local.is_routable() {
                    debug!(target: peer.logger().target(), "Advertising {} to {}", local, peer);
                    peer.push_addr_msg(&[local], settings.subnetwork_id);
                }
            }
        }

        if deps.addr_manager.need_more_addresses() {
            peer.queue_message(Message::GetAddr {
                include_all_subnetworks: false,
                subnetwork_id: settings.subnetwork_id,
            });
            // Partial nodes also want full-node addresses
            if settings.subnetwork_id.is_some() {
                peer.queue_message(Message::GetAddr {
                    include_all_subnetworks: false,
                    subnetwork_id: None,
                });
            }
        }

        deps.addr_manager
            .good(&peer.net_address(), msg.subnetwork_id.as_ref());
    }

    server.add_peer(peer).await;
}
