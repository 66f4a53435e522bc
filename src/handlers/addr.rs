use crate::peer::ban::{
    BAN_SCORE_MSG_ADDR_WITH_INVALID_SUBNETWORK, BAN_SCORE_SENT_TOO_MANY_ADDRESSES,
};
use crate::peer::Peer;
use crate::wire::hash::SubnetworkId;
use crate::wire::message::{NetAddress, MAX_ADDR_PER_MSG};
use chrono::{Duration, Utc};
use log::{debug, warn};
use std::sync::Arc;

/// Timestamps further ahead than this are treated as bogus
const MAX_TIMESTAMP_DRIFT_MINUTES: i64 = 10;

/// Age given to addresses with a bogus timestamp so they are evicted first
const BOGUS_TIMESTAMP_AGE_DAYS: i64 = 5;

/// Answer the first GetAddr of an inbound peer from the address cache.
pub(super) fn on_get_addr(
    peer: &Arc<Peer>,
    include_all_subnetworks: bool,
    subnetwork_id: Option<SubnetworkId>,
) {
    let server = peer.server();
    if server.settings().simnet {
        return;
    }

    // Outbound peers never get our addresses; it makes fingerprinting harder
    if !peer.is_inbound() {
        debug!(target: peer.logger().target(), "Ignoring getaddr request from outbound peer {}", peer);
        return;
    }

    // Once per connection keeps the peer from stamping our inventory
    if peer.mark_addrs_sent() {
        debug!(target: peer.logger().target(), "Ignoring repeated getaddr request from peer {}", peer);
        return;
    }

    let cache = server
        .deps()
        .addr_manager
        .address_cache(include_all_subnetworks, subnetwork_id.as_ref());
    let sent = peer.push_addr_msg(&cache, subnetwork_id);
    debug!(target: peer.logger().target(), "Sent {} addresses to {}", sent.len(), peer);
}

/// Merge advertised addresses into the known set and the address manager.
pub(super) async fn on_addr(
    peer: &Arc<Peer>,
    include_all_subnetworks: bool,
    subnetwork_id: Option<SubnetworkId>,
    mut addresses: Vec<NetAddress>,
) {
    let server = peer.server();
    let settings = server.settings();
    if settings.simnet {
        return;
    }

    if addresses.is_empty() {
        warn!(target: peer.logger().target(), "Command [addr] from {} does not contain any addresses", peer);
        peer.disconnect();
        return;
    }

    if addresses.len() > MAX_ADDR_PER_MSG {
        let reason = format!(
            "address count exceeded: {} addresses, at most {} allowed",
            addresses.len(),
            MAX_ADDR_PER_MSG
        );
        peer.add_ban_score(BAN_SCORE_SENT_TOO_MANY_ADDRESSES, 0, &reason).await;
        return;
    }

    if include_all_subnetworks {
        let reason = "addr message with unexpected include-all-subnetworks flag";
        peer.add_ban_score(BAN_SCORE_MSG_ADDR_WITH_INVALID_SUBNETWORK, 0, reason)
            .await;
        peer.disconnect();
        return;
    }

    if let Some(id) = subnetwork_id {
        if Some(id) != settings.subnetwork_id {
            let reason = format!("addr message for foreign subnetwork {}", id);
            peer.add_ban_score(BAN_SCORE_MSG_ADDR_WITH_INVALID_SUBNETWORK, 0, &reason)
                .await;
            peer.disconnect();
            return;
        }
    }

    let now = Utc::now();
    let horizon = now + Duration::minutes(MAX_TIMESTAMP_DRIFT_MINUTES);
    for na in &mut addresses {
        if na.timestamp > horizon {
            na.timestamp = now - Duration::days(BOGUS_TIMESTAMP_AGE_DAYS);
        }
    }

    if !peer.is_connected() {
        return;
    }

    peer.add_known_addresses(&addresses);
    server
        .deps()
        .addr_manager
        .add_addresses(&addresses, &peer.net_address(), subnetwork_id.as_ref());
}
