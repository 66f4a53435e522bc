//! Bloom filter and fee filter management, plus mempool requests

use crate::peer::ban::{
    BAN_SCORE_INVALID_FILTER, BAN_SCORE_MEMPOOL_REQUEST, BAN_SCORE_NODE_BLOOM_FLAG_VIOLATION,
    BAN_SCORE_NO_FILTER_LOADED,
};
use crate::peer::Peer;
use crate::wire::bloom::BloomFilter;
use crate::wire::message::{
    InvVect, Message, MsgFilterLoad, ServiceFlags, MAX_FILTER_ADD_DATA_SIZE,
    MAX_FILTER_LOAD_FILTER_SIZE, MAX_FILTER_LOAD_HASH_FUNCS, MAX_INV_PER_MSG, MAX_SOMPI,
};
use log::debug;
use std::sync::Arc;

/// Bloom filter commands are only accepted when we advertise NODE_BLOOM.
/// Otherwise the peer is banned (unless banning is disabled) and always
/// disconnected. Returns whether the command may proceed.
async fn enforce_node_bloom_flag(peer: &Arc<Peer>, command: &str) -> bool {
    let settings = peer.server().settings();
    if settings.has_service(ServiceFlags::NODE_BLOOM) {
        return true;
    }

    if !settings.disable_banning {
        let reason = format!("{} sent while bloom filtering is disabled", command);
        peer.add_ban_score(BAN_SCORE_NODE_BLOOM_FLAG_VIOLATION, 0, &reason)
            .await;
    }
    debug!(
        target: peer.logger().target(),
        "{} sent from {} with bloom filtering disabled -- disconnecting",
        command, peer
    );
    peer.disconnect();
    false
}

pub(super) fn on_fee_filter(peer: &Arc<Peer>, min_fee: i64) {
    if !(0..=MAX_SOMPI).contains(&min_fee) {
        debug!(
            target: peer.logger().target(),
            "Peer {} sent an invalid feefilter '{}' -- disconnecting",
            peer, min_fee
        );
        peer.disconnect();
        return;
    }
    peer.set_fee_filter(min_fee);
}

pub(super) async fn on_filter_load(peer: &Arc<Peer>, msg: &MsgFilterLoad) {
    if !enforce_node_bloom_flag(peer, "filterload").await {
        return;
    }

    if msg.filter.len() > MAX_FILTER_LOAD_FILTER_SIZE
        || msg.hash_funcs > MAX_FILTER_LOAD_HASH_FUNCS
    {
        let reason = format!(
            "filterload with {} bytes and {} hash functions exceeds the limits",
            msg.filter.len(),
            msg.hash_funcs
        );
        peer.add_ban_score(BAN_SCORE_INVALID_FILTER, 0, &reason).await;
        peer.disconnect();
        return;
    }

    peer.set_relay_tx_disabled(false);
    peer.load_filter(BloomFilter::from_load(msg));
}

pub(super) async fn on_filter_add(peer: &Arc<Peer>, data: &[u8]) {
    if !enforce_node_bloom_flag(peer, "filteradd").await {
        return;
    }

    if data.len() > MAX_FILTER_ADD_DATA_SIZE {
        let reason = format!(
            "filteradd with {} bytes, at most {} allowed",
            data.len(),
            MAX_FILTER_ADD_DATA_SIZE
        );
        peer.add_ban_score(BAN_SCORE_INVALID_FILTER, 0, &reason).await;
        peer.disconnect();
        return;
    }

    if !peer.filter_add(data) {
        peer.add_ban_score(BAN_SCORE_NO_FILTER_LOADED, 0, "filteradd without a loaded filter")
            .await;
        peer.disconnect();
    }
}

pub(super) async fn on_filter_clear(peer: &Arc<Peer>) {
    if !enforce_node_bloom_flag(peer, "filterclear").await {
        return;
    }

    if !peer.unload_filter() {
        peer.add_ban_score(BAN_SCORE_NO_FILTER_LOADED, 0, "filterclear without a loaded filter")
            .await;
        peer.disconnect();
    }
}

/// Announce the mempool contents, filtered by the peer's bloom filter
pub(super) async fn on_mempool(peer: &Arc<Peer>) {
    let server = peer.server();
    if !server.settings().has_service(ServiceFlags::NODE_BLOOM) {
        debug!(
            target: peer.logger().target(),
            "Peer {} sent mempool request with bloom filtering disabled -- disconnecting",
            peer
        );
        peer.disconnect();
        return;
    }

    // Decaying score: a burst of requests crosses the threshold, the
    // occasional one doesn't
    if peer.add_ban_score(0, BAN_SCORE_MEMPOOL_REQUEST, "mempool").await {
        return;
    }

    let mut list = Vec::new();
    for desc in server.deps().mempool.tx_descs() {
        if !peer.filter_matches_tx(&desc.tx) {
            continue;
        }
        let iv = InvVect::tx(desc.tx_id());
        peer.add_known_inventory(iv);
        list.push(iv);
        if list.len() >= MAX_INV_PER_MSG {
            break;
        }
    }

    if !list.is_empty() {
        peer.queue_message(Message::Inv(list));
    }
}
