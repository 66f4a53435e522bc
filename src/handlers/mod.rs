//! Per-message protocol handlers
//!
//! A peer's read task hands every message it receives after version
//! negotiation to [`dispatch`], one at a time and in arrival order. Handlers
//! talk to the collaborators in [`crate::deps`] and to the server actor; the
//! only ones that suspend for long are block and transaction delivery, which
//! wait on the peer's processing gate.

mod addr;
mod cfilter;
mod delivery;
mod filter;
mod headers;
mod inv;
mod locator;
mod tip;
mod version;

use crate::peer::Peer;
use crate::wire::message::Message;
use log::{debug, trace};
use std::sync::Arc;

/// Route a message to its handler
pub(crate) async fn dispatch(peer: &Arc<Peer>, msg: Message) {
    trace!(target: peer.logger().target(), "Received {} from {}", msg.command(), peer);

    match msg {
        Message::Version(version) => version::on_version(peer, &version).await,

        Message::GetAddr {
            include_all_subnetworks,
            subnetwork_id,
        } => addr::on_get_addr(peer, include_all_subnetworks, subnetwork_id),
        Message::Addr {
            include_all_subnetworks,
            subnetwork_id,
            addresses,
        } => addr::on_addr(peer, include_all_subnetworks, subnetwork_id, addresses).await,

        Message::Inv(list) => inv::on_inv(peer, list).await,
        Message::GetData(list) => inv::on_get_data(peer, list).await,
        Message::NotFound(list) => {
            debug!(
                target: peer.logger().target(),
                "Peer {} doesn't have {} requested items",
                peer,
                list.len()
            );
        }

        Message::Block(block) => delivery::on_block(peer, block).await,
        Message::Tx(tx) => delivery::on_tx(peer, tx).await,

        Message::GetBlockLocator {
            high_hash,
            low_hash,
        } => locator::on_get_block_locator(peer, &high_hash, &low_hash),
        Message::BlockLocator(hashes) => locator::on_block_locator(peer, hashes).await,
        Message::GetBlockInvs {
            low_hash,
            high_hash,
        } => locator::on_get_block_invs(peer, &low_hash, &high_hash).await,

        Message::GetHeaders {
            low_hash,
            high_hash,
        } => headers::on_get_headers(peer, &low_hash, &high_hash),
        Message::Headers(list) => headers::on_headers(peer, list),

        Message::FeeFilter(min_fee) => filter::on_fee_filter(peer, min_fee),
        Message::FilterLoad(msg) => filter::on_filter_load(peer, &msg).await,
        Message::FilterAdd(data) => filter::on_filter_add(peer, &data).await,
        Message::FilterClear => filter::on_filter_clear(peer).await,
        Message::MemPool => filter::on_mempool(peer).await,

        Message::GetSelectedTip => tip::on_get_selected_tip(peer),
        Message::SelectedTip(hash) => tip::on_selected_tip(peer, hash),

        Message::GetCFilters {
            filter_type,
            start_height,
            stop_hash,
        } => cfilter::on_get_cfilters(peer, filter_type, start_height, &stop_hash),
        Message::GetCFHeaders {
            filter_type,
            start_height,
            stop_hash,
        } => cfilter::on_get_cfheaders(peer, filter_type, start_height, &stop_hash),
        Message::GetCFCheckpt {
            filter_type,
            stop_hash,
        } => cfilter::on_get_cfcheckpt(peer, filter_type, &stop_hash),

        other => {
            debug!(
                target: peer.logger().target(),
                "Ignoring unexpected {} message from {}",
                other.command(),
                peer
            );
        }
    }
}
