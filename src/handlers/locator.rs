//! Locator rendezvous
//!
//! Two peers find their highest shared block by exchanging progressively
//! finer block locators. Once the top hash of a received locator is known
//! locally, the remote peer is asked for the blue blocks from there up to
//! its selected tip.

use crate::peer::ban::{
    BAN_SCORE_EMPTY_BLOCK_LOCATOR, BAN_SCORE_INVALID_MSG_BLOCK_LOCATOR,
    BAN_SCORE_INVALID_MSG_GET_BLOCK_INVS, BAN_SCORE_UNREQUESTED_BLOCK_LOCATOR,
};
use crate::peer::Peer;
use crate::wire::hash::Hash;
use crate::wire::message::{InvType, InvVect, Message, MAX_BLOCK_LOCATORS_PER_MSG, MAX_INV_PER_MSG};
use log::{debug, warn};
use std::sync::Arc;

pub(super) fn on_get_block_locator(peer: &Arc<Peer>, high_hash: &Hash, low_hash: &Hash) {
    match peer
        .server()
        .deps()
        .dag
        .block_locator_from_hashes(high_hash, low_hash)
    {
        Ok(mut locator) if !locator.is_empty() => {
            locator.truncate(MAX_BLOCK_LOCATORS_PER_MSG);
            peer.queue_message(Message::BlockLocator(locator));
        }
        Ok(_) => {
            warn!(
                target: peer.logger().target(),
                "Couldn't build a block locator between {} and {} requested by {}",
                high_hash, low_hash, peer
            );
            peer.disconnect();
        }
        Err(e) => {
            warn!(
                target: peer.logger().target(),
                "Couldn't build a block locator between {} and {} requested by {}: {}",
                high_hash, low_hash, peer, e
            );
            peer.disconnect();
        }
    }
}

pub(super) async fn on_block_locator(peer: &Arc<Peer>, locator: Vec<Hash>) {
    if !peer.take_block_locator_requested() {
        let reason = "sent an unrequested block locator";
        peer.add_ban_score(BAN_SCORE_UNREQUESTED_BLOCK_LOCATOR, 0, reason)
            .await;
        peer.disconnect();
        return;
    }

    let Some(&first) = locator.first() else {
        peer.add_ban_score(BAN_SCORE_EMPTY_BLOCK_LOCATOR, 0, "sent an empty block locator")
            .await;
        peer.disconnect();
        return;
    };

    let deps = peer.server().deps();
    if deps.dag.is_in_dag(&first) {
        if deps.dag.is_known_finalized_block(&first) {
            debug!(
                target: peer.logger().target(),
                "Cannot sync with {}: highest shared block {} is below the finality point",
                peer, first
            );
            deps.sync_manager.remove_from_sync_candidates(peer);
            return;
        }

        let Some(tip) = peer.selected_tip_hash() else {
            return;
        };
        peer.queue_message(Message::GetBlockInvs {
            low_hash: first,
            high_hash: tip,
        });
        return;
    }

    match deps.dag.find_next_locator_boundaries(&locator) {
        Some((high_hash, low_hash)) => peer.push_get_block_locator(high_hash, low_hash),
        None => {
            peer.add_ban_score(
                BAN_SCORE_INVALID_MSG_BLOCK_LOCATOR,
                0,
                "sent a block locator without any known block",
            )
            .await;
            peer.disconnect();
        }
    }
}

/// Answer with up to [`MAX_INV_PER_MSG`] blue block hashes between the two
/// hashes
pub(super) async fn on_get_block_invs(peer: &Arc<Peer>, low_hash: &Hash, high_hash: &Hash) {
    let hashes = match peer
        .server()
        .deps()
        .dag
        .blue_blocks_hashes_between(low_hash, high_hash, MAX_INV_PER_MSG)
    {
        Ok(hashes) => hashes,
        Err(e) => {
            let reason = format!(
                "error getting blue blocks between {} and {}: {}",
                low_hash, high_hash, e
            );
            peer.add_ban_score(BAN_SCORE_INVALID_MSG_GET_BLOCK_INVS, 0, &reason)
                .await;
            return;
        }
    };

    if hashes.is_empty() {
        return;
    }
    // A full batch means more is left; remember where to pick up
    if hashes.len() == MAX_INV_PER_MSG {
        peer.set_continue_hash(hashes.last().copied());
    }

    let list = hashes
        .into_iter()
        .map(|hash| InvVect::new(InvType::SyncBlock, hash))
        .collect();
    peer.queue_message(Message::Inv(list));
}
