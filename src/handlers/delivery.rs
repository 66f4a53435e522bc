use crate::peer::Peer;
use crate::wire::message::{InvVect, MsgBlock, MsgTx};
use log::{debug, trace};
use std::sync::Arc;

/// Queue a block for validation and hold the peer's read loop until the sync
/// manager is done with it. A peer can't pile up unvalidated blocks this way.
pub(super) async fn on_block(peer: &Arc<Peer>, block: MsgBlock) {
    let hash = block.block_hash();
    peer.add_known_inventory(InvVect::block(hash));

    let done = peer.block_processed.signal();
    peer.server().deps().sync_manager.queue_block(block, peer, done);

    if !peer.block_processed.wait(peer.quit_token()).await {
        debug!(target: peer.logger().target(), "Peer {} disconnected while block {} was pending", peer, hash);
    }
}

/// Same as [`on_block`] for transactions. Ignored in blocks-only mode.
pub(super) async fn on_tx(peer: &Arc<Peer>, tx: MsgTx) {
    let tx_id = tx.tx_id();
    if peer.server().settings().blocks_only {
        trace!(target: peer.logger().target(), "Ignoring tx {} from {} - blocks-only mode", tx_id, peer);
        return;
    }
    peer.add_known_inventory(InvVect::tx(tx_id));

    let done = peer.tx_processed.signal();
    peer.server().deps().sync_manager.queue_tx(tx, peer, done);

    if !peer.tx_processed.wait(peer.quit_token()).await {
        debug!(target: peer.logger().target(), "Peer {} disconnected while tx {} was pending", peer, tx_id);
    }
}
