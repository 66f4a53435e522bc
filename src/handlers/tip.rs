use crate::peer::Peer;
use crate::wire::hash::Hash;
use crate::wire::message::Message;
use log::debug;
use std::sync::Arc;

pub(super) fn on_get_selected_tip(peer: &Arc<Peer>) {
    let tip = peer.server().deps().dag.selected_tip_hash();
    peer.queue_message(Message::SelectedTip(tip));
}

/// Record the peer's new tip; a change restarts sync negotiation
pub(super) fn on_selected_tip(peer: &Arc<Peer>, hash: Hash) {
    if peer.update_selected_tip_hash(hash) {
        debug!(target: peer.logger().target(), "Peer {} selected tip is now {}", peer, hash);
        peer.server().deps().sync_manager.start_sync();
    }
}
