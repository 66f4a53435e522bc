use crate::peer::Peer;
use crate::wire::hash::Hash;
use crate::wire::message::{BlockHeader, Message, MAX_BLOCK_HEADERS_PER_MSG};
use log::{debug, warn};
use std::sync::Arc;

/// Serve blue block headers between the two hashes. Only answered while we
/// consider ourselves synced.
pub(super) fn on_get_headers(peer: &Arc<Peer>, low_hash: &Hash, high_hash: &Hash) {
    let deps = peer.server().deps();
    if !deps.sync_manager.is_current() {
        debug!(target: peer.logger().target(), "Ignoring getheaders from {} while not synced", peer);
        return;
    }

    match deps
        .dag
        .blue_blocks_headers_between(low_hash, high_hash, MAX_BLOCK_HEADERS_PER_MSG)
    {
        Ok(headers) => peer.queue_message(Message::Headers(headers)),
        Err(e) => {
            warn!(
                target: peer.logger().target(),
                "Error getting headers between {} and {} for {}: {}",
                low_hash, high_hash, peer, e
            );
        }
    }
}

pub(super) fn on_headers(peer: &Arc<Peer>, headers: Vec<BlockHeader>) {
    peer.server().deps().sync_manager.queue_headers(headers, peer);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::testutil::{drain, sample_block, TestNode};
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn test_get_headers_only_when_current() {
        let node = TestNode::new(Config::default());
        let (peer, mut rx) = node.detached_peer("10.13.0.1:16111", true);
        let header = sample_block(1).header;
        *node.dag.blue_headers.lock() = vec![header.clone()];

        on_get_headers(&peer, &node.dag.genesis, &Hash::digest(b"tip"));
        assert!(drain(&mut rx).is_empty());

        node.sync_manager.current.store(true, Ordering::SeqCst);
        on_get_headers(&peer, &node.dag.genesis, &Hash::digest(b"tip"));
        assert_eq!(drain(&mut rx), vec![Message::Headers(vec![header])]);
    }

    #[tokio::test]
    async fn test_headers_forwarded_to_sync_manager() {
        let node = TestNode::new(Config::default());
        let (peer, _rx) = node.detached_peer("10.13.0.2:16111", false);
        let headers = vec![sample_block(2).header, sample_block(3).header];
        on_headers(&peer, headers.clone());
        assert_eq!(*node.sync_manager.headers.lock(), vec![headers]);
    }
}
