use crate::peer::ban::{BAN_SCORE_MAX_GET_DATA, BAN_SCORE_SENT_TX_TO_BLOCKS_ONLY};
use crate::peer::Peer;
use crate::wire::hash::Hash;
use crate::wire::message::{InvType, InvVect, Message, MsgMerkleBlock, MAX_INV_PER_MSG};
use log::{debug, warn};
use std::sync::Arc;

/// Forward announced inventory to the sync manager.
pub(super) async fn on_inv(peer: &Arc<Peer>, list: Vec<InvVect>) {
    let server = peer.server();
    if list.is_empty() {
        return;
    }

    if server.settings().blocks_only {
        if let Some(tx) = list.iter().find(|iv| iv.is_tx()) {
            let reason = format!("announced transaction {} while in blocks-only mode", tx.hash);
            peer.add_ban_score(BAN_SCORE_SENT_TX_TO_BLOCKS_ONLY, 0, &reason)
                .await;
            peer.disconnect();
            return;
        }
    }

    server.deps().sync_manager.queue_inv(list, peer);
}

/// Serve requested blocks, filtered blocks and transactions; everything we
/// can't find is reported back in a single NotFound.
pub(super) async fn on_get_data(peer: &Arc<Peer>, list: Vec<InvVect>) {
    if list.is_empty() {
        return;
    }

    // Decaying score proportional to the request size: a full-size request
    // scores BAN_SCORE_MAX_GET_DATA
    let transient =
        (list.len() as u64 * BAN_SCORE_MAX_GET_DATA as u64 / MAX_INV_PER_MSG as u64) as u32;
    if peer.add_ban_score(0, transient, "getdata").await {
        return;
    }

    let mut not_found = Vec::new();
    for iv in list {
        if !peer.is_connected() {
            return;
        }
        let found = match iv.inv_type {
            InvType::Tx => push_tx(peer, &iv.hash),
            InvType::Block | InvType::SyncBlock => push_block(peer, &iv.hash),
            InvType::FilteredBlock => push_merkle_block(peer, &iv.hash),
            InvType::Error => {
                warn!(target: peer.logger().target(), "Unknown type in inventory request from {}", peer);
                false
            }
        };
        if found {
            peer.add_known_inventory(iv);
        } else {
            not_found.push(iv);
        }
    }

    if !not_found.is_empty() {
        debug!(
            target: peer.logger().target(),
            "Sending notfound for {} items to {}",
            not_found.len(),
            peer
        );
        peer.queue_message(Message::NotFound(not_found));
    }
}

fn push_tx(peer: &Peer, hash: &Hash) -> bool {
    match peer.server().deps().mempool.fetch_transaction(hash) {
        Some(tx) => {
            peer.queue_message(Message::Tx(tx));
            true
        }
        None => false,
    }
}

fn push_block(peer: &Peer, hash: &Hash) -> bool {
    match peer.server().deps().dag.block_by_hash(hash) {
        Ok(Some(block)) => {
            peer.queue_message(Message::Block(block));
            true
        }
        Ok(None) => false,
        Err(e) => {
            debug!(target: peer.logger().target(), "Unable to fetch requested block {}: {}", hash, e);
            false
        }
    }
}

/// Send the block reduced to the transactions matching the peer's filter,
/// followed by those transactions
fn push_merkle_block(peer: &Peer, hash: &Hash) -> bool {
    // Without a loaded filter there is nothing to send, but the block isn't
    // missing either
    if !peer.is_filter_loaded() {
        return true;
    }

    let block = match peer.server().deps().dag.block_by_hash(hash) {
        Ok(Some(block)) => block,
        Ok(None) => return false,
        Err(e) => {
            debug!(target: peer.logger().target(), "Unable to fetch requested block {}: {}", hash, e);
            return false;
        }
    };

    let matched: Vec<_> = block
        .transactions
        .iter()
        .filter(|tx| peer.filter_matches_tx(tx))
        .cloned()
        .collect();

    peer.queue_message(Message::MerkleBlock(MsgMerkleBlock {
        header: block.header.clone(),
        total_transactions: block.transactions.len() as u32,
        matched_tx_ids: matched.iter().map(|tx| tx.tx_id()).collect(),
    }));
    for tx in matched {
        peer.queue_message(Message::Tx(tx));
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::testutil::{drain, sample_block, sample_tx, TestNode};
    use crate::wire::message::{BloomUpdateType, MsgFilterLoad};
    use crate::wire::BloomFilter;

    #[tokio::test]
    async fn test_inv_forwarded_to_sync_manager() {
        let node = TestNode::new(Config::default());
        let (peer, _rx) = node.detached_peer("10.10.0.1:16111", true);
        let list = vec![
            InvVect::block(Hash::digest(b"b1")),
            InvVect::tx(Hash::digest(b"t1")),
        ];

        on_inv(&peer, list.clone()).await;
        assert_eq!(*node.sync_manager.invs.lock(), vec![list]);
    }

    #[tokio::test]
    async fn test_blocks_only_rejects_tx_announcements() {
        let config = Config {
            blocks_only: true,
            ..Default::default()
        };
        let node = TestNode::new(config);
        let (peer, _rx) = node.detached_peer("10.10.0.2:16111", true);
        let list = vec![
            InvVect::block(Hash::digest(b"b1")),
            InvVect::tx(Hash::digest(b"t1")),
        ];

        on_inv(&peer, list).await;
        assert!(!peer.is_connected());
        assert_eq!(peer.ban_score(), BAN_SCORE_SENT_TX_TO_BLOCKS_ONLY);
        assert!(node.sync_manager.invs.lock().is_empty());

        // Block-only announcements are fine
        let (peer, _rx) = node.detached_peer("10.10.0.3:16111", true);
        on_inv(&peer, vec![InvVect::block(Hash::digest(b"b2"))]).await;
        assert!(peer.is_connected());
        assert_eq!(node.sync_manager.invs.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_get_data_serves_and_reports_missing() {
        let node = TestNode::new(Config::default());
        let (peer, mut rx) = node.detached_peer("10.10.1.1:16111", true);

        let tx = sample_tx(4);
        node.mempool.add(tx.clone(), 1000);
        let block = sample_block(4);
        node.dag.blocks.lock().insert(block.block_hash(), block.clone());
        let missing = InvVect::tx(Hash::digest(b"missing"));

        let request = vec![
            InvVect::tx(tx.tx_id()),
            InvVect::block(block.block_hash()),
            missing,
        ];
        on_get_data(&peer, request).await;

        assert_eq!(
            drain(&mut rx),
            vec![
                Message::Tx(tx.clone()),
                Message::Block(block),
                Message::NotFound(vec![missing]),
            ]
        );
        assert!(peer.is_known_inventory(&InvVect::tx(tx.tx_id())));
        assert!(!peer.is_known_inventory(&missing));
    }

    #[tokio::test]
    async fn test_filtered_block_sends_matching_transactions() {
        let node = TestNode::new(Config::default());
        let (peer, mut rx) = node.detached_peer("10.10.2.1:16111", true);
        let block = sample_block(6);
        let wanted = block.transactions[0].clone();
        node.dag.blocks.lock().insert(block.block_hash(), block.clone());

        let mut filter = BloomFilter::from_load(&MsgFilterLoad {
            filter: vec![0u8; 512],
            hash_funcs: 10,
            tweak: 7,
            flags: BloomUpdateType::None,
        });
        filter.insert(wanted.tx_id().as_bytes());
        peer.load_filter(filter);

        on_get_data(&peer, vec![InvVect::new(InvType::FilteredBlock, block.block_hash())]).await;

        let sent = drain(&mut rx);
        match &sent[0] {
            Message::MerkleBlock(merkle) => {
                assert_eq!(merkle.total_transactions, 2);
                assert!(merkle.matched_tx_ids.contains(&wanted.tx_id()));
            }
            other => panic!("expected merkleblock, got {:?}", other),
        }
        assert!(sent.contains(&Message::Tx(wanted)));
    }

    #[tokio::test]
    async fn test_filtered_block_without_filter_sends_nothing() {
        let node = TestNode::new(Config::default());
        let (peer, mut rx) = node.detached_peer("10.10.2.2:16111", true);
        let block = sample_block(7);
        node.dag.blocks.lock().insert(block.block_hash(), block.clone());

        on_get_data(&peer, vec![InvVect::new(InvType::FilteredBlock, block.block_hash())]).await;
        assert!(drain(&mut rx).is_empty());
    }
}
