//! Committed filter requests
//!
//! Served from the optional [`FilterIndex`] collaborator, and only while the
//! node advertises NODE_CF, is synced and builds the requested filter type.

use crate::deps::FilterIndex;
use crate::peer::Peer;
use crate::wire::hash::Hash;
use crate::wire::message::{
    Message, ServiceFlags, CF_CHECKPT_INTERVAL, FILTER_TYPE_REGULAR, MAX_CF_HEADERS_PER_MSG,
    MAX_GET_CFILTERS_REQ_RANGE,
};
use log::{debug, warn};
use std::sync::Arc;

fn filter_index<'a>(
    peer: &'a Peer,
    filter_type: u8,
    command: &str,
) -> Option<&'a Arc<dyn FilterIndex>> {
    let server = peer.server();
    let deps = server.deps();
    if !server.settings().has_service(ServiceFlags::NODE_CF) || !deps.sync_manager.is_current() {
        return None;
    }
    if filter_type != FILTER_TYPE_REGULAR {
        debug!(
            target: peer.logger().target(),
            "{} from {} for unknown filter type {}",
            command, peer, filter_type
        );
        return None;
    }
    deps.filter_index.as_ref()
}

pub(super) fn on_get_cfilters(
    peer: &Arc<Peer>,
    filter_type: u8,
    start_height: u64,
    stop_hash: &Hash,
) {
    let Some(index) = filter_index(peer, filter_type, "getcfilters") else {
        return;
    };

    let hashes = match peer.server().deps().dag.height_to_hash_range(
        start_height,
        stop_hash,
        MAX_GET_CFILTERS_REQ_RANGE,
    ) {
        Ok(hashes) => hashes,
        Err(e) => {
            debug!(target: peer.logger().target(), "Invalid getcfilters request from {}: {}", peer, e);
            return;
        }
    };

    let filters = match index.filters_by_block_hashes(&hashes, filter_type) {
        Ok(filters) => filters,
        Err(e) => {
            warn!(target: peer.logger().target(), "Error retrieving cfilters: {}", e);
            return;
        }
    };

    for (block_hash, data) in hashes.into_iter().zip(filters) {
        if data.is_empty() {
            warn!(target: peer.logger().target(), "Could not obtain cfilter for {}", block_hash);
            return;
        }
        peer.queue_message(Message::CFilter {
            filter_type,
            block_hash,
            data,
        });
    }
}

pub(super) fn on_get_cfheaders(
    peer: &Arc<Peer>,
    filter_type: u8,
    start_height: u64,
    stop_hash: &Hash,
) {
    let Some(index) = filter_index(peer, filter_type, "getcfheaders") else {
        return;
    };

    // Past genesis the header of the block before the range is needed too
    let (fetch_start, max) = if start_height > 0 {
        (start_height - 1, MAX_CF_HEADERS_PER_MSG + 1)
    } else {
        (0, MAX_CF_HEADERS_PER_MSG)
    };
    let mut hashes = match peer
        .server()
        .deps()
        .dag
        .height_to_hash_range(fetch_start, stop_hash, max)
    {
        Ok(hashes) => hashes,
        Err(e) => {
            debug!(target: peer.logger().target(), "Invalid getcfheaders request from {}: {}", peer, e);
            return;
        }
    };
    if hashes.is_empty() {
        debug!(target: peer.logger().target(), "No results for getcfheaders request from {}", peer);
        return;
    }

    let prev_filter_header = if start_height > 0 {
        let prev = hashes.remove(0);
        match index.filter_headers_by_block_hashes(&[prev], filter_type) {
            Ok(headers) => headers.first().copied().unwrap_or(Hash::ZERO),
            Err(e) => {
                warn!(target: peer.logger().target(), "Error retrieving filter header for {}: {}", prev, e);
                return;
            }
        }
    } else {
        Hash::ZERO
    };

    let filter_hashes = match index.filter_hashes_by_block_hashes(&hashes, filter_type) {
        Ok(filter_hashes) => filter_hashes,
        Err(e) => {
            warn!(target: peer.logger().target(), "Error retrieving cfilter hashes: {}", e);
            return;
        }
    };
    if filter_hashes.len() != hashes.len() {
        warn!(
            target: peer.logger().target(),
            "Filter index returned {} cfilter hashes for {} blocks",
            filter_hashes.len(),
            hashes.len()
        );
        return;
    }
    if let Some(pos) = filter_hashes.iter().position(|h| h.is_zero()) {
        if let Some(block_hash) = hashes.get(pos) {
            warn!(target: peer.logger().target(), "Could not obtain cfilter hash for {}", block_hash);
        }
        return;
    }

    peer.queue_message(Message::CFHeaders {
        filter_type,
        stop_hash: *stop_hash,
        prev_filter_header,
        filter_hashes,
    });
}

pub(super) fn on_get_cfcheckpt(peer: &Arc<Peer>, filter_type: u8, stop_hash: &Hash) {
    let Some(index) = filter_index(peer, filter_type, "getcfcheckpt") else {
        return;
    };

    let hashes = match peer
        .server()
        .deps()
        .dag
        .interval_block_hashes(stop_hash, CF_CHECKPT_INTERVAL)
    {
        Ok(hashes) => hashes,
        Err(e) => {
            debug!(target: peer.logger().target(), "Invalid getcfcheckpt request from {}: {}", peer, e);
            return;
        }
    };

    match index.filter_headers_by_block_hashes(&hashes, filter_type) {
        Ok(filter_headers) => peer.queue_message(Message::CFCheckpt {
            filter_type,
            stop_hash: *stop_hash,
            filter_headers,
        }),
        Err(e) => warn!(target: peer.logger().target(), "Error retrieving cfilter headers: {}", e),
    }
}
