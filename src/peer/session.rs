//! Connection read/write loops
//!
//! Each peer gets one task reading framed messages off the connection and
//! one task writing queued messages to it. The read task negotiates the
//! version handshake, then dispatches every message to the handlers in order.

use crate::handlers;
use crate::peer::ban::{
    BAN_SCORE_DUPLICATE_VERACK, BAN_SCORE_DUPLICATE_VERSION, BAN_SCORE_NON_VERSION_FIRST_MESSAGE,
};
use crate::peer::{Peer, PeerError};
use crate::wire::codec::MessageCodec;
use crate::wire::message::{Message, MIN_PROTOCOL_VERSION};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use log::debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant};
use tokio_util::codec::Framed;
use tokio_util::task::TaskTracker;

/// Time the remote side has to send its Version
pub const NEGOTIATE_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval between keep-alive pings
pub const PING_INTERVAL: Duration = Duration::from_secs(2 * 60);

/// Byte stream a peer session can run over
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

type Reader<S> = SplitStream<Framed<S, MessageCodec>>;
type Writer<S> = SplitSink<Framed<S, MessageCodec>, Message>;

/// Start the read and write loops of a peer on the tracker
pub(crate) fn spawn<S: Transport>(
    peer: Arc<Peer>,
    stream: S,
    outgoing: mpsc::UnboundedReceiver<Message>,
    tracker: &TaskTracker,
) {
    let (writer, reader) = Framed::new(stream, MessageCodec).split();
    tracker.spawn(write_loop(peer.clone(), writer, outgoing));
    tracker.spawn(read_loop(peer, reader));
}

async fn read_loop<S: Transport>(peer: Arc<Peer>, mut reader: Reader<S>) {
    if let Err(e) = negotiate(&peer, &mut reader).await {
        debug!(target: peer.logger().target(), "Negotiation with {} failed: {}", peer, e);
        peer.disconnect();
        return;
    }

    loop {
        let next = tokio::select! {
            _ = peer.quit_token().cancelled() => break,
            next = reader.next() => next,
        };
        match next {
            Some(Ok(msg)) => handle_message(&peer, msg).await,
            Some(Err(e)) => {
                debug!(target: peer.logger().target(), "Can't read message from {}: {}", peer, e);
                break;
            }
            None => {
                debug!(target: peer.logger().target(), "Peer {} closed the connection", peer);
                break;
            }
        }
        if !peer.is_connected() {
            break;
        }
    }
    peer.disconnect();
}

async fn write_loop<S: Transport>(
    peer: Arc<Peer>,
    mut writer: Writer<S>,
    mut outgoing: mpsc::UnboundedReceiver<Message>,
) {
    let mut ping = interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);

    loop {
        let msg = tokio::select! {
            _ = peer.quit_token().cancelled() => break,
            _ = ping.tick() => Message::Ping(rand::random()),
            msg = outgoing.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };
        if let Err(e) = writer.send(msg).await {
            debug!(target: peer.logger().target(), "Can't write message to {}: {}", peer, e);
            break;
        }
    }

    let _ = writer.close().await;
    peer.disconnect();
}

/// Wait for the remote Version and hand it to the handlers
async fn negotiate<S: Transport>(
    peer: &Arc<Peer>,
    reader: &mut Reader<S>,
) -> Result<(), PeerError> {
    let first = tokio::select! {
        _ = peer.quit_token().cancelled() => return Err(PeerError::Disconnected),
        first = timeout(NEGOTIATE_TIMEOUT, reader.next()) => first.map_err(|_| PeerError::Timeout)?,
    };

    let version = match first {
        Some(Ok(Message::Version(version))) => version,
        Some(Ok(other)) => {
            let reason = format!("a {} message was received before version", other.command());
            peer.add_ban_score(BAN_SCORE_NON_VERSION_FIRST_MESSAGE, 0, &reason).await;
            return Err(PeerError::ProtocolViolation(reason));
        }
        Some(Err(e)) => return Err(e.into()),
        None => return Err(PeerError::Disconnected),
    };

    if version.protocol_version < MIN_PROTOCOL_VERSION {
        return Err(PeerError::ObsoleteVersion(version.protocol_version));
    }
    if peer.server().is_local_nonce(version.nonce) {
        return Err(PeerError::SelfConnection);
    }

    debug!(
        target: peer.logger().target(),
        "Received version from {}: {} (protocol {})",
        peer, version.user_agent, version.protocol_version
    );
    peer.set_version(version.clone());
    peer.queue_message(Message::VerAck);
    handlers::dispatch(peer, Message::Version(version)).await;
    Ok(())
}

async fn handle_message(peer: &Arc<Peer>, msg: Message) {
    match msg {
        Message::Version(_) => {
            peer.add_ban_score(BAN_SCORE_DUPLICATE_VERSION, 0, "duplicate version message")
                .await;
        }
        Message::VerAck => {
            if peer.mark_verack_received() {
                peer.add_ban_score(BAN_SCORE_DUPLICATE_VERACK, 0, "verack sent twice")
                    .await;
            }
        }
        Message::Ping(nonce) => peer.queue_message(Message::Pong(nonce)),
        Message::Pong(_) => {}
        other => handlers::dispatch(peer, other).await,
    }
}
