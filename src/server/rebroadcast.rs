//! Periodic rebroadcast of unconfirmed inventory
//!
//! Our own transactions are re-announced at random intervals until they are
//! confirmed, in case the first relay got lost. The pending set is owned by
//! this task alone; the server only sends it add/remove messages.

use crate::config::Settings;
use crate::logger::Logger;
use crate::server::actor::ServerMsg;
use crate::server::RelayPayload;
use crate::wire::message::InvVect;
use log::{debug, trace};
use rand::Rng;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

/// Changes to the rebroadcast set
#[derive(Debug, Clone)]
pub enum RebroadcastMsg {
    Add { inv: InvVect, payload: RelayPayload },
    Remove(InvVect),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebroadcastTimings {
    /// Delay before the first rebroadcast
    pub initial_delay: Duration,
    /// Each later rebroadcast happens after a random interval up to this
    pub max_interval: Duration,
}

impl RebroadcastTimings {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            initial_delay: settings.rebroadcast_initial_delay,
            max_interval: settings.rebroadcast_max_interval,
        }
    }

    fn next_interval(&self) -> Duration {
        let max_ms = (self.max_interval.as_millis() as u64).max(1);
        Duration::from_millis(rand::thread_rng().gen_range(1..=max_ms))
    }
}

/// Run until `shutdown` fires, relaying every pending item through the actor
/// on each tick
pub(crate) async fn run(
    mut rx: mpsc::Receiver<RebroadcastMsg>,
    relay: mpsc::Sender<ServerMsg>,
    timings: RebroadcastTimings,
    shutdown: CancellationToken,
    log: Logger,
) {
    let mut pending: HashMap<InvVect, RelayPayload> = HashMap::new();
    let timer = sleep(timings.initial_delay);
    tokio::pin!(timer);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(RebroadcastMsg::Add { inv, payload }) => {
                    trace!(target: log.target(), "Added {} to rebroadcast set", inv);
                    pending.insert(inv, payload);
                }
                Some(RebroadcastMsg::Remove(inv)) => {
                    if pending.remove(&inv).is_some() {
                        trace!(target: log.target(), "Removed {} from rebroadcast set", inv);
                    }
                }
                None => break,
            },
            () = &mut timer => {
                for (inv, payload) in &pending {
                    let msg = ServerMsg::RelayInventory {
                        inv: *inv,
                        payload: payload.clone(),
                    };
                    if relay.send(msg).await.is_err() {
                        break;
                    }
                }
                timer.as_mut().reset(Instant::now() + timings.next_interval());
            }
        }
    }

    debug!(target: log.target(), "Rebroadcast handler done ({} items pending)", pending.len());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::hash::Hash;
    use tokio::time::timeout;

    fn timings(initial_ms: u64, max_ms: u64) -> RebroadcastTimings {
        RebroadcastTimings {
            initial_delay: Duration::from_millis(initial_ms),
            max_interval: Duration::from_millis(max_ms),
        }
    }

    fn relayed_inv(msg: ServerMsg) -> InvVect {
        match msg {
            ServerMsg::RelayInventory { inv, .. } => inv,
            _ => panic!("expected a relay message"),
        }
    }

    #[tokio::test]
    async fn test_pending_inventory_is_relayed_until_removed() {
        let (tx, rx) = mpsc::channel(16);
        let (relay_tx, mut relay_rx) = mpsc::channel(64);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run(
            rx,
            relay_tx,
            timings(10, 10),
            shutdown.clone(),
            Logger::default(),
        ));

        let inv = InvVect::tx(Hash::digest(b"tx"));
        tx.send(RebroadcastMsg::Add {
            inv,
            payload: RelayPayload::None,
        })
        .await
        .unwrap();

        for _ in 0..2 {
            let msg = timeout(Duration::from_secs(1), relay_rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(relayed_inv(msg), inv);
        }

        tx.send(RebroadcastMsg::Remove(inv)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        while relay_rx.try_recv().is_ok() {}
        assert!(timeout(Duration::from_millis(100), relay_rx.recv())
            .await
            .is_err());

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_nothing_relayed_before_initial_delay() {
        let (tx, rx) = mpsc::channel(16);
        let (relay_tx, mut relay_rx) = mpsc::channel(16);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run(
            rx,
            relay_tx,
            timings(5_000, 10),
            shutdown.clone(),
            Logger::default(),
        ));

        tx.send(RebroadcastMsg::Add {
            inv: InvVect::tx(Hash::digest(b"early")),
            payload: RelayPayload::None,
        })
        .await
        .unwrap();
        assert!(timeout(Duration::from_millis(50), relay_rx.recv())
            .await
            .is_err());

        shutdown.cancel();
        timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_next_interval_bounds() {
        let t = timings(0, 30);
        for _ in 0..100 {
            let interval = t.next_interval();
            assert!(interval >= Duration::from_millis(1));
            assert!(interval <= Duration::from_millis(30));
        }
    }
}
