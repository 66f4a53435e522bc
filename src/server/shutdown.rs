//! Delayed shutdown
//!
//! `schedule_shutdown` warns periodically while counting down, ticking more
//! often as the deadline gets closer, then stops the server.

use crate::server::Server;
use log::warn;
use std::time::Duration;
use tokio::time::{interval_at, sleep_until, Instant};

/// Warning interval for the given time left
pub fn dynamic_tick_duration(remaining: Duration) -> Duration {
    const MINUTE: u64 = 60;
    match remaining.as_secs() {
        s if s <= 5 => Duration::from_secs(1),
        s if s <= MINUTE => Duration::from_secs(5),
        s if s <= 5 * MINUTE => Duration::from_secs(MINUTE),
        s if s <= 15 * MINUTE => Duration::from_secs(5 * MINUTE),
        s if s <= 60 * MINUTE => Duration::from_secs(15 * MINUTE),
        _ => Duration::from_secs(60 * MINUTE),
    }
}

impl Server {
    /// Stop the server after `duration`. Only the first call has an effect.
    pub fn schedule_shutdown(&self, duration: Duration) {
        if self.inner.shutdown_scheduled.swap(true, std::sync::atomic::Ordering::AcqRel) {
            return;
        }
        warn!(target: self.logger().target(), "Server shutdown in {:?}", duration);

        let server = self.clone();
        tokio::spawn(async move {
            let deadline = Instant::now() + duration;
            let done = sleep_until(deadline);
            tokio::pin!(done);

            let mut tick = dynamic_tick_duration(duration);
            let mut ticker = interval_at(Instant::now() + tick, tick);

            loop {
                tokio::select! {
                    _ = &mut done => break,
                    _ = server.shutdown_token().cancelled() => return,
                    _ = ticker.tick() => {
                        let remaining = deadline.saturating_duration_since(Instant::now());
                        if remaining < Duration::from_secs(1) {
                            continue;
                        }
                        let next = dynamic_tick_duration(remaining);
                        if next < tick {
                            tick = next;
                            ticker = interval_at(Instant::now() + tick, tick);
                        }
                        warn!(
                            target: server.logger().target(),
                            "Server shutdown in {}s",
                            remaining.as_secs()
                        );
                    }
                }
            }

            server.stop().await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::testutil::TestNode;
    use tokio::time::timeout;

    #[test]
    fn test_dynamic_tick_duration() {
        let secs = Duration::from_secs;
        assert_eq!(dynamic_tick_duration(secs(3)), secs(1));
        assert_eq!(dynamic_tick_duration(secs(5)), secs(1));
        assert_eq!(dynamic_tick_duration(secs(30)), secs(5));
        assert_eq!(dynamic_tick_duration(secs(4 * 60)), secs(60));
        assert_eq!(dynamic_tick_duration(secs(10 * 60)), secs(5 * 60));
        assert_eq!(dynamic_tick_duration(secs(45 * 60)), secs(15 * 60));
        assert_eq!(dynamic_tick_duration(secs(3 * 60 * 60)), secs(60 * 60));
    }

    #[tokio::test]
    async fn test_scheduled_shutdown_stops_server() {
        let node = TestNode::start(Config::default());
        let (peer, _rx) = node.connected_peer("10.7.0.1:16111", true).await;

        node.server.schedule_shutdown(Duration::from_millis(50));
        // A second schedule is ignored
        node.server.schedule_shutdown(Duration::from_secs(3600));

        timeout(Duration::from_secs(2), node.server.wait_for_shutdown())
            .await
            .unwrap();
        assert!(node.server.is_shutting_down());
        assert!(!peer.is_connected());
    }
}
