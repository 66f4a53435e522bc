//! Processing gates
//!
//! When a peer delivers a block or transaction, its read task hands the item
//! to the sync manager and then waits on a gate until the sync manager
//! reports it processed. This keeps at most one such item in flight per peer.

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// Completion side of a gate, handed to the sync manager
#[derive(Debug, Clone)]
pub struct ProcessedSignal(mpsc::Sender<()>);

impl ProcessedSignal {
    /// Report the item processed. Extra signals are dropped.
    pub fn signal(&self) {
        let _ = self.0.try_send(());
    }
}

/// Capacity-1 gate awaited by a peer's read task
#[derive(Debug)]
pub struct ProcessedGate {
    tx: mpsc::Sender<()>,
    rx: Mutex<mpsc::Receiver<()>>,
}

impl ProcessedGate {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    pub fn signal(&self) -> ProcessedSignal {
        ProcessedSignal(self.tx.clone())
    }

    /// Wait for the signal. Returns false if `quit` fired first.
    pub async fn wait(&self, quit: &CancellationToken) -> bool {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            _ = quit.cancelled() => false,
            signalled = rx.recv() => signalled.is_some(),
        }
    }
}

impl Default for ProcessedGate {
    fn default() -> Self {
        Self::new()
    }
}
