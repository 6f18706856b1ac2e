//! Liveness signal for long paginated fetches
//!
//! The engine calls [`Heartbeat::beat`] after connecting and after each page;
//! the orchestrator's watchdog treats silence longer than the configured
//! timeout as a hung attempt.

use std::time::Duration;
use tokio::sync::watch;

pub struct Heartbeat {
    tx: watch::Sender<u64>,
}

pub struct HeartbeatMonitor {
    rx: watch::Receiver<u64>,
}

impl Heartbeat {
    pub fn new() -> (Self, HeartbeatMonitor) {
        let (tx, rx) = watch::channel(0);
        (Self { tx }, HeartbeatMonitor { rx })
    }

    /// Heartbeat nobody watches
    pub fn noop() -> Self {
        Self::new().0
    }

    pub fn beat(&self) {
        self.tx.send_modify(|count| *count += 1);
    }

    /// Beats sent so far
    pub fn count(&self) -> u64 {
        *self.tx.borrow()
    }
}

impl HeartbeatMonitor {
    /// Resolves once no beat has arrived for `timeout`. Pends forever if the
    /// heartbeat is dropped (the attempt has finished).
    pub async fn flatlined(mut self, timeout: Duration) {
        loop {
            match tokio::time::timeout(timeout, self.rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => std::future::pending::<()>().await,
                Err(_) => return,
            }
        }
    }
}
