//! Keepalive scheduler: keeps the coordinator's host from tearing it down
//! while attachments exist.
//!
//! A pure liveness mechanism with no data contract beyond "did it fire":
//! while at least one attachment is live, a signal fires every period (20 s
//! by default, well inside the reference host's 30 s idle-teardown window).
//! When attachments drop to zero the scheduler stops. Firing is observable
//! through a tick counter so liveness is testable.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

/// Periodic liveness signal, started and stopped by attachment count.
#[derive(Debug)]
pub struct KeepaliveScheduler {
    interval: Duration,
    ticks: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl KeepaliveScheduler {
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            ticks: Arc::new(AtomicU64::new(0)),
            handle: None,
        }
    }

    /// Whether the signal task is currently running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Total signals fired since creation.
    #[must_use]
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Shared handle to the fire counter, for observation from outside the
    /// owning event loop.
    #[must_use]
    pub fn ticks_handle(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.ticks)
    }

    /// Start signaling if not already running. Idempotent.
    pub fn ensure_running(&mut self) {
        if self.is_running() {
            return;
        }
        debug!(interval_secs = self.interval.as_secs(), "keepalive started");
        let ticks = Arc::clone(&self.ticks);
        let interval = self.interval;
        self.handle = Some(tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // interval fires immediately; the first real signal is one
            // period out.
            timer.tick().await;
            loop {
                timer.tick().await;
                ticks.fetch_add(1, Ordering::Relaxed);
                trace!("keepalive signal");
            }
        }));
    }

    /// Stop signaling.
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            debug!("keepalive stopped");
        }
    }

    /// Reconcile with the current attachment count: run while ≥1 attachment
    /// exists, stop at zero.
    pub fn sync(&mut self, active_attachments: usize) {
        if active_attachments > 0 {
            self.ensure_running();
        } else {
            self.stop();
        }
    }
}

impl Drop for KeepaliveScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
