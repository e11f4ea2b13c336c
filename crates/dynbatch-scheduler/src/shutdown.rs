//! Cooperative stop flag and in-flight payload drain

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Shutdown coordinator for a scheduler instance
#[derive(Debug, Default)]
pub struct ShutdownCoordinator {
    stopping: AtomicBool,
    inflight: Arc<AtomicUsize>,
    inflight_requests: Arc<AtomicUsize>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if stop has been requested
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(AtomicOrdering::SeqCst)
    }

    /// Request stop. Returns `false` if stop was already requested.
    pub fn initiate(&self) -> bool {
        let first = !self.stopping.swap(true, AtomicOrdering::SeqCst);
        if first {
            info!("Stop requested - new requests will be rejected");
        }
        first
    }

    /// Payloads cut and not yet released, including those waiting for a ticket.
    pub fn inflight(&self) -> usize {
        self.inflight.load(AtomicOrdering::SeqCst)
    }

    /// Requests inside those payloads.
    pub fn inflight_requests(&self) -> usize {
        self.inflight_requests.load(AtomicOrdering::SeqCst)
    }

    /// Count a payload of `requests` requests as executing until the guard
    /// is dropped.
    pub fn track(&self, requests: usize) -> InflightGuard {
        self.inflight.fetch_add(1, AtomicOrdering::SeqCst);
        self.inflight_requests.fetch_add(requests, AtomicOrdering::SeqCst);
        InflightGuard {
            inflight: Arc::clone(&self.inflight),
            inflight_requests: Arc::clone(&self.inflight_requests),
            requests,
        }
    }

    /// Wait for executing payloads to drain
    pub async fn drain(&self, timeout: Duration) -> Duration {
        let drain_start = Instant::now();
        let poll_interval = Duration::from_millis(10);

        loop {
            let inflight = self.inflight();

            if inflight == 0 {
                debug!("All in-flight payloads completed");
                break;
            }

            if drain_start.elapsed() >= timeout {
                warn!(inflight, "Drain timeout exceeded - proceeding with {} payloads in flight", inflight);
                break;
            }

            debug!(inflight, elapsed = ?drain_start.elapsed(), "Waiting for in-flight payloads");

            tokio::time::sleep(poll_interval).await;
        }

        drain_start.elapsed()
    }
}

/// Marks one executing payload
#[derive(Debug)]
pub struct InflightGuard {
    inflight: Arc<AtomicUsize>,
    inflight_requests: Arc<AtomicUsize>,
    requests: usize,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.inflight_requests.fetch_sub(self.requests, AtomicOrdering::SeqCst);
        self.inflight.fetch_sub(1, AtomicOrdering::SeqCst);
    }
}
