//! Admission control for payload execution.
//!
//! The scheduler asks an [`AdmissionController`] for a [`Ticket`] before
//! each payload executes. Waiting for a ticket is the scheduler's only
//! unbounded suspension point and is how execution backpressure reaches the
//! queue.

use async_trait::async_trait;
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::debug;

use crate::error::AdmissionError;

/// Permission to execute one payload. Resources are returned on drop.
pub struct Ticket {
    cost: usize,
    acquired_at: Instant,
    _guard: Option<Box<dyn Any + Send + Sync>>,
}

impl Ticket {
    /// A ticket that holds no resources.
    pub fn new(cost: usize) -> Self {
        Self { cost, acquired_at: Instant::now(), _guard: None }
    }

    /// A ticket that keeps `guard` alive until the payload completes.
    pub fn with_guard<G: Send + Sync + 'static>(cost: usize, guard: G) -> Self {
        Self { cost, acquired_at: Instant::now(), _guard: Some(Box::new(guard)) }
    }

    pub fn cost(&self) -> usize {
        self.cost
    }

    /// How long the ticket has been held.
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

impl fmt::Debug for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ticket")
            .field("cost", &self.cost)
            .field("acquired_at", &self.acquired_at)
            .field("guarded", &self._guard.is_some())
            .finish()
    }
}

/// Gate granting execution tickets.
#[async_trait]
pub trait AdmissionController: Send + Sync {
    /// Wait for a ticket covering `cost` batch slots. `None` waits
    /// indefinitely.
    async fn acquire(&self, cost: usize, timeout: Option<Duration>) -> Result<Ticket, AdmissionError>;

    /// Stop granting tickets; pending and future acquires fail with
    /// [`AdmissionError::Closed`].
    fn close(&self) {}
}

// ---------------------------------------------------------------------------
// Unbounded
// ---------------------------------------------------------------------------

/// Controller that grants every request immediately.
#[derive(Debug, Default)]
pub struct UnboundedAdmission;

#[async_trait]
impl AdmissionController for UnboundedAdmission {
    async fn acquire(&self, cost: usize, _timeout: Option<Duration>) -> Result<Ticket, AdmissionError> {
        Ok(Ticket::new(cost))
    }
}

// ---------------------------------------------------------------------------
// Semaphore
// ---------------------------------------------------------------------------

/// What one permit of a [`SemaphoreAdmission`] stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CostUnit {
    /// One permit per payload: limits concurrently executing payloads.
    Payload,
    /// One permit per batch slot: limits concurrently executing slots.
    BatchSlot,
}

/// Semaphore-backed controller.
pub struct SemaphoreAdmission {
    semaphore: Arc<Semaphore>,
    permits: usize,
    unit: CostUnit,
    granted: AtomicU64,
    timed_out: AtomicU64,
}

/// Admission statistics
#[derive(Debug, Clone, Serialize)]
pub struct AdmissionStats {
    pub unit: CostUnit,
    pub total_permits: usize,
    pub available_permits: usize,
    pub granted: u64,
    pub timed_out: u64,
}

impl SemaphoreAdmission {
    /// Allow at most `permits` payloads to execute at once.
    pub fn per_payload(permits: usize) -> Self {
        Self::new(permits, CostUnit::Payload)
    }

    /// Allow at most `permits` batch slots to execute at once.
    pub fn per_batch_slot(permits: usize) -> Self {
        Self::new(permits, CostUnit::BatchSlot)
    }

    fn new(permits: usize, unit: CostUnit) -> Self {
        let permits = permits.clamp(1, Semaphore::MAX_PERMITS);
        Self {
            semaphore: Arc::new(Semaphore::new(permits)),
            permits,
            unit,
            granted: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
        }
    }

    /// Permits a request of `cost` slots takes. Never more than the total,
    /// so an oversized payload waits for exclusive use instead of forever.
    fn permits_for(&self, cost: usize) -> u32 {
        let wanted = match self.unit {
            CostUnit::Payload => 1,
            CostUnit::BatchSlot => cost.clamp(1, self.permits),
        };
        u32::try_from(wanted).unwrap_or(u32::MAX)
    }

    pub fn stats(&self) -> AdmissionStats {
        AdmissionStats {
            unit: self.unit,
            total_permits: self.permits,
            available_permits: self.semaphore.available_permits(),
            granted: self.granted.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl AdmissionController for SemaphoreAdmission {
    async fn acquire(&self, cost: usize, timeout: Option<Duration>) -> Result<Ticket, AdmissionError> {
        let permits = self.permits_for(cost);
        let acquire = Arc::clone(&self.semaphore).acquire_many_owned(permits);

        let permit = match timeout {
            Some(limit) => match tokio::time::timeout(limit, acquire).await {
                Ok(result) => result,
                Err(_) => {
                    self.timed_out.fetch_add(1, Ordering::Relaxed);
                    debug!(cost, permits, timeout = ?limit, "Admission timed out");
                    return Err(AdmissionError::Timeout(limit));
                }
            },
            None => acquire.await,
        }
        .map_err(|_| AdmissionError::Closed)?;

        self.granted.fetch_add(1, Ordering::Relaxed);
        Ok(Ticket::with_guard(cost, permit))
    }

    fn close(&self) {
        self.semaphore.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unbounded_grants_immediately() {
        let ticket = UnboundedAdmission.acquire(16, None).await.unwrap();
        assert_eq!(ticket.cost(), 16);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_payload_limit_and_release() {
        let admission = SemaphoreAdmission::per_payload(1);
        let ticket = admission.acquire(4, None).await.unwrap();
        assert_eq!(admission.stats().available_permits, 0);

        let err = admission.acquire(1, Some(Duration::from_millis(10))).await.unwrap_err();
        assert_eq!(err, AdmissionError::Timeout(Duration::from_millis(10)));

        drop(ticket);
        assert!(admission.acquire(1, Some(Duration::from_millis(10))).await.is_ok());

        let stats = admission.stats();
        assert_eq!(stats.granted, 2);
        assert_eq!(stats.timed_out, 1);
    }

    #[tokio::test]
    async fn test_batch_slot_cost_is_clamped() {
        let admission = SemaphoreAdmission::per_batch_slot(4);
        let ticket = admission.acquire(10, None).await.unwrap();
        assert_eq!(admission.stats().available_permits, 0);
        drop(ticket);

        let _small = admission.acquire(3, None).await.unwrap();
        assert_eq!(admission.stats().available_permits, 1);
    }

    #[tokio::test]
    async fn test_close_fails_waiters() {
        let admission = Arc::new(SemaphoreAdmission::per_payload(1));
        let _held = admission.acquire(1, None).await.unwrap();

        let waiter = {
            let admission = Arc::clone(&admission);
            tokio::spawn(async move { admission.acquire(1, None).await })
        };
        tokio::task::yield_now().await;
        admission.close();

        assert_eq!(waiter.await.unwrap().unwrap_err(), AdmissionError::Closed);
        assert_eq!(admission.acquire(1, None).await.unwrap_err(), AdmissionError::Closed);
    }
}
