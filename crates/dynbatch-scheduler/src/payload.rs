//! Payloads: batches of requests handed to the execution backend.
//!
//! A [`Payload`] accumulates requests up to the configured maximum batch
//! size. Once saturated nothing more may join; sealing it splits it into an
//! immutable, shared [`Batch`] for the backend and the response sinks that
//! stay with the completion path.

use std::sync::Arc;

use tokio::time::Instant;

use crate::error::SchedulerError;
use crate::request::{InferenceRequest, ResponseSink};
use crate::request_queue::QueuedRequest;

/// Monotonic payload identifier, unique per scheduler.
pub type BatchId = u64;

/// Immutable view of a cut payload shared with the execution backend.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub id: BatchId,
    /// Requests in the order they joined the payload.
    pub requests: Vec<InferenceRequest>,
    /// Total batch slots used by `requests`.
    pub batch_size: usize,
    /// Enqueue time of the oldest member.
    pub oldest_enqueued_at: Instant,
    pub cut_at: Instant,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

/// A forming batch.
#[derive(Debug)]
pub struct Payload {
    id: BatchId,
    max_batch_size: usize,
    entries: Vec<QueuedRequest>,
    batch_size: usize,
    saturated: bool,
}

impl Payload {
    pub fn new(id: BatchId, max_batch_size: usize) -> Self {
        Self { id, max_batch_size, entries: Vec::new(), batch_size: 0, saturated: false }
    }

    pub fn id(&self) -> BatchId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Accumulated batch size of the members.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn is_saturated(&self) -> bool {
        self.saturated
    }

    /// Whether a request of `size` slots could still join.
    pub fn can_fit(&self, size: usize) -> bool {
        !self.saturated && self.batch_size + size <= self.max_batch_size
    }

    /// Add a request, handing it back if it cannot join.
    ///
    /// Reaching `max_batch_size` saturates the payload.
    pub fn add(&mut self, entry: QueuedRequest) -> Result<(), QueuedRequest> {
        if !self.can_fit(entry.batch_size()) {
            return Err(entry);
        }
        self.batch_size += entry.batch_size();
        self.entries.push(entry);
        if self.batch_size == self.max_batch_size {
            self.saturated = true;
        }
        Ok(())
    }

    /// Mark the payload as closed to further members.
    pub fn saturate(&mut self) {
        self.saturated = true;
    }

    pub fn oldest_enqueued_at(&self) -> Option<Instant> {
        self.entries.iter().map(|e| e.enqueued_at).min()
    }

    /// Split into the shared batch and the members' sinks, in member order.
    pub fn seal(self, cut_at: Instant) -> (Arc<Batch>, Vec<ResponseSink>) {
        let oldest_enqueued_at = self.oldest_enqueued_at().unwrap_or(cut_at);
        let mut requests = Vec::with_capacity(self.entries.len());
        let mut sinks = Vec::with_capacity(self.entries.len());
        for entry in self.entries {
            requests.push(entry.request);
            sinks.push(entry.sink);
        }
        let batch = Batch { id: self.id, requests, batch_size: self.batch_size, oldest_enqueued_at, cut_at };
        (Arc::new(batch), sinks)
    }

    /// Fail every member with the same error.
    pub fn fail_all(self, err: SchedulerError) {
        for entry in self.entries {
            entry.fail(err.clone());
        }
    }
}
