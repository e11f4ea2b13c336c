//! Priority request queue feeding the batch former.
//!
//! [`PriorityQueue`] keeps one FIFO per priority level (lower level number
//! drains first), applies the level's [`QueuePolicy`] on push, and tracks the
//! pending request count and batch-slot total across all levels. Each level
//! also owns a delayed sub-queue for requests whose timeout fired under a
//! `delay` policy; it drains only after the level's regular requests.
//!
//! The queue is not internally synchronized; the scheduler guards it with the
//! same mutex as the rest of its forming state.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::config::{SchedulerConfig, TimeoutAction};
use crate::error::SchedulerError;
use crate::policy::{AdmitDecision, QueuePolicy};
use crate::request::{InferenceRequest, ResponseSink};

// ---------------------------------------------------------------------------
// Queue entry
// ---------------------------------------------------------------------------

/// A request waiting in the queue, together with its response sink.
#[derive(Debug)]
pub struct QueuedRequest {
    pub request: InferenceRequest,
    pub sink: ResponseSink,
    /// Level the request is stored at.
    pub level: u32,
    pub enqueued_at: Instant,
    /// When the level's timeout action applies; `None` never expires.
    pub deadline: Option<Instant>,
}

impl QueuedRequest {
    pub fn new(request: InferenceRequest, sink: ResponseSink, level: u32, enqueued_at: Instant) -> Self {
        Self { request, sink, level, enqueued_at, deadline: None }
    }

    pub fn batch_size(&self) -> usize {
        self.request.batch_size
    }

    /// Fail the request, consuming its sink.
    pub fn fail(self, err: SchedulerError) {
        self.sink.send(Err(err));
    }
}

// ---------------------------------------------------------------------------
// Levels
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Level {
    policy: QueuePolicy,
    queue: VecDeque<QueuedRequest>,
    delayed: VecDeque<QueuedRequest>,
}

impl Level {
    fn new(policy: QueuePolicy) -> Self {
        Self { policy, queue: VecDeque::new(), delayed: VecDeque::new() }
    }

    fn len(&self) -> usize {
        self.queue.len() + self.delayed.len()
    }

    fn pop_front(&mut self) -> Option<QueuedRequest> {
        self.queue.pop_front().or_else(|| self.delayed.pop_front())
    }

    /// Remove the request with the earliest enqueue time.
    fn pop_oldest(&mut self) -> Option<QueuedRequest> {
        match (self.queue.front(), self.delayed.front()) {
            (Some(a), Some(b)) if b.enqueued_at < a.enqueued_at => self.delayed.pop_front(),
            (Some(_), _) => self.queue.pop_front(),
            (None, _) => self.delayed.pop_front(),
        }
    }

    fn iter(&self) -> impl Iterator<Item = &QueuedRequest> {
        self.queue.iter().chain(self.delayed.iter())
    }
}

/// Snapshot of one level's occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LevelDepth {
    pub level: u32,
    pub queued: usize,
    pub delayed: usize,
}

// ---------------------------------------------------------------------------
// PriorityQueue
// ---------------------------------------------------------------------------

/// Ordered collection of pending requests across priority levels.
#[derive(Debug)]
pub struct PriorityQueue {
    levels: BTreeMap<u32, Level>,
    size: usize,
    batch_size: usize,
}

impl PriorityQueue {
    /// Build an empty queue with one level per configured priority.
    pub fn new(config: &SchedulerConfig) -> Self {
        let levels = config
            .levels()
            .into_iter()
            .map(|level| (level, Level::new(QueuePolicy::new(level, config.policy_for(level).clone()))))
            .collect();
        Self { levels, size: 0, batch_size: 0 }
    }

    /// Number of pending requests across all levels.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Sum of the batch sizes of all pending requests.
    pub fn queued_batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn policy(&self, level: u32) -> Option<&QueuePolicy> {
        self.levels.get(&level).map(|l| &l.policy)
    }

    pub fn depths(&self) -> Vec<LevelDepth> {
        self.levels
            .iter()
            .map(|(&level, l)| LevelDepth { level, queued: l.queue.len(), delayed: l.delayed.len() })
            .collect()
    }

    /// Link a request into its level after applying the level's policy.
    ///
    /// On success returns the request evicted to make room, if any. The
    /// entry's deadline is derived from the policy timeout here.
    pub fn push(&mut self, mut entry: QueuedRequest) -> Result<Option<QueuedRequest>, SchedulerError> {
        let level = self
            .levels
            .get_mut(&entry.level)
            .ok_or(SchedulerError::QueueFull { level: entry.level, limit: 0 })?;

        let evicted = match level.policy.admit(level.len()) {
            AdmitDecision::Accept => None,
            AdmitDecision::RejectNew => {
                return Err(SchedulerError::QueueFull {
                    level: entry.level,
                    limit: level.policy.max_queue_size().unwrap_or(0),
                });
            }
            AdmitDecision::EvictOldestThenAccept => level.pop_oldest(),
        };

        entry.deadline = level.policy.timeout_for(entry.request.timeout).map(|t| entry.enqueued_at + t);

        if let Some(old) = &evicted {
            self.size -= 1;
            self.batch_size -= old.batch_size();
        }
        self.size += 1;
        self.batch_size += entry.batch_size();
        level.queue.push_back(entry);

        Ok(evicted)
    }

    /// Iterate pending requests in dispatch order: levels ascending, each
    /// level's regular requests before its delayed ones, FIFO within each.
    pub fn iter(&self) -> impl Iterator<Item = &QueuedRequest> {
        self.levels.values().flat_map(Level::iter)
    }

    pub fn peek(&self) -> Option<&QueuedRequest> {
        self.iter().next()
    }

    /// Remove and return the first `n` requests in dispatch order.
    pub fn pop_front_n(&mut self, n: usize) -> Vec<QueuedRequest> {
        let mut popped = Vec::with_capacity(n.min(self.size));
        for level in self.levels.values_mut() {
            while popped.len() < n {
                match level.pop_front() {
                    Some(entry) => popped.push(entry),
                    None => break,
                }
            }
            if popped.len() == n {
                break;
            }
        }
        for entry in &popped {
            self.size -= 1;
            self.batch_size -= entry.batch_size();
        }
        popped
    }

    /// Pop requests in dispatch order while they fit within `max_batch_size`
    /// and `can_join` accepts them. Stops at the first request that does not
    /// qualify, leaving it and everything behind it queued.
    pub fn pop_ready_batch<F>(&mut self, max_batch_size: usize, mut can_join: F) -> Vec<QueuedRequest>
    where
        F: FnMut(&QueuedRequest) -> bool,
    {
        let mut total = 0;
        let mut count = 0;
        for entry in self.iter() {
            if total + entry.batch_size() > max_batch_size || !can_join(entry) {
                break;
            }
            total += entry.batch_size();
            count += 1;
        }
        self.pop_front_n(count)
    }

    /// Apply timeout actions to every request whose deadline is at or before
    /// `now`. Requests under a `reject` policy are removed and returned;
    /// requests under a `delay` policy move to their level's delayed queue
    /// and never expire again.
    pub fn expire(&mut self, now: Instant) -> Vec<QueuedRequest> {
        let mut rejected = Vec::new();
        for level in self.levels.values_mut() {
            if !level.queue.iter().any(|e| e.deadline.is_some_and(|d| d <= now)) {
                continue;
            }
            let action = level.policy.timeout_action();
            let mut kept = VecDeque::with_capacity(level.queue.len());
            for mut entry in level.queue.drain(..) {
                if !entry.deadline.is_some_and(|d| d <= now) {
                    kept.push_back(entry);
                    continue;
                }
                match action {
                    TimeoutAction::Reject => rejected.push(entry),
                    TimeoutAction::Delay => {
                        entry.deadline = None;
                        level.delayed.push_back(entry);
                    }
                }
            }
            level.queue = kept;
        }
        for entry in &rejected {
            self.size -= 1;
            self.batch_size -= entry.batch_size();
        }
        rejected
    }

    /// Earliest pending timeout deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.levels.values().flat_map(|l| l.queue.iter()).filter_map(|e| e.deadline).min()
    }

    /// Remove every pending request.
    pub fn drain_all(&mut self) -> Vec<QueuedRequest> {
        let total = self.size;
        self.pop_front_n(total)
    }
}

/// Time a request has spent in the queue.
pub fn waited(entry: &QueuedRequest, now: Instant) -> Duration {
    now.saturating_duration_since(entry.enqueued_at)
}

// =========================================================================
// Tests
// =========================================================================
