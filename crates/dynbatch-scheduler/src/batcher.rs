//! Dynamic batch formation.
//!
//! [`Batcher::get_dynamic_batch`] runs once per scheduler wake. It walks the
//! queue in dispatch order, accumulating the longest prefix that fits in one
//! payload, and decides whether to cut that prefix now or sleep. Requests
//! stay queued until a cut pops them, so a higher-priority arrival joins the
//! front of the forming payload on the next wake.
//!
//! Cut rules, checked in order:
//!
//! 1. the prefix reached the largest preferred size: cut at the largest
//!    preferred boundary inside the prefix (or the whole prefix if none);
//! 2. the prefix is saturated, because it reached `max_batch_size` or the
//!    next request cannot join: cut the whole prefix;
//! 3. the scheduler is stopping, or the oldest member has waited
//!    `max_queue_delay`: cut the whole prefix;
//! 4. under [`PreferredBatchPolicy::CutAtPreferred`], a preferred size was
//!    reached: cut at the largest reached preferred size.
//!
//! Otherwise the scheduler waits until the delay expires or the next queue
//! timeout fires, whichever is first.

use std::collections::BTreeSet;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::{PreferredBatchPolicy, SchedulerConfig};
use crate::request::InferenceRequest;
use crate::request_queue::PriorityQueue;

/// Why a payload was cut.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CutReason {
    MaxBatchSize,
    /// The next request in dispatch order could not join.
    Incompatible,
    PreferredSize,
    QueueDelay,
    Stopping,
    /// Dynamic batching is disabled.
    Unbatched,
}

impl CutReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MaxBatchSize => "max_batch_size",
            Self::Incompatible => "incompatible",
            Self::PreferredSize => "preferred_size",
            Self::QueueDelay => "queue_delay",
            Self::Stopping => "stopping",
            Self::Unbatched => "unbatched",
        }
    }
}

/// Outcome of one formation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchDecision {
    /// Nothing is queued.
    Idle,
    /// Keep the forming payload open until `until` or new work arrives.
    Wait { until: Instant, pending_batch_size: usize },
    /// Pop the first `count` queued requests as one payload.
    Cut { count: usize, batch_size: usize, reason: CutReason },
}

/// Batch formation rules derived from the scheduler configuration.
#[derive(Debug, Clone)]
pub struct Batcher {
    dynamic_batching: bool,
    max_batch_size: usize,
    preferred_batch_sizes: BTreeSet<usize>,
    max_queue_delay: Duration,
    preferred_policy: PreferredBatchPolicy,
    has_optional_inputs: bool,
    /// Input name and whether its values must match as well.
    equal_shape_tensors: Vec<(String, bool)>,
}

impl Batcher {
    pub fn new(config: &SchedulerConfig) -> Self {
        let mut equal_shape_tensors: Vec<(String, bool)> =
            config.enforce_equal_shape_tensors.iter().map(|(k, v)| (k.clone(), *v)).collect();
        equal_shape_tensors.sort();
        Self {
            dynamic_batching: config.dynamic_batching,
            max_batch_size: config.max_batch_size,
            preferred_batch_sizes: config.preferred_batch_sizes.clone(),
            max_queue_delay: config.max_queue_delay,
            preferred_policy: config.preferred_policy,
            has_optional_inputs: config.has_optional_inputs,
            equal_shape_tensors,
        }
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// Whether `candidate` may share a payload started by `anchor`.
    pub fn compatible(&self, anchor: &InferenceRequest, candidate: &InferenceRequest) -> bool {
        if self.has_optional_inputs && anchor.input_names() != candidate.input_names() {
            return false;
        }
        self.equal_shape_tensors.iter().all(|(name, values_matter)| {
            match (anchor.input(name), candidate.input(name)) {
                (Some(a), Some(b)) => {
                    a.shape == b.shape && (!values_matter || a.shape_values == b.shape_values)
                }
                (None, None) => true,
                _ => false,
            }
        })
    }

    /// Decide what to do with the queue's current contents.
    ///
    /// Timeouts must already have been applied for `now`; the returned wait
    /// deadline accounts for the next one.
    pub fn get_dynamic_batch(&self, queue: &PriorityQueue, now: Instant, stopping: bool) -> BatchDecision {
        let mut entries = queue.iter();
        let Some(anchor) = entries.next() else {
            return BatchDecision::Idle;
        };

        if !self.dynamic_batching {
            return BatchDecision::Cut { count: 1, batch_size: anchor.batch_size(), reason: CutReason::Unbatched };
        }

        let max_preferred = self.preferred_batch_sizes.last().copied();
        let mut count = 1;
        let mut size = anchor.batch_size();
        let mut oldest = anchor.enqueued_at;
        let mut last_preferred = self.preferred_batch_sizes.contains(&size).then_some((count, size));
        let mut saturated = None;

        if max_preferred.is_none_or(|p| size < p) && size < self.max_batch_size {
            for entry in entries {
                if size + entry.batch_size() > self.max_batch_size {
                    saturated = Some(CutReason::MaxBatchSize);
                    break;
                }
                if !self.compatible(&anchor.request, &entry.request) {
                    saturated = Some(CutReason::Incompatible);
                    break;
                }
                count += 1;
                size += entry.batch_size();
                oldest = oldest.min(entry.enqueued_at);
                if self.preferred_batch_sizes.contains(&size) {
                    last_preferred = Some((count, size));
                }
                if max_preferred.is_some_and(|p| size >= p) || size == self.max_batch_size {
                    break;
                }
            }
        }

        if let Some(p) = max_preferred
            && size >= p
        {
            let (count, batch_size) = last_preferred.unwrap_or((count, size));
            return BatchDecision::Cut { count, batch_size, reason: CutReason::PreferredSize };
        }

        if size == self.max_batch_size {
            saturated = Some(CutReason::MaxBatchSize);
        }
        if let Some(reason) = saturated {
            return BatchDecision::Cut { count, batch_size: size, reason };
        }

        if stopping {
            return BatchDecision::Cut { count, batch_size: size, reason: CutReason::Stopping };
        }

        let delay_deadline = oldest + self.max_queue_delay;
        if now >= delay_deadline {
            return BatchDecision::Cut { count, batch_size: size, reason: CutReason::QueueDelay };
        }

        if self.preferred_policy == PreferredBatchPolicy::CutAtPreferred
            && let Some((count, batch_size)) = last_preferred
        {
            return BatchDecision::Cut { count, batch_size, reason: CutReason::PreferredSize };
        }

        let until = queue.next_deadline().map_or(delay_deadline, |d| d.min(delay_deadline));
        BatchDecision::Wait { until, pending_batch_size: size }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{InputTensor, response_channel};
    use crate::request_queue::QueuedRequest;

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            max_batch_size: 4,
            max_queue_delay: Duration::from_micros(1000),
            ..SchedulerConfig::default()
        }
    }

    fn push(queue: &mut PriorityQueue, request: InferenceRequest, at: Instant) {
        let (sink, _handle) = response_channel(request.id);
        let level = request.priority;
        queue.push(QueuedRequest::new(request, sink, level, at)).unwrap();
    }

    fn sized(id: u64, size: usize) -> InferenceRequest {
        InferenceRequest::new(id).with_batch_size(size)
    }

    #[test]
    fn empty_queue_is_idle() {
        let cfg = config();
        let queue = PriorityQueue::new(&cfg);
        assert_eq!(Batcher::new(&cfg).get_dynamic_batch(&queue, Instant::now(), false), BatchDecision::Idle);
    }

    #[test]
    fn waits_for_delay_then_cuts() {
        let cfg = config();
        let batcher = Batcher::new(&cfg);
        let mut queue = PriorityQueue::new(&cfg);
        let t0 = Instant::now();
        push(&mut queue, sized(1, 1), t0);
        push(&mut queue, sized(2, 1), t0);

        let until = t0 + Duration::from_micros(1000);
        assert_eq!(
            batcher.get_dynamic_batch(&queue, t0, false),
            BatchDecision::Wait { until, pending_batch_size: 2 }
        );
        assert_eq!(
            batcher.get_dynamic_batch(&queue, until, false),
            BatchDecision::Cut { count: 2, batch_size: 2, reason: CutReason::QueueDelay }
        );
    }

    #[test]
    fn full_payload_cuts_immediately() {
        let cfg = config();
        let batcher = Batcher::new(&cfg);
        let mut queue = PriorityQueue::new(&cfg);
        let t0 = Instant::now();
        for id in 1..=5 {
            push(&mut queue, sized(id, 1), t0);
        }
        assert_eq!(
            batcher.get_dynamic_batch(&queue, t0, false),
            BatchDecision::Cut { count: 4, batch_size: 4, reason: CutReason::MaxBatchSize }
        );
    }

    #[test]
    fn overflowing_request_saturates_payload() {
        let cfg = config();
        let batcher = Batcher::new(&cfg);
        let mut queue = PriorityQueue::new(&cfg);
        let t0 = Instant::now();
        push(&mut queue, sized(1, 3), t0);
        push(&mut queue, sized(2, 2), t0);
        assert_eq!(
            batcher.get_dynamic_batch(&queue, t0, false),
            BatchDecision::Cut { count: 1, batch_size: 3, reason: CutReason::MaxBatchSize }
        );
    }

    #[test]
    fn wait_for_larger_preferred_size() {
        let mut cfg = config();
        cfg.preferred_batch_sizes = [2, 4].into_iter().collect();
        let batcher = Batcher::new(&cfg);
        let mut queue = PriorityQueue::new(&cfg);
        let t0 = Instant::now();
        push(&mut queue, sized(1, 1), t0);
        push(&mut queue, sized(2, 1), t0);

        assert!(matches!(batcher.get_dynamic_batch(&queue, t0, false), BatchDecision::Wait { .. }));
        assert_eq!(
            batcher.get_dynamic_batch(&queue, t0 + Duration::from_micros(1000), false),
            BatchDecision::Cut { count: 2, batch_size: 2, reason: CutReason::QueueDelay }
        );
    }

    #[test]
    fn cut_at_preferred_policy() {
        let mut cfg = config();
        cfg.preferred_batch_sizes = [2, 4].into_iter().collect();
        cfg.preferred_policy = PreferredBatchPolicy::CutAtPreferred;
        let batcher = Batcher::new(&cfg);
        let mut queue = PriorityQueue::new(&cfg);
        let t0 = Instant::now();
        for id in 1..=3 {
            push(&mut queue, sized(id, 1), t0);
        }
        assert_eq!(
            batcher.get_dynamic_batch(&queue, t0, false),
            BatchDecision::Cut { count: 2, batch_size: 2, reason: CutReason::PreferredSize }
        );
    }

    #[test]
    fn overshooting_largest_preferred_trims_to_boundary() {
        let mut cfg = config();
        cfg.max_batch_size = 8;
        cfg.preferred_batch_sizes = [2, 4].into_iter().collect();
        let batcher = Batcher::new(&cfg);
        let mut queue = PriorityQueue::new(&cfg);
        let t0 = Instant::now();
        push(&mut queue, sized(1, 1), t0);
        push(&mut queue, sized(2, 1), t0);
        push(&mut queue, sized(3, 3), t0);
        assert_eq!(
            batcher.get_dynamic_batch(&queue, t0, false),
            BatchDecision::Cut { count: 2, batch_size: 2, reason: CutReason::PreferredSize }
        );
    }

    #[test]
    fn shape_mismatch_saturates_payload() {
        let mut cfg = config();
        cfg.enforce_equal_shape_tensors.insert("input".into(), false);
        let batcher = Batcher::new(&cfg);
        let mut queue = PriorityQueue::new(&cfg);
        let t0 = Instant::now();
        push(&mut queue, sized(1, 1).with_input(InputTensor::new("input", vec![16])), t0);
        push(&mut queue, sized(2, 1).with_input(InputTensor::new("input", vec![16])), t0);
        push(&mut queue, sized(3, 1).with_input(InputTensor::new("input", vec![32])), t0);
        push(&mut queue, sized(4, 1).with_input(InputTensor::new("input", vec![16])), t0);
        assert_eq!(
            batcher.get_dynamic_batch(&queue, t0, false),
            BatchDecision::Cut { count: 2, batch_size: 2, reason: CutReason::Incompatible }
        );
    }

    #[test]
    fn shape_tensor_values_must_match() {
        let mut cfg = config();
        cfg.enforce_equal_shape_tensors.insert("dims".into(), true);
        let batcher = Batcher::new(&cfg);
        let a = sized(1, 1).with_input(InputTensor::new("dims", vec![2]).with_shape_values(vec![3, 4]));
        let b = sized(2, 1).with_input(InputTensor::new("dims", vec![2]).with_shape_values(vec![3, 4]));
        let c = sized(3, 1).with_input(InputTensor::new("dims", vec![2]).with_shape_values(vec![4, 3]));
        assert!(batcher.compatible(&a, &b));
        assert!(!batcher.compatible(&a, &c));
    }

    #[test]
    fn optional_input_pattern_must_match() {
        let mut cfg = config();
        cfg.has_optional_inputs = true;
        let batcher = Batcher::new(&cfg);
        let both = sized(1, 1).with_input(InputTensor::new("a", vec![1])).with_input(InputTensor::new("b", vec![1]));
        let only_a = sized(2, 1).with_input(InputTensor::new("a", vec![1]));
        assert!(!batcher.compatible(&both, &only_a));
        assert!(batcher.compatible(&only_a, &only_a.clone()));

        cfg.has_optional_inputs = false;
        assert!(Batcher::new(&cfg).compatible(&both, &only_a));
    }

    #[test]
    fn stopping_cuts_without_waiting() {
        let cfg = config();
        let batcher = Batcher::new(&cfg);
        let mut queue = PriorityQueue::new(&cfg);
        let t0 = Instant::now();
        for id in 1..=3 {
            push(&mut queue, sized(id, 1), t0);
        }
        assert_eq!(
            batcher.get_dynamic_batch(&queue, t0, true),
            BatchDecision::Cut { count: 3, batch_size: 3, reason: CutReason::Stopping }
        );
    }

    #[test]
    fn disabled_batching_dispatches_singletons() {
        let mut cfg = config();
        cfg.dynamic_batching = false;
        let batcher = Batcher::new(&cfg);
        let mut queue = PriorityQueue::new(&cfg);
        let t0 = Instant::now();
        push(&mut queue, sized(1, 2), t0);
        push(&mut queue, sized(2, 1), t0);
        assert_eq!(
            batcher.get_dynamic_batch(&queue, t0, false),
            BatchDecision::Cut { count: 1, batch_size: 2, reason: CutReason::Unbatched }
        );
    }

    #[test]
    fn wait_honours_earlier_queue_timeout() {
        let mut cfg = config();
        cfg.default_queue_policy.default_timeout = Duration::from_micros(300);
        let batcher = Batcher::new(&cfg);
        let mut queue = PriorityQueue::new(&cfg);
        let t0 = Instant::now();
        push(&mut queue, sized(1, 1), t0);
        assert_eq!(
            batcher.get_dynamic_batch(&queue, t0, false),
            BatchDecision::Wait { until: t0 + Duration::from_micros(300), pending_batch_size: 1 }
        );
    }

    #[test]
    fn delay_measured_from_oldest_member() {
        let mut cfg = config();
        cfg.priority_levels = 2;
        cfg.default_priority_level = 2;
        let batcher = Batcher::new(&cfg);
        let mut queue = PriorityQueue::new(&cfg);
        let t0 = Instant::now();
        push(&mut queue, sized(1, 1).with_priority(2), t0);
        let later = t0 + Duration::from_micros(600);
        push(&mut queue, sized(2, 1).with_priority(1), later);

        assert_eq!(
            batcher.get_dynamic_batch(&queue, later, false),
            BatchDecision::Wait { until: t0 + Duration::from_micros(1000), pending_batch_size: 2 }
        );
        assert_eq!(queue.peek().map(|e| e.request.id), Some(2));
    }
}
