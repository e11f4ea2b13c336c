//! Response ordering across concurrently executing payloads.
//!
//! Every dispatched payload registers a completion slot in dispatch order.
//! When a payload finishes, its responses are parked in its slot and only
//! released once every earlier slot has released. Release happens under the
//! queue lock so callers observe responses in slot order.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use tracing::{trace, warn};

use crate::request::{ResponseResult, ResponseSink};

/// Identifier of a registered completion slot.
pub type SlotId = u64;

/// A response waiting to be delivered to its caller.
pub type Outcome = (ResponseSink, ResponseResult);

#[derive(Debug)]
struct Slot {
    id: SlotId,
    expected: usize,
    ready: Option<Vec<Outcome>>,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: SlotId,
    slots: VecDeque<Slot>,
}

/// FIFO of completion slots.
#[derive(Debug, Default)]
pub struct CompletionQueue {
    inner: Mutex<Inner>,
}

impl CompletionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the next slot for a payload owning `responses` responses.
    pub fn register(&self, responses: usize) -> SlotId {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let id = inner.next_id;
        inner.next_id += 1;
        inner.slots.push_back(Slot { id, expected: responses, ready: None });
        id
    }

    /// Park a payload's responses and release every slot that is now at the
    /// front of the queue. Returns the number of responses released.
    pub fn complete(&self, slot: SlotId, outcomes: Vec<Outcome>) -> usize {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        let Some(entry) = inner.slots.iter_mut().find(|s| s.id == slot) else {
            warn!(slot, "Completion for unknown slot, releasing unordered");
            return release(outcomes);
        };
        if entry.expected != outcomes.len() {
            warn!(slot, expected = entry.expected, actual = outcomes.len(), "Slot response count mismatch");
        }
        entry.ready = Some(outcomes);

        let mut released = 0;
        while inner.slots.front().is_some_and(|s| s.ready.is_some()) {
            if let Some(Slot { id, ready: Some(outcomes), .. }) = inner.slots.pop_front() {
                trace!(slot = id, responses = outcomes.len(), "Releasing completion slot");
                released += release(outcomes);
            }
        }
        released
    }

    /// Number of slots registered but not yet released.
    pub fn pending(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).slots.len()
    }
}

/// Deliver responses immediately, in the given order.
pub fn release(outcomes: Vec<Outcome>) -> usize {
    let count = outcomes.len();
    for (sink, result) in outcomes {
        sink.send(result);
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{InferenceResponse, ResponseHandle, response_channel};

    fn outcome(id: u64) -> (Outcome, ResponseHandle) {
        let (sink, handle) = response_channel(id);
        ((sink, Ok(InferenceResponse::new(id, Vec::new()))), handle)
    }

    #[test]
    fn in_order_completion_releases_immediately() {
        let queue = CompletionQueue::new();
        let a = queue.register(1);
        let (o, mut h) = outcome(1);
        assert_eq!(queue.complete(a, vec![o]), 1);
        assert!(h.try_take().is_some());
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn later_slot_waits_for_earlier() {
        let queue = CompletionQueue::new();
        let a = queue.register(2);
        let b = queue.register(1);

        let (ob, mut hb) = outcome(3);
        assert_eq!(queue.complete(b, vec![ob]), 0);
        assert!(hb.try_take().is_none());
        assert_eq!(queue.pending(), 2);

        let (o1, mut h1) = outcome(1);
        let (o2, mut h2) = outcome(2);
        assert_eq!(queue.complete(a, vec![o1, o2]), 3);
        assert!(h1.try_take().is_some());
        assert!(h2.try_take().is_some());
        assert!(hb.try_take().is_some());
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn middle_slot_does_not_unblock_tail() {
        let queue = CompletionQueue::new();
        let a = queue.register(1);
        let b = queue.register(1);
        let c = queue.register(1);

        let (oc, mut hc) = outcome(3);
        queue.complete(c, vec![oc]);
        let (ob, mut hb) = outcome(2);
        queue.complete(b, vec![ob]);
        assert!(hb.try_take().is_none());
        assert!(hc.try_take().is_none());

        let (oa, _ha) = outcome(1);
        assert_eq!(queue.complete(a, vec![oa]), 3);
        assert!(hb.try_take().is_some());
        assert!(hc.try_take().is_some());
    }
}
