//! Per-priority-level queue policy: overflow admission and timeout rules.
//!
//! A policy is consulted once per enqueue, before the request is linked into
//! its level, and once per scheduler wake to find requests that have
//! outlived their timeout. It never acts retroactively on queue contents
//! beyond those two points.

use std::time::Duration;

use crate::config::{OverflowAction, QueuePolicyConfig, TimeoutAction};

/// Outcome of applying a policy to an arriving request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitDecision {
    Accept,
    /// The level is full; the arriving request fails.
    RejectNew,
    /// The level is full; its oldest request fails and the arrival is accepted.
    EvictOldestThenAccept,
}

/// Queue policy bound to a priority level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuePolicy {
    level: u32,
    config: QueuePolicyConfig,
}

impl QueuePolicy {
    pub fn new(level: u32, config: QueuePolicyConfig) -> Self {
        Self { level, config }
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    /// Maximum pending requests at this level, or `None` if unbounded.
    pub fn max_queue_size(&self) -> Option<usize> {
        (self.config.max_queue_size > 0).then_some(self.config.max_queue_size)
    }

    pub fn timeout_action(&self) -> TimeoutAction {
        self.config.timeout_action
    }

    /// Decide whether a request may join a level currently holding `pending` requests.
    pub fn admit(&self, pending: usize) -> AdmitDecision {
        match self.max_queue_size() {
            Some(limit) if pending >= limit => match self.config.overflow_action {
                OverflowAction::RejectNew => AdmitDecision::RejectNew,
                OverflowAction::EvictOldest => AdmitDecision::EvictOldestThenAccept,
            },
            _ => AdmitDecision::Accept,
        }
    }

    /// Effective queue timeout for a request, or `None` if it never expires.
    pub fn timeout_for(&self, requested: Option<Duration>) -> Option<Duration> {
        let timeout = match requested {
            Some(t) if self.config.allow_timeout_override => t,
            _ => self.config.default_timeout,
        };
        (!timeout.is_zero()).then_some(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max: usize, overflow: OverflowAction) -> QueuePolicy {
        QueuePolicy::new(
            1,
            QueuePolicyConfig { max_queue_size: max, overflow_action: overflow, ..Default::default() },
        )
    }

    #[test]
    fn unbounded_always_accepts() {
        let p = policy(0, OverflowAction::RejectNew);
        assert_eq!(p.max_queue_size(), None);
        assert_eq!(p.admit(10_000), AdmitDecision::Accept);
    }

    #[test]
    fn full_level_rejects_new() {
        let p = policy(2, OverflowAction::RejectNew);
        assert_eq!(p.admit(1), AdmitDecision::Accept);
        assert_eq!(p.admit(2), AdmitDecision::RejectNew);
    }

    #[test]
    fn full_level_evicts_oldest() {
        let p = policy(2, OverflowAction::EvictOldest);
        assert_eq!(p.admit(2), AdmitDecision::EvictOldestThenAccept);
    }

    #[test]
    fn timeout_override_requires_permission() {
        let mut config = QueuePolicyConfig {
            default_timeout: Duration::from_millis(10),
            ..Default::default()
        };
        let strict = QueuePolicy::new(1, config.clone());
        assert_eq!(strict.timeout_for(Some(Duration::from_millis(50))), Some(Duration::from_millis(10)));

        config.allow_timeout_override = true;
        let lenient = QueuePolicy::new(1, config);
        assert_eq!(lenient.timeout_for(Some(Duration::from_millis(50))), Some(Duration::from_millis(50)));
        assert_eq!(lenient.timeout_for(None), Some(Duration::from_millis(10)));
    }

    #[test]
    fn zero_timeout_never_expires() {
        let p = policy(0, OverflowAction::RejectNew);
        assert_eq!(p.timeout_for(None), None);
        assert_eq!(p.timeout_for(Some(Duration::from_secs(1))), None);
    }
}
