//! Metrics collection and reporting for the batching scheduler

use metrics::{Counter, Gauge, Histogram, counter, gauge, histogram};
use std::time::Duration;

/// Observer of scheduler events.
///
/// All methods default to no-ops so implementors only override what they
/// care about. Called from the enqueue path and the scheduler worker, so
/// implementations must not block.
pub trait MetricsSink: Send + Sync {
    fn request_enqueued(&self, _level: u32, _queued_requests: usize) {}

    /// A request failed before reaching a payload; `reason` is a static label.
    fn request_rejected(&self, _reason: &'static str) {}

    fn request_timed_out(&self, _level: u32) {}

    fn cache_hit(&self) {}

    /// A payload was cut and handed to admission.
    fn batch_dispatched(&self, _batch_size: usize, _requests: usize, _oldest_wait: Duration) {}

    /// A payload finished executing.
    fn batch_completed(&self, _batch_size: usize, _failed: usize, _elapsed: Duration) {}

    fn inflight_batches(&self, _count: usize) {}
}

/// Sink that forwards events to the `metrics` facade, labelled by model.
#[derive(Debug, Clone)]
pub struct MetricsReporter {
    model: String,
    requests_enqueued: Counter,
    requests_timed_out: Counter,
    cache_hits: Counter,
    batches_dispatched: Counter,
    requests_dispatched: Counter,
    batch_size: Histogram,
    queue_wait: Histogram,
    execution_duration: Histogram,
    execution_failures: Counter,
    queue_depth: Gauge,
    inflight: Gauge,
}

impl MetricsReporter {
    pub fn new(model: impl Into<String>) -> Self {
        let model = model.into();
        Self {
            requests_enqueued: counter!("dynbatch_requests_enqueued_total", "model" => model.clone()),
            requests_timed_out: counter!("dynbatch_requests_timed_out_total", "model" => model.clone()),
            cache_hits: counter!("dynbatch_cache_hits_total", "model" => model.clone()),
            batches_dispatched: counter!("dynbatch_batches_dispatched_total", "model" => model.clone()),
            requests_dispatched: counter!("dynbatch_requests_dispatched_total", "model" => model.clone()),
            batch_size: histogram!("dynbatch_batch_size", "model" => model.clone()),
            queue_wait: histogram!("dynbatch_queue_wait_seconds", "model" => model.clone()),
            execution_duration: histogram!("dynbatch_execution_duration_seconds", "model" => model.clone()),
            execution_failures: counter!("dynbatch_execution_failures_total", "model" => model.clone()),
            queue_depth: gauge!("dynbatch_queue_depth", "model" => model.clone()),
            inflight: gauge!("dynbatch_inflight_batches", "model" => model.clone()),
            model,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

impl MetricsSink for MetricsReporter {
    fn request_enqueued(&self, _level: u32, queued_requests: usize) {
        self.requests_enqueued.increment(1);
        self.queue_depth.set(queued_requests as f64);
    }

    fn request_rejected(&self, reason: &'static str) {
        counter!("dynbatch_requests_rejected_total", "model" => self.model.clone(), "reason" => reason)
            .increment(1);
    }

    fn request_timed_out(&self, _level: u32) {
        self.requests_timed_out.increment(1);
    }

    fn cache_hit(&self) {
        self.cache_hits.increment(1);
    }

    fn batch_dispatched(&self, batch_size: usize, requests: usize, oldest_wait: Duration) {
        self.batches_dispatched.increment(1);
        self.requests_dispatched.increment(requests as u64);
        self.batch_size.record(batch_size as f64);
        self.queue_wait.record(oldest_wait.as_secs_f64());
    }

    fn batch_completed(&self, _batch_size: usize, failed: usize, elapsed: Duration) {
        self.execution_duration.record(elapsed.as_secs_f64());
        if failed > 0 {
            self.execution_failures.increment(failed as u64);
        }
    }

    fn inflight_batches(&self, count: usize) {
        self.inflight.set(count as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reporter_without_recorder_is_noop() {
        let reporter = MetricsReporter::new("resnet");
        assert_eq!(reporter.model(), "resnet");

        reporter.request_enqueued(1, 3);
        reporter.request_rejected("queue_full");
        reporter.batch_dispatched(4, 2, Duration::from_micros(250));
        reporter.batch_completed(4, 1, Duration::from_millis(3));
        reporter.inflight_batches(0);
    }

    #[test]
    fn test_default_sink_methods() {
        struct Silent;
        impl MetricsSink for Silent {}

        let sink: &dyn MetricsSink = &Silent;
        sink.cache_hit();
        sink.request_timed_out(2);
    }
}
