//! Shared fixtures for scheduler integration tests
//!
//! Tests run on a paused tokio clock, so backend latencies and batching
//! delays resolve deterministically.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use dynbatch_scheduler::{
    BackendResult, Batch, ExecutionBackend, InferenceResponse, MetricsSink, OutputTensor, SchedulerConfig,
};

/// What the backend saw for one payload.
#[derive(Debug, Clone)]
pub struct RecordedBatch {
    pub batch_id: u64,
    pub request_ids: Vec<u64>,
    pub batch_size: usize,
    pub cut_at: Instant,
    pub started_at: Instant,
}

type LatencyFn = dyn Fn(&Batch) -> Duration + Send + Sync;

/// Backend that records every payload, sleeps a configurable latency, and
/// echoes one response per request.
pub struct RecordingBackend {
    batches: Mutex<Vec<RecordedBatch>>,
    latency: Box<LatencyFn>,
    failing: HashSet<u64>,
    truncate_to: Option<usize>,
}

impl Default for RecordingBackend {
    fn default() -> Self {
        Self { batches: Mutex::new(Vec::new()), latency: Box::new(|_| Duration::ZERO), failing: HashSet::new(), truncate_to: None }
    }
}

impl RecordingBackend {
    pub fn with_latency(mut self, latency: impl Fn(&Batch) -> Duration + Send + Sync + 'static) -> Self {
        self.latency = Box::new(latency);
        self
    }

    /// Fail these request ids with an execution error.
    pub fn with_failures(mut self, ids: impl IntoIterator<Item = u64>) -> Self {
        self.failing = ids.into_iter().collect();
        self
    }

    /// Return at most `n` results per payload.
    pub fn truncating_to(mut self, n: usize) -> Self {
        self.truncate_to = Some(n);
        self
    }

    pub fn batches(&self) -> Vec<RecordedBatch> {
        self.batches.lock().unwrap().clone()
    }

    pub fn batch_ids(&self) -> Vec<Vec<u64>> {
        self.batches().into_iter().map(|b| b.request_ids).collect()
    }
}

#[async_trait]
impl ExecutionBackend for RecordingBackend {
    async fn execute(&self, batch: Arc<Batch>) -> Vec<BackendResult> {
        self.batches.lock().unwrap().push(RecordedBatch {
            batch_id: batch.id,
            request_ids: batch.requests.iter().map(|r| r.id).collect(),
            batch_size: batch.batch_size,
            cut_at: batch.cut_at,
            started_at: Instant::now(),
        });

        let latency = (self.latency)(&batch);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut results: Vec<BackendResult> = batch
            .requests
            .iter()
            .map(|r| {
                if self.failing.contains(&r.id) {
                    Err(format!("injected failure for request {}", r.id))
                } else {
                    let output = OutputTensor { name: "echo".to_string(), shape: vec![1], data: r.id.to_le_bytes().to_vec() };
                    Ok(InferenceResponse::new(r.id, vec![output]))
                }
            })
            .collect();
        if let Some(n) = self.truncate_to {
            results.truncate(n);
        }
        results
    }
}

/// Metrics sink that only counts calls.
#[derive(Debug, Default)]
pub struct CountingSink {
    pub enqueued: AtomicUsize,
    pub rejected: AtomicUsize,
    pub timed_out: AtomicUsize,
    pub cache_hits: AtomicUsize,
    pub dispatched: AtomicUsize,
    pub completed: AtomicUsize,
}

impl MetricsSink for CountingSink {
    fn request_enqueued(&self, _level: u32, _queued: usize) {
        self.enqueued.fetch_add(1, Ordering::SeqCst);
    }

    fn request_rejected(&self, _reason: &'static str) {
        self.rejected.fetch_add(1, Ordering::SeqCst);
    }

    fn request_timed_out(&self, _level: u32) {
        self.timed_out.fetch_add(1, Ordering::SeqCst);
    }

    fn cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::SeqCst);
    }

    fn batch_dispatched(&self, _batch_size: usize, _requests: usize, _oldest_wait: Duration) {
        self.dispatched.fetch_add(1, Ordering::SeqCst);
    }

    fn batch_completed(&self, _batch_size: usize, _failed: usize, _elapsed: Duration) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Dynamic batching config with the given size limit and delay.
pub fn batching_config(max_batch_size: usize, max_queue_delay: Duration) -> SchedulerConfig {
    SchedulerConfig { model_name: "test-model".to_string(), max_batch_size, max_queue_delay, ..Default::default() }
}
