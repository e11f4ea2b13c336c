//! Dynamic batch scheduler.
//!
//! [`DynamicBatchScheduler`] owns a [`PriorityQueue`] guarded by one mutex
//! and a single worker task that forms and dispatches payloads. Producers
//! call [`Scheduler::enqueue`] from any thread; it never waits on batch
//! formation. The worker sleeps on a [`Notify`] until new work arrives, the
//! batching delay expires, or a queue timeout fires.
//!
//! Dispatch waits for an admission ticket (the backpressure point), then
//! spawns the payload's execution so the next payload can start forming
//! immediately. Responses are released directly or through the
//! [`CompletionQueue`] when ordering must be preserved.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Context;
use futures::FutureExt;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::backend::{BackendResult, ExecutionBackend};
use crate::batcher::{BatchDecision, Batcher};
use crate::caching::ResponseCache;
use crate::concurrency::{AdmissionController, UnboundedAdmission};
use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::monitoring::MetricsSink;
use crate::ordering::{self, CompletionQueue, Outcome, SlotId};
use crate::payload::{Batch, BatchId, Payload};
use crate::request::{InferenceRequest, ResponseHandle, ResponseSink, response_channel};
use crate::request_queue::{LevelDepth, PriorityQueue, QueuedRequest, waited};
use crate::shutdown::ShutdownCoordinator;

// ---------------------------------------------------------------------------
// Capability interface
// ---------------------------------------------------------------------------

/// Scheduling strategy for one model instance.
pub trait Scheduler: Send + Sync {
    /// Submit a request. Capacity and shutdown failures are returned
    /// immediately; everything else arrives through the handle.
    fn enqueue(&self, request: InferenceRequest) -> Result<ResponseHandle>;

    /// Requests accepted but not yet completed: queued plus dispatched.
    fn inflight_count(&self) -> usize;

    /// Stop accepting requests and drain what is queued.
    fn stop(&self);
}

/// Build the scheduler for a model instance.
pub fn build_scheduler(
    config: SchedulerConfig,
    components: SchedulerComponents,
) -> anyhow::Result<Arc<dyn Scheduler>> {
    Ok(Arc::new(DynamicBatchScheduler::new(config, components)?))
}

/// External collaborators of a scheduler.
#[derive(Clone)]
pub struct SchedulerComponents {
    pub backend: Arc<dyn ExecutionBackend>,
    pub admission: Arc<dyn AdmissionController>,
    pub cache: Option<Arc<dyn ResponseCache>>,
    pub metrics: Option<Arc<dyn MetricsSink>>,
}

impl SchedulerComponents {
    /// Components with unbounded admission and no cache or metrics.
    pub fn new(backend: Arc<dyn ExecutionBackend>) -> Self {
        Self { backend, admission: Arc::new(UnboundedAdmission), cache: None, metrics: None }
    }

    pub fn with_admission(mut self, admission: Arc<dyn AdmissionController>) -> Self {
        self.admission = admission;
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Point-in-time scheduler statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulerStats {
    pub queued_requests: usize,
    pub queued_batch_size: usize,
    /// Batch size of the forming payload at the last formation pass.
    pub pending_batch_size: usize,
    pub batches_dispatched: u64,
    pub requests_dispatched: u64,
    pub rejected: u64,
    pub timed_out: u64,
    pub cache_hits: u64,
    pub admission_failures: u64,
    pub execution_failures: u64,
    /// Payloads between cut and release, admitted or not.
    pub inflight_batches: usize,
    pub inflight_requests: usize,
    pub levels: Vec<LevelDepth>,
}

#[derive(Debug, Default)]
struct Counters {
    batches_dispatched: AtomicU64,
    requests_dispatched: AtomicU64,
    rejected: AtomicU64,
    timed_out: AtomicU64,
    cache_hits: AtomicU64,
    admission_failures: AtomicU64,
    execution_failures: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct SchedulerState {
    queue: PriorityQueue,
    next_batch_id: BatchId,
    pending_batch_size: usize,
}

struct Shared {
    config: SchedulerConfig,
    batcher: Batcher,
    state: Mutex<SchedulerState>,
    wake: Notify,
    shutdown: ShutdownCoordinator,
    ordering: CompletionQueue,
    components: SchedulerComponents,
    counters: Counters,
}

enum Step {
    Dispatch(Payload),
    Sleep(Option<Instant>),
    Exit,
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn metrics(&self) -> Option<&dyn MetricsSink> {
        self.components.metrics.as_deref()
    }

    fn reject(&self, reason: &'static str) {
        Counters::bump(&self.counters.rejected, 1);
        if let Some(m) = self.metrics() {
            m.request_rejected(reason);
        }
    }

    fn cache(&self) -> Option<&dyn ResponseCache> {
        if self.config.response_cache { self.components.cache.as_deref() } else { None }
    }

    /// Apply timeouts and run one formation pass under the lock.
    fn form_next(&self) -> (Vec<QueuedRequest>, Step) {
        let mut state = self.lock_state();
        let now = Instant::now();
        let expired = state.queue.expire(now);
        let stopping = self.shutdown.is_stopping();

        if stopping && state.queue.is_empty() {
            return (expired, Step::Exit);
        }

        let step = match self.batcher.get_dynamic_batch(&state.queue, now, stopping) {
            BatchDecision::Idle => {
                state.pending_batch_size = 0;
                Step::Sleep(None)
            }
            BatchDecision::Wait { until, pending_batch_size } => {
                state.pending_batch_size = pending_batch_size;
                Step::Sleep(Some(until))
            }
            BatchDecision::Cut { count, batch_size, reason } => {
                let Some(anchor) = state.queue.peek().map(|entry| entry.request.clone()) else {
                    return (expired, Step::Sleep(None));
                };
                let id = state.next_batch_id;
                state.next_batch_id += 1;
                state.pending_batch_size = 0;

                let mut payload = Payload::new(id, self.batcher.max_batch_size());
                let mut remaining = count;
                let members = state.queue.pop_ready_batch(batch_size, |entry| {
                    let joins = remaining > 0 && self.batcher.compatible(&anchor, &entry.request);
                    remaining = remaining.saturating_sub(1);
                    joins
                });
                debug_assert_eq!(members.len(), count);
                for entry in members {
                    let added = payload.add(entry);
                    debug_assert!(added.is_ok(), "cut member exceeds max batch size");
                }
                payload.saturate();

                debug!(
                    batch_id = id,
                    batch_size,
                    requests = payload.len(),
                    reason = reason.as_str(),
                    queue_depth = state.queue.size(),
                    "Payload cut"
                );
                Step::Dispatch(payload)
            }
        };
        (expired, step)
    }

    fn fail_expired(&self, expired: Vec<QueuedRequest>) {
        if expired.is_empty() {
            return;
        }
        let now = Instant::now();
        Counters::bump(&self.counters.timed_out, expired.len() as u64);
        for entry in expired {
            let wait = waited(&entry, now);
            if let Some(m) = self.metrics() {
                m.request_timed_out(entry.level);
            }
            warn!(request_id = entry.request.id, priority = entry.level, waited = ?wait, "Request timed out in queue");
            entry.fail(SchedulerError::Timeout { waited: wait });
        }
    }

    async fn dispatch(self: &Arc<Self>, payload: Payload) {
        let cut_at = Instant::now();
        let (batch, sinks) = payload.seal(cut_at);
        let slot = self.config.preserve_ordering.then(|| self.ordering.register(sinks.len()));

        Counters::bump(&self.counters.batches_dispatched, 1);
        Counters::bump(&self.counters.requests_dispatched, batch.len() as u64);
        if let Some(m) = self.metrics() {
            m.batch_dispatched(batch.batch_size, batch.len(), cut_at - batch.oldest_enqueued_at);
        }

        // Counted from cut to release, including the wait for a ticket.
        let guard = self.shutdown.track(batch.len());
        if let Some(m) = self.metrics() {
            m.inflight_batches(self.shutdown.inflight());
        }

        debug!(batch_id = batch.id, batch_size = batch.batch_size, "Waiting for execution ticket");
        let ticket = match self.components.admission.acquire(batch.batch_size, self.config.admission_timeout).await {
            Ok(ticket) => ticket,
            Err(err) => {
                let err = SchedulerError::from(err);
                warn!(batch_id = batch.id, requests = batch.len(), error = %err, "Admission failed, failing payload");
                Counters::bump(&self.counters.admission_failures, 1);
                let outcomes = sinks.into_iter().map(|sink| (sink, Err(err.clone()))).collect();
                self.release(slot, outcomes);
                drop(guard);
                return;
            }
        };

        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let started = Instant::now();
            let execution = AssertUnwindSafe(shared.components.backend.execute(Arc::clone(&batch)));
            let results = match execution.catch_unwind().await {
                Ok(results) => results,
                Err(_) => {
                    error!(batch_id = batch.id, requests = batch.len(), "Backend panicked while executing payload");
                    vec![Err("backend panicked during execution".to_string()); batch.len()]
                }
            };
            drop(ticket);

            let outcomes = shared.collect_outcomes(&batch, sinks, results);
            let failed = outcomes.iter().filter(|(_, result)| result.is_err()).count();
            if failed > 0 {
                Counters::bump(&shared.counters.execution_failures, failed as u64);
                warn!(batch_id = batch.id, failed, requests = batch.len(), "Payload completed with failures");
            } else {
                trace!(batch_id = batch.id, elapsed = ?started.elapsed(), "Payload completed");
            }
            if let Some(m) = shared.metrics() {
                m.batch_completed(batch.batch_size, failed, started.elapsed());
            }

            shared.release(slot, outcomes);
            drop(guard);
            if let Some(m) = shared.metrics() {
                m.inflight_batches(shared.shutdown.inflight());
            }
        });
    }

    /// Pair each sink with its backend result, caching successes.
    fn collect_outcomes(&self, batch: &Batch, sinks: Vec<ResponseSink>, results: Vec<BackendResult>) -> Vec<Outcome> {
        if results.len() != sinks.len() {
            warn!(batch_id = batch.id, expected = sinks.len(), actual = results.len(), "Backend result count mismatch");
        }
        let cache = self.cache();
        let mut results = results.into_iter();
        sinks
            .into_iter()
            .zip(&batch.requests)
            .map(|(sink, request)| {
                let result = match results.next() {
                    Some(Ok(response)) => {
                        if let (Some(cache), Some(fingerprint)) = (cache, request.fingerprint) {
                            cache.insert(fingerprint, response.clone());
                        }
                        Ok(response)
                    }
                    Some(Err(msg)) => Err(SchedulerError::Execution(msg)),
                    None => Err(SchedulerError::Execution("backend returned no result".to_string())),
                };
                (sink, result)
            })
            .collect()
    }

    fn release(&self, slot: Option<SlotId>, outcomes: Vec<Outcome>) {
        match slot {
            Some(slot) => self.ordering.complete(slot, outcomes),
            None => ordering::release(outcomes),
        };
    }
}

async fn run_worker(shared: Arc<Shared>) {
    info!(model = %shared.config.model_name, "Scheduler worker started");

    loop {
        let (expired, step) = shared.form_next();
        shared.fail_expired(expired);

        match step {
            Step::Dispatch(payload) => shared.dispatch(payload).await,
            Step::Sleep(Some(deadline)) => {
                tokio::select! {
                    _ = shared.wake.notified() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            Step::Sleep(None) => shared.wake.notified().await,
            Step::Exit => break,
        }
    }

    info!(model = %shared.config.model_name, "Scheduler worker stopped");
}

// ---------------------------------------------------------------------------
// DynamicBatchScheduler
// ---------------------------------------------------------------------------

/// Batching scheduler for one model instance.
pub struct DynamicBatchScheduler {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DynamicBatchScheduler {
    /// Validate `config` and start the worker on the current tokio runtime.
    pub fn new(config: SchedulerConfig, components: SchedulerComponents) -> anyhow::Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current().context("DynamicBatchScheduler must be created inside a tokio runtime")?;

        if config.response_cache && components.cache.is_none() {
            warn!(model = %config.model_name, "Response cache enabled without a cache; lookups disabled");
        }

        info!(
            model = %config.model_name,
            dynamic_batching = config.dynamic_batching,
            max_batch_size = config.max_batch_size,
            preferred_batch_sizes = ?config.preferred_batch_sizes,
            max_queue_delay = ?config.max_queue_delay,
            priority_levels = config.priority_levels,
            preserve_ordering = config.preserve_ordering,
            "Creating dynamic batch scheduler"
        );

        let shared = Arc::new(Shared {
            batcher: Batcher::new(&config),
            state: Mutex::new(SchedulerState {
                queue: PriorityQueue::new(&config),
                next_batch_id: 0,
                pending_batch_size: 0,
            }),
            wake: Notify::new(),
            shutdown: ShutdownCoordinator::new(),
            ordering: CompletionQueue::new(),
            components,
            counters: Counters::default(),
            config,
        });

        let worker = runtime.spawn(run_worker(Arc::clone(&shared)));
        Ok(Self { shared, worker: Mutex::new(Some(worker)) })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    pub fn is_stopping(&self) -> bool {
        self.shared.shutdown.is_stopping()
    }

    /// Stop, wait for the worker to drain the queue, then wait for executing
    /// payloads, all bounded by `timeout`. Returns the time spent.
    pub async fn shutdown(&self, timeout: Duration) -> Duration {
        let start = Instant::now();
        self.stop();

        let worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(worker) = worker {
            match tokio::time::timeout(timeout, worker).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!(error = %err, "Scheduler worker failed"),
                Err(_) => warn!(timeout = ?timeout, "Scheduler worker still draining at shutdown timeout"),
            }
        }

        let remaining = timeout.saturating_sub(start.elapsed());
        self.shared.shutdown.drain(remaining).await;
        start.elapsed()
    }

    pub fn stats(&self) -> SchedulerStats {
        let (queued_requests, queued_batch_size, pending_batch_size, levels) = {
            let state = self.shared.lock_state();
            (state.queue.size(), state.queue.queued_batch_size(), state.pending_batch_size, state.queue.depths())
        };
        let counters = &self.shared.counters;
        SchedulerStats {
            queued_requests,
            queued_batch_size,
            pending_batch_size,
            batches_dispatched: counters.batches_dispatched.load(Ordering::Relaxed),
            requests_dispatched: counters.requests_dispatched.load(Ordering::Relaxed),
            rejected: counters.rejected.load(Ordering::Relaxed),
            timed_out: counters.timed_out.load(Ordering::Relaxed),
            cache_hits: counters.cache_hits.load(Ordering::Relaxed),
            admission_failures: counters.admission_failures.load(Ordering::Relaxed),
            execution_failures: counters.execution_failures.load(Ordering::Relaxed),
            inflight_batches: self.shared.shutdown.inflight(),
            inflight_requests: self.shared.shutdown.inflight_requests(),
            levels,
        }
    }
}

impl Scheduler for DynamicBatchScheduler {
    fn enqueue(&self, request: InferenceRequest) -> Result<ResponseHandle> {
        let shared = &self.shared;

        if shared.shutdown.is_stopping() {
            shared.reject("shutdown");
            return Err(SchedulerError::Shutdown);
        }

        let max = shared.config.max_batch_size;
        if request.batch_size > max {
            shared.reject("oversize");
            warn!(request_id = request.id, size = request.batch_size, max, "Request exceeds max batch size");
            return Err(SchedulerError::Oversize { size: request.batch_size, max });
        }

        let (sink, handle) = response_channel(request.id);

        if let (Some(cache), Some(fingerprint)) = (shared.cache(), request.fingerprint)
            && let Some(mut response) = cache.lookup(fingerprint)
        {
            response.request_id = request.id;
            response.cached = true;
            Counters::bump(&shared.counters.cache_hits, 1);
            if let Some(m) = shared.metrics() {
                m.cache_hit();
            }
            trace!(request_id = request.id, fingerprint, "Served from response cache");
            sink.send(Ok(response));
            return Ok(handle);
        }

        let request_id = request.id;
        let level = shared.config.effective_level(request.priority);
        let entry = QueuedRequest::new(request, sink, level, Instant::now());

        let (evicted, depth) = {
            let mut state = shared.lock_state();
            if shared.shutdown.is_stopping() {
                drop(state);
                shared.reject("shutdown");
                return Err(SchedulerError::Shutdown);
            }
            match state.queue.push(entry) {
                Ok(evicted) => (evicted, state.queue.size()),
                Err(err) => {
                    drop(state);
                    shared.reject("queue_full");
                    warn!(request_id, priority = level, error = %err, "Request rejected by queue policy");
                    return Err(err);
                }
            }
        };

        if let Some(old) = evicted {
            shared.reject("evicted");
            warn!(request_id = old.request.id, priority = level, "Evicting oldest request for newer arrival");
            old.fail(SchedulerError::Evicted { level });
        }

        if let Some(m) = shared.metrics() {
            m.request_enqueued(level, depth);
        }
        trace!(request_id, priority = level, queue_depth = depth, "Request enqueued");

        shared.wake.notify_one();
        Ok(handle)
    }

    fn inflight_count(&self) -> usize {
        let queued = self.shared.lock_state().queue.size();
        queued + self.shared.shutdown.inflight_requests()
    }

    fn stop(&self) {
        if self.shared.shutdown.initiate() {
            info!(model = %self.shared.config.model_name, "Stopping scheduler");
        }
        self.shared.wake.notify_one();
    }
}

impl Drop for DynamicBatchScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
