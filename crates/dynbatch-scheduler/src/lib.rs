//! Dynamic request batching for model inference servers.
//!
//! Individual inference requests are queued per priority level, grouped into
//! payloads by size, shape compatibility, and a bounded queueing delay, and
//! handed to an execution backend behind an admission controller. Responses
//! can optionally be released to callers in dispatch order.
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use dynbatch_scheduler::{
//!     DynamicBatchScheduler, InferenceRequest, Scheduler, SchedulerComponents, SchedulerConfig,
//!     SyntheticBackend,
//! };
//!
//! # async fn run() -> anyhow::Result<()> {
//! let backend = Arc::new(SyntheticBackend::new(Duration::from_millis(2), Duration::ZERO));
//! let scheduler = DynamicBatchScheduler::new(SchedulerConfig::default(), SchedulerComponents::new(backend))?;
//!
//! let handle = scheduler.enqueue(InferenceRequest::new(1))?;
//! let response = handle.await?;
//! assert_eq!(response.request_id, 1);
//!
//! scheduler.shutdown(Duration::from_secs(1)).await;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod batcher;
pub mod caching;
pub mod concurrency;
pub mod config;
pub mod error;
pub mod monitoring;
pub mod ordering;
pub mod payload;
pub mod policy;
pub mod request;
pub mod request_queue;
pub mod scheduler;
pub mod shutdown;

pub use backend::{BackendResult, ExecutionBackend, SyntheticBackend};
pub use batcher::{BatchDecision, Batcher, CutReason};
pub use caching::{CacheStats, InMemoryResponseCache, ResponseCache};
pub use concurrency::{AdmissionController, SemaphoreAdmission, Ticket, UnboundedAdmission};
pub use config::{
    ConfigBuilder, OverflowAction, PreferredBatchPolicy, QueuePolicyConfig, SchedulerConfig, ServiceConfig,
    TimeoutAction, load_config,
};
pub use error::{AdmissionError, Result, SchedulerError};
pub use monitoring::{MetricsReporter, MetricsSink, MonitoringConfig};
pub use payload::{Batch, BatchId, Payload};
pub use policy::{AdmitDecision, QueuePolicy};
pub use request::{
    InferenceRequest, InferenceResponse, InputTensor, OutputTensor, RequestId, ResponseHandle, ResponseResult,
    ResponseSink,
};
pub use request_queue::{PriorityQueue, QueuedRequest};
pub use scheduler::{DynamicBatchScheduler, Scheduler, SchedulerComponents, SchedulerStats, build_scheduler};
