//! Execution backend interface.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::payload::Batch;
use crate::request::{InferenceResponse, OutputTensor};

/// Per-request result reported by a backend.
pub type BackendResult = Result<InferenceResponse, String>;

/// Runs payloads on a model instance.
///
/// `execute` returns one result per request of the batch, in batch order.
/// Missing trailing results are reported to their callers as execution
/// failures; a failure for one request does not affect its siblings.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    async fn execute(&self, batch: Arc<Batch>) -> Vec<BackendResult>;
}

/// Backend that sleeps for a fixed latency and echoes each request id.
///
/// Latency is `base + per_slot * batch_size`, which models an accelerator
/// whose cost is dominated by a fixed launch overhead.
#[derive(Debug, Clone)]
pub struct SyntheticBackend {
    base: Duration,
    per_slot: Duration,
}

impl SyntheticBackend {
    pub fn new(base: Duration, per_slot: Duration) -> Self {
        Self { base, per_slot }
    }

    pub fn latency_for(&self, batch_size: usize) -> Duration {
        self.base + self.per_slot * u32::try_from(batch_size).unwrap_or(u32::MAX)
    }
}

#[async_trait]
impl ExecutionBackend for SyntheticBackend {
    async fn execute(&self, batch: Arc<Batch>) -> Vec<BackendResult> {
        tokio::time::sleep(self.latency_for(batch.batch_size)).await;
        batch
            .requests
            .iter()
            .map(|request| {
                let output = OutputTensor {
                    name: "output".to_string(),
                    shape: vec![request.batch_size as i64],
                    data: request.id.to_le_bytes().to_vec(),
                };
                Ok(InferenceResponse::new(request.id, vec![output]))
            })
            .collect()
    }
}
