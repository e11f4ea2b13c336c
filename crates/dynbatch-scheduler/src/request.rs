//! Request and response types exchanged with the scheduler.
//!
//! An [`InferenceRequest`] is immutable once enqueued. Each request is paired
//! with a [`ResponseSink`] (held by the scheduler) and a [`ResponseHandle`]
//! (held by the caller) that together form a oneshot channel carrying exactly
//! one terminal result.

use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::SchedulerError;

/// Caller-assigned request identifier.
pub type RequestId = u64;

/// Result delivered to a caller.
pub type ResponseResult = Result<InferenceResponse, SchedulerError>;

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// Shape description of one input tensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputTensor {
    pub name: String,
    /// Shape excluding the batch dimension.
    pub shape: Vec<i64>,
    /// Contents of a shape tensor, compared when the tensor is marked as one.
    pub shape_values: Option<Vec<i64>>,
}

impl InputTensor {
    pub fn new(name: impl Into<String>, shape: Vec<i64>) -> Self {
        Self { name: name.into(), shape, shape_values: None }
    }

    pub fn with_shape_values(mut self, values: Vec<i64>) -> Self {
        self.shape_values = Some(values);
        self
    }
}

/// A single inference request destined for one model instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub id: RequestId,
    /// Requested priority; 0 selects the default level.
    pub priority: u32,
    /// Number of batch slots this request occupies.
    pub batch_size: usize,
    pub inputs: Vec<InputTensor>,
    /// Fingerprint of the request contents, used as the response cache key.
    pub fingerprint: Option<u64>,
    /// Request-specified queue timeout, honoured only if the level's policy allows it.
    pub timeout: Option<Duration>,
}

impl InferenceRequest {
    /// Create a request of batch size 1 with no inputs at the default priority.
    pub fn new(id: RequestId) -> Self {
        Self { id, priority: 0, batch_size: 1, inputs: Vec::new(), fingerprint: None, timeout: None }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_input(mut self, input: InputTensor) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn with_fingerprint(mut self, fingerprint: u64) -> Self {
        self.fingerprint = Some(fingerprint);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Look up an input by name.
    pub fn input(&self, name: &str) -> Option<&InputTensor> {
        self.inputs.iter().find(|t| t.name == name)
    }

    /// Names of the inputs present on this request.
    pub fn input_names(&self) -> BTreeSet<&str> {
        self.inputs.iter().map(|t| t.name.as_str()).collect()
    }
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// One output tensor; contents are opaque to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputTensor {
    pub name: String,
    pub shape: Vec<i64>,
    pub data: Vec<u8>,
}

/// Response for a single request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub request_id: RequestId,
    pub outputs: Vec<OutputTensor>,
    /// Whether the response was served from the response cache.
    pub cached: bool,
}

impl InferenceResponse {
    pub fn new(request_id: RequestId, outputs: Vec<OutputTensor>) -> Self {
        Self { request_id, outputs, cached: false }
    }
}

// ---------------------------------------------------------------------------
// Response channel
// ---------------------------------------------------------------------------

/// Create the sink/handle pair for a request.
pub fn response_channel(request_id: RequestId) -> (ResponseSink, ResponseHandle) {
    let (tx, rx) = oneshot::channel();
    (ResponseSink { request_id, tx }, ResponseHandle { request_id, rx })
}

/// Scheduler-side end of a request's response channel.
#[derive(Debug)]
pub struct ResponseSink {
    request_id: RequestId,
    tx: oneshot::Sender<ResponseResult>,
}

impl ResponseSink {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Deliver the terminal result. Returns `false` if the caller has gone away.
    pub fn send(self, result: ResponseResult) -> bool {
        self.tx.send(result).is_ok()
    }
}

/// Caller-side end of a request's response channel.
///
/// Awaiting the handle yields the request's terminal result.
#[derive(Debug)]
pub struct ResponseHandle {
    request_id: RequestId,
    rx: oneshot::Receiver<ResponseResult>,
}

impl ResponseHandle {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Take the result if it has already been released.
    pub fn try_take(&mut self) -> Option<ResponseResult> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(SchedulerError::ResponseDropped)),
        }
    }
}

impl Future for ResponseHandle {
    type Output = ResponseResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(SchedulerError::ResponseDropped)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let req = InferenceRequest::new(7)
            .with_priority(2)
            .with_batch_size(3)
            .with_input(InputTensor::new("input_ids", vec![16]))
            .with_input(InputTensor::new("mask", vec![16]))
            .with_fingerprint(0xfeed);

        assert_eq!(req.id, 7);
        assert_eq!(req.priority, 2);
        assert_eq!(req.batch_size, 3);
        assert_eq!(req.input("mask").map(|t| t.shape.clone()), Some(vec![16]));
        assert!(req.input("missing").is_none());
        assert_eq!(req.input_names().into_iter().collect::<Vec<_>>(), vec!["input_ids", "mask"]);
        assert_eq!(req.fingerprint, Some(0xfeed));
    }

    #[tokio::test]
    async fn test_response_channel_delivers_once() {
        let (sink, mut handle) = response_channel(3);
        assert_eq!(sink.request_id(), 3);
        assert!(handle.try_take().is_none());

        assert!(sink.send(Ok(InferenceResponse::new(3, Vec::new()))));
        let response = handle.await.unwrap();
        assert_eq!(response.request_id, 3);
        assert!(!response.cached);
    }

    #[tokio::test]
    async fn test_dropped_sink_reports_error() {
        let (sink, handle) = response_channel(1);
        drop(sink);
        assert_eq!(handle.await, Err(SchedulerError::ResponseDropped));
    }

    #[test]
    fn test_send_to_dropped_handle() {
        let (sink, handle) = response_channel(1);
        drop(handle);
        assert!(!sink.send(Err(SchedulerError::Shutdown)));
    }
}
