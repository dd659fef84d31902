//! Processor traits for delivered payloads.

use crate::error::ProcessingError;
use crate::payload::Records;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

/// Payload processor.
///
/// Implement this trait to define what happens to delivered messages. The
/// processor is backend-agnostic: a per-message subscriber dispatches
/// [`Records::Single`], a batching subscriber dispatches [`Records::Batch`].
///
/// # Error Handling
///
/// Returning an error routes the message (or the whole batch) to the
/// dead-letter path via a negative acknowledgement without requeue. The
/// subscriber never retries a failed dispatch in place.
///
/// # Example
///
/// ```rust,ignore
/// use messaging::{Processor, ProcessingError, Records};
/// use async_trait::async_trait;
///
/// struct AuditProcessor {
///     store: Arc<AuditStore>,
/// }
///
/// #[async_trait]
/// impl Processor for AuditProcessor {
///     async fn process(&self, records: Records) -> Result<(), ProcessingError> {
///         match records {
///             Records::Single(event) => self.store.write_one(event).await,
///             Records::Batch(items) => self.store.write_many(items).await,
///         }
///         .map_err(|e| ProcessingError::failed_with_source("audit write failed", e))
///     }
///
///     fn name(&self) -> &'static str {
///         "audit_processor"
///     }
/// }
/// ```
#[async_trait]
pub trait Processor: Send + Sync {
    /// Process the dispatched payloads.
    ///
    /// # Returns
    ///
    /// * `Ok(())` - dispatch succeeded, the delivery (or batch) is acked
    /// * `Err(ProcessingError)` - dispatch failed, the delivery (or batch)
    ///   is nacked without requeue
    async fn process(&self, records: Records) -> Result<(), ProcessingError>;

    /// Get the processor name, used for logging.
    fn name(&self) -> &'static str;
}

/// Transforms one decoded payload before it is processed or buffered.
#[async_trait]
pub trait Preprocessor: Send + Sync {
    /// Transform the payload, returning the value to process in its place.
    async fn transform(&self, value: Value) -> Result<Value, ProcessingError>;
}

/// A no-op processor for testing.
#[derive(Debug, Clone, Default)]
pub struct NoOpProcessor;

#[async_trait]
impl Processor for NoOpProcessor {
    async fn process(&self, _records: Records) -> Result<(), ProcessingError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "noop_processor"
    }
}

/// A processor that always fails (for testing).
#[derive(Debug, Clone)]
pub struct FailingProcessor {
    error_message: String,
}

impl FailingProcessor {
    /// Create a processor that fails with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error_message: message.into(),
        }
    }
}

#[async_trait]
impl Processor for FailingProcessor {
    async fn process(&self, _records: Records) -> Result<(), ProcessingError> {
        Err(ProcessingError::failed(&self.error_message))
    }

    fn name(&self) -> &'static str {
        "failing_processor"
    }
}

/// A processor that records every dispatch, for assertions in tests.
#[derive(Debug, Default)]
pub struct RecordingProcessor {
    received: Mutex<Vec<Records>>,
}

impl RecordingProcessor {
    /// Create an empty recording processor.
    pub fn new() -> Self {
        Self::default()
    }

    /// All dispatches received so far, in order.
    pub async fn received(&self) -> Vec<Records> {
        self.received.lock().await.clone()
    }

    /// Number of dispatches received so far.
    pub async fn call_count(&self) -> usize {
        self.received.lock().await.len()
    }
}

#[async_trait]
impl Processor for RecordingProcessor {
    async fn process(&self, records: Records) -> Result<(), ProcessingError> {
        self.received.lock().await.push(records);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "recording_processor"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_noop_processor() {
        let processor = NoOpProcessor;
        let result = processor.process(Records::Single(json!({"id": 1}))).await;

        assert!(result.is_ok());
        assert_eq!(processor.name(), "noop_processor");
    }

    #[tokio::test]
    async fn test_failing_processor() {
        let processor = FailingProcessor::new("always fails");
        let result = processor.process(Records::Single(json!(null))).await;

        let error = result.unwrap_err();
        assert!(matches!(error, ProcessingError::Failed { .. }));
    }

    #[tokio::test]
    async fn test_recording_processor_captures_dispatches() {
        let processor = RecordingProcessor::new();

        processor
            .process(Records::Single(json!({"seq": 1})))
            .await
            .unwrap();
        processor
            .process(Records::Batch(vec![(7, json!({"seq": 2}))]))
            .await
            .unwrap();

        assert_eq!(processor.call_count().await, 2);

        let received = processor.received().await;
        assert_eq!(received[0], Records::Single(json!({"seq": 1})));
        assert!(received[1].is_batch());
    }
}
