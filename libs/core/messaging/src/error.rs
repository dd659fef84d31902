//! Error types for message processing.

use thiserror::Error;

/// Error that can occur while handling a delivered message.
///
/// Backends contain these errors at the delivery boundary: a failed message
/// (or batch) is negatively acknowledged without requeue and routed to the
/// dead-letter path, never retried in place.
#[derive(Debug, Error)]
pub enum ProcessingError {
    /// The message body was not valid JSON
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// The processor or preprocessor rejected the payload
    #[error("processing failed: {message}")]
    Failed {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The submitted callback task was cancelled or panicked
    #[error("processing task canceled: {0}")]
    Canceled(String),
}

impl ProcessingError {
    /// Create a processing failure.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            source: None,
        }
    }

    /// Create a processing failure with an underlying cause.
    pub fn failed_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Failed {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a cancellation error for a callback task that never completed.
    pub fn canceled(message: impl Into<String>) -> Self {
        Self::Canceled(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_error_from_serde() {
        let err = serde_json::from_slice::<serde_json::Value>(b"not json").unwrap_err();
        let processing: ProcessingError = err.into();
        assert!(matches!(processing, ProcessingError::Decode(_)));
    }

    #[test]
    fn test_failed_display() {
        let err = ProcessingError::failed("downstream unavailable");
        assert_eq!(err.to_string(), "processing failed: downstream unavailable");
    }

    #[test]
    fn test_failed_with_source_keeps_cause() {
        let cause = std::io::Error::other("boom");
        let err = ProcessingError::failed_with_source("write failed", cause);

        let source = std::error::Error::source(&err);
        assert!(source.is_some());
    }
}
