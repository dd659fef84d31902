//! Payload types handed to processors.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One buffered delivery: the broker's delivery tag and the decoded payload.
pub type BatchItem = (u64, Value);

/// Payloads dispatched to a [`Processor`](crate::Processor).
///
/// Per-message subscribers dispatch one decoded payload at a time; batching
/// subscribers dispatch the buffered `(delivery tag, payload)` pairs in
/// arrival order. The variant makes the contract explicit instead of leaving
/// the processor to inspect the shape of the data at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Records {
    /// A single decoded message payload.
    Single(Value),

    /// Buffered payloads with their delivery tags, in arrival order.
    Batch(Vec<BatchItem>),
}

impl Records {
    /// Number of payloads carried.
    pub fn len(&self) -> usize {
        match self {
            Records::Single(_) => 1,
            Records::Batch(items) => items.len(),
        }
    }

    /// Whether no payloads are carried (only possible for an empty batch).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether this is a batch dispatch.
    pub fn is_batch(&self) -> bool {
        matches!(self, Records::Batch(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_single_len() {
        let records = Records::Single(json!({"id": 1}));
        assert_eq!(records.len(), 1);
        assert!(!records.is_empty());
        assert!(!records.is_batch());
    }

    #[test]
    fn test_batch_len() {
        let records = Records::Batch(vec![(1, json!("a")), (2, json!("b"))]);
        assert_eq!(records.len(), 2);
        assert!(records.is_batch());

        let empty = Records::Batch(vec![]);
        assert!(empty.is_empty());
    }

    #[test]
    fn test_wire_codec_round_trip() {
        let values = [
            json!(null),
            json!(true),
            json!(42),
            json!("plain text"),
            json!([1, "two", {"three": 3.5}]),
            json!({"nested": {"list": [null, false], "name": "svc"}}),
        ];

        for value in values {
            let encoded = serde_json::to_vec(&value).unwrap();
            let decoded: Value = serde_json::from_slice(&encoded).unwrap();
            assert_eq!(decoded, value);
        }
    }
}
