//! Bounded in-memory buffer for batched deliveries.

use messaging::BatchItem;
use serde_json::Value;
use tracing::error;

/// Approximate the in-memory footprint of a decoded payload in bytes.
///
/// Counts scalar and container overhead plus string content, recursing
/// through arrays and objects.
pub(crate) fn estimated_size(value: &Value) -> usize {
    const SCALAR: usize = 16;
    const CONTAINER: usize = 32;

    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) => SCALAR,
        Value::String(s) => SCALAR + s.len(),
        Value::Array(items) => CONTAINER + items.iter().map(estimated_size).sum::<usize>(),
        Value::Object(map) => {
            CONTAINER
                + map
                    .iter()
                    .map(|(k, v)| SCALAR + k.len() + estimated_size(v))
                    .sum::<usize>()
        }
    }
}

/// Accumulates `(delivery tag, payload)` pairs up to an entry count and an
/// approximate byte budget.
///
/// Owned by exactly one batch subscriber and only mutated under its lock.
/// `append` is the sole growth path and refuses to grow past either limit,
/// so `count() <= max_entries` and `size() <= max_size` always hold.
#[derive(Debug)]
pub struct BatchBuffer {
    max_entries: usize,
    max_size: usize,
    entries: Vec<BatchItem>,
    last_tag: Option<u64>,
    size: usize,
}

impl BatchBuffer {
    pub fn new(max_entries: usize, max_size: usize) -> Self {
        Self {
            max_entries,
            max_size,
            entries: Vec::new(),
            last_tag: None,
            size: 0,
        }
    }

    /// Append one decoded payload, returning the bytes added, or `None`
    /// when either limit would be exceeded (the buffer is left untouched
    /// and the caller is expected to flush first).
    pub fn append(&mut self, payload: Value, delivery_tag: u64) -> Option<usize> {
        let payload_size = estimated_size(&payload);

        if self.entries.len() >= self.max_entries {
            error!(
                limit = self.max_entries,
                "Rejecting append, buffer is at its entry limit"
            );
            return None;
        }

        if self.size + payload_size > self.max_size {
            error!(
                limit = self.max_size,
                "Rejecting append, buffer is at its size limit"
            );
            return None;
        }

        self.entries.push((delivery_tag, payload));
        self.last_tag = Some(delivery_tag);
        self.size += payload_size;

        Some(payload_size)
    }

    /// Either limit reached; each is checked independently.
    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.max_entries || self.size >= self.max_size
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// Accumulated approximate payload bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Entries buffered so far plus the most recent delivery tag, for a
    /// cumulative acknowledgement.
    pub fn enqueued(&self) -> (&[BatchItem], Option<u64>) {
        (&self.entries, self.last_tag)
    }

    /// Drain the buffer, handing out the entries and the last delivery tag.
    pub fn take(&mut self) -> (Vec<BatchItem>, Option<u64>) {
        let entries = std::mem::take(&mut self.entries);
        let last_tag = self.last_tag.take();
        self.size = 0;
        (entries, last_tag)
    }

    /// Empty the buffer. Safe to call on an already-empty buffer.
    pub fn reset(&mut self) {
        self.entries.clear();
        self.last_tag = None;
        self.size = 0;
    }
}
