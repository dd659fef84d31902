//! Backend-agnostic messaging abstractions for pub/sub workers.
//!
//! This library provides the shared contracts between message-queue backends
//! and the application code that consumes deliveries:
//! - **Payloads**: the [`Records`] sum type makes explicit whether a
//!   processor receives one decoded payload or a buffered batch
//! - **Processing**: the [`Processor`] and [`Preprocessor`] traits are the
//!   seam user callbacks plug into, independent of the broker behind them
//! - **Errors**: [`ProcessingError`] is the single failure channel for
//!   decode, preprocess, and process stages
//! - **Backoff**: [`BackoffStrategy`] computes reconnect/retry delays
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌──────────────────────────────────┐
//! │   Your Code     │     │            Backends              │
//! │                 │     │                                  │
//! │  ┌───────────┐  │     │  ┌─────────────┐                 │
//! │  │ Processor │──│─────│─▶│ amqp-worker │  (RabbitMQ)     │
//! │  └───────────┘  │     │  └─────────────┘                 │
//! │  ┌───────────┐  │     │        ▲                         │
//! │  │ Preproc.  │──│─────│────────┘                         │
//! │  └───────────┘  │     │   Same traits, any backend       │
//! └─────────────────┘     └──────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use messaging::{Processor, ProcessingError, Records};
//! use async_trait::async_trait;
//!
//! struct OrderProcessor;
//!
//! #[async_trait]
//! impl Processor for OrderProcessor {
//!     async fn process(&self, records: Records) -> Result<(), ProcessingError> {
//!         match records {
//!             Records::Single(value) => handle_order(value).await,
//!             Records::Batch(items) => handle_orders(items).await,
//!         }
//!     }
//!
//!     fn name(&self) -> &'static str {
//!         "order_processor"
//!     }
//! }
//! ```

mod backoff;
mod error;
mod payload;
mod processor;

pub use backoff::BackoffStrategy;
pub use error::ProcessingError;
pub use payload::{BatchItem, Records};
pub use processor::{
    FailingProcessor, NoOpProcessor, Preprocessor, Processor, RecordingProcessor,
};
