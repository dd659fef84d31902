//! Per-message AMQP subscriber.
//!
//! Declares the durable queue (and, for topic exchanges, its dead-letter
//! topology), binds it to the configured keys, and runs a consume loop that
//! dispatches each delivery to the processor, acking successes and
//! dead-lettering failures.

use crate::config::{ExchangeKind, PubSubConfig};
use crate::connection::ChannelManager;
use crate::error::AmqpError;
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{Channel, Consumer};
use messaging::{Preprocessor, Processor, ProcessingError, Records};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Pause before reopening the queue after a transient consume failure.
pub(crate) const RECONNECT_PAUSE: Duration = Duration::from_secs(3);

/// What to do with a delivery once the processing path has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AckDecision {
    /// Acknowledge this delivery only.
    Ack,
    /// Reject this delivery without requeue (dead-letter path).
    Reject,
}

/// Submit a callback future to the runtime and await it, so a panicking
/// callback surfaces as an error instead of tearing down the consume loop.
pub(crate) async fn submit<T>(
    fut: impl Future<Output = Result<T, ProcessingError>> + Send + 'static,
) -> Result<T, ProcessingError>
where
    T: Send + 'static,
{
    match tokio::spawn(fut).await {
        Ok(result) => result,
        Err(e) => Err(ProcessingError::canceled(e.to_string())),
    }
}

/// Decode a message body and run the optional preprocessor over it.
pub(crate) async fn decode_and_preprocess(
    body: &[u8],
    preprocessor: Option<&Arc<dyn Preprocessor>>,
) -> Result<Value, ProcessingError> {
    let value: Value = serde_json::from_slice(body)?;

    match preprocessor {
        Some(preprocessor) => {
            let preprocessor = preprocessor.clone();
            submit(async move { preprocessor.transform(value).await }).await
        }
        None => Ok(value),
    }
}

/// Run the full per-message path over one body and report the ack decision.
/// Failures are logged here and never escape.
pub(crate) async fn dispatch_single<P: Processor + 'static>(
    body: &[u8],
    preprocessor: Option<&Arc<dyn Preprocessor>>,
    processor: &Arc<P>,
) -> AckDecision {
    let result = async {
        let value = decode_and_preprocess(body, preprocessor).await?;
        let processor = processor.clone();
        submit(async move { processor.process(Records::Single(value)).await }).await
    }
    .await;

    match result {
        Ok(()) => AckDecision::Ack,
        Err(e) => {
            error!(error = %e, "Failed to process message");
            AckDecision::Reject
        }
    }
}

/// Declare the dead-letter exchange/queue pair for topic exchanges and
/// return the live queue's dead-letter arguments.
///
/// Non-topic exchanges get no dead-letter topology: a nacked message there
/// is dropped by the broker.
pub(crate) async fn declare_dead_letter_topology(
    channel: &Channel,
    config: &PubSubConfig,
) -> Result<FieldTable, AmqpError> {
    if config.publisher().exchange_kind() != ExchangeKind::Topic {
        debug!(
            exchange = %config.publisher().exchange_name(),
            "No dead-letter topology for non-topic exchange"
        );
        return Ok(FieldTable::default());
    }

    let dlx_name = config.dlx_name();
    let dlq_name = config.dlq_name();
    let queue_name = config.queue_name();

    channel
        .exchange_declare(
            &dlx_name,
            lapin::ExchangeKind::Direct,
            ExchangeDeclareOptions {
                durable: false,
                auto_delete: false,
                internal: false,
                passive: false,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;

    // Messages rejected off the dead-letter queue hop back to the live
    // queue, giving poisoned messages a one-hop delayed retry path.
    let mut dlq_args = FieldTable::default();
    dlq_args.insert(
        "x-dead-letter-exchange".into(),
        AMQPValue::LongString("amq.direct".into()),
    );
    dlq_args.insert(
        "x-dead-letter-routing-key".into(),
        AMQPValue::LongString(queue_name.as_str().into()),
    );

    channel
        .queue_declare(
            &dlq_name,
            QueueDeclareOptions {
                durable: true,
                exclusive: false,
                auto_delete: false,
                ..Default::default()
            },
            dlq_args,
        )
        .await?;

    channel
        .queue_bind(
            &dlq_name,
            &dlx_name,
            &dlq_name,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await?;

    info!(dlx = %dlx_name, dlq = %dlq_name, "Declared dead-letter topology");

    let mut queue_args = FieldTable::default();
    queue_args.insert(
        "x-dead-letter-exchange".into(),
        AMQPValue::LongString(dlx_name.as_str().into()),
    );
    queue_args.insert(
        "x-dead-letter-routing-key".into(),
        AMQPValue::LongString(dlq_name.as_str().into()),
    );

    Ok(queue_args)
}

/// Consumes messages one at a time: ack on success, nack without requeue on
/// any decode/preprocess/process failure.
pub struct Subscriber<P: Processor + 'static> {
    pub(crate) config: PubSubConfig,
    pub(crate) manager: ChannelManager,
    pub(crate) processor: Arc<P>,
    pub(crate) preprocessor: Option<Arc<dyn Preprocessor>>,
    pub(crate) consumer_tag: String,
    pub(crate) queue_declared: bool,
    pub(crate) running: bool,
}

impl<P: Processor + 'static> Subscriber<P> {
    pub fn new(config: PubSubConfig, processor: P) -> Self {
        let consumer_tag = format!("{}-{}", config.publisher().service(), Uuid::new_v4());
        let manager = ChannelManager::new(config.publisher().clone());

        Self {
            config,
            manager,
            processor: Arc::new(processor),
            preprocessor: None,
            consumer_tag,
            queue_declared: false,
            running: false,
        }
    }

    /// Install a preprocessor that transforms each payload before it is
    /// processed.
    pub fn with_preprocessor(mut self, preprocessor: impl Preprocessor + 'static) -> Self {
        self.preprocessor = Some(Arc::new(preprocessor));
        self
    }

    pub fn config(&self) -> &PubSubConfig {
        &self.config
    }

    /// Refresh the connection and redeclare queue topology when a new
    /// connection epoch began.
    pub(crate) async fn refresh_topology(&mut self) -> Result<(), AmqpError> {
        let fresh = self.manager.refresh().await?;
        if !fresh && self.queue_declared {
            return Ok(());
        }

        let channel = self.manager.channel().ok_or(AmqpError::NotConnected)?;
        let queue_args = declare_dead_letter_topology(channel, &self.config).await?;

        let queue_name = self.config.queue_name();
        channel
            .queue_declare(
                &queue_name,
                QueueDeclareOptions {
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    ..Default::default()
                },
                queue_args,
            )
            .await?;

        for binding_key in self.config.binding_keys() {
            channel
                .queue_bind(
                    &queue_name,
                    self.config.publisher().exchange_name(),
                    binding_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
        }

        info!(
            queue = %queue_name,
            bindings = self.config.binding_keys().len(),
            "Queue declared and bound"
        );
        self.queue_declared = true;

        Ok(())
    }

    pub(crate) async fn open_consumer(&self) -> Result<Consumer, AmqpError> {
        let channel = self.manager.channel().ok_or(AmqpError::NotConnected)?;

        let consumer = channel
            .basic_consume(
                &self.config.queue_name(),
                &self.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        Ok(consumer)
    }

    pub(crate) async fn pause_and_reconnect(&mut self) {
        tokio::time::sleep(RECONNECT_PAUSE).await;

        if let Err(e) = self.refresh_topology().await {
            error!(error = %e, "Failed to refresh connection");
        }
    }

    /// Run the consume loop until the shutdown signal flips.
    ///
    /// Transient failures (channel closed, stream errors) are absorbed with
    /// a short pause and a reconnect; an initial connect failure propagates.
    /// Calling `consume` on an already-running subscriber is a warned no-op.
    pub async fn consume(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), AmqpError> {
        if self.running {
            warn!(
                service = %self.config.publisher().service(),
                "Subscriber is already running"
            );
            return Ok(());
        }

        self.refresh_topology().await?;
        self.running = true;

        info!(
            queue = %self.config.queue_name(),
            consumer_tag = %self.consumer_tag,
            "Starting subscriber"
        );

        while self.running {
            let mut consumer = match self.open_consumer().await {
                Ok(consumer) => consumer,
                Err(e) => {
                    error!(error = %e, "Failed to open consumer");
                    self.pause_and_reconnect().await;
                    continue;
                }
            };

            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("Shutdown signal received, stopping subscriber");
                            self.close(None).await;
                            return Ok(());
                        }
                    }
                    delivery = consumer.next() => match delivery {
                        Some(Ok(delivery)) => self.handle_delivery(delivery).await,
                        Some(Err(e)) => {
                            error!(error = %e, "Consumer stream failed");
                            break;
                        }
                        None => {
                            warn!("Consumer stream ended");
                            break;
                        }
                    }
                }
            }

            self.pause_and_reconnect().await;
        }

        Ok(())
    }

    async fn handle_delivery(&self, delivery: Delivery) {
        let delivery_tag = delivery.delivery_tag;
        let decision =
            dispatch_single(&delivery.data, self.preprocessor.as_ref(), &self.processor).await;

        match decision {
            AckDecision::Ack => {
                info!(delivery_tag, "Processed message");
                if let Err(e) = delivery.ack(BasicAckOptions { multiple: false }).await {
                    error!(delivery_tag, error = %e, "Failed to ack message");
                }
            }
            AckDecision::Reject => {
                if self.config.publisher().exchange_kind() != ExchangeKind::Topic {
                    debug!(
                        delivery_tag,
                        "No dead-letter queue for this exchange kind, message will be dropped"
                    );
                }
                if let Err(e) = delivery
                    .nack(BasicNackOptions {
                        multiple: false,
                        requeue: false,
                    })
                    .await
                {
                    error!(delivery_tag, error = %e, "Failed to nack message");
                }
            }
        }
    }

    /// Stop consuming and close the underlying channel and connection.
    pub async fn close(&mut self, reason: Option<&str>) {
        self.running = false;
        self.queue_declared = false;
        self.manager.close(reason).await;
    }
}
