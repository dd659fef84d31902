//! Batching AMQP subscriber.
//!
//! Amortizes processing cost by accumulating deliveries in a
//! [`BatchBuffer`] and handing the whole batch to the processor when either
//! capacity limit is reached or the batch interval has elapsed. A batch is
//! settled with a single cumulative ack (or nack) on the last delivery tag.

use crate::batch::BatchBuffer;
use crate::config::PubSubConfig;
use crate::error::AmqpError;
use crate::subscriber::{decode_and_preprocess, submit, Subscriber};
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicNackOptions};
use lapin::Channel;
use messaging::{Preprocessor, Processor, Records};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// State shared between the consume loop and the periodic flush task,
/// guarded by one exclusive lock. All acking for the channel happens under
/// this lock, which keeps cumulative acknowledgements ordered.
pub(crate) struct FlushState {
    pub(crate) buffer: BatchBuffer,
    pub(crate) channel: Option<Channel>,
    pub(crate) last_flush: Instant,
    pub(crate) wait: Duration,
    pub(crate) interval: Duration,
}

impl FlushState {
    pub(crate) fn new(buffer: BatchBuffer, interval: Duration) -> Self {
        Self {
            buffer,
            channel: None,
            last_flush: Instant::now(),
            wait: interval,
            interval,
        }
    }
}

/// Hand the buffered batch to the processor and settle it cumulatively.
///
/// The buffer is reset whether the processor succeeds or fails: a failed
/// batch is dead-lettered, never retried in place. The flush timestamp and
/// the periodic wait are rearmed in both arms.
pub(crate) async fn flush_batch<P: Processor + 'static>(
    state: &mut FlushState,
    processor: &Arc<P>,
) {
    let (entries, last_tag) = state.buffer.take();
    let Some(last_tag) = last_tag else {
        return;
    };
    let count = entries.len();

    let processor = processor.clone();
    let result = submit(async move { processor.process(Records::Batch(entries)).await }).await;

    let acked = match result {
        Ok(()) => {
            info!(count, last_tag, "Processed batch");
            true
        }
        Err(e) => {
            error!(error = %e, count, last_tag, "Failed to process batch");
            false
        }
    };

    settle_batch(state.channel.as_ref(), last_tag, acked).await;

    state.last_flush = Instant::now();
    state.wait = state.interval;
}

/// Cumulatively ack (or nack without requeue) everything up to `last_tag`.
async fn settle_batch(channel: Option<&Channel>, last_tag: u64, acked: bool) {
    let Some(channel) = channel else {
        warn!(last_tag, "No live channel to settle batch on");
        return;
    };

    let result = if acked {
        channel
            .basic_ack(last_tag, BasicAckOptions { multiple: true })
            .await
    } else {
        channel
            .basic_nack(
                last_tag,
                BasicNackOptions {
                    multiple: true,
                    requeue: false,
                },
            )
            .await
    };

    if let Err(e) = result {
        error!(last_tag, error = %e, "Failed to settle batch");
    }
}

/// Buffer one delivery, or flush first when the buffer is already full.
///
/// A full buffer flushes what it holds and returns without buffering or
/// settling the triggering delivery; that delivery stays unacked and comes
/// back via broker redelivery. Decode and preprocess failures are logged
/// and the delivery is likewise left to redelivery.
pub(crate) async fn buffer_or_flush<P: Processor + 'static>(
    state: &mut FlushState,
    body: &[u8],
    delivery_tag: u64,
    preprocessor: Option<&Arc<dyn Preprocessor>>,
    processor: &Arc<P>,
) {
    if state.buffer.is_full() {
        flush_batch(state, processor).await;
        return;
    }

    match decode_and_preprocess(body, preprocessor).await {
        Ok(value) => match state.buffer.append(value, delivery_tag) {
            Some(bytes) => {
                info!(delivery_tag, bytes, "Appended message to batch");
            }
            None => {
                warn!(delivery_tag, "Batch buffer rejected message");
            }
        },
        Err(e) => {
            error!(delivery_tag, error = %e, "Failed to decode message for batching");
        }
    }
}

/// Periodic flush loop: guarantees a non-empty batch is flushed within one
/// batch interval of the previous flush, independent of message arrival.
pub(crate) async fn run_periodic<P: Processor + 'static>(
    shared: Arc<Mutex<FlushState>>,
    processor: Arc<P>,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let wait = shared.lock().await.wait;
        debug!(
            wait_secs = wait.as_secs_f64(),
            "Waiting before periodic batch check"
        );

        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            _ = tokio::time::sleep(wait) => {}
        }

        let mut state = shared.lock().await;
        let elapsed = state.last_flush.elapsed();

        if elapsed >= interval {
            if state.buffer.is_empty() {
                debug!("No messages to flush in the batch");
                state.wait = interval;
                continue;
            }

            info!(
                elapsed_secs = elapsed.as_secs(),
                "Running periodic batch flush"
            );
            flush_batch(&mut state, &processor).await;
        } else {
            state.wait = interval - elapsed;
        }
    }

    debug!("Periodic batch task stopped");
}

/// Subscriber that processes deliveries a batch at a time.
pub struct BatchSubscriber<P: Processor + 'static> {
    base: Subscriber<P>,
    shared: Arc<Mutex<FlushState>>,
    stop_periodic: Option<watch::Sender<bool>>,
    periodic_task: Option<JoinHandle<()>>,
}

impl<P: Processor + 'static> BatchSubscriber<P> {
    pub fn new(config: PubSubConfig, processor: P) -> Self {
        let buffer = BatchBuffer::new(config.max_batch_entries(), config.max_batch_size());
        let interval = config.batch_interval();

        Self {
            base: Subscriber::new(config, processor),
            shared: Arc::new(Mutex::new(FlushState::new(buffer, interval))),
            stop_periodic: None,
            periodic_task: None,
        }
    }

    /// Install a preprocessor that transforms each payload before it is
    /// buffered.
    pub fn with_preprocessor(mut self, preprocessor: impl Preprocessor + 'static) -> Self {
        self.base = self.base.with_preprocessor(preprocessor);
        self
    }

    pub fn config(&self) -> &PubSubConfig {
        self.base.config()
    }

    /// Copy the current channel into the shared flush state so batch
    /// settlement follows the active connection epoch.
    async fn sync_channel(&self) {
        let channel = self.base.manager.channel().cloned();
        self.shared.lock().await.channel = channel;
    }

    async fn pause_and_reconnect(&mut self) {
        self.base.pause_and_reconnect().await;
        self.sync_channel().await;
    }

    async fn handle_delivery(&self, delivery: Delivery) {
        let mut state = self.shared.lock().await;
        buffer_or_flush(
            &mut state,
            &delivery.data,
            delivery.delivery_tag,
            self.base.preprocessor.as_ref(),
            &self.base.processor,
        )
        .await;
    }

    /// Run the consume loop with the periodic flush task alongside it.
    ///
    /// Shares the semantics of [`Subscriber::consume`]; on shutdown the
    /// periodic task is stopped before the connection closes.
    pub async fn consume(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), AmqpError> {
        if self.base.running {
            warn!(
                service = %self.base.config.publisher().service(),
                "Subscriber is already running"
            );
            return Ok(());
        }

        self.base.refresh_topology().await?;
        self.sync_channel().await;
        self.base.running = true;

        let (stop_tx, stop_rx) = watch::channel(false);
        let interval = self.base.config.batch_interval();
        self.periodic_task = Some(tokio::spawn(run_periodic(
            self.shared.clone(),
            self.base.processor.clone(),
            interval,
            stop_rx,
        )));
        self.stop_periodic = Some(stop_tx);

        info!(
            queue = %self.base.config.queue_name(),
            batch_interval_secs = interval.as_secs(),
            "Starting batch subscriber"
        );

        while self.base.running {
            let mut consumer = match self.base.open_consumer().await {
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
                            info!("Shutdown signal received, stopping batch subscriber");
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

    /// Stop the periodic task, then close the underlying subscriber.
    ///
    /// The periodic task is given one batch interval to finish; a task that
    /// overruns is aborted with a warning.
    pub async fn close(&mut self, reason: Option<&str>) {
        if let Some(stop) = self.stop_periodic.take() {
            let _ = stop.send(true);
        }

        if let Some(mut task) = self.periodic_task.take() {
            let interval = self.base.config.batch_interval();
            if tokio::time::timeout(interval, &mut task).await.is_err() {
                warn!("Periodic batch task did not stop within the batch interval, aborting it");
                task.abort();
            }
        }

        self.base.close(reason).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PublisherConfig;
    use messaging::RecordingProcessor;
    use serde_json::json;

    fn flush_state(max_entries: usize, interval_secs: u64) -> FlushState {
        FlushState::new(
            BatchBuffer::new(max_entries, 1_000_000),
            Duration::from_secs(interval_secs),
        )
    }

    fn body(value: &serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(value).unwrap()
    }

    #[tokio::test]
    async fn test_deliveries_accumulate_until_threshold() {
        let processor = Arc::new(RecordingProcessor::new());
        let mut state = flush_state(3, 10);

        for tag in 1..=3u64 {
            buffer_or_flush(&mut state, &body(&json!({"seq": tag})), tag, None, &processor).await;
        }

        // No flush yet: the third append filled the buffer, but only a
        // later delivery trips the full-buffer check.
        assert_eq!(processor.call_count().await, 0);
        assert_eq!(state.buffer.count(), 3);
        assert!(state.buffer.is_full());
    }

    #[tokio::test]
    async fn test_fourth_delivery_flushes_first_three() {
        let processor = Arc::new(RecordingProcessor::new());
        let mut state = flush_state(3, 10);

        for tag in 1..=4u64 {
            buffer_or_flush(&mut state, &body(&json!({"seq": tag})), tag, None, &processor).await;
        }

        assert_eq!(processor.call_count().await, 1);
        let received = processor.received().await;
        match &received[0] {
            Records::Batch(items) => {
                assert_eq!(items.len(), 3);
                assert_eq!(items.last().unwrap().0, 3);
            }
            other => panic!("expected a batch, got {other:?}"),
        }

        // The fourth delivery was not buffered in the flushing round; it
        // stays unacked for broker redelivery.
        assert!(state.buffer.is_empty());
    }

    #[tokio::test]
    async fn test_flush_references_last_tag_and_empties_buffer() {
        let processor = Arc::new(RecordingProcessor::new());
        let mut state = flush_state(10, 10);

        for tag in 1..=3u64 {
            state.buffer.append(json!({"seq": tag}), tag);
        }
        assert_eq!(state.buffer.enqueued().1, Some(3));

        flush_batch(&mut state, &processor).await;

        let received = processor.received().await;
        match &received[0] {
            Records::Batch(items) => assert_eq!(items.last().unwrap().0, 3),
            other => panic!("expected a batch, got {other:?}"),
        }
        assert!(state.buffer.is_empty());
    }

    #[tokio::test]
    async fn test_flush_resets_buffer_even_when_processor_fails() {
        let processor = Arc::new(messaging::FailingProcessor::new("batch refused"));
        let mut state = flush_state(10, 10);
        state.buffer.append(json!(1), 1);

        flush_batch(&mut state, &processor).await;

        assert!(state.buffer.is_empty());
    }

    #[tokio::test]
    async fn test_flush_on_empty_buffer_is_noop() {
        let processor = Arc::new(RecordingProcessor::new());
        let mut state = flush_state(10, 10);

        flush_batch(&mut state, &processor).await;

        assert_eq!(processor.call_count().await, 0);
    }

    #[tokio::test]
    async fn test_undecodable_delivery_is_not_buffered() {
        let processor = Arc::new(RecordingProcessor::new());
        let mut state = flush_state(3, 10);

        buffer_or_flush(&mut state, b"not json", 1, None, &processor).await;

        assert!(state.buffer.is_empty());
        assert_eq!(processor.call_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_task_flushes_single_entry_within_interval() {
        let processor = Arc::new(RecordingProcessor::new());
        let interval = Duration::from_secs(1);
        let shared = Arc::new(Mutex::new(flush_state(10, 1)));

        shared.lock().await.buffer.append(json!({"only": true}), 7);

        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(run_periodic(
            shared.clone(),
            processor.clone(),
            interval,
            stop_rx,
        ));

        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert_eq!(processor.call_count().await, 1);
        assert!(shared.lock().await.buffer.is_empty());

        let _ = stop_tx.send(true);
        let _ = task.await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_task_skips_empty_buffer() {
        let processor = Arc::new(RecordingProcessor::new());
        let shared = Arc::new(Mutex::new(flush_state(10, 1)));

        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(run_periodic(
            shared.clone(),
            processor.clone(),
            Duration::from_secs(1),
            stop_rx,
        ));

        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(processor.call_count().await, 0);

        let _ = stop_tx.send(true);
        let _ = task.await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_wait_shrinks_after_midway_flush() {
        let processor = Arc::new(RecordingProcessor::new());
        let interval = Duration::from_secs(10);
        let shared = Arc::new(Mutex::new(flush_state(10, 10)));

        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(run_periodic(
            shared.clone(),
            processor.clone(),
            interval,
            stop_rx,
        ));

        // A threshold flush happens midway through the periodic wait; the
        // periodic task then shortens its next wait instead of drifting.
        tokio::time::sleep(Duration::from_secs(5)).await;
        {
            let mut state = shared.lock().await;
            state.buffer.append(json!(1), 1);
            flush_batch(&mut state, &processor).await;
        }
        assert_eq!(processor.call_count().await, 1);

        // Buffer another entry; it must flush one interval after the last
        // flush, not one interval after the periodic task woke up.
        shared.lock().await.buffer.append(json!(2), 2);
        tokio::time::sleep(Duration::from_secs(11)).await;

        assert_eq!(processor.call_count().await, 2);

        let _ = stop_tx.send(true);
        let _ = task.await;
    }

    #[test]
    fn test_batch_subscriber_construction() {
        let publisher =
            PublisherConfig::new("batch-svc", "amqp://u:p@localhost:5672/", "events").unwrap();
        let config = PubSubConfig::new(publisher, vec!["svc.#".to_string()]).unwrap();
        let subscriber = BatchSubscriber::new(config, messaging::NoOpProcessor);

        assert!(subscriber.periodic_task.is_none());
        assert_eq!(subscriber.config().max_batch_entries(), 10);
    }
}
