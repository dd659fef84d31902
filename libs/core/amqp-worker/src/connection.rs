//! Connection and channel lifecycle management.

use crate::config::PublisherConfig;
use crate::error::AmqpError;
use lapin::options::{BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties, ConnectionState};
use messaging::BackoffStrategy;
use std::time::Duration;
use tracing::{debug, info, warn};

/// AMQP reply code for a clean close.
const REPLY_SUCCESS: u16 = 200;

/// Reconnect wait: 2s doubling, capped at 30s, at most 5 checks.
const RECOVERY_BACKOFF_BASE: Duration = Duration::from_secs(2);
const RECOVERY_BACKOFF_MAX: Duration = Duration::from_secs(30);
const RECOVERY_MAX_ATTEMPTS: u32 = 5;

/// Owns the single logical connection, channel, and declared exchange that
/// publishers and subscribers operate on.
///
/// The manager is an explicitly constructed, explicitly owned object; its
/// handles are only touched from the task driving `publish`/`consume`, so no
/// locking is needed around them.
pub struct ChannelManager {
    config: PublisherConfig,
    connection: Option<Connection>,
    channel: Option<Channel>,
}

impl ChannelManager {
    pub fn new(config: PublisherConfig) -> Self {
        Self {
            config,
            connection: None,
            channel: None,
        }
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    /// Current channel, if connected.
    pub fn channel(&self) -> Option<&Channel> {
        self.channel.as_ref()
    }

    /// Ensure a live connection, channel, and declared exchange.
    ///
    /// Returns `true` when a new connection epoch began, so callers know
    /// that anything scoped to the old epoch (queues, bindings, consumers)
    /// must be redeclared. Idempotent when already connected.
    ///
    /// A connection observed mid-recovery is waited on with exponential
    /// backoff; a slow recovery alone never fails this call. An initial
    /// connect failure does propagate: retry policy for a broker that was
    /// never reachable belongs to the caller.
    pub async fn refresh(&mut self) -> Result<bool, AmqpError> {
        if let Some(connection) = &self.connection {
            if matches!(connection.status().state(), ConnectionState::Connecting) {
                self.wait_for_recovery().await;
            }
        }

        if let Some(connection) = &self.connection {
            if connection.status().connected() {
                if self.channel.as_ref().is_some_and(|c| c.status().connected()) {
                    debug!(service = %self.config.service(), "Already connected");
                    return Ok(false);
                }

                // The connection survived but the channel did not.
                let channel = open_channel(&self.config, connection).await?;
                self.channel = Some(channel);
                info!(service = %self.config.service(), "Reopened channel on live connection");
                return Ok(true);
            }
        }

        let connection =
            Connection::connect(self.config.amqp_url(), ConnectionProperties::default()).await?;
        let channel = open_channel(&self.config, &connection).await?;

        info!(
            service = %self.config.service(),
            exchange = %self.config.exchange_name(),
            prefetch = self.config.prefetch_count(),
            "Connected to broker and declared exchange"
        );

        self.connection = Some(connection);
        self.channel = Some(channel);
        Ok(true)
    }

    /// Wait for an in-flight recovery to settle, backing off exponentially.
    async fn wait_for_recovery(&self) {
        let backoff = BackoffStrategy::Exponential {
            base: RECOVERY_BACKOFF_BASE,
            max: RECOVERY_BACKOFF_MAX,
        };

        for attempt in 0..RECOVERY_MAX_ATTEMPTS {
            let delay = backoff.delay(attempt);
            info!(
                delay_secs = delay.as_secs(),
                attempt, "Waiting for connection recovery"
            );
            tokio::time::sleep(delay).await;

            let Some(connection) = &self.connection else {
                return;
            };
            match connection.status().state() {
                ConnectionState::Connecting => continue,
                ConnectionState::Connected => {
                    info!(service = %self.config.service(), "Connection recovered");
                    return;
                }
                _ => return,
            }
        }

        warn!("Maximum recovery wait attempts reached");
    }

    /// Close channel then connection, clearing all handles.
    ///
    /// Idempotent: closing an unset or already-closed handle is a no-op, and
    /// close failures are only logged.
    pub async fn close(&mut self, reason: Option<&str>) {
        let reply_text = reason.unwrap_or("closing");

        if let Some(channel) = self.channel.take() {
            if channel.status().connected() {
                if let Err(e) = channel.close(REPLY_SUCCESS, reply_text).await {
                    warn!(error = %e, "Failed to close channel");
                }
            }
        }

        if let Some(connection) = self.connection.take() {
            if connection.status().connected() {
                if let Err(e) = connection.close(REPLY_SUCCESS, reply_text).await {
                    warn!(error = %e, "Failed to close connection");
                }
            }
        }
    }
}

/// Open a channel with publisher confirms and QoS, and declare the exchange.
async fn open_channel(
    config: &PublisherConfig,
    connection: &Connection,
) -> Result<Channel, AmqpError> {
    let channel = connection.create_channel().await?;

    channel
        .confirm_select(ConfirmSelectOptions::default())
        .await?;
    channel
        .basic_qos(config.prefetch_count(), BasicQosOptions::default())
        .await?;
    channel
        .exchange_declare(
            config.exchange_name(),
            config.exchange_kind().as_lapin(),
            ExchangeDeclareOptions {
                durable: true,
                auto_delete: false,
                internal: false,
                passive: false,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;

    Ok(channel)
}
