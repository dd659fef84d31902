//! Publishing to the managed exchange.

use crate::config::{is_valid_binding_key, PublisherConfig};
use crate::connection::ChannelManager;
use crate::error::AmqpError;
use lapin::options::BasicPublishOptions;
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::BasicProperties;
use serde_json::Value;
use tracing::{debug, info, warn};

/// Publishes JSON payloads to the configured exchange, reconnecting
/// transparently between calls.
pub struct Publisher {
    manager: ChannelManager,
}

impl Publisher {
    pub fn new(config: PublisherConfig) -> Self {
        Self {
            manager: ChannelManager::new(config),
        }
    }

    pub fn config(&self) -> &PublisherConfig {
        self.manager.config()
    }

    /// Publish `payload` to the exchange under `routing_key`.
    ///
    /// The routing key must satisfy the binding-key grammar; a bad key is
    /// reported without touching the network. Every failure comes back as
    /// the `Err` arm so callers can inspect and retry at the call site.
    pub async fn publish(
        &mut self,
        routing_key: &str,
        headers: FieldTable,
        payload: &Value,
    ) -> Result<(), AmqpError> {
        if !is_valid_binding_key(routing_key) {
            return Err(AmqpError::InvalidRoutingKey(routing_key.to_string()));
        }

        self.manager.refresh().await?;
        let channel = self.manager.channel().ok_or(AmqpError::NotConnected)?;

        let body = serde_json::to_vec(payload)?;
        if body.len() > self.manager.config().max_message_size() {
            warn!(
                bytes = body.len(),
                limit = self.manager.config().max_message_size(),
                "Payload exceeds the configured message size limit"
            );
        }

        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_headers(headers);

        let confirmation = channel
            .basic_publish(
                self.manager.config().exchange_name(),
                routing_key,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await?
            .await?;

        match confirmation {
            Confirmation::Ack(_) => {
                info!(routing_key = %routing_key, bytes = body.len(), "Message published and confirmed");
            }
            Confirmation::Nack(_) => {
                warn!(routing_key = %routing_key, "Broker negatively confirmed the publish");
            }
            Confirmation::NotRequested => {
                debug!(routing_key = %routing_key, "Publish confirmation not requested");
            }
        }

        Ok(())
    }

    /// Close the underlying channel and connection.
    pub async fn close(&mut self, reason: Option<&str>) {
        self.manager.close(reason).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PublisherConfig;
    use serde_json::json;

    #[tokio::test]
    async fn test_invalid_routing_key_fails_before_any_network_call() {
        let config =
            PublisherConfig::new("svc", "amqp://u:p@unreachable:5672/", "events").unwrap();
        let mut publisher = Publisher::new(config);

        // The broker host does not exist; an attempted connection would
        // surface as a different error. The grammar check must win.
        let result = publisher
            .publish("orders..created", FieldTable::default(), &json!({"id": 1}))
            .await;

        assert!(matches!(result, Err(AmqpError::InvalidRoutingKey(_))));
    }
}
