// src/rabbitmq/producer.rs

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use lapin::BasicProperties;
use tokio::time::timeout;
use tracing::{debug, error, trace};

use super::amqp_client::AmqpConnector;
use super::broker::ConnectionBroker;
use super::connection_state::{ChannelSetup, ComponentState, ConnectionState, ExchangeOnly};
use super::errors::{ClientError, Result, TransportError};
use super::events::EventBus;
use super::lapin_client::LapinConnector;
use super::settings::TransportSettings;
use super::topology::{ConnectionInfo, ExchangeSpec};

const CONTENT_TYPE: &str = "application/octet-stream";

/// Publishes opaque payloads to one exchange under its configured routing key.
pub struct Producer {
    state: Arc<ConnectionState>,
    publish_timeout: Duration,
}

impl Producer {
    /// Creates a producer with its own broker connection. The broker starts connecting
    /// right away; call [`Producer::connect`] once it reports `CREATED`.
    pub fn new(info: ConnectionInfo, exchange: ExchangeSpec, settings: &TransportSettings) -> Self {
        Self::with_connector(info, exchange, Arc::new(LapinConnector::new()), settings)
    }

    pub fn with_connector(
        info: ConnectionInfo,
        exchange: ExchangeSpec,
        connector: Arc<dyn AmqpConnector>,
        settings: &TransportSettings,
    ) -> Self {
        let state = ConnectionState::with_connector(
            "producer",
            info,
            exchange,
            connector,
            Arc::new(ExchangeOnly) as Arc<dyn ChannelSetup>,
            settings,
        );
        Self {
            state,
            publish_timeout: settings.close_timeout,
        }
    }

    pub fn exchange(&self) -> &ExchangeSpec {
        self.state.exchange()
    }

    pub async fn connect(&self) -> Result<()> {
        self.state.connect().await
    }

    pub async fn disconnect(&self, reason: &str) {
        self.state.disconnect(reason).await
    }

    pub async fn shutdown(&self) {
        self.state.shutdown().await
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    pub fn state(&self) -> ComponentState {
        self.state.state()
    }

    pub fn status_details(&self) -> String {
        self.state.status_details()
    }

    pub fn events(&self) -> &EventBus {
        self.state.events()
    }

    pub fn broker(&self) -> &ConnectionBroker {
        self.state.broker()
    }

    /// Publishes `payload` once. While disconnected the payload is dropped and `Ok` is
    /// returned; the host is expected to watch the event bus instead.
    ///
    /// A publish still pending after the close timeout (a blocked connection, for
    /// instance) fails with [`TransportError::Publish`] and releases the component.
    pub async fn send(&self, payload: &[u8]) -> Result<()> {
        if payload.is_empty() {
            return Err(TransportError::EmptyPayload);
        }

        let Some(channel) = self.state.lock_connected().await else {
            trace!(
                component = %self.state.name(),
                bytes = payload.len(),
                "Not connected, dropping message"
            );
            return Ok(());
        };

        let exchange = self.state.exchange();
        let routing_key = exchange.effective_routing_key();
        let properties = BasicProperties::default()
            .with_content_type(CONTENT_TYPE.into())
            .with_timestamp(Utc::now().timestamp() as u64);

        let outcome = timeout(
            self.publish_timeout,
            channel.publish(exchange.name(), routing_key, properties, payload),
        )
        .await
        .unwrap_or_else(|elapsed| Err(ClientError::from(elapsed)));

        match outcome {
            Ok(()) => {
                debug!(
                    exchange = exchange.name(),
                    routing_key,
                    bytes = payload.len(),
                    "Message published"
                );
                Ok(())
            }
            Err(e) => {
                error!(
                    exchange = exchange.name(),
                    routing_key,
                    "Failed to publish message: {}", e
                );
                Err(TransportError::Publish(e.to_string()))
            }
        }
    }
}
