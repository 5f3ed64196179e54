// src/rabbitmq/lapin_client.rs
// lapin-backed implementation of the broker client seam

use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::amqp_client::{
    AmqpChannel, AmqpConnection, AmqpConnector, Delivery, DeliveryHandler, Envelope,
    ShutdownCallback,
};
use super::errors::ClientError;
use super::topology::{ConnectionInfo, ExchangeSpec, QueueSpec};

const REPLY_SUCCESS: u16 = 200;

/// Wraps a one-shot callback so it can sit behind lapin's `FnMut` error hook.
fn once(callback: ShutdownCallback) -> impl FnMut(lapin::Error) + Send + 'static {
    let slot = Mutex::new(Some(callback));
    move |err: lapin::Error| {
        let callback = slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(callback) = callback {
            callback(err.to_string());
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LapinConnector;

impl LapinConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AmqpConnector for LapinConnector {
    async fn open(&self, info: &ConnectionInfo) -> Result<Arc<dyn AmqpConnection>, ClientError> {
        debug!(host = %info.host(), port = info.port(), "Opening RabbitMQ connection");
        let connection =
            Connection::connect_uri(info.amqp_uri(), ConnectionProperties::default()).await?;
        info!("Connected to RabbitMQ at {}", info);

        Ok(Arc::new(LapinConnection { connection }))
    }
}

pub struct LapinConnection {
    connection: Connection,
}

#[async_trait]
impl AmqpConnection for LapinConnection {
    fn is_open(&self) -> bool {
        self.connection.status().connected()
    }

    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, ClientError> {
        let channel = self.connection.create_channel().await?;
        debug!(channel_id = channel.id(), "Channel opened");
        Ok(Arc::new(LapinChannel { channel }))
    }

    fn on_shutdown(&self, callback: ShutdownCallback) {
        self.connection.on_error(once(callback));
    }

    async fn close(&self) -> Result<(), ClientError> {
        self.connection
            .close(REPLY_SUCCESS, "Closing connection")
            .await?;
        Ok(())
    }
}

pub struct LapinChannel {
    channel: Channel,
}

impl fmt::Debug for LapinChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LapinChannel")
            .field("id", &self.channel.id())
            .field("connected", &self.channel.status().connected())
            .finish()
    }
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    fn id(&self) -> u16 {
        self.channel.id()
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    fn on_shutdown(&self, callback: ShutdownCallback) {
        self.channel.on_error(once(callback));
    }

    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<(), ClientError> {
        self.channel
            .exchange_declare(
                exchange.name(),
                exchange.kind().into(),
                ExchangeDeclareOptions {
                    durable: exchange.is_durable(),
                    auto_delete: exchange.is_auto_delete(),
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<(), ClientError> {
        let declared = self
            .channel
            .queue_declare(
                queue.name(),
                QueueDeclareOptions {
                    durable: queue.is_durable(),
                    exclusive: queue.is_exclusive(),
                    auto_delete: queue.is_auto_delete(),
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        debug!(
            queue = queue.name(),
            messages = declared.message_count(),
            consumers = declared.consumer_count(),
            "Queue declared"
        );
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), ClientError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn set_qos(&self, prefetch_count: u16) -> Result<(), ClientError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await?;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: BasicProperties,
        body: &[u8],
    ) -> Result<(), ClientError> {
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                properties,
            )
            .await?
            .await?;
        Ok(())
    }

    async fn register_consumer(
        &self,
        queue: &str,
        auto_ack: bool,
        handler: DeliveryHandler,
    ) -> Result<String, ClientError> {
        let tag = format!("consumer-{}", Uuid::new_v4());
        let mut consumer = self
            .channel
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions {
                    no_ack: auto_ack,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        // one delivery at a time: the handler's await is what holds back the next one
        let consumer_tag = tag.clone();
        tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                match delivery {
                    Ok(delivery) => {
                        let delivery = Delivery {
                            envelope: Envelope {
                                consumer_tag: consumer_tag.clone(),
                                delivery_tag: delivery.delivery_tag,
                                exchange: delivery.exchange.as_str().to_string(),
                                routing_key: delivery.routing_key.as_str().to_string(),
                                redelivered: delivery.redelivered,
                            },
                            properties: delivery.properties,
                            body: delivery.data,
                        };
                        handler(delivery).await;
                    }
                    Err(e) => {
                        warn!(consumer_tag = %consumer_tag, "Consumer error: {}", e);
                        break;
                    }
                }
            }
            debug!(consumer_tag = %consumer_tag, "Consumer stream ended");
        });

        Ok(tag)
    }

    async fn cancel_consumer(&self, consumer_tag: &str) -> Result<(), ClientError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), ClientError> {
        self.channel.close(REPLY_SUCCESS, "Closing channel").await?;
        Ok(())
    }
}
