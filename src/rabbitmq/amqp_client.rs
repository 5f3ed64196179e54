// src/rabbitmq/amqp_client.rs
// Capability surface the transport needs from a broker client

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use lapin::BasicProperties;

use super::errors::ClientError;
use super::topology::{ConnectionInfo, ExchangeSpec, QueueSpec};

/// Invoked at most once, with the failure reason, when a connection or channel
/// goes away underneath us. Runs on the client library's own thread.
pub type ShutdownCallback = Box<dyn FnOnce(String) + Send + 'static>;

/// Awaited once per inbound delivery, in arrival order. The client does not dispatch
/// the next delivery until the returned future completes.
pub type DeliveryHandler = Arc<dyn Fn(Delivery) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct Envelope {
    pub consumer_tag: String,
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub envelope: Envelope,
    pub properties: BasicProperties,
    pub body: Vec<u8>,
}

/// Opens broker connections.
#[async_trait]
pub trait AmqpConnector: Send + Sync {
    async fn open(&self, info: &ConnectionInfo) -> Result<Arc<dyn AmqpConnection>, ClientError>;
}

#[async_trait]
pub trait AmqpConnection: Send + Sync {
    fn is_open(&self) -> bool;

    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, ClientError>;

    fn on_shutdown(&self, callback: ShutdownCallback);

    async fn close(&self) -> Result<(), ClientError>;
}

/// A multiplexed session on a connection. Owned by exactly one producer or consumer.
#[async_trait]
pub trait AmqpChannel: Send + Sync + Debug {
    fn id(&self) -> u16;

    fn is_open(&self) -> bool;

    fn on_shutdown(&self, callback: ShutdownCallback);

    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<(), ClientError>;

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<(), ClientError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), ClientError>;

    async fn set_qos(&self, prefetch_count: u16) -> Result<(), ClientError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: BasicProperties,
        body: &[u8],
    ) -> Result<(), ClientError>;

    /// Starts a consumer and returns its tag.
    async fn register_consumer(
        &self,
        queue: &str,
        auto_ack: bool,
        handler: DeliveryHandler,
    ) -> Result<String, ClientError>;

    async fn cancel_consumer(&self, consumer_tag: &str) -> Result<(), ClientError>;

    async fn close(&self) -> Result<(), ClientError>;
}
