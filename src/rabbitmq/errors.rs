// src/rabbitmq/errors.rs

use lapin::Error as LapinError;
use thiserror::Error;
use tokio::time::error::Elapsed;

/// Errors surfaced by producers, consumers and the connection broker.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection to RabbitMQ broker at {host} is broken")]
    ConnectionBroken { host: String },

    #[error("Failed to create channel: {0}")]
    ChannelCreate(String),

    #[error("Failed to initialize channel: {0}")]
    ChannelInit(String),

    #[error("Failed to initialize consumer: {0}")]
    ConsumerInit(String),

    #[error("No message to send: payload is empty")]
    EmptyPayload,

    #[error("Failed to publish message: {0}")]
    Publish(String),

    #[error("Component has been shut down")]
    Shutdown,
}

// Custom Result type for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors reported by the broker client behind the `AmqpConnection`/`AmqpChannel` seam.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("AMQP error: {0}")]
    Lapin(#[from] LapinError),

    #[error("Operation timed out")]
    Timeout,

    #[error("{0}")]
    Other(String),
}

impl From<Elapsed> for ClientError {
    fn from(_: Elapsed) -> Self {
        ClientError::Timeout
    }
}

/// Value-object validation failures. Each variant names the offending option.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("host must not be empty")]
    EmptyHost,

    #[error("port must be greater than zero")]
    InvalidPort,

    #[error("exchangeName must not be empty")]
    EmptyExchangeName,

    #[error("queueName must not be empty")]
    EmptyQueueName,

    #[error("queueName is required for inbound transports")]
    MissingQueue,

    #[error("unknown exchangeType '{0}' (expected direct, fanout, topic or headers)")]
    UnknownExchangeType(String),

    #[error("unknown durability '{0}' (expected transient or durable)")]
    UnknownDurability(String),
}
