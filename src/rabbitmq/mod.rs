// src/rabbitmq/mod.rs
// Resilient RabbitMQ transport: supervised connection, lifecycle events, producer and consumer

pub mod amqp_client;
pub mod errors;
pub mod events;
pub mod settings;
pub mod topology;

mod broker;
mod connection_state;
mod consumer;
mod lapin_client;
mod monitor;
mod producer;

#[cfg(test)]
pub(crate) mod mock;

// Re-export specific items to simplify imports elsewhere
pub use amqp_client::{
    AmqpChannel, AmqpConnection, AmqpConnector, Delivery, DeliveryHandler, Envelope,
    ShutdownCallback,
};
pub use broker::ConnectionBroker;
pub use connection_state::ComponentState;
pub use consumer::{Consumer, DEFAULT_PREFETCH_COUNT};
pub use errors::{ClientError, Result, TransportError, ValidationError};
pub use events::{
    ConnectionStatus, Event, EventBus, EventPayload, EventSource, LifecycleListener, Listener,
    ListenerId,
};
pub use lapin_client::LapinConnector;
pub use producer::Producer;
pub use settings::TransportSettings;
pub use topology::{ConnectionInfo, Durability, ExchangeSpec, ExchangeType, QueueSpec};
