// src/lib.rs
//! Resilient RabbitMQ transport: a supervised broker connection that hands channels to
//! independent producers and consumers and reports connectivity changes as events.

pub mod config;
pub mod env;
pub mod rabbitmq;

pub use config::TransportConfig;
pub use rabbitmq::{
    ComponentState, ConnectionBroker, ConnectionInfo, ConnectionStatus, Consumer, Event,
    EventBus, EventSource, ExchangeSpec, Producer, QueueSpec, TransportError,
    TransportSettings,
};
