// src/rabbitmq/consumer.rs
//! Queue consumer that turns pushed deliveries into a pull API.
//!
//! Deliveries land in a bounded buffer filled by the client's delivery callback;
//! [`Consumer::receive`] drains it with a bounded wait so a host polling loop never
//! blocks indefinitely.

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use super::amqp_client::{AmqpChannel, AmqpConnector, Delivery, DeliveryHandler};
use super::broker::ConnectionBroker;
use super::connection_state::{ChannelSetup, ComponentState, ConnectionState};
use super::errors::{Result, TransportError};
use super::events::EventBus;
use super::lapin_client::LapinConnector;
use super::settings::TransportSettings;
use super::topology::{ConnectionInfo, ExchangeSpec, QueueSpec};

pub const DEFAULT_PREFETCH_COUNT: u16 = 1;

struct ConsumerSetup {
    queue: QueueSpec,
    prefetch: AtomicU16,
    capacity: usize,
    drain_grace: Duration,
    registration: Mutex<Option<String>>,
    buffer: tokio::sync::Mutex<Option<mpsc::Receiver<Delivery>>>,
    registered_before: AtomicBool,
}

impl ConsumerSetup {
    fn new(queue: QueueSpec, settings: &TransportSettings) -> Self {
        Self {
            queue,
            prefetch: AtomicU16::new(DEFAULT_PREFETCH_COUNT),
            capacity: settings.buffer_capacity.max(1),
            drain_grace: settings.drain_grace,
            registration: Mutex::new(None),
            buffer: tokio::sync::Mutex::new(None),
            registered_before: AtomicBool::new(false),
        }
    }

    fn set_registration(&self, tag: Option<String>) -> Option<String> {
        let mut registration = self
            .registration
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::replace(&mut *registration, tag)
    }

    async fn declare_and_bind(
        &self,
        channel: &Arc<dyn AmqpChannel>,
        exchange: &ExchangeSpec,
    ) -> Result<()> {
        let queue = self.queue.name();

        channel.declare_queue(&self.queue).await.map_err(|e| {
            error!(queue, "Failed to declare queue: {}", e);
            TransportError::ChannelInit(format!("failed to declare queue '{}': {}", queue, e))
        })?;

        let routing_key = exchange.effective_routing_key();
        channel
            .bind_queue(queue, exchange.name(), routing_key)
            .await
            .map_err(|e| {
                error!(queue, exchange = exchange.name(), "Failed to bind queue: {}", e);
                TransportError::ChannelInit(format!(
                    "failed to bind queue '{}' to exchange '{}' with key '{}': {}",
                    queue,
                    exchange.name(),
                    routing_key,
                    e
                ))
            })?;

        let prefetch = self.prefetch.load(Ordering::SeqCst);
        channel.set_qos(prefetch).await.map_err(|e| {
            error!(queue, prefetch, "Failed to set prefetch count: {}", e);
            TransportError::ChannelInit(format!("failed to set prefetch count {}: {}", prefetch, e))
        })?;

        debug!(
            queue,
            exchange = exchange.name(),
            routing_key,
            prefetch,
            "Queue declared and bound"
        );
        Ok(())
    }
}

#[async_trait]
impl ChannelSetup for ConsumerSetup {
    async fn init(
        &self,
        channel: &Arc<dyn AmqpChannel>,
        exchange: &ExchangeSpec,
        broker: &ConnectionBroker,
    ) -> Result<()> {
        self.declare_and_bind(channel, exchange).await?;

        let queue = self.queue.name().to_string();
        let recovering = self.registered_before.load(Ordering::SeqCst);
        if recovering {
            broker.consumer_listener().on_recovery_started(queue.clone());
        }

        let (tx, rx) = mpsc::channel::<Delivery>(self.capacity);
        *self.buffer.lock().await = Some(rx);

        let handler: DeliveryHandler = Arc::new(move |delivery: Delivery| {
            let tx = tx.clone();
            async move {
                let delivery_tag = delivery.envelope.delivery_tag;
                // waits while the buffer is full; the client dispatches serially, so this stalls it
                if tx.send(delivery).await.is_err() {
                    debug!(delivery_tag, "Buffer closed, dropping delivery");
                }
            }
            .boxed()
        });

        match channel.register_consumer(&queue, true, handler).await {
            Ok(tag) => {
                info!(queue = %queue, consumer_tag = %tag, "Consumer registered");
                self.set_registration(Some(tag));
                if recovering {
                    broker.consumer_listener().on_recovery_completed(queue);
                }
                self.registered_before.store(true, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                error!(queue = %queue, "Failed to register consumer: {}", e);
                if recovering {
                    broker.consumer_listener().on_recovery_failure(queue.clone(), &e);
                }
                *self.buffer.lock().await = None;
                Err(TransportError::ConsumerInit(format!(
                    "failed to consume from queue '{}': {}",
                    queue, e
                )))
            }
        }
    }

    async fn teardown(&self, channel: &Arc<dyn AmqpChannel>) {
        if let Some(tag) = self.set_registration(None) {
            match channel.cancel_consumer(&tag).await {
                Ok(()) => debug!(consumer_tag = %tag, "Consumer cancelled"),
                Err(e) => warn!(consumer_tag = %tag, "Failed to cancel consumer: {}", e),
            }
            // let deliveries already in flight reach the buffer before it goes away
            sleep(self.drain_grace).await;
        }
        *self.buffer.lock().await = None;
    }
}

/// Consumes opaque payloads from one queue bound to one exchange.
pub struct Consumer {
    state: Arc<ConnectionState>,
    setup: Arc<ConsumerSetup>,
    receive_timeout: Duration,
}

impl Consumer {
    /// Creates a consumer with its own broker connection. The broker starts connecting
    /// right away; call [`Consumer::connect`] once it reports `CREATED`.
    pub fn new(
        info: ConnectionInfo,
        exchange: ExchangeSpec,
        queue: QueueSpec,
        settings: &TransportSettings,
    ) -> Self {
        Self::with_connector(info, exchange, queue, Arc::new(LapinConnector::new()), settings)
    }

    pub fn with_connector(
        info: ConnectionInfo,
        exchange: ExchangeSpec,
        queue: QueueSpec,
        connector: Arc<dyn AmqpConnector>,
        settings: &TransportSettings,
    ) -> Self {
        let setup = Arc::new(ConsumerSetup::new(queue, settings));
        let state = ConnectionState::with_connector(
            "consumer",
            info,
            exchange,
            connector,
            Arc::clone(&setup) as Arc<dyn ChannelSetup>,
            settings,
        );
        Self {
            state,
            setup,
            receive_timeout: settings.receive_timeout,
        }
    }

    pub fn queue(&self) -> &QueueSpec {
        &self.setup.queue
    }

    pub fn exchange(&self) -> &ExchangeSpec {
        self.state.exchange()
    }

    /// Applied on the next [`Consumer::connect`].
    pub fn set_prefetch_count(&self, prefetch_count: u16) {
        self.setup.prefetch.store(prefetch_count, Ordering::SeqCst);
    }

    pub fn prefetch_count(&self) -> u16 {
        self.setup.prefetch.load(Ordering::SeqCst)
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

    /// Next buffered payload, or `None` once the receive timeout elapses.
    pub async fn receive(&self) -> Option<Vec<u8>> {
        self.receive_delivery().await.map(|delivery| delivery.body)
    }

    /// Like [`Consumer::receive`], keeping the envelope and properties.
    ///
    /// Without an open buffer this still waits out the timeout, so a polling loop
    /// does not spin while the consumer is disconnected.
    pub async fn receive_delivery(&self) -> Option<Delivery> {
        let wait = async {
            let mut buffer = self.setup.buffer.lock().await;
            match buffer.as_mut() {
                Some(rx) => match rx.recv().await {
                    Some(delivery) => Some(delivery),
                    None => {
                        drop(buffer);
                        std::future::pending::<Option<Delivery>>().await
                    }
                },
                None => {
                    drop(buffer);
                    std::future::pending::<Option<Delivery>>().await
                }
            }
        };
        timeout(self.receive_timeout, wait).await.ok().flatten()
    }
}
