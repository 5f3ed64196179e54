// src/rabbitmq/mock.rs
//! In-memory broker implementing the client seam for unit tests.
//!
//! Routing covers what the transport relies on: direct and topic exchanges match the
//! binding key exactly, fanout exchanges copy to every bound queue. Messages published
//! to a queue with no consumer wait in a backlog until one registers.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use lapin::BasicProperties;
use tokio::sync::mpsc;

use super::amqp_client::{
    AmqpChannel, AmqpConnection, AmqpConnector, Delivery, DeliveryHandler, Envelope,
    ShutdownCallback,
};
use super::errors::ClientError;
use super::topology::{ConnectionInfo, ExchangeSpec, ExchangeType, QueueSpec};

#[derive(Default)]
struct BrokerState {
    reachable: bool,
    open_attempts: usize,
    fail_exchange_declare: bool,
    fail_register: bool,
    fail_publish: bool,
    hang_publish: bool,
    fail_close: bool,
    hang_close: bool,
    fail_cancel: bool,
    publishes: usize,
    last_prefetch: Option<u16>,
    next_connection_id: usize,
    next_channel_id: u16,
    next_consumer_id: usize,
    next_delivery_tag: u64,
    connections: Vec<Arc<MockConnection>>,
    exchanges: HashMap<String, ExchangeType>,
    queues: HashMap<String, VecDeque<Delivery>>,
    // (exchange, queue, routing key)
    bindings: Vec<(String, String, String)>,
    consumers: HashMap<String, MockConsumer>,
}

struct MockConsumer {
    queue: String,
    channel_id: u16,
    tx: mpsc::UnboundedSender<Delivery>,
}

#[derive(Clone, Default)]
pub(crate) struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MockBroker {
    /// A broker that accepts connections.
    pub(crate) fn new() -> Self {
        let broker = Self::default();
        broker.set_reachable(true);
        broker
    }

    pub(crate) fn unreachable() -> Self {
        Self::default()
    }

    pub(crate) fn connector(&self) -> Arc<dyn AmqpConnector> {
        Arc::new(MockConnector {
            broker: self.clone(),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    pub(crate) fn set_fail_exchange_declare(&self, fail: bool) {
        self.lock().fail_exchange_declare = fail;
    }

    pub(crate) fn set_fail_register(&self, fail: bool) {
        self.lock().fail_register = fail;
    }

    pub(crate) fn set_fail_publish(&self, fail: bool) {
        self.lock().fail_publish = fail;
    }

    /// Publishes never complete, as under broker flow control.
    pub(crate) fn set_hang_publish(&self, hang: bool) {
        self.lock().hang_publish = hang;
    }

    /// Connection and channel closes fail and leave the resource open.
    pub(crate) fn set_fail_close(&self, fail: bool) {
        self.lock().fail_close = fail;
    }

    /// Connection and channel closes never complete.
    pub(crate) fn set_hang_close(&self, hang: bool) {
        self.lock().hang_close = hang;
    }

    pub(crate) fn set_fail_cancel(&self, fail: bool) {
        self.lock().fail_cancel = fail;
    }

    pub(crate) fn open_attempts(&self) -> usize {
        self.lock().open_attempts
    }

    pub(crate) fn publishes(&self) -> usize {
        self.lock().publishes
    }

    pub(crate) fn last_prefetch(&self) -> Option<u16> {
        self.lock().last_prefetch
    }

    pub(crate) fn consumer_count(&self) -> usize {
        self.lock().consumers.len()
    }

    pub(crate) fn has_exchange(&self, name: &str) -> bool {
        self.lock().exchanges.contains_key(name)
    }

    pub(crate) fn backlog(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, VecDeque::len)
    }

    pub(crate) fn open_connections(&self) -> usize {
        self.lock()
            .connections
            .iter()
            .filter(|conn| conn.is_open())
            .count()
    }

    pub(crate) fn open_channels(&self) -> usize {
        let connections = self.lock().connections.clone();
        connections
            .iter()
            .flat_map(|conn| conn.channels.lock().unwrap().clone())
            .filter(|channel| channel.is_open())
            .count()
    }

    /// Kills every open connection and its channels, firing their shutdown callbacks
    /// the way a broker restart would.
    pub(crate) fn drop_connections(&self, reason: &str) {
        let connections = {
            let mut state = self.lock();
            state.consumers.clear();
            state.connections.clone()
        };

        let mut callbacks = Vec::new();
        for conn in connections.iter().filter(|conn| conn.is_open()) {
            conn.open.store(false, Ordering::SeqCst);
            for channel in conn.channels.lock().unwrap().iter() {
                if channel.open.swap(false, Ordering::SeqCst) {
                    callbacks.extend(channel.callback.lock().unwrap().take());
                }
            }
            callbacks.extend(conn.callback.lock().unwrap().take());
        }
        for callback in callbacks {
            callback(reason.to_string());
        }
    }

    /// Closes one channel from the broker side.
    pub(crate) fn fail_channel(&self, channel_id: u16, reason: &str) {
        let connections = self.lock().connections.clone();
        let channel = connections
            .iter()
            .flat_map(|conn| conn.channels.lock().unwrap().clone())
            .find(|channel| channel.id == channel_id && channel.is_open());
        if let Some(channel) = channel {
            channel.open.store(false, Ordering::SeqCst);
            self.lock()
                .consumers
                .retain(|_, consumer| consumer.channel_id != channel_id);
            let callback = channel.callback.lock().unwrap().take();
            if let Some(callback) = callback {
                callback(reason.to_string());
            }
        }
    }

    async fn close_fault(&self, what: &str) -> Result<(), ClientError> {
        let (fail, hang) = {
            let state = self.lock();
            (state.fail_close, state.hang_close)
        };
        if hang {
            std::future::pending::<()>().await;
        }
        if fail {
            return Err(ClientError::Other(format!("{} close refused", what)));
        }
        Ok(())
    }

    fn route(&self, exchange: &str, routing_key: &str, properties: BasicProperties, body: &[u8]) {
        let mut state = self.lock();
        let fanout = state.exchanges.get(exchange) == Some(&ExchangeType::Fanout);
        let targets: Vec<String> = state
            .bindings
            .iter()
            .filter(|(ex, _, key)| ex == exchange && (fanout || key == routing_key))
            .map(|(_, queue, _)| queue.clone())
            .collect();

        for queue in targets {
            state.next_delivery_tag += 1;
            let delivery = Delivery {
                envelope: Envelope {
                    consumer_tag: String::new(),
                    delivery_tag: state.next_delivery_tag,
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    redelivered: false,
                },
                properties: properties.clone(),
                body: body.to_vec(),
            };

            let consumer = state
                .consumers
                .iter()
                .find(|(_, consumer)| consumer.queue == queue)
                .map(|(tag, consumer)| (tag.clone(), consumer.tx.clone()));
            match consumer {
                Some((tag, tx)) => {
                    let mut delivery = delivery;
                    delivery.envelope.consumer_tag = tag;
                    let _ = tx.send(delivery);
                }
                None => state.queues.entry(queue).or_default().push_back(delivery),
            }
        }
    }
}

struct MockConnector {
    broker: MockBroker,
}

#[async_trait]
impl AmqpConnector for MockConnector {
    async fn open(&self, _info: &ConnectionInfo) -> Result<Arc<dyn AmqpConnection>, ClientError> {
        let mut state = self.broker.lock();
        state.open_attempts += 1;
        if !state.reachable {
            return Err(ClientError::Other("connection refused".to_string()));
        }
        state.next_connection_id += 1;
        let connection = Arc::new(MockConnection {
            id: state.next_connection_id,
            broker: self.broker.clone(),
            open: AtomicBool::new(true),
            callback: Mutex::new(None),
            channels: Mutex::new(Vec::new()),
        });
        state.connections.push(Arc::clone(&connection));
        Ok(connection)
    }
}

pub(crate) struct MockConnection {
    id: usize,
    broker: MockBroker,
    open: AtomicBool,
    callback: Mutex<Option<ShutdownCallback>>,
    channels: Mutex<Vec<Arc<MockChannel>>>,
}

#[async_trait]
impl AmqpConnection for MockConnection {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, ClientError> {
        if !self.is_open() {
            return Err(ClientError::Other(format!("connection {} is closed", self.id)));
        }
        let id = {
            let mut state = self.broker.lock();
            state.next_channel_id += 1;
            state.next_channel_id
        };
        let channel = Arc::new(MockChannel {
            id,
            broker: self.broker.clone(),
            open: AtomicBool::new(true),
            callback: Mutex::new(None),
        });
        self.channels.lock().unwrap().push(Arc::clone(&channel));
        Ok(channel)
    }

    fn on_shutdown(&self, callback: ShutdownCallback) {
        *self.callback.lock().unwrap() = Some(callback);
    }

    async fn close(&self) -> Result<(), ClientError> {
        self.broker.close_fault("connection").await?;
        self.open.store(false, Ordering::SeqCst);
        for channel in self.channels.lock().unwrap().iter() {
            channel.open.store(false, Ordering::SeqCst);
        }
        Ok(())
    }
}

pub(crate) struct MockChannel {
    id: u16,
    broker: MockBroker,
    open: AtomicBool,
    callback: Mutex<Option<ShutdownCallback>>,
}

impl fmt::Debug for MockChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockChannel")
            .field("id", &self.id)
            .field("open", &self.is_open())
            .finish()
    }
}

impl MockChannel {
    fn ensure_open(&self) -> Result<(), ClientError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(ClientError::Other(format!("channel {} is closed", self.id)))
        }
    }
}

#[async_trait]
impl AmqpChannel for MockChannel {
    fn id(&self) -> u16 {
        self.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn on_shutdown(&self, callback: ShutdownCallback) {
        *self.callback.lock().unwrap() = Some(callback);
    }

    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<(), ClientError> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        if state.fail_exchange_declare {
            return Err(ClientError::Other("exchange declare refused".to_string()));
        }
        state
            .exchanges
            .insert(exchange.name().to_string(), exchange.kind());
        Ok(())
    }

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<(), ClientError> {
        self.ensure_open()?;
        self.broker
            .lock()
            .queues
            .entry(queue.name().to_string())
            .or_default();
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), ClientError> {
        self.ensure_open()?;
        let binding = (exchange.to_string(), queue.to_string(), routing_key.to_string());
        let mut state = self.broker.lock();
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn set_qos(&self, prefetch_count: u16) -> Result<(), ClientError> {
        self.ensure_open()?;
        self.broker.lock().last_prefetch = Some(prefetch_count);
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: BasicProperties,
        body: &[u8],
    ) -> Result<(), ClientError> {
        self.ensure_open()?;
        let hang = {
            let mut state = self.broker.lock();
            state.publishes += 1;
            if state.fail_publish {
                return Err(ClientError::Other("publish refused".to_string()));
            }
            state.hang_publish
        };
        if hang {
            std::future::pending::<()>().await;
        }
        self.broker.route(exchange, routing_key, properties, body);
        Ok(())
    }

    async fn register_consumer(
        &self,
        queue: &str,
        _auto_ack: bool,
        handler: DeliveryHandler,
    ) -> Result<String, ClientError> {
        self.ensure_open()?;
        let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();

        let tag = {
            let mut state = self.broker.lock();
            if state.fail_register {
                return Err(ClientError::Other("basic.consume refused".to_string()));
            }
            state.next_consumer_id += 1;
            let tag = format!("mock-consumer-{}", state.next_consumer_id);
            let backlog: Vec<Delivery> = state
                .queues
                .get_mut(queue)
                .map(|pending| pending.drain(..).collect())
                .unwrap_or_default();
            for mut delivery in backlog {
                delivery.envelope.consumer_tag = tag.clone();
                let _ = tx.send(delivery);
            }
            state.consumers.insert(
                tag.clone(),
                MockConsumer {
                    queue: queue.to_string(),
                    channel_id: self.id,
                    tx,
                },
            );
            tag
        };

        // like the lapin client, await each handler call before dispatching the next
        tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                handler(delivery).await;
            }
        });
        Ok(tag)
    }

    async fn cancel_consumer(&self, consumer_tag: &str) -> Result<(), ClientError> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        if state.fail_cancel {
            return Err(ClientError::Other("basic.cancel refused".to_string()));
        }
        match state.consumers.remove(consumer_tag) {
            Some(_) => Ok(()),
            None => Err(ClientError::Other(format!("unknown consumer tag {}", consumer_tag))),
        }
    }

    async fn close(&self) -> Result<(), ClientError> {
        self.broker.close_fault("channel").await?;
        self.open.store(false, Ordering::SeqCst);
        self.broker
            .lock()
            .consumers
            .retain(|_, consumer| consumer.channel_id != self.id);
        Ok(())
    }
}
