// src/rabbitmq/broker.rs

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, error, info};

use super::amqp_client::{AmqpChannel, AmqpConnector};
use super::errors::{Result, TransportError};
use super::events::{EventBus, EventSource, LifecycleListener, ListenerId};
use super::monitor::{ConnectionMonitor, ConnectionSlot};
use super::settings::TransportSettings;
use super::topology::ConnectionInfo;

/// Owns the live connection to one broker and hands out channels on it.
///
/// Events from the reconnect monitor and from the connection, channel and consumer
/// lifecycle listeners are re-emitted on [`ConnectionBroker::events`].
pub struct ConnectionBroker {
    info: ConnectionInfo,
    slot: ConnectionSlot,
    monitor: ConnectionMonitor,
    events: EventBus,
    connection_listener: LifecycleListener,
    channel_listener: LifecycleListener,
    consumer_listener: LifecycleListener,
    subscriptions: Mutex<Vec<(EventBus, ListenerId)>>,
    close_timeout: Duration,
    ops: tokio::sync::Mutex<()>,
    shut_down: AtomicBool,
}

impl ConnectionBroker {
    /// Creates the broker and starts its monitor. Must be called within a Tokio runtime.
    pub fn start(
        info: ConnectionInfo,
        connector: Arc<dyn AmqpConnector>,
        settings: &TransportSettings,
    ) -> Self {
        let slot = ConnectionSlot::default();
        let events = EventBus::new();
        let connection_listener = LifecycleListener::new(EventSource::Connection);
        let channel_listener = LifecycleListener::new(EventSource::Channel);
        let consumer_listener = LifecycleListener::new(EventSource::Consumer);
        let monitor = ConnectionMonitor::new(
            info.clone(),
            connector,
            slot.clone(),
            settings,
            connection_listener.clone(),
        );

        let sources = [
            monitor.events().clone(),
            connection_listener.events().clone(),
            channel_listener.events().clone(),
            consumer_listener.events().clone(),
        ];
        let subscriptions = sources
            .into_iter()
            .map(|source| {
                let id = source.forward_to(&events);
                (source, id)
            })
            .collect();

        let broker = Self {
            info,
            slot,
            monitor,
            events,
            connection_listener,
            channel_listener,
            consumer_listener,
            subscriptions: Mutex::new(subscriptions),
            close_timeout: settings.close_timeout,
            ops: tokio::sync::Mutex::new(()),
            shut_down: AtomicBool::new(false),
        };
        broker.monitor.start();
        broker
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn connection_info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn connection_listener(&self) -> &LifecycleListener {
        &self.connection_listener
    }

    pub fn channel_listener(&self) -> &LifecycleListener {
        &self.channel_listener
    }

    pub fn consumer_listener(&self) -> &LifecycleListener {
        &self.consumer_listener
    }

    pub fn is_connected(&self) -> bool {
        self.slot.is_connected()
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor.is_running()
    }

    pub async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>> {
        let _guard = self.ops.lock().await;

        let Some(connection) = self.slot.live() else {
            let cause = TransportError::ConnectionBroken {
                host: self.info.host().to_string(),
            };
            let err = TransportError::ChannelCreate(cause.to_string());
            error!("{}", err);
            self.channel_listener.on_create_failure(&cause);
            return Err(err);
        };

        match connection.create_channel().await {
            Ok(channel) => {
                debug!(channel_id = channel.id(), host = %self.info.host(), "Channel created");
                self.channel_listener.on_create(channel.id());
                Ok(channel)
            }
            Err(e) => {
                let err = TransportError::ChannelCreate(e.to_string());
                error!("{}", err);
                self.channel_listener.on_create_failure(&e);
                Err(err)
            }
        }
    }

    /// Stops the monitor, detaches from all event sources and closes the connection.
    /// Close failures are logged, never returned. Safe to call more than once.
    pub async fn shutdown(&self) {
        let _guard = self.ops.lock().await;
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        self.monitor.stop();
        self.monitor.join(self.close_timeout).await;

        let subscriptions: Vec<_> = self
            .subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();
        for (source, id) in subscriptions {
            source.unsubscribe(id);
        }

        if let Some(connection) = self.slot.take() {
            if !connection.is_open() {
                return;
            }
            match timeout(self.close_timeout, connection.close()).await {
                Ok(Ok(())) => info!(host = %self.info.host(), "Closed RabbitMQ connection"),
                Ok(Err(e)) => error!(
                    host = %self.info.host(),
                    "Failed to close RabbitMQ connection: {}", e
                ),
                Err(_) => error!(
                    host = %self.info.host(),
                    "Timed out after {:?} closing RabbitMQ connection", self.close_timeout
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rabbitmq::events::{ConnectionStatus, Event};
    use crate::rabbitmq::mock::MockBroker;
    use tokio::time::sleep;

    fn settings() -> TransportSettings {
        TransportSettings {
            reconnect_interval: Duration::from_millis(20),
            connect_timeout: Duration::from_millis(200),
            close_timeout: Duration::from_millis(200),
            ..TransportSettings::default()
        }
    }

    fn recorder(bus: &EventBus) -> Arc<Mutex<Vec<Event>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(move |event: &Event| sink.lock().unwrap().push(event.clone()));
        seen
    }

    async fn wait_connected(broker: &ConnectionBroker) {
        for _ in 0..100 {
            if broker.is_connected() {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("broker never connected");
    }

    #[tokio::test]
    async fn create_channel_reports_channel_id() {
        let mock = MockBroker::new();
        let broker = ConnectionBroker::start(ConnectionInfo::default(), mock.connector(), &settings());
        let seen = recorder(broker.events());
        wait_connected(&broker).await;

        let channel = broker.create_channel().await.unwrap();

        let events = seen.lock().unwrap();
        let created = events
            .iter()
            .find(|e| e.source == EventSource::Channel)
            .unwrap();
        assert_eq!(created.status, ConnectionStatus::Created);
        assert_eq!(created.payload_as::<u16>(), Some(&channel.id()));
        assert!(events
            .iter()
            .any(|e| e.source == EventSource::Monitor && e.status == ConnectionStatus::Created));
        drop(events);
        broker.shutdown().await;
    }

    #[tokio::test]
    async fn create_channel_without_connection_embeds_the_cause() {
        let mock = MockBroker::unreachable();
        let broker = ConnectionBroker::start(ConnectionInfo::default(), mock.connector(), &settings());
        let seen = recorder(broker.channel_listener().events());

        let err = broker.create_channel().await.unwrap_err();

        match err {
            TransportError::ChannelCreate(message) => assert!(message.contains("localhost")),
            other => panic!("unexpected error: {other}"),
        }
        let statuses: Vec<_> = seen.lock().unwrap().iter().map(|e| e.status).collect();
        assert_eq!(statuses, vec![ConnectionStatus::CreationFailed]);
        broker.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_closes_connection_and_is_idempotent() {
        let mock = MockBroker::new();
        let broker = ConnectionBroker::start(ConnectionInfo::default(), mock.connector(), &settings());
        wait_connected(&broker).await;

        broker.shutdown().await;
        broker.shutdown().await;

        assert!(!broker.is_connected());
        assert!(!broker.is_monitoring());
        assert_eq!(mock.open_connections(), 0);
        assert!(broker.connection_listener().events().is_empty());
    }

    #[tokio::test]
    async fn shutdown_detaches_from_sub_listeners() {
        let mock = MockBroker::new();
        let broker = ConnectionBroker::start(ConnectionInfo::default(), mock.connector(), &settings());
        let seen = recorder(broker.events());

        broker.shutdown().await;
        let before = seen.lock().unwrap().len();
        broker.consumer_listener().on_recovery_started("q1".to_string());

        assert_eq!(seen.lock().unwrap().len(), before);
    }

    #[tokio::test]
    async fn shutdown_logs_and_swallows_a_close_failure() {
        let mock = MockBroker::new();
        let broker = ConnectionBroker::start(ConnectionInfo::default(), mock.connector(), &settings());
        wait_connected(&broker).await;
        mock.set_fail_close(true);

        broker.shutdown().await;

        assert!(!broker.is_connected());
        assert!(!broker.is_monitoring());
    }

    #[tokio::test]
    async fn shutdown_returns_when_close_hangs() {
        let mock = MockBroker::new();
        let broker = ConnectionBroker::start(ConnectionInfo::default(), mock.connector(), &settings());
        wait_connected(&broker).await;
        mock.set_hang_close(true);

        let started = std::time::Instant::now();
        broker.shutdown().await;

        assert!(started.elapsed() < Duration::from_millis(600));
        assert!(!broker.is_connected());
        assert!(!broker.is_monitoring());
    }
}
