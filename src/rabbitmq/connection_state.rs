// src/rabbitmq/connection_state.rs
//! Connect/disconnect state machine shared by [`Producer`](super::Producer) and
//! [`Consumer`](super::Consumer).
//!
//! Each component owns one [`ConnectionBroker`] and at most one channel on it. Role
//! specific work (queue declaration, consumer registration) plugs in through
//! [`ChannelSetup`]; reconnect policy stays in the broker's monitor and in whoever
//! listens to [`ConnectionState::events`].

use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::runtime::Handle;
use tokio::sync::MutexGuard;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::amqp_client::{AmqpChannel, AmqpConnector};
use super::broker::ConnectionBroker;
use super::errors::{Result, TransportError};
use super::events::{ConnectionStatus, EventBus, EventSource, ListenerId};
use super::settings::TransportSettings;
use super::topology::{ConnectionInfo, ExchangeSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentState {
    Disconnected,
    Connecting,
    Connected,
    Shutdown,
}

impl fmt::Display for ComponentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ComponentState::Disconnected => "DISCONNECTED",
            ComponentState::Connecting => "CONNECTING",
            ComponentState::Connected => "CONNECTED",
            ComponentState::Shutdown => "SHUTDOWN",
        };
        f.write_str(name)
    }
}

/// Role-specific channel work run inside the component's critical section.
#[async_trait]
pub(crate) trait ChannelSetup: Send + Sync {
    /// Runs after the exchange has been declared on a fresh or reused channel.
    async fn init(
        &self,
        _channel: &Arc<dyn AmqpChannel>,
        _exchange: &ExchangeSpec,
        _broker: &ConnectionBroker,
    ) -> Result<()> {
        Ok(())
    }

    /// Runs during disconnect, before the channel is closed, while it is still open.
    async fn teardown(&self, _channel: &Arc<dyn AmqpChannel>) {}
}

/// Producers need nothing beyond the exchange.
pub(crate) struct ExchangeOnly;

impl ChannelSetup for ExchangeOnly {}

struct Session {
    channel: Option<Arc<dyn AmqpChannel>>,
    // bumped whenever a new channel is acquired; stale shutdown callbacks compare against it
    generation: u64,
}

struct Status {
    state: ComponentState,
    details: String,
}

/// The open channel of a connected component, held with the component's lock.
pub(crate) struct ConnectedChannel<'a> {
    _session: MutexGuard<'a, Session>,
    channel: Arc<dyn AmqpChannel>,
}

impl Deref for ConnectedChannel<'_> {
    type Target = Arc<dyn AmqpChannel>;

    fn deref(&self) -> &Self::Target {
        &self.channel
    }
}

pub(crate) struct ConnectionState {
    name: String,
    exchange: ExchangeSpec,
    broker: ConnectionBroker,
    setup: Arc<dyn ChannelSetup>,
    events: EventBus,
    broker_subscription: Mutex<Option<ListenerId>>,
    session: tokio::sync::Mutex<Session>,
    status: Mutex<Status>,
    close_timeout: Duration,
    runtime: Handle,
    this: Weak<ConnectionState>,
}

impl ConnectionState {
    /// Must be called within a Tokio runtime; channel callbacks are spawned onto it.
    pub(crate) fn new(
        role: &str,
        broker: ConnectionBroker,
        exchange: ExchangeSpec,
        setup: Arc<dyn ChannelSetup>,
        settings: &TransportSettings,
    ) -> Arc<Self> {
        let events = EventBus::new();
        let subscription = broker.events().forward_to(&events);
        let name = format!("{}-{}", role, &Uuid::new_v4().simple().to_string()[..8]);
        debug!(component = %name, exchange = exchange.name(), "Creating component");

        Arc::new_cyclic(|this| Self {
            name,
            exchange,
            broker,
            setup,
            events,
            broker_subscription: Mutex::new(Some(subscription)),
            session: tokio::sync::Mutex::new(Session {
                channel: None,
                generation: 0,
            }),
            status: Mutex::new(Status {
                state: ComponentState::Disconnected,
                details: String::new(),
            }),
            close_timeout: settings.close_timeout,
            runtime: Handle::current(),
            this: this.clone(),
        })
    }

    /// Starts a dedicated broker for this component.
    pub(crate) fn with_connector(
        role: &str,
        info: ConnectionInfo,
        exchange: ExchangeSpec,
        connector: Arc<dyn AmqpConnector>,
        setup: Arc<dyn ChannelSetup>,
        settings: &TransportSettings,
    ) -> Arc<Self> {
        let broker = ConnectionBroker::start(info, connector, settings);
        Self::new(role, broker, exchange, setup, settings)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exchange(&self) -> &ExchangeSpec {
        &self.exchange
    }

    pub fn broker(&self) -> &ConnectionBroker {
        &self.broker
    }

    /// Broker lifecycle events re-emitted verbatim, plus this component's own `SHUTDOWN`.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn state(&self) -> ComponentState {
        self.status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ComponentState::Connected
    }

    /// Reason recorded by the last disconnect or failed connect.
    pub fn status_details(&self) -> String {
        self.status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .details
            .clone()
    }

    fn set_status(&self, state: ComponentState, details: impl Into<String>) {
        let mut status = self
            .status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        status.state = state;
        status.details = details.into();
    }

    pub async fn connect(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        if self.state() == ComponentState::Shutdown {
            return Err(TransportError::Shutdown);
        }

        self.disconnect_locked(&mut session, None).await;
        self.set_status(ComponentState::Connecting, "");

        if !self.broker.is_connected() {
            let err = TransportError::ConnectionBroken {
                host: self.broker.connection_info().host().to_string(),
            };
            error!(component = %self.name, "{}", err);
            self.set_status(ComponentState::Disconnected, err.to_string());
            return Err(err);
        }

        let channel = match session.channel.take() {
            Some(channel) if channel.is_open() => channel,
            _ => match self.broker.create_channel().await {
                Ok(channel) => {
                    session.generation += 1;
                    self.watch_channel(&channel, session.generation);
                    channel
                }
                Err(err) => {
                    self.set_status(ComponentState::Disconnected, err.to_string());
                    return Err(err);
                }
            },
        };

        if let Err(err) = self.init_channel(&channel).await {
            if channel.is_open() {
                self.close_channel(&channel).await;
            }
            self.set_status(ComponentState::Disconnected, err.to_string());
            return Err(err);
        }

        info!(
            component = %self.name,
            channel_id = channel.id(),
            exchange = self.exchange.name(),
            "Component connected"
        );
        session.channel = Some(channel);
        self.set_status(ComponentState::Connected, "");
        Ok(())
    }

    async fn init_channel(&self, channel: &Arc<dyn AmqpChannel>) -> Result<()> {
        if let Err(e) = channel.declare_exchange(&self.exchange).await {
            let err = TransportError::ChannelInit(format!(
                "failed to declare exchange '{}': {}",
                self.exchange.name(),
                e
            ));
            error!(component = %self.name, "{}", err);
            return Err(err);
        }
        self.setup.init(channel, &self.exchange, &self.broker).await
    }

    /// Arranges for a broker-side channel close to disconnect this component. The
    /// callback fires on the client's thread, so the actual work is spawned.
    fn watch_channel(&self, channel: &Arc<dyn AmqpChannel>, generation: u64) {
        let this = self.this.clone();
        let runtime = self.runtime.clone();
        channel.on_shutdown(Box::new(move |reason: String| {
            runtime.spawn(async move {
                if let Some(state) = this.upgrade() {
                    state.on_channel_shutdown(generation, reason).await;
                }
            });
        }));
    }

    async fn on_channel_shutdown(&self, generation: u64, reason: String) {
        let mut session = self.session.lock().await;
        if session.generation != generation || session.channel.is_none() {
            debug!(component = %self.name, "Ignoring shutdown of a replaced channel: {}", reason);
            return;
        }
        warn!(component = %self.name, "Channel shut down by broker: {}", reason);
        self.disconnect_locked(&mut session, Some(reason)).await;
    }

    pub async fn disconnect(&self, reason: &str) {
        let mut session = self.session.lock().await;
        self.disconnect_locked(&mut session, Some(reason.to_string()))
            .await;
    }

    async fn disconnect_locked(&self, session: &mut Session, reason: Option<String>) {
        if self.is_connected() {
            if let Some(channel) = session.channel.take() {
                if channel.is_open() {
                    self.setup.teardown(&channel).await;
                    self.close_channel(&channel).await;
                }
                debug!(component = %self.name, channel_id = channel.id(), "Released channel");
            }
        }

        let state = match self.state() {
            ComponentState::Shutdown => ComponentState::Shutdown,
            _ => ComponentState::Disconnected,
        };
        self.set_status(state, reason.unwrap_or_default());
    }

    async fn close_channel(&self, channel: &Arc<dyn AmqpChannel>) {
        match timeout(self.close_timeout, channel.close()).await {
            Ok(Ok(())) => debug!(component = %self.name, channel_id = channel.id(), "Channel closed"),
            Ok(Err(e)) => error!(
                component = %self.name,
                channel_id = channel.id(),
                "Failed to close channel: {}", e
            ),
            Err(_) => error!(
                component = %self.name,
                channel_id = channel.id(),
                "Timed out after {:?} closing channel", self.close_timeout
            ),
        }
    }

    /// The component's channel together with its lock, or `None` when not connected.
    pub(crate) async fn lock_connected(&self) -> Option<ConnectedChannel<'_>> {
        let session = self.session.lock().await;
        if !self.is_connected() {
            return None;
        }
        let channel = session.channel.clone()?;
        Some(ConnectedChannel {
            _session: session,
            channel,
        })
    }

    /// Disconnects, detaches from the broker and shuts it down. The component cannot be
    /// reconnected afterwards.
    pub async fn shutdown(&self) {
        {
            let mut session = self.session.lock().await;
            if self.state() == ComponentState::Shutdown {
                return;
            }
            self.disconnect_locked(&mut session, Some(String::new()))
                .await;
            self.set_status(ComponentState::Shutdown, "");
        }

        info!(component = %self.name, "Component shut down");
        self.events.emit(
            ConnectionStatus::Shutdown,
            EventSource::Component,
            format!("{} shut down", self.name),
        );

        let subscription = self
            .broker_subscription
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(id) = subscription {
            self.broker.events().unsubscribe(id);
        }
        self.broker.shutdown().await;
    }
}
