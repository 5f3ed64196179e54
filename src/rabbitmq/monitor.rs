// src/rabbitmq/monitor.rs
//! Background task that keeps trying to hold one live broker connection.
//!
//! While running, each iteration:
//! 1. opens a connection if none is live, emitting `CREATED` on success;
//! 2. emits `CREATION_FAILED` only for the first failure of a streak;
//! 3. sleeps for the reconnect interval (interruptible by [`ConnectionMonitor::stop`]).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use super::amqp_client::{AmqpConnection, AmqpConnector};
use super::errors::ClientError;
use super::events::{ConnectionStatus, EventBus, EventSource, LifecycleListener};
use super::settings::TransportSettings;
use super::topology::ConnectionInfo;

/// The connection shared between the monitor (writer) and its broker (reader).
#[derive(Clone, Default)]
pub(crate) struct ConnectionSlot {
    inner: Arc<RwLock<Option<Arc<dyn AmqpConnection>>>>,
}

impl ConnectionSlot {
    /// The held connection, if it is still open.
    pub(crate) fn live(&self) -> Option<Arc<dyn AmqpConnection>> {
        let guard = self
            .inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.as_ref().filter(|conn| conn.is_open()).cloned()
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.live().is_some()
    }

    fn set(&self, connection: Arc<dyn AmqpConnection>) {
        let mut guard = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Some(connection);
    }

    pub(crate) fn take(&self) -> Option<Arc<dyn AmqpConnection>> {
        self.inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

struct MonitorLoop {
    info: ConnectionInfo,
    connector: Arc<dyn AmqpConnector>,
    slot: ConnectionSlot,
    events: EventBus,
    connection_listener: LifecycleListener,
    running: Arc<AtomicBool>,
    recovering: Arc<AtomicBool>,
    stop_rx: watch::Receiver<bool>,
    reconnect_interval: Duration,
    connect_timeout: Duration,
}

impl MonitorLoop {
    async fn run(mut self) {
        let mut last_attempt_failed = false;
        info!(host = %self.info.host(), "Connection monitor started");

        while self.running.load(Ordering::SeqCst) {
            if !self.slot.is_connected() {
                let attempt = timeout(self.connect_timeout, self.connector.open(&self.info));
                let outcome = tokio::select! {
                    outcome = attempt => Some(outcome),
                    _ = self.stop_rx.changed() => None,
                };
                let Some(outcome) = outcome else {
                    break;
                };

                match outcome.unwrap_or_else(|elapsed| Err(ClientError::from(elapsed))) {
                    Ok(connection) => {
                        last_attempt_failed = false;
                        self.on_connected(connection);
                    }
                    Err(err) => {
                        self.on_failed(&err, last_attempt_failed);
                        last_attempt_failed = true;
                    }
                }
            }

            if !self.pause().await {
                break;
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!(host = %self.info.host(), "Connection monitor stopped");
    }

    /// Returns `false` when a stop was requested during the pause.
    async fn pause(&mut self) -> bool {
        tokio::select! {
            _ = sleep(self.reconnect_interval) => self.running.load(Ordering::SeqCst),
            _ = self.stop_rx.changed() => false,
        }
    }

    fn on_connected(&self, connection: Arc<dyn AmqpConnection>) {
        let host = self.info.host().to_string();

        let events = self.events.clone();
        let listener = self.connection_listener.clone();
        let recovering = Arc::clone(&self.recovering);
        let broken_host = host.clone();
        connection.on_shutdown(Box::new(move |reason: String| {
            error!(host = %broken_host, "Connection to RabbitMQ broken: {}", reason);
            recovering.store(true, Ordering::SeqCst);
            events.emit(ConnectionStatus::Disconnected, EventSource::Monitor, reason);
            listener.on_recovery_started(broken_host);
        }));
        self.slot.set(connection);

        let msg = format!("Connection established with RabbitMQ broker at {}", host);
        info!("{}", msg);
        self.events
            .emit(ConnectionStatus::Created, EventSource::Monitor, msg);

        if self.recovering.swap(false, Ordering::SeqCst) {
            self.connection_listener.on_recovery(host.clone());
            self.connection_listener.on_recovery_completed(host);
        }
    }

    fn on_failed(&self, err: &ClientError, already_failing: bool) {
        // only report the first failure of a streak
        if already_failing {
            debug!(host = %self.info.host(), "Connection attempt failed again: {}", err);
            return;
        }

        let msg = format!(
            "Failed to establish connection with RabbitMQ broker at {}: {}",
            self.info.host(),
            err
        );
        error!("{}", msg);
        self.events
            .emit(ConnectionStatus::CreationFailed, EventSource::Monitor, msg);

        if self.recovering.load(Ordering::SeqCst) {
            self.connection_listener
                .on_recovery_failure(self.info.host().to_string(), err);
        }
    }
}

/// Owns the reconnect loop of one broker.
///
/// The loop is created stopped so subscribers can attach to [`ConnectionMonitor::events`]
/// before the first attempt; [`ConnectionMonitor::start`] spawns it on the current Tokio runtime.
pub(crate) struct ConnectionMonitor {
    events: EventBus,
    running: Arc<AtomicBool>,
    stop_tx: watch::Sender<bool>,
    pending: Mutex<Option<MonitorLoop>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionMonitor {
    pub(crate) fn new(
        info: ConnectionInfo,
        connector: Arc<dyn AmqpConnector>,
        slot: ConnectionSlot,
        settings: &TransportSettings,
        connection_listener: LifecycleListener,
    ) -> Self {
        let events = EventBus::new();
        let running = Arc::new(AtomicBool::new(false));
        let (stop_tx, stop_rx) = watch::channel(false);

        let pending = MonitorLoop {
            info,
            connector,
            slot,
            events: events.clone(),
            connection_listener,
            running: Arc::clone(&running),
            recovering: Arc::new(AtomicBool::new(false)),
            stop_rx,
            reconnect_interval: settings.reconnect_interval,
            connect_timeout: settings.connect_timeout,
        };

        Self {
            events,
            running,
            stop_tx,
            pending: Mutex::new(Some(pending)),
            task: Mutex::new(None),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawns the loop. Calling it again is a no-op.
    pub(crate) fn start(&self) {
        let pending = self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(monitor) = pending {
            self.running.store(true, Ordering::SeqCst);
            let handle = tokio::spawn(monitor.run());
            *self
                .task
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);
        }
    }

    /// Asks the loop to exit at its next iteration boundary and wakes it if it is sleeping.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let _ = self.stop_tx.send(true);
    }

    /// Waits up to `limit` for the loop to exit after [`ConnectionMonitor::stop`].
    pub(crate) async fn join(&self, limit: Duration) {
        let handle = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            if timeout(limit, handle).await.is_err() {
                warn!("Connection monitor did not stop within {:?}", limit);
            }
        }
    }
}
