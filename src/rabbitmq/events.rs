// src/rabbitmq/events.rs
//! Lifecycle events and the synchronous bus that carries them.
//!
//! Every layer (monitor, broker, component) owns an [`EventBus`] and forwards what it
//! hears to the layer above, so the owning transport only has to watch one bus.
//!
//! Emission runs on whichever thread triggered it: the monitor task, a caller task, or
//! one of the broker client's internal threads. Listeners must therefore return quickly
//! and hand anything heavier off to a spawned task.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tracing::debug;

/// Connectivity transitions reported to downstream components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    Created,
    CreationFailed,
    Recovery,
    RecoveryStarted,
    RecoveryCompleted,
    RecoveryFailed,
    Disconnected,
    Shutdown,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionStatus::Created => "CREATED",
            ConnectionStatus::CreationFailed => "CREATION_FAILED",
            ConnectionStatus::Recovery => "RECOVERY",
            ConnectionStatus::RecoveryStarted => "RECOVERY_STARTED",
            ConnectionStatus::RecoveryCompleted => "RECOVERY_COMPLETED",
            ConnectionStatus::RecoveryFailed => "RECOVERY_FAILED",
            ConnectionStatus::Disconnected => "DISCONNECTED",
            ConnectionStatus::Shutdown => "SHUTDOWN",
        };
        f.write_str(name)
    }
}

/// Which part of the stack an event originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventSource {
    Monitor,
    Connection,
    Channel,
    Consumer,
    Component,
}

pub type EventPayload = Arc<dyn Any + Send + Sync>;

#[derive(Clone)]
pub struct Event {
    pub status: ConnectionStatus,
    pub source: EventSource,
    pub details: String,
    pub payload: Option<EventPayload>,
    pub at: DateTime<Utc>,
}

impl Event {
    pub fn new(status: ConnectionStatus, source: EventSource, details: impl Into<String>) -> Self {
        Self {
            status,
            source,
            details: details.into(),
            payload: None,
            at: Utc::now(),
        }
    }

    pub fn with_payload<T: Any + Send + Sync>(mut self, payload: T) -> Self {
        self.payload = Some(Arc::new(payload));
        self
    }

    pub fn payload_as<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.payload.as_ref().and_then(|p| p.downcast_ref::<T>())
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("status", &self.status)
            .field("source", &self.source)
            .field("details", &self.details)
            .field("has_payload", &self.payload.is_some())
            .field("at", &self.at)
            .finish()
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransportEvent({}, {})", self.status, self.details)
    }
}

pub trait Listener: Send + Sync {
    fn on_event(&self, event: &Event);
}

impl<F> Listener for F
where
    F: Fn(&Event) + Send + Sync,
{
    fn on_event(&self, event: &Event) {
        self(event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct BusInner {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn Listener>)>>,
}

/// Synchronous publish/subscribe primitive.
///
/// Cloning yields another handle to the same subscriber list.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<L: Listener + 'static>(&self, listener: L) -> ListenerId {
        let id = ListenerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let mut guard = self
            .inner
            .listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.push((id, Arc::new(listener)));
        id
    }

    /// Returns whether the listener was still registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut guard = self
            .inner
            .listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = guard.len();
        guard.retain(|(existing, _)| *existing != id);
        guard.len() != before
    }

    pub fn emit(&self, status: ConnectionStatus, source: EventSource, details: impl Into<String>) {
        self.publish(Event::new(status, source, details));
    }

    /// Delivers `event` to every current subscriber in registration order.
    ///
    /// The subscriber list is snapshotted first so listeners may (un)subscribe
    /// from inside their callback.
    pub fn publish(&self, event: Event) {
        debug!(status = %event.status, source = ?event.source, details = %event.details, "emitting event");
        let snapshot: Vec<Arc<dyn Listener>> = {
            let guard = self
                .inner
                .listeners
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.iter().map(|(_, listener)| Arc::clone(listener)).collect()
        };
        for listener in snapshot {
            listener.on_event(&event);
        }
    }

    /// Re-emits every event of this bus on `target` verbatim.
    pub fn forward_to(&self, target: &EventBus) -> ListenerId {
        let target = target.clone();
        self.subscribe(move |event: &Event| target.publish(event.clone()))
    }

    pub fn len(&self) -> usize {
        self.inner
            .listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus").field("listeners", &self.len()).finish()
    }
}

/// Reports the lifecycle of one kind of broker resource (connection, channel or
/// consumer registration) as events on its own bus.
#[derive(Debug, Clone)]
pub struct LifecycleListener {
    source: EventSource,
    events: EventBus,
}

impl LifecycleListener {
    pub fn new(source: EventSource) -> Self {
        Self {
            source,
            events: EventBus::new(),
        }
    }

    pub fn source(&self) -> EventSource {
        self.source
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    fn report<T: Any + Send + Sync>(&self, status: ConnectionStatus, details: String, resource: Option<T>) {
        let mut event = Event::new(status, self.source, details);
        if let Some(resource) = resource {
            event = event.with_payload(resource);
        }
        self.events.publish(event);
    }

    pub fn on_create<T: Any + Send + Sync + fmt::Display>(&self, resource: T) {
        let details = format!("{:?} {} created", self.source, resource);
        self.report(ConnectionStatus::Created, details, Some(resource));
    }

    pub fn on_create_failure(&self, failure: &dyn fmt::Display) {
        let details = format!("{:?} creation failed: {}", self.source, failure);
        self.report::<()>(ConnectionStatus::CreationFailed, details, None);
    }

    pub fn on_recovery<T: Any + Send + Sync + fmt::Display>(&self, resource: T) {
        let details = format!("{:?} {} recovered", self.source, resource);
        self.report(ConnectionStatus::Recovery, details, Some(resource));
    }

    pub fn on_recovery_started<T: Any + Send + Sync + fmt::Display>(&self, resource: T) {
        let details = format!("{:?} {} recovery started", self.source, resource);
        self.report(ConnectionStatus::RecoveryStarted, details, Some(resource));
    }

    pub fn on_recovery_completed<T: Any + Send + Sync + fmt::Display>(&self, resource: T) {
        let details = format!("{:?} {} recovery completed", self.source, resource);
        self.report(ConnectionStatus::RecoveryCompleted, details, Some(resource));
    }

    pub fn on_recovery_failure<T: Any + Send + Sync + fmt::Display>(
        &self,
        resource: T,
        failure: &dyn fmt::Display,
    ) {
        let details = format!("{:?} {} recovery failed: {}", self.source, resource, failure);
        self.report(ConnectionStatus::RecoveryFailed, details, Some(resource));
    }
}
