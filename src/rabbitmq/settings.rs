// src/rabbitmq/settings.rs

use std::time::Duration;

pub const DEFAULT_RECONNECT_INTERVAL_MS: u64 = 5000;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_CLOSE_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_RECEIVE_TIMEOUT_MS: u64 = 100;
pub const DEFAULT_DRAIN_GRACE_MS: u64 = 1000;
pub const DEFAULT_BUFFER_CAPACITY: usize = 1024;

/// Intervals and bounds shared by the broker, its monitor and the components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportSettings {
    /// Pause between connection attempts made by the monitor.
    pub reconnect_interval: Duration,
    pub connect_timeout: Duration,
    /// Upper bound for closing a connection or channel during teardown.
    pub close_timeout: Duration,
    pub receive_timeout: Duration,
    /// How long a consumer lets in-flight deliveries land after cancelling.
    pub drain_grace: Duration,
    pub buffer_capacity: usize,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_millis(DEFAULT_RECONNECT_INTERVAL_MS),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            close_timeout: Duration::from_millis(DEFAULT_CLOSE_TIMEOUT_MS),
            receive_timeout: Duration::from_millis(DEFAULT_RECEIVE_TIMEOUT_MS),
            drain_grace: Duration::from_millis(DEFAULT_DRAIN_GRACE_MS),
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
        }
    }
}
