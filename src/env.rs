// src/env.rs
// Transport configuration from RABBITMQ_* environment variables (.env aware)

use std::env;
use std::str::FromStr;

use dotenv::dotenv;
use thiserror::Error;
use tracing::warn;

use crate::config::TransportConfig;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("environment variable {0} is not set")]
    Missing(&'static str),

    #[error("environment variable {name} has invalid value '{value}'")]
    Invalid { name: &'static str, value: String },
}

/// Reads the process environment after loading `.env` from the working directory.
pub fn load() -> Result<TransportConfig, ConfigError> {
    dotenv().ok();
    from_lookup(|name| env::var(name).ok())
}

/// Builds a config from any variable source. `RABBITMQ_EXCHANGE` is required;
/// everything else falls back to the file defaults.
pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<TransportConfig, ConfigError> {
    let text = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
    let defaults = TransportConfig::default();

    Ok(TransportConfig {
        host: text("RABBITMQ_HOST").unwrap_or(defaults.host),
        port: parsed(&lookup, "RABBITMQ_PORT")?.unwrap_or(defaults.port),
        virtual_host: text("RABBITMQ_VHOST"),
        username: text("RABBITMQ_USERNAME"),
        password: text("RABBITMQ_PASSWORD"),
        ssl: parsed(&lookup, "RABBITMQ_SSL")?.unwrap_or(defaults.ssl),

        exchange_name: text("RABBITMQ_EXCHANGE").ok_or(ConfigError::Missing("RABBITMQ_EXCHANGE"))?,
        exchange_type: lenient(&lookup, "RABBITMQ_EXCHANGE_TYPE"),
        exchange_durability: lenient(&lookup, "RABBITMQ_EXCHANGE_DURABILITY"),
        exchange_auto_delete: parsed(&lookup, "RABBITMQ_EXCHANGE_AUTO_DELETE")?
            .unwrap_or(defaults.exchange_auto_delete),
        routing_key: text("RABBITMQ_ROUTING_KEY"),

        queue_name: text("RABBITMQ_QUEUE"),
        queue_durability: lenient(&lookup, "RABBITMQ_QUEUE_DURABILITY"),
        queue_exclusive: parsed(&lookup, "RABBITMQ_QUEUE_EXCLUSIVE")?
            .unwrap_or(defaults.queue_exclusive),
        queue_auto_delete: parsed(&lookup, "RABBITMQ_QUEUE_AUTO_DELETE")?
            .unwrap_or(defaults.queue_auto_delete),
        prefetch_count: parsed(&lookup, "RABBITMQ_PREFETCH_COUNT")?
            .unwrap_or(defaults.prefetch_count),

        reconnect_interval_ms: parsed(&lookup, "RABBITMQ_RECONNECT_INTERVAL_MS")?
            .unwrap_or(defaults.reconnect_interval_ms),
        connect_timeout_ms: parsed(&lookup, "RABBITMQ_CONNECT_TIMEOUT_MS")?
            .unwrap_or(defaults.connect_timeout_ms),
        close_timeout_ms: parsed(&lookup, "RABBITMQ_CLOSE_TIMEOUT_MS")?
            .unwrap_or(defaults.close_timeout_ms),
        receive_timeout_ms: parsed(&lookup, "RABBITMQ_RECEIVE_TIMEOUT_MS")?
            .unwrap_or(defaults.receive_timeout_ms),
        drain_grace_ms: parsed(&lookup, "RABBITMQ_DRAIN_GRACE_MS")?
            .unwrap_or(defaults.drain_grace_ms),
        buffer_capacity: parsed(&lookup, "RABBITMQ_BUFFER_CAPACITY")?
            .unwrap_or(defaults.buffer_capacity),
    })
}

fn parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(name) {
        None => Ok(None),
        Some(value) if value.trim().is_empty() => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { name, value }),
    }
}

/// Exchange types and durabilities fall back to their default when unrecognised.
fn lenient<T>(lookup: &impl Fn(&str) -> Option<String>, name: &'static str) -> T
where
    T: FromStr + Default,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(value) if !value.trim().is_empty() => value.parse().unwrap_or_else(|e| {
            warn!("Ignoring {}: {}", name, e);
            T::default()
        }),
        _ => T::default(),
    }
}
