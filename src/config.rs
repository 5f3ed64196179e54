// src/config.rs
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::rabbitmq::settings::{
    DEFAULT_BUFFER_CAPACITY, DEFAULT_CLOSE_TIMEOUT_MS, DEFAULT_CONNECT_TIMEOUT_MS,
    DEFAULT_DRAIN_GRACE_MS, DEFAULT_RECEIVE_TIMEOUT_MS, DEFAULT_RECONNECT_INTERVAL_MS,
};
use crate::rabbitmq::topology::{DEFAULT_HOST, DEFAULT_PORT};
use crate::rabbitmq::{
    ConnectionInfo, Durability, ExchangeSpec, ExchangeType, QueueSpec, TransportSettings,
    ValidationError, DEFAULT_PREFETCH_COUNT,
};

pub const CONFIG_FILE_NAME: &str = "rabbitmq-transport.json";

/// Every option a host can set for one producer or consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default)]
    pub ssl: bool,

    #[serde(default)]
    pub exchange_name: String,
    #[serde(default)]
    pub exchange_type: ExchangeType,
    #[serde(default)]
    pub exchange_durability: Durability,
    #[serde(default = "default_true")]
    pub exchange_auto_delete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_name: Option<String>,
    #[serde(default)]
    pub queue_durability: Durability,
    #[serde(default)]
    pub queue_exclusive: bool,
    #[serde(default = "default_true")]
    pub queue_auto_delete: bool,
    #[serde(default = "default_prefetch_count")]
    pub prefetch_count: u16,

    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,
    #[serde(default = "default_receive_timeout_ms")]
    pub receive_timeout_ms: u64,
    #[serde(default = "default_drain_grace_ms")]
    pub drain_grace_ms: u64,
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
}

// Default values
fn default_host() -> String { DEFAULT_HOST.to_string() }
fn default_port() -> u16 { DEFAULT_PORT }
fn default_true() -> bool { true }
fn default_prefetch_count() -> u16 { DEFAULT_PREFETCH_COUNT }
fn default_reconnect_interval_ms() -> u64 { DEFAULT_RECONNECT_INTERVAL_MS }
fn default_connect_timeout_ms() -> u64 { DEFAULT_CONNECT_TIMEOUT_MS }
fn default_close_timeout_ms() -> u64 { DEFAULT_CLOSE_TIMEOUT_MS }
fn default_receive_timeout_ms() -> u64 { DEFAULT_RECEIVE_TIMEOUT_MS }
fn default_drain_grace_ms() -> u64 { DEFAULT_DRAIN_GRACE_MS }
fn default_buffer_capacity() -> usize { DEFAULT_BUFFER_CAPACITY }

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            virtual_host: None,
            username: None,
            password: None,
            ssl: false,
            exchange_name: String::new(),
            exchange_type: ExchangeType::default(),
            exchange_durability: Durability::default(),
            exchange_auto_delete: true,
            routing_key: None,
            queue_name: None,
            queue_durability: Durability::default(),
            queue_exclusive: false,
            queue_auto_delete: true,
            prefetch_count: default_prefetch_count(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            close_timeout_ms: default_close_timeout_ms(),
            receive_timeout_ms: default_receive_timeout_ms(),
            drain_grace_ms: default_drain_grace_ms(),
            buffer_capacity: default_buffer_capacity(),
        }
    }
}

impl TransportConfig {
    pub fn connection_info(&self) -> Result<ConnectionInfo, ValidationError> {
        let mut info = ConnectionInfo::new(self.host.clone(), self.port)?.with_tls(self.ssl);
        if let Some(vhost) = &self.virtual_host {
            info = info.with_virtual_host(vhost.clone());
        }
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            info = info.with_credentials(username.clone(), password.clone());
        }
        Ok(info)
    }

    pub fn exchange_spec(&self) -> Result<ExchangeSpec, ValidationError> {
        let mut exchange = ExchangeSpec::new(self.exchange_name.clone())?
            .with_kind(self.exchange_type)
            .with_durability(self.exchange_durability)
            .with_auto_delete(self.exchange_auto_delete);
        if let Some(key) = &self.routing_key {
            exchange = exchange.with_routing_key(key.clone());
        }
        Ok(exchange)
    }

    /// `None` when no queue is configured, as for a producer.
    pub fn queue_spec(&self) -> Result<Option<QueueSpec>, ValidationError> {
        self.queue_name
            .as_ref()
            .map(|name| {
                Ok(QueueSpec::new(name.clone())?
                    .with_durability(self.queue_durability)
                    .with_exclusive(self.queue_exclusive)
                    .with_auto_delete(self.queue_auto_delete))
            })
            .transpose()
    }

    /// The queue a consumer reads from; consumers cannot run without one.
    pub fn inbound_queue(&self) -> Result<QueueSpec, ValidationError> {
        self.queue_spec()?.ok_or(ValidationError::MissingQueue)
    }

    pub fn settings(&self) -> TransportSettings {
        TransportSettings {
            reconnect_interval: Duration::from_millis(self.reconnect_interval_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            close_timeout: Duration::from_millis(self.close_timeout_ms),
            receive_timeout: Duration::from_millis(self.receive_timeout_ms),
            drain_grace: Duration::from_millis(self.drain_grace_ms),
            buffer_capacity: self.buffer_capacity,
        }
    }

    /// Checks every value object the config converts into.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.connection_info()?;
        self.exchange_spec()?;
        self.queue_spec()?;
        Ok(())
    }
}

// Configuration loading and management functions
pub fn find_config_file() -> Result<PathBuf> {
    let locations = [
        ("Current directory", PathBuf::from(CONFIG_FILE_NAME)),
        ("Config directory", Path::new("config").join(CONFIG_FILE_NAME)),
    ];

    for (location_name, path) in locations.iter() {
        if path.exists() {
            debug!("Found config file in {}: {}", location_name, path.display());
            return Ok(path.clone());
        }
    }

    if let Some(home_dir) = home::home_dir() {
        let home_config = home_dir.join(format!(".{}", CONFIG_FILE_NAME));
        if home_config.exists() {
            debug!("Found config file in home directory: {}", home_config.display());
            return Ok(home_config);
        }
    }

    Err(anyhow!(
        "Could not find {} in the current directory, ./config or the home directory",
        CONFIG_FILE_NAME
    ))
}

pub fn load_config() -> Result<TransportConfig> {
    let config_path = find_config_file()?;
    load_config_from(&config_path)
}

pub fn load_config_from(path: &Path) -> Result<TransportConfig> {
    let config_content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;

    let config: TransportConfig = serde_json::from_str(&config_content)
        .context("Configuration file contains invalid JSON or unknown option values")?;

    config
        .validate()
        .with_context(|| format!("Invalid configuration in {}", path.display()))?;

    Ok(config)
}

pub fn create_default_config_file(path: &Path) -> Result<()> {
    let default_config = TransportConfig {
        exchange_name: "ex1".to_string(),
        routing_key: Some("k1".to_string()),
        queue_name: Some("q1".to_string()),
        ..TransportConfig::default()
    };

    let json = serde_json::to_string_pretty(&default_config)
        .context("Failed to serialize default configuration")?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory at {}", parent.display()))?;
        }
    }

    fs::write(path, json)
        .with_context(|| format!("Failed to write configuration to {}", path.display()))?;

    info!("Created default configuration file at: {}", path.display());
    Ok(())
}
