// src/main.rs
// Demo host: publishes stdin lines and prints whatever arrives on the configured queue.
//
//   rabbitmq-transport [config.json]
//   rabbitmq-transport --init-config [path]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use rabbitmq_transport::config::{self, TransportConfig, CONFIG_FILE_NAME};
use rabbitmq_transport::env;
use rabbitmq_transport::rabbitmq::{
    self, ComponentState, ConnectionBroker, ConnectionStatus, Consumer, Event, EventBus,
    EventSource, Producer,
};

/// Either side of the transport, driven the same way by the supervisor.
#[derive(Clone)]
enum Endpoint {
    Producer(Arc<Producer>),
    Consumer(Arc<Consumer>),
}

impl Endpoint {
    fn role(&self) -> &'static str {
        match self {
            Endpoint::Producer(_) => "producer",
            Endpoint::Consumer(_) => "consumer",
        }
    }

    fn events(&self) -> &EventBus {
        match self {
            Endpoint::Producer(p) => p.events(),
            Endpoint::Consumer(c) => c.events(),
        }
    }

    fn broker(&self) -> &ConnectionBroker {
        match self {
            Endpoint::Producer(p) => p.broker(),
            Endpoint::Consumer(c) => c.broker(),
        }
    }

    async fn connect(&self) -> rabbitmq::Result<()> {
        match self {
            Endpoint::Producer(p) => p.connect().await,
            Endpoint::Consumer(c) => c.connect().await,
        }
    }

    async fn disconnect(&self, reason: &str) {
        match self {
            Endpoint::Producer(p) => p.disconnect(reason).await,
            Endpoint::Consumer(c) => c.disconnect(reason).await,
        }
    }

    async fn shutdown(&self) {
        match self {
            Endpoint::Producer(p) => p.shutdown().await,
            Endpoint::Consumer(c) => c.shutdown().await,
        }
    }
}

/// Connects the endpoint whenever its broker (re)connects and releases its channel when
/// the broker connection drops. Event listeners only forward; the work happens here.
fn supervise(endpoint: Endpoint) -> JoinHandle<()> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
    endpoint.events().subscribe(move |event: &Event| {
        let _ = tx.send(event.clone());
    });

    tokio::spawn(async move {
        let role = endpoint.role();
        // the broker may have connected before we subscribed
        if endpoint.broker().is_connected() {
            if let Err(e) = endpoint.connect().await {
                warn!(role, "Initial connect failed: {}", e);
            }
        }

        while let Some(event) = rx.recv().await {
            match (event.source, event.status) {
                (EventSource::Monitor, ConnectionStatus::Created) => {
                    match endpoint.connect().await {
                        Ok(()) => info!(role, "Connected"),
                        Err(e) => warn!(role, "Connect failed: {}", e),
                    }
                }
                (EventSource::Monitor, ConnectionStatus::Disconnected) => {
                    endpoint.disconnect(&event.details).await;
                    warn!(role, "Disconnected: {}", event.details);
                }
                (EventSource::Monitor, ConnectionStatus::CreationFailed) => {
                    warn!(role, "Broker unavailable, retrying: {}", event.details);
                }
                (EventSource::Component, ConnectionStatus::Shutdown) => break,
                _ => debug!(role, "{}", event),
            }
        }
    })
}

fn load_transport_config(path: Option<&String>) -> Result<TransportConfig> {
    if let Some(path) = path {
        return config::load_config_from(Path::new(path));
    }
    match config::load_config() {
        Ok(config) => Ok(config),
        Err(e) => {
            debug!("{:#}", e);
            env::load().context("No configuration file found and the RABBITMQ_* environment is incomplete")
        }
    }
}

fn print_deliveries(consumer: Arc<Consumer>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while consumer.state() != ComponentState::Shutdown {
            if let Some(body) = consumer.receive().await {
                println!("<< {}", String::from_utf8_lossy(&body));
            }
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.first().map(String::as_str) == Some("--init-config") {
        let path = args
            .get(1)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));
        return config::create_default_config_file(&path);
    }

    let config = load_transport_config(args.first())?;
    let info = config.connection_info().context("Invalid connection settings")?;
    let exchange = config.exchange_spec().context("Invalid exchange settings")?;
    let settings = config.settings();
    info!("Using RabbitMQ at {} with exchange '{}'", info, exchange.name());

    let producer = Arc::new(Producer::new(info.clone(), exchange.clone(), &settings));
    let consumer = match config.queue_spec().context("Invalid queue settings")? {
        Some(queue) => {
            let consumer = Consumer::new(info, exchange, queue, &settings);
            consumer.set_prefetch_count(config.prefetch_count);
            Some(Arc::new(consumer))
        }
        None => None,
    };

    let mut endpoints = vec![Endpoint::Producer(Arc::clone(&producer))];
    let mut tasks = vec![supervise(endpoints[0].clone())];
    if let Some(consumer) = &consumer {
        let endpoint = Endpoint::Consumer(Arc::clone(consumer));
        tasks.push(supervise(endpoint.clone()));
        tasks.push(print_deliveries(Arc::clone(consumer)));
        endpoints.push(endpoint);
    }

    info!("Type a line to publish it; Ctrl+C to quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, shutting down");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if let Err(e) = producer.send(line.as_bytes()).await {
                        warn!("Not sent: {}", e);
                    }
                }
                Ok(None) => {
                    info!("stdin closed; waiting for Ctrl+C");
                    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;
                    break;
                }
                Err(e) => {
                    error!("Failed to read stdin: {}", e);
                    break;
                }
            }
        }
    }

    for endpoint in &endpoints {
        endpoint.shutdown().await;
    }
    for task in tasks {
        if timeout(settings.close_timeout + settings.receive_timeout, task).await.is_err() {
            warn!("Background task did not finish in time");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_config_path_must_exist() {
        let missing = format!("/nonexistent/{}", CONFIG_FILE_NAME);
        assert!(load_transport_config(Some(&missing)).is_err());
    }
}
