// src/rabbitmq/topology.rs
// Broker endpoint and topology value objects

use std::fmt;
use std::str::FromStr;

use lapin::uri::{AMQPAuthority, AMQPScheme, AMQPUri, AMQPUserInfo};
use lapin::ExchangeKind;
use serde::{Deserialize, Serialize};

use super::errors::ValidationError;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 5672;

/// Where the broker lives and how to authenticate against it.
///
/// Fields are private so a constructed value always satisfies
/// `host` non-empty and `port > 0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    host: String,
    port: u16,
    virtual_host: Option<String>,
    username: Option<String>,
    password: Option<String>,
    tls: bool,
}

impl ConnectionInfo {
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self, ValidationError> {
        let host = host.into();
        if host.trim().is_empty() {
            return Err(ValidationError::EmptyHost);
        }
        if port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(Self {
            host,
            port,
            virtual_host: None,
            username: None,
            password: None,
            tls: false,
        })
    }

    pub fn with_virtual_host(mut self, virtual_host: impl Into<String>) -> Self {
        let virtual_host = virtual_host.into();
        self.virtual_host = (!virtual_host.is_empty()).then_some(virtual_host);
        self
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn virtual_host(&self) -> Option<&str> {
        self.virtual_host.as_deref()
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    pub fn is_tls(&self) -> bool {
        self.tls
    }

    /// Builds the lapin URI. Credentials are only applied when both halves are present,
    /// otherwise the client library defaults are used.
    pub fn amqp_uri(&self) -> AMQPUri {
        let mut uri = AMQPUri {
            scheme: if self.tls {
                AMQPScheme::AMQPS
            } else {
                AMQPScheme::AMQP
            },
            authority: AMQPAuthority {
                host: self.host.clone(),
                port: self.port,
                ..AMQPAuthority::default()
            },
            ..AMQPUri::default()
        };
        if let Some(vhost) = &self.virtual_host {
            uri.vhost = vhost.clone();
        }
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            uri.authority.userinfo = AMQPUserInfo {
                username: username.clone(),
                password: password.clone(),
            };
        }
        uri
    }
}

impl Default for ConnectionInfo {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            virtual_host: None,
            username: None,
            password: None,
            tls: false,
        }
    }
}

// Never prints the password.
impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls { "amqps" } else { "amqp" };
        write!(f, "{}://", scheme)?;
        if let Some(username) = &self.username {
            write!(f, "{}@", username)?;
        }
        write!(f, "{}:{}", self.host, self.port)?;
        if let Some(vhost) = &self.virtual_host {
            write!(f, "/{}", vhost)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ExchangeType {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl ExchangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeType::Direct => "direct",
            ExchangeType::Fanout => "fanout",
            ExchangeType::Topic => "topic",
            ExchangeType::Headers => "headers",
        }
    }
}

impl FromStr for ExchangeType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(ExchangeType::Direct),
            "fanout" => Ok(ExchangeType::Fanout),
            "topic" => Ok(ExchangeType::Topic),
            "headers" => Ok(ExchangeType::Headers),
            _ => Err(ValidationError::UnknownExchangeType(s.to_string())),
        }
    }
}

impl TryFrom<String> for ExchangeType {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ExchangeType> for String {
    fn from(kind: ExchangeType) -> Self {
        kind.as_str().to_string()
    }
}

impl From<ExchangeType> for ExchangeKind {
    fn from(kind: ExchangeType) -> Self {
        match kind {
            ExchangeType::Direct => ExchangeKind::Direct,
            ExchangeType::Fanout => ExchangeKind::Fanout,
            ExchangeType::Topic => ExchangeKind::Topic,
            ExchangeType::Headers => ExchangeKind::Headers,
        }
    }
}

impl fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Durability {
    #[default]
    Transient,
    Durable,
}

impl Durability {
    pub fn is_durable(&self) -> bool {
        matches!(self, Durability::Durable)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Durability::Transient => "Transient",
            Durability::Durable => "Durable",
        }
    }
}

impl FromStr for Durability {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "transient" => Ok(Durability::Transient),
            "durable" => Ok(Durability::Durable),
            _ => Err(ValidationError::UnknownDurability(s.to_string())),
        }
    }
}

impl TryFrom<String> for Durability {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Durability> for String {
    fn from(durability: Durability) -> Self {
        durability.as_str().to_string()
    }
}

/// Exchange to declare on every (re)connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    name: String,
    kind: ExchangeType,
    durability: Durability,
    auto_delete: bool,
    routing_key: Option<String>,
}

impl ExchangeSpec {
    /// Transient, auto-deleting direct exchange with no routing key.
    pub fn new(name: impl Into<String>) -> Result<Self, ValidationError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ValidationError::EmptyExchangeName);
        }
        Ok(Self {
            name,
            kind: ExchangeType::default(),
            durability: Durability::default(),
            auto_delete: true,
            routing_key: None,
        })
    }

    pub fn with_kind(mut self, kind: ExchangeType) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_durability(mut self, durability: Durability) -> Self {
        self.durability = durability;
        self
    }

    pub fn with_auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        let routing_key = routing_key.into();
        self.routing_key = (!routing_key.is_empty()).then_some(routing_key);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ExchangeType {
        self.kind
    }

    pub fn is_durable(&self) -> bool {
        self.durability.is_durable()
    }

    pub fn is_auto_delete(&self) -> bool {
        self.auto_delete
    }

    pub fn routing_key(&self) -> Option<&str> {
        self.routing_key.as_deref()
    }

    /// Routing key used on the wire; a missing key routes with "".
    pub fn effective_routing_key(&self) -> &str {
        self.routing_key.as_deref().unwrap_or("")
    }
}

/// Queue declared and bound by consumers only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    name: String,
    durability: Durability,
    exclusive: bool,
    auto_delete: bool,
}

impl QueueSpec {
    /// Transient, non-exclusive, auto-deleting queue.
    pub fn new(name: impl Into<String>) -> Result<Self, ValidationError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ValidationError::EmptyQueueName);
        }
        Ok(Self {
            name,
            durability: Durability::default(),
            exclusive: false,
            auto_delete: true,
        })
    }

    pub fn with_durability(mut self, durability: Durability) -> Self {
        self.durability = durability;
        self
    }

    pub fn with_exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn with_auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_durable(&self) -> bool {
        self.durability.is_durable()
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn is_auto_delete(&self) -> bool {
        self.auto_delete
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_info_rejects_empty_host_and_zero_port() {
        assert_eq!(ConnectionInfo::new("  ", 5672), Err(ValidationError::EmptyHost));
        assert_eq!(ConnectionInfo::new("localhost", 0), Err(ValidationError::InvalidPort));
    }

    #[test]
    fn connection_info_defaults() {
        let info = ConnectionInfo::default();
        assert_eq!(info.host(), "localhost");
        assert_eq!(info.port(), 5672);
        assert!(info.virtual_host().is_none());
        assert!(!info.is_tls());
    }

    #[test]
    fn amqp_uri_carries_endpoint_vhost_and_credentials() {
        let info = ConnectionInfo::new("rabbit", 5671)
            .unwrap()
            .with_virtual_host("vhost_rust")
            .with_credentials("user_rust", "secret")
            .with_tls(true);

        let uri = info.amqp_uri();
        assert_eq!(uri.scheme, AMQPScheme::AMQPS);
        assert_eq!(uri.authority.host, "rabbit");
        assert_eq!(uri.authority.port, 5671);
        assert_eq!(uri.vhost, "vhost_rust");
        assert_eq!(uri.authority.userinfo.username, "user_rust");
        assert_eq!(uri.authority.userinfo.password, "secret");
    }

    #[test]
    fn display_hides_password() {
        let info = ConnectionInfo::new("rabbit", 5672)
            .unwrap()
            .with_credentials("user_rust", "secret");
        let shown = info.to_string();
        assert_eq!(shown, "amqp://user_rust@rabbit:5672");
        assert!(!shown.contains("secret"));
    }

    #[test]
    fn exchange_type_parses_ignoring_case() {
        assert_eq!("Fanout".parse::<ExchangeType>(), Ok(ExchangeType::Fanout));
        assert_eq!(" TOPIC ".parse::<ExchangeType>(), Ok(ExchangeType::Topic));
        assert!(matches!(
            "x-delayed".parse::<ExchangeType>(),
            Err(ValidationError::UnknownExchangeType(_))
        ));
        assert_eq!("durable".parse::<Durability>(), Ok(Durability::Durable));
    }

    #[test]
    fn exchange_spec_requires_a_name() {
        assert_eq!(ExchangeSpec::new(""), Err(ValidationError::EmptyExchangeName));

        let exchange = ExchangeSpec::new("ex1").unwrap().with_routing_key("");
        assert_eq!(exchange.kind(), ExchangeType::Direct);
        assert!(!exchange.is_durable());
        assert!(exchange.is_auto_delete());
        assert_eq!(exchange.routing_key(), None);
        assert_eq!(exchange.effective_routing_key(), "");
    }

    #[test]
    fn queue_spec_defaults() {
        assert_eq!(QueueSpec::new(" "), Err(ValidationError::EmptyQueueName));

        let queue = QueueSpec::new("q1").unwrap();
        assert!(!queue.is_durable());
        assert!(!queue.is_exclusive());
        assert!(queue.is_auto_delete());
    }
}
