// Broker endpoint and session tuning.

use std::time::Duration;

use secrecy::SecretString;
use url::Url;

use crate::error::ConnectError;
use crate::mqtt::backoff::ReconnectConfig;

pub const DEFAULT_PORT: u16 = 1883;
pub const DEFAULT_TLS_PORT: u16 = 8883;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Parsed broker address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl Endpoint {
    /// Parse a broker URI such as `tcp://localhost:1883` or
    /// `mqtts://broker.example.com`.
    ///
    /// Accepted schemes: `tcp`, `mqtt` (plain) and `ssl`, `mqtts`, `tls`.
    /// A missing port falls back to 1883 or 8883 depending on the scheme.
    pub fn parse(uri: &str) -> Result<Self, ConnectError> {
        let invalid = |reason: &str| ConnectError::InvalidEndpoint {
            endpoint: uri.to_owned(),
            reason: reason.to_owned(),
        };

        let url = Url::parse(uri.trim()).map_err(|e| invalid(&e.to_string()))?;
        let tls = match url.scheme() {
            "tcp" | "mqtt" => false,
            "ssl" | "mqtts" | "tls" => true,
            other => return Err(invalid(&format!("unsupported scheme '{other}'"))),
        };
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("missing host"))?;
        let port = url
            .port()
            .unwrap_or(if tls { DEFAULT_TLS_PORT } else { DEFAULT_PORT });

        Ok(Self {
            host: host.trim_start_matches('[').trim_end_matches(']').to_owned(),
            port,
            tls,
        })
    }
}

/// Everything the session needs to open a broker connection.
#[derive(Debug, Clone)]
pub struct MqttOptions {
    /// Broker URI, see [`Endpoint::parse`].
    pub endpoint: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<SecretString>,
    pub keep_alive: Duration,
    /// How long `connect` waits for the broker's CONNACK.
    pub connect_timeout: Duration,
    /// Publishes buffered while reconnecting; the oldest is dropped when full.
    pub queue_capacity: usize,
    pub clean_session: bool,
    pub reconnect: ReconnectConfig,
}

impl MqttOptions {
    pub fn new(endpoint: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            client_id: client_id.into(),
            username: None,
            password: None,
            keep_alive: DEFAULT_KEEP_ALIVE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            clean_session: true,
            reconnect: ReconnectConfig::default(),
        }
    }

    #[must_use]
    pub fn with_credentials(mut self, username: impl Into<String>, password: SecretString) -> Self {
        self.username = Some(username.into());
        self.password = Some(password);
        self
    }
}
