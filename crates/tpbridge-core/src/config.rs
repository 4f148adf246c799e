// ── Runtime bridge configuration ──
//
// Describes *how* the bridge talks to the broker and the platform. It
// carries credentials and tuning but never touches disk; the config crate
// or the application builds one and hands it to `Bridge`.

use std::net::SocketAddr;
use std::time::Duration;

use secrecy::SecretString;
use tpbridge_api::mqtt::{Endpoint, MqttOptions, ReconnectConfig};
use tpbridge_api::{QoS, TlsMode, TransportConfig};
use url::Url;

use crate::error::BridgeError;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_API_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// MQTT client ids longer than this are rejected by many brokers.
const MAX_CLIENT_ID_LEN: usize = 65_535;

/// Immutable bridge configuration, validated by [`BridgeConfigBuilder::build`].
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    broker: String,
    api_base_url: Option<String>,
    client_id: String,
    username: Option<String>,
    password: Option<SecretString>,
    service_identifier: Option<String>,
    connect_timeout: Duration,
    api_timeout: Duration,
    handler_timeout: Duration,
    heartbeat_interval: Duration,
    keep_alive: Duration,
    queue_capacity: usize,
    default_qos: QoS,
    tls: TlsMode,
    reconnect: ReconnectConfig,
    callback_addr: Option<SocketAddr>,
}

impl BridgeConfig {
    /// Start building a configuration for the broker at `broker`
    /// (e.g. `tcp://localhost:1883`).
    pub fn builder(broker: impl Into<String>) -> BridgeConfigBuilder {
        BridgeConfigBuilder::new(broker)
    }

    pub fn broker(&self) -> &str {
        &self.broker
    }

    pub fn api_base_url(&self) -> Option<&str> {
        self.api_base_url.as_deref()
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn has_password(&self) -> bool {
        self.password.is_some()
    }

    pub fn service_identifier(&self) -> Option<&str> {
        self.service_identifier.as_deref()
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn api_timeout(&self) -> Duration {
        self.api_timeout
    }

    pub fn handler_timeout(&self) -> Duration {
        self.handler_timeout
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    pub fn keep_alive(&self) -> Duration {
        self.keep_alive
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    pub fn default_qos(&self) -> QoS {
        self.default_qos
    }

    pub fn tls(&self) -> &TlsMode {
        &self.tls
    }

    pub fn reconnect(&self) -> ReconnectConfig {
        self.reconnect
    }

    pub fn callback_addr(&self) -> Option<SocketAddr> {
        self.callback_addr
    }

    /// Session options derived from this configuration.
    pub fn mqtt_options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.broker, &self.client_id);
        options.username.clone_from(&self.username);
        options.password.clone_from(&self.password);
        options.keep_alive = self.keep_alive;
        options.connect_timeout = self.connect_timeout;
        options.queue_capacity = self.queue_capacity;
        options.reconnect = self.reconnect;
        options
    }

    /// HTTP transport settings for the platform client.
    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            tls: self.tls.clone(),
            timeout: self.api_timeout,
        }
    }
}

/// Consuming builder for [`BridgeConfig`].
#[derive(Debug, Clone)]
pub struct BridgeConfigBuilder {
    config: BridgeConfig,
}

impl BridgeConfigBuilder {
    fn new(broker: impl Into<String>) -> Self {
        Self {
            config: BridgeConfig {
                broker: broker.into(),
                api_base_url: None,
                client_id: default_client_id(),
                username: None,
                password: None,
                service_identifier: None,
                connect_timeout: DEFAULT_CONNECT_TIMEOUT,
                api_timeout: DEFAULT_API_TIMEOUT,
                handler_timeout: DEFAULT_HANDLER_TIMEOUT,
                heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
                keep_alive: DEFAULT_KEEP_ALIVE,
                queue_capacity: DEFAULT_QUEUE_CAPACITY,
                default_qos: QoS::AtLeastOnce,
                tls: TlsMode::default(),
                reconnect: ReconnectConfig::default(),
                callback_addr: None,
            },
        }
    }

    pub fn api_base_url(mut self, url: impl Into<String>) -> Self {
        self.config.api_base_url = Some(url.into());
        self
    }

    pub fn credentials(mut self, username: impl Into<String>, password: SecretString) -> Self {
        self.config.username = Some(username.into());
        self.config.password = Some(password);
        self
    }

    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.config.client_id = client_id.into();
        self
    }

    pub fn service_identifier(mut self, service_identifier: impl Into<String>) -> Self {
        self.config.service_identifier = Some(service_identifier.into());
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn api_timeout(mut self, timeout: Duration) -> Self {
        self.config.api_timeout = timeout;
        self
    }

    pub fn handler_timeout(mut self, timeout: Duration) -> Self {
        self.config.handler_timeout = timeout;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.config.keep_alive = keep_alive;
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    pub fn default_qos(mut self, qos: QoS) -> Self {
        self.config.default_qos = qos;
        self
    }

    pub fn tls(mut self, tls: TlsMode) -> Self {
        self.config.tls = tls;
        self
    }

    pub fn reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.config.reconnect = reconnect;
        self
    }

    pub fn callback_addr(mut self, addr: SocketAddr) -> Self {
        self.config.callback_addr = Some(addr);
        self
    }

    /// Validate and freeze the configuration.
    pub fn build(self) -> Result<BridgeConfig, BridgeError> {
        let config = self.config;

        Endpoint::parse(&config.broker).map_err(|e| BridgeError::config(e.to_string()))?;

        if let Some(url) = &config.api_base_url {
            let parsed = Url::parse(url.trim())
                .map_err(|e| BridgeError::config(format!("invalid API base URL '{url}': {e}")))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(BridgeError::config(format!(
                    "API base URL '{url}' must use http or https"
                )));
            }
        }

        if config.client_id.is_empty() {
            return Err(BridgeError::config("client id must not be empty"));
        }
        if config.client_id.len() > MAX_CLIENT_ID_LEN {
            return Err(BridgeError::config("client id is too long"));
        }

        if let Some(service) = &config.service_identifier {
            if service.is_empty() || service.contains(['/', '+', '#']) {
                return Err(BridgeError::config(format!(
                    "service identifier '{service}' must be a single non-empty topic level"
                )));
            }
        }

        if config.password.is_some() && config.username.is_none() {
            return Err(BridgeError::config("password given without a username"));
        }

        for (name, value) in [
            ("connect timeout", config.connect_timeout),
            ("API timeout", config.api_timeout),
            ("handler timeout", config.handler_timeout),
            ("heartbeat interval", config.heartbeat_interval),
        ] {
            if value.is_zero() {
                return Err(BridgeError::config(format!("{name} must be greater than zero")));
            }
        }

        if config.queue_capacity == 0 {
            return Err(BridgeError::config("queue capacity must be at least 1"));
        }

        Ok(config)
    }
}

/// `tp-client-{unix millis}`.
pub fn default_client_id() -> String {
    format!("tp-client-{}", chrono::Utc::now().timestamp_millis())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn defaults() {
        let config = BridgeConfig::builder("tcp://localhost:1883").build().unwrap();
        assert!(config.client_id().starts_with("tp-client-"));
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(config.handler_timeout(), Duration::from_secs(5));
        assert_eq!(config.queue_capacity(), 256);
        assert_eq!(config.default_qos(), QoS::AtLeastOnce);
        assert!(config.api_base_url().is_none());
    }

    #[test]
    fn mqtt_options_carry_credentials() {
        let config = BridgeConfig::builder("mqtts://broker")
            .client_id("plugin-1")
            .credentials("user", SecretString::from("pw".to_string()))
            .queue_capacity(8)
            .build()
            .unwrap();

        let options = config.mqtt_options();
        assert_eq!(options.client_id, "plugin-1");
        assert_eq!(options.username.as_deref(), Some("user"));
        assert_eq!(options.password.unwrap().expose_secret(), "pw");
        assert_eq!(options.queue_capacity, 8);
    }

    #[test]
    fn rejects_invalid_values() {
        let cases = [
            BridgeConfig::builder("not a uri"),
            BridgeConfig::builder("tcp://localhost").api_base_url("ftp://platform"),
            BridgeConfig::builder("tcp://localhost").client_id(""),
            BridgeConfig::builder("tcp://localhost").service_identifier("a/b"),
            BridgeConfig::builder("tcp://localhost").queue_capacity(0),
            BridgeConfig::builder("tcp://localhost").handler_timeout(Duration::ZERO),
        ];
        for builder in cases {
            let err = builder.build().unwrap_err();
            assert!(matches!(err, BridgeError::Config { .. }), "{err}");
        }
    }
}
