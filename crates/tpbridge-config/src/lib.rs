//! Configuration file support for tpbridge.
//!
//! A TOML file plus `TPBRIDGE_`-prefixed environment overrides, credential
//! resolution for the MQTT password, and translation into
//! `tpbridge_core::BridgeConfig`.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use tpbridge_core::{BridgeConfig, BridgeError, QoS, ReconnectConfig, TlsMode};

/// Fallback environment variable for the MQTT password.
pub const PASSWORD_ENV: &str = "TPBRIDGE_MQTT_PASSWORD";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub mqtt: MqttSection,

    #[serde(default)]
    pub platform: PlatformSection,

    #[serde(default)]
    pub callback: CallbackSection,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct MqttSection {
    /// Broker URI (e.g., "tcp://127.0.0.1:1883").
    #[serde(default = "default_broker")]
    pub broker: String,

    /// Client identifier; generated when absent.
    pub client_id: Option<String>,

    pub username: Option<String>,

    /// Password (plaintext, prefer `password_env`).
    pub password: Option<String>,

    /// Environment variable name containing the password.
    pub password_env: Option<String>,

    #[serde(default = "default_qos")]
    pub qos: u8,

    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    #[serde(default = "default_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Reconnect backoff base, in milliseconds.
    #[serde(default = "default_reconnect_initial")]
    pub reconnect_initial_ms: u64,

    /// Reconnect backoff cap, in milliseconds.
    #[serde(default = "default_reconnect_max")]
    pub reconnect_max_ms: u64,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            broker: default_broker(),
            client_id: None,
            username: None,
            password: None,
            password_env: None,
            qos: default_qos(),
            keep_alive_secs: default_keep_alive(),
            connect_timeout_secs: default_timeout(),
            queue_capacity: default_queue_capacity(),
            reconnect_initial_ms: default_reconnect_initial(),
            reconnect_max_ms: default_reconnect_max(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PlatformSection {
    /// REST API base URL (e.g., "http://127.0.0.1:9999").
    pub api_url: Option<String>,

    pub service_identifier: Option<String>,

    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_heartbeat")]
    pub heartbeat_secs: u64,

    /// Accept any TLS certificate.
    #[serde(default)]
    pub insecure: bool,

    /// Path to a custom CA certificate.
    pub ca_cert: Option<PathBuf>,
}

impl Default for PlatformSection {
    fn default() -> Self {
        Self {
            api_url: None,
            service_identifier: None,
            timeout_secs: default_timeout(),
            heartbeat_secs: default_heartbeat(),
            insecure: false,
            ca_cert: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CallbackSection {
    /// Listen address for platform callbacks (e.g., "0.0.0.0:8080").
    pub listen: Option<String>,

    #[serde(default = "default_handler_timeout")]
    pub handler_timeout_secs: u64,
}

impl Default for CallbackSection {
    fn default() -> Self {
        Self {
            listen: None,
            handler_timeout_secs: default_handler_timeout(),
        }
    }
}

fn default_broker() -> String {
    "tcp://127.0.0.1:1883".into()
}
fn default_qos() -> u8 {
    1
}
fn default_keep_alive() -> u64 {
    60
}
fn default_timeout() -> u64 {
    10
}
fn default_queue_capacity() -> usize {
    256
}
fn default_reconnect_initial() -> u64 {
    1_000
}
fn default_reconnect_max() -> u64 {
    60_000
}
fn default_heartbeat() -> u64 {
    30
}
fn default_handler_timeout() -> u64 {
    5
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("io", "thingspanel", "tpbridge").map_or_else(
        || {
            let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
            p.push(".config");
            p.push("tpbridge");
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

// ── Config loading ──────────────────────────────────────────────────

/// Load the config from the canonical path + environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load the config from `path` + environment. A missing file yields the
/// defaults. Environment keys nest with `__`, e.g. `TPBRIDGE_MQTT__BROKER`.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("TPBRIDGE_").split("__"));

    let config: Config = figment.extract()?;
    Ok(config)
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write it to `path`.
pub fn save_config_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

/// Serialize config to TOML and write it to the canonical config path.
pub fn save_config(cfg: &Config) -> Result<(), ConfigError> {
    save_config_to(cfg, &config_path())
}

// ── Credential resolution ───────────────────────────────────────────

/// Resolve the MQTT password: the variable named by `password_env`, then
/// `TPBRIDGE_MQTT_PASSWORD`, then the plaintext value.
pub fn resolve_password(mqtt: &MqttSection) -> Option<SecretString> {
    if let Some(ref env_name) = mqtt.password_env {
        if let Ok(val) = std::env::var(env_name) {
            return Some(SecretString::from(val));
        }
    }

    if let Ok(val) = std::env::var(PASSWORD_ENV) {
        return Some(SecretString::from(val));
    }

    mqtt.password.clone().map(SecretString::from)
}

// ── Translation ─────────────────────────────────────────────────────

/// Build a validated `BridgeConfig` from the file configuration.
pub fn to_bridge_config(cfg: &Config) -> Result<BridgeConfig, ConfigError> {
    let mqtt = &cfg.mqtt;
    let platform = &cfg.platform;

    let qos = match mqtt.qos {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        other => {
            return Err(ConfigError::Validation {
                field: "mqtt.qos".into(),
                reason: format!("expected 0, 1 or 2, got {other}"),
            });
        }
    };

    let tls = if platform.insecure {
        TlsMode::DangerAcceptInvalid
    } else if let Some(ref ca_path) = platform.ca_cert {
        TlsMode::CustomCa(ca_path.clone())
    } else {
        TlsMode::System
    };

    let mut builder = BridgeConfig::builder(mqtt.broker.clone())
        .default_qos(qos)
        .tls(tls)
        .keep_alive(Duration::from_secs(mqtt.keep_alive_secs))
        .connect_timeout(Duration::from_secs(mqtt.connect_timeout_secs))
        .queue_capacity(mqtt.queue_capacity)
        .reconnect(ReconnectConfig {
            initial_delay: Duration::from_millis(mqtt.reconnect_initial_ms),
            max_delay: Duration::from_millis(mqtt.reconnect_max_ms),
        })
        .api_timeout(Duration::from_secs(platform.timeout_secs))
        .heartbeat_interval(Duration::from_secs(platform.heartbeat_secs))
        .handler_timeout(Duration::from_secs(cfg.callback.handler_timeout_secs));

    if let Some(ref client_id) = mqtt.client_id {
        builder = builder.client_id(client_id.clone());
    }
    if let Some(ref username) = mqtt.username {
        let password = resolve_password(mqtt).unwrap_or_else(|| SecretString::from(String::new()));
        builder = builder.credentials(username.clone(), password);
    }
    if let Some(ref url) = platform.api_url {
        builder = builder.api_base_url(url.clone());
    }
    if let Some(ref service) = platform.service_identifier {
        builder = builder.service_identifier(service.clone());
    }
    if let Some(ref listen) = cfg.callback.listen {
        let addr: SocketAddr = listen.parse().map_err(|_| ConfigError::Validation {
            field: "callback.listen".into(),
            reason: format!("invalid socket address: {listen}"),
        })?;
        builder = builder.callback_addr(addr);
    }

    Ok(builder.build()?)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use figment::Jail;
    use pretty_assertions::assert_eq;
    use secrecy::ExposeSecret;

    const SAMPLE: &str = r#"
        [mqtt]
        broker = "mqtt://broker.local:1884"
        client_id = "plugin-modbus"
        username = "root"
        password = "plain"
        qos = 0

        [platform]
        api_url = "http://platform.local:9999"
        service_identifier = "modbus"
        heartbeat_secs = 15

        [callback]
        listen = "127.0.0.1:8080"
    "#;

    #[test]
    fn loads_file_and_env_overrides() {
        Jail::expect_with(|jail| {
            jail.create_file("config.toml", SAMPLE)?;
            jail.set_env("TPBRIDGE_PLATFORM__SERVICE_IDENTIFIER", "opcua");

            let cfg = load_config_from(Path::new("config.toml")).unwrap();
            assert_eq!(cfg.mqtt.broker, "mqtt://broker.local:1884");
            assert_eq!(cfg.mqtt.qos, 0);
            assert_eq!(cfg.mqtt.queue_capacity, 256);
            assert_eq!(cfg.platform.service_identifier.as_deref(), Some("opcua"));
            assert_eq!(cfg.platform.heartbeat_secs, 15);
            assert_eq!(cfg.callback.handler_timeout_secs, 5);
            Ok(())
        });
    }

    #[test]
    fn missing_file_yields_defaults() {
        Jail::expect_with(|_| {
            let cfg = load_config_from(Path::new("absent.toml")).unwrap();
            assert_eq!(cfg, Config::default());
            Ok(())
        });
    }

    #[test]
    fn password_chain_prefers_named_env() {
        Jail::expect_with(|jail| {
            let mut mqtt = MqttSection {
                password: Some("plain".into()),
                password_env: Some("MY_BROKER_PW".into()),
                ..MqttSection::default()
            };
            assert_eq!(resolve_password(&mqtt).unwrap().expose_secret(), "plain");

            jail.set_env(PASSWORD_ENV, "from-default-env");
            assert_eq!(
                resolve_password(&mqtt).unwrap().expose_secret(),
                "from-default-env"
            );

            jail.set_env("MY_BROKER_PW", "from-named-env");
            assert_eq!(
                resolve_password(&mqtt).unwrap().expose_secret(),
                "from-named-env"
            );

            mqtt.password_env = None;
            assert_eq!(
                resolve_password(&mqtt).unwrap().expose_secret(),
                "from-default-env"
            );
            Ok(())
        });
    }

    #[test]
    fn translates_into_bridge_config() {
        Jail::expect_with(|jail| {
            jail.create_file("config.toml", SAMPLE)?;
            let cfg = load_config_from(Path::new("config.toml")).unwrap();
            let bridge = to_bridge_config(&cfg).unwrap();

            assert_eq!(bridge.broker(), "mqtt://broker.local:1884");
            assert_eq!(bridge.client_id(), "plugin-modbus");
            assert_eq!(bridge.username(), Some("root"));
            assert!(bridge.has_password());
            assert_eq!(bridge.default_qos(), QoS::AtMostOnce);
            assert_eq!(bridge.api_base_url(), Some("http://platform.local:9999"));
            assert_eq!(bridge.heartbeat_interval(), Duration::from_secs(15));
            assert_eq!(bridge.callback_addr(), Some("127.0.0.1:8080".parse().unwrap()));
            Ok(())
        });
    }

    #[test]
    fn rejects_bad_values() {
        let mut cfg = Config::default();
        cfg.mqtt.qos = 3;
        assert!(matches!(
            to_bridge_config(&cfg),
            Err(ConfigError::Validation { ref field, .. }) if field == "mqtt.qos"
        ));

        let mut cfg = Config::default();
        cfg.callback.listen = Some("not-an-addr".into());
        assert!(matches!(
            to_bridge_config(&cfg),
            Err(ConfigError::Validation { .. })
        ));

        let mut cfg = Config::default();
        cfg.platform.service_identifier = Some("bad/id".into());
        assert!(matches!(to_bridge_config(&cfg), Err(ConfigError::Bridge(_))));
    }

    #[test]
    fn save_round_trips_through_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut cfg = Config::default();
        cfg.platform.api_url = Some("https://tp.example".into());
        cfg.mqtt.username = Some("user".into());
        save_config_to(&cfg, &path).unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("api_url = \"https://tp.example\""));
        let parsed: Config = toml::from_str(&written).unwrap();
        assert_eq!(parsed, cfg);
    }
}
