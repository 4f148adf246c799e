//! CLI error types with miette diagnostics.

use miette::Diagnostic;
use thiserror::Error;

use tpbridge_config::ConfigError;
use tpbridge_core::{BridgeError, ConnectError};

pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const CONFIG: i32 = 2;
    pub const AUTH: i32 = 3;
    pub const CONNECTION: i32 = 7;
    pub const TIMEOUT: i32 = 8;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    #[error("Invalid configuration ({path})")]
    #[diagnostic(
        code(tpbridge::config),
        help(
            "Fix the file or the TPBRIDGE_* environment overrides.\n\
             Run: tpbridge check --config {path}"
        )
    )]
    Config {
        path: String,
        #[source]
        source: ConfigError,
    },

    #[error("Broker at {broker} rejected the credentials")]
    #[diagnostic(
        code(tpbridge::auth_failed),
        help(
            "Check mqtt.username and the password chain:\n\
             mqtt.password_env, TPBRIDGE_MQTT_PASSWORD, then mqtt.password."
        )
    )]
    AuthFailed {
        broker: String,
        #[source]
        source: BridgeError,
    },

    #[error("Could not connect to broker at {broker}")]
    #[diagnostic(
        code(tpbridge::connection_failed),
        help("Check that the broker is running and reachable from this host.")
    )]
    ConnectionFailed {
        broker: String,
        #[source]
        source: BridgeError,
    },

    #[error("Broker at {broker} did not answer in time")]
    #[diagnostic(
        code(tpbridge::timeout),
        help("Raise mqtt.connect_timeout_secs or check the network path.")
    )]
    Timeout {
        broker: String,
        #[source]
        source: BridgeError,
    },

    #[error(transparent)]
    #[diagnostic(code(tpbridge::bridge))]
    Bridge(#[from] BridgeError),
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config { .. } => exit_code::CONFIG,
            Self::AuthFailed { .. } => exit_code::AUTH,
            Self::ConnectionFailed { .. } => exit_code::CONNECTION,
            Self::Timeout { .. } => exit_code::TIMEOUT,
            Self::Bridge(_) => exit_code::GENERAL,
        }
    }

    pub fn config(path: &std::path::Path, source: ConfigError) -> Self {
        Self::Config {
            path: path.display().to_string(),
            source,
        }
    }

    /// Classify a failed broker connect.
    pub fn connect(broker: &str, source: BridgeError) -> Self {
        let broker = broker.to_owned();
        match source {
            source @ BridgeError::Connect(ConnectError::AuthRejected { .. }) => {
                Self::AuthFailed { broker, source }
            }
            source @ BridgeError::Connect(ConnectError::Timeout { .. }) => {
                Self::Timeout { broker, source }
            }
            source @ BridgeError::Connect(_) => Self::ConnectionFailed { broker, source },
            other => Self::Bridge(other),
        }
    }
}
