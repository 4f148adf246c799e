use thiserror::Error;

// ── MQTT session ────────────────────────────────────────────────────

/// Failure to establish a broker connection.
///
/// Returned by [`MqttSession::connect`](crate::mqtt::MqttSession::connect).
/// The session never retries an initial connect on its own; the caller
/// decides whether to try again.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    /// Broker refused the credentials (bad username/password, not authorized).
    #[error("Broker rejected credentials: {reason}")]
    AuthRejected { reason: String },

    /// TCP/TLS level failure (DNS, connection refused, reset).
    #[error("Broker unreachable: {reason}")]
    NetworkUnreachable { reason: String },

    /// No CONNACK within the connect timeout.
    #[error("Broker connection timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    /// Broker refused the connection for a non-auth reason.
    #[error("Broker refused connection: {reason}")]
    Refused { reason: String },

    /// The broker URI could not be interpreted.
    #[error("Invalid broker endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },
}

/// Failure to hand a message to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    #[error("MQTT session is not connected")]
    NotConnected,

    /// The client library reported a send failure.
    #[error("Broker rejected publish to '{topic}': {reason}")]
    BrokerRejected { topic: String, reason: String },

    #[error("Invalid publish topic '{topic}'")]
    InvalidTopic { topic: String },
}

/// Failure to register a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscribeError {
    #[error("MQTT session is not connected")]
    NotConnected,

    #[error("Invalid topic filter '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Broker rejected subscription to '{pattern}': {reason}")]
    BrokerRejected { pattern: String, reason: String },
}

// ── Platform API ────────────────────────────────────────────────────

/// Errors raised inside the platform REST client.
///
/// These never cross the client boundary: every public call folds them
/// into an [`ApiResponse`](crate::ApiResponse) failure. The variants are
/// kept around so the response can report *what kind* of failure occurred.
#[derive(Debug, Error)]
pub enum ApiError {
    /// HTTP transport error (connection refused, DNS failure, etc.)
    #[error("HTTP transport error: {0}")]
    Network(#[source] reqwest::Error),

    /// Request timed out.
    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    /// Non-2xx status. `body` is the raw response text.
    #[error("HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    /// JSON deserialization failed, with the raw body for debugging.
    #[error("Failed to decode response: {message}")]
    DecodeFailure { message: String, body: String },

    /// The platform envelope carried a non-success code.
    #[error("Platform rejected request (code {code}): {message}")]
    Rejected { code: i64, message: String },

    /// The owning facade disconnected while the request was in flight.
    #[error("Request cancelled")]
    Cancelled,

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The underlying HTTP client could not be constructed.
    #[error("TLS error: {0}")]
    Tls(String),
}

/// Coarse classification of an [`ApiError`], carried by failed responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorKind {
    Network,
    Timeout,
    HttpStatus(u16),
    DecodeFailure,
    Rejected,
    Cancelled,
    Configuration,
}

impl ApiError {
    /// Returns `true` if this is a transient error worth one retry.
    ///
    /// Only connection-level failures and timeouts qualify; an HTTP status
    /// means the platform answered and must not be asked again.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(e) => e.is_timeout() || e.is_connect(),
            Self::Timeout { .. } => true,
            _ => false,
        }
    }

    /// Returns `true` if the platform answered 404.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::HttpStatus { status: 404, .. })
    }

    pub fn kind(&self) -> ApiErrorKind {
        match self {
            Self::Network(_) => ApiErrorKind::Network,
            Self::Timeout { .. } => ApiErrorKind::Timeout,
            Self::HttpStatus { status, .. } => ApiErrorKind::HttpStatus(*status),
            Self::DecodeFailure { .. } => ApiErrorKind::DecodeFailure,
            Self::Rejected { .. } => ApiErrorKind::Rejected,
            Self::Cancelled => ApiErrorKind::Cancelled,
            Self::InvalidUrl(_) | Self::Tls(_) => ApiErrorKind::Configuration,
        }
    }

    /// The message a failed [`ApiResponse`](crate::ApiResponse) carries.
    ///
    /// For HTTP status errors this is the raw body (what the platform said);
    /// everything else uses the display text. Never empty.
    pub fn response_message(&self) -> String {
        let message = match self {
            Self::HttpStatus { status, body } if body.trim().is_empty() => {
                format!("HTTP {status}")
            }
            Self::HttpStatus { body, .. } => body.clone(),
            Self::Rejected { message, code } if message.trim().is_empty() => {
                format!("platform returned code {code}")
            }
            Self::Rejected { message, .. } => message.clone(),
            other => other.to_string(),
        };
        if message.is_empty() {
            "request failed".into()
        } else {
            message
        }
    }
}
