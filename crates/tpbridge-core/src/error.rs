// ── Core error types ──
//
// Errors surfaced by the `Bridge` facade. Session errors pass through
// unchanged so callers can still match on `NotConnected` and friends;
// platform API failures never appear here because the API wrappers
// report them inside `ApiResponse`.

use thiserror::Error;

use tpbridge_api::{ApiError, ConnectError, PublishError, SubscribeError};

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum BridgeError {
    // ── Session errors ───────────────────────────────────────────────
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Subscribe(#[from] SubscribeError),

    // ── Configuration errors ─────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// The platform client could not be constructed (bad URL, TLS setup).
    #[error("Platform client setup failed: {0}")]
    Api(#[from] ApiError),

    // ── Callback surface ─────────────────────────────────────────────
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// `true` for the fail-fast "not connected" errors of publish/subscribe.
    pub fn is_not_connected(&self) -> bool {
        matches!(
            self,
            Self::Publish(PublishError::NotConnected) | Self::Subscribe(SubscribeError::NotConnected)
        )
    }
}
