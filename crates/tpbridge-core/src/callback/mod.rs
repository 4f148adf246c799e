// ── Platform callbacks ──
//
// The platform calls back into the plugin for form configuration,
// device disconnects and free-form notifications. Each hook has at most
// one handler; registering again replaces it. Handlers are plain
// synchronous closures and always run on the blocking pool under a
// timeout, so a slow or panicking handler only fails its own request.

mod server;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub use server::{CallbackServer, router};

// ── Requests ─────────────────────────────────────────────────────────

/// Query of `GET /api/v1/form/config`. Missing parameters are empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormConfigQuery {
    #[serde(default, alias = "protocolType")]
    pub protocol_type: String,
    #[serde(default, alias = "deviceType")]
    pub device_type: String,
    #[serde(default, alias = "formType")]
    pub form_type: String,
}

/// Body of `POST /api/v1/device/disconnect`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectRequest {
    #[serde(alias = "deviceId")]
    pub device_id: String,
    #[serde(default)]
    pub voucher: String,
}

// ── Handlers ─────────────────────────────────────────────────────────

/// The fixed set of callback hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackKind {
    FormConfig,
    DeviceDisconnect,
    Notification,
}

impl fmt::Display for CallbackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::FormConfig => "form-config",
            Self::DeviceDisconnect => "device-disconnect",
            Self::Notification => "notification",
        })
    }
}

pub type FormConfigFn = Arc<dyn Fn(&FormConfigQuery) -> Value + Send + Sync>;
pub type DeviceDisconnectFn = Arc<dyn Fn(&DisconnectRequest) + Send + Sync>;
pub type NotificationFn = Arc<dyn Fn(&Map<String, Value>) + Send + Sync>;

/// A registered callback, tagged by the hook it serves.
#[derive(Clone)]
pub enum CallbackHandler {
    FormConfig(FormConfigFn),
    DeviceDisconnect(DeviceDisconnectFn),
    Notification(NotificationFn),
}

impl CallbackHandler {
    pub fn form_config<F>(f: F) -> Self
    where
        F: Fn(&FormConfigQuery) -> Value + Send + Sync + 'static,
    {
        Self::FormConfig(Arc::new(f))
    }

    pub fn device_disconnect<F>(f: F) -> Self
    where
        F: Fn(&DisconnectRequest) + Send + Sync + 'static,
    {
        Self::DeviceDisconnect(Arc::new(f))
    }

    pub fn notification<F>(f: F) -> Self
    where
        F: Fn(&Map<String, Value>) + Send + Sync + 'static,
    {
        Self::Notification(Arc::new(f))
    }

    pub fn kind(&self) -> CallbackKind {
        match self {
            Self::FormConfig(_) => CallbackKind::FormConfig,
            Self::DeviceDisconnect(_) => CallbackKind::DeviceDisconnect,
            Self::Notification(_) => CallbackKind::Notification,
        }
    }
}

impl fmt::Debug for CallbackHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CallbackHandler").field(&self.kind()).finish()
    }
}

/// Handler table keyed by [`CallbackKind`].
#[derive(Debug, Default)]
pub struct CallbackRegistry {
    handlers: RwLock<HashMap<CallbackKind, CallbackHandler>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `handler`, returning the one it replaced.
    pub fn register(&self, handler: CallbackHandler) -> Option<CallbackHandler> {
        let kind = handler.kind();
        tracing::debug!(%kind, "callback handler registered");
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind, handler)
    }

    pub fn unregister(&self, kind: CallbackKind) -> Option<CallbackHandler> {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&kind)
    }

    pub fn get(&self, kind: CallbackKind) -> Option<CallbackHandler> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned()
    }

    pub fn is_registered(&self, kind: CallbackKind) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&kind)
    }

    fn form_config(&self) -> Option<FormConfigFn> {
        match self.get(CallbackKind::FormConfig)? {
            CallbackHandler::FormConfig(f) => Some(f),
            _ => None,
        }
    }

    fn device_disconnect(&self) -> Option<DeviceDisconnectFn> {
        match self.get(CallbackKind::DeviceDisconnect)? {
            CallbackHandler::DeviceDisconnect(f) => Some(f),
            _ => None,
        }
    }

    fn notification(&self) -> Option<NotificationFn> {
        match self.get(CallbackKind::Notification)? {
            CallbackHandler::Notification(f) => Some(f),
            _ => None,
        }
    }
}

// ── Execution ────────────────────────────────────────────────────────

/// Why a callback handler produced no result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    #[error("handler did not finish within {}ms", timeout.as_millis())]
    Timeout { timeout: Duration },

    #[error("handler panicked: {message}")]
    Panic { message: String },
}

/// Run `f` on the blocking pool, giving up after `timeout`.
///
/// A timed-out handler keeps running on its blocking thread; only the
/// request stops waiting for it.
pub(crate) async fn run_handler<R, F>(timeout: Duration, f: F) -> Result<R, HandlerError>
where
    R: Send + 'static,
    F: FnOnce() -> R + Send + 'static,
{
    match tokio::time::timeout(timeout, tokio::task::spawn_blocking(f)).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(join)) => {
            let message = if join.is_panic() {
                let payload = join.into_panic();
                payload
                    .downcast_ref::<&str>()
                    .map(ToString::to_string)
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".into())
            } else {
                join.to_string()
            };
            Err(HandlerError::Panic { message })
        }
        Err(_) => Err(HandlerError::Timeout { timeout }),
    }
}
