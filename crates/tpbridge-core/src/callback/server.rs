// HTTP surface the platform calls into.
//
//   GET  /api/v1/form/config          form configuration for a protocol
//   POST /api/v1/device/disconnect    device deregistered on the platform
//   POST /api/v1/plugin/notification  free-form platform notification
//   GET  /api/v1/plugin/device/list   devices currently known locally

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Json, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde_json::{Map, Value, json};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, info, warn};

use super::{CallbackRegistry, DisconnectRequest, FormConfigQuery, HandlerError, run_handler};
use crate::error::BridgeError;
use crate::registry::DeviceRegistry;

const NO_HANDLER: &str = "no handler registered";

#[derive(Clone)]
struct AppState {
    callbacks: Arc<CallbackRegistry>,
    registry: Arc<DeviceRegistry>,
    handler_timeout: Duration,
}

/// Build the callback router over the given handler table and registry.
pub fn router(
    callbacks: Arc<CallbackRegistry>,
    registry: Arc<DeviceRegistry>,
    handler_timeout: Duration,
) -> Router {
    Router::new()
        .route("/api/v1/form/config", get(form_config))
        .route("/api/v1/device/disconnect", post(device_disconnect))
        .route("/api/v1/plugin/notification", post(notification))
        .route("/api/v1/plugin/device/list", get(device_list))
        .with_state(AppState {
            callbacks,
            registry,
            handler_timeout,
        })
}

fn message(status: StatusCode, text: impl Into<String>) -> Response {
    (status, Json(json!({ "message": text.into() }))).into_response()
}

fn ok() -> Response {
    message(StatusCode::OK, "ok")
}

impl IntoResponse for HandlerError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Panic { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        message(status, self.to_string())
    }
}

// ── Routes ───────────────────────────────────────────────────────────

async fn form_config(
    State(state): State<AppState>,
    query: Result<Query<FormConfigQuery>, QueryRejection>,
) -> Response {
    let Query(query) = match query {
        Ok(q) => q,
        Err(rejection) => return message(StatusCode::BAD_REQUEST, rejection.body_text()),
    };
    debug!(
        protocol_type = %query.protocol_type,
        device_type = %query.device_type,
        form_type = %query.form_type,
        "form config requested"
    );

    let Some(handler) = state.callbacks.form_config() else {
        return message(StatusCode::OK, NO_HANDLER);
    };
    match run_handler(state.handler_timeout, move || handler(&query)).await {
        Ok(value) => Json(value).into_response(),
        Err(e) => {
            warn!(error = %e, "form config handler failed");
            e.into_response()
        }
    }
}

async fn device_disconnect(
    State(state): State<AppState>,
    body: Result<Json<DisconnectRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(b) => b,
        Err(rejection) => return message(StatusCode::BAD_REQUEST, rejection.body_text()),
    };
    info!(device_id = %request.device_id, "device disconnect notification");

    if state.registry.remove(&request.device_id).is_some() {
        debug!(device_id = %request.device_id, "device removed from registry");
    }

    let Some(handler) = state.callbacks.device_disconnect() else {
        info!(device_id = %request.device_id, voucher = %request.voucher, "device disconnected");
        return ok();
    };
    let timeout = state.handler_timeout;
    let device_id = request.device_id.clone();
    tokio::spawn(
        async move {
            if let Err(e) = run_handler(timeout, move || handler(&request)).await {
                warn!(device_id = %device_id, error = %e, "device disconnect handler failed");
            }
        }
        .in_current_span(),
    );
    ok()
}

async fn notification(
    State(state): State<AppState>,
    body: Result<Json<Map<String, Value>>, JsonRejection>,
) -> Response {
    let Json(payload) = match body {
        Ok(b) => b,
        Err(rejection) => return message(StatusCode::BAD_REQUEST, rejection.body_text()),
    };

    let Some(handler) = state.callbacks.notification() else {
        let payload = Value::Object(payload);
        info!(payload = %payload, "platform notification");
        return ok();
    };
    match run_handler(state.handler_timeout, move || handler(&payload)).await {
        Ok(()) => ok(),
        Err(e) => {
            warn!(error = %e, "notification handler failed");
            e.into_response()
        }
    }
}

#[allow(clippy::unused_async)]
async fn device_list(State(state): State<AppState>) -> Response {
    let devices = state.registry.snapshot();
    Json(json!({ "total": devices.len(), "list": &*devices })).into_response()
}

// ── Server ───────────────────────────────────────────────────────────

/// A running callback server.
#[derive(Debug)]
pub struct CallbackServer {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<std::io::Result<()>>,
}

impl CallbackServer {
    /// Bind `addr` and serve `router` until [`shutdown`](Self::shutdown).
    pub async fn bind(addr: SocketAddr, router: Router, span: Span) -> Result<Self, BridgeError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let cancel = CancellationToken::new();

        let shutdown = cancel.clone();
        let task = tokio::spawn(
            async move {
                axum::serve(listener, router)
                    .with_graceful_shutdown(async move { shutdown.cancelled().await })
                    .await
            }
            .instrument(span.clone()),
        );
        info!(parent: &span, %local_addr, "callback server listening");

        Ok(Self {
            local_addr,
            cancel,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting requests and wait for in-flight ones to finish.
    pub async fn shutdown(self) -> Result<(), BridgeError> {
        self.cancel.cancel();
        match self.task.await {
            Ok(result) => result.map_err(BridgeError::from),
            Err(e) => Err(BridgeError::Io(std::io::Error::other(e))),
        }
    }
}
