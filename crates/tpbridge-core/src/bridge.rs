// ── Bridge facade ──
//
// Composes the MQTT session, the platform client, the device registry
// and the callback surface behind one lifecycle. Cheaply cloneable via
// `Arc<BridgeInner>`; clones share every resource.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use bytes::Bytes;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, info, warn};

use tpbridge_api::mqtt::{Connector, RumqttConnector, topics};
use tpbridge_api::{ApiResponse, Message, MqttSession, PlatformClient, SessionHealth, SessionState};

use crate::callback::{self, CallbackHandler, CallbackRegistry, CallbackServer};
use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::model::{AccessInfo, Credentials, Device};
use crate::registry::DeviceRegistry;

/// A downlink command addressed to one device.
#[derive(Debug, Clone)]
pub struct Command {
    pub device_id: String,
    pub message: Message,
}

struct Heartbeat {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct BridgeInner {
    config: BridgeConfig,
    session: MqttSession,
    platform: Option<PlatformClient>,
    registry: Arc<DeviceRegistry>,
    callbacks: Arc<CallbackRegistry>,
    /// Token handed to platform calls; replaced on every disconnect.
    api_cancel: ArcSwap<CancellationToken>,
    heartbeat: Mutex<Option<Heartbeat>>,
    server: Mutex<Option<CallbackServer>>,
    span: Span,
}

/// The main entry point for applications bridging devices to the platform.
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

impl Bridge {
    /// Bridge backed by a real broker connection.
    pub fn new(config: BridgeConfig) -> Result<Self, BridgeError> {
        Self::with_connector(config, Arc::new(RumqttConnector))
    }

    /// Bridge whose MQTT session opens links through `connector`.
    pub fn with_connector(
        config: BridgeConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, BridgeError> {
        Self::build(config, connector, Span::none())
    }

    /// Return a fresh, disconnected bridge whose components log inside
    /// `span`. Registered callbacks and known devices are carried over.
    #[must_use]
    pub fn with_span(self, span: Span) -> Self {
        let inner = &self.inner;
        Self {
            inner: Arc::new(BridgeInner {
                config: inner.config.clone(),
                session: inner.session.clone().with_span(span.clone()),
                platform: inner.platform.clone().map(|p| p.with_span(span.clone())),
                registry: Arc::clone(&inner.registry),
                callbacks: Arc::clone(&inner.callbacks),
                api_cancel: ArcSwap::from_pointee(CancellationToken::new()),
                heartbeat: Mutex::new(None),
                server: Mutex::new(None),
                span,
            }),
        }
    }

    fn build(
        config: BridgeConfig,
        connector: Arc<dyn Connector>,
        span: Span,
    ) -> Result<Self, BridgeError> {
        let session =
            MqttSession::with_connector(config.mqtt_options(), connector).with_span(span.clone());

        let platform = match config.api_base_url() {
            Some(url) => Some(
                PlatformClient::new(url, &config.transport())?.with_span(span.clone()),
            ),
            None => None,
        };

        Ok(Self {
            inner: Arc::new(BridgeInner {
                config,
                session,
                platform,
                registry: Arc::new(DeviceRegistry::new()),
                callbacks: Arc::new(CallbackRegistry::new()),
                api_cancel: ArcSwap::from_pointee(CancellationToken::new()),
                heartbeat: Mutex::new(None),
                server: Mutex::new(None),
                span,
            }),
        })
    }

    // ── Accessors ────────────────────────────────────────────────────

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    pub fn session(&self) -> &MqttSession {
        &self.inner.session
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.inner.registry
    }

    pub fn callbacks(&self) -> &Arc<CallbackRegistry> {
        &self.inner.callbacks
    }

    /// Install a platform callback, replacing any previous one of its kind.
    pub fn register_callback(&self, handler: CallbackHandler) {
        self.inner.callbacks.register(handler);
    }

    pub fn state(&self) -> SessionState {
        self.inner.session.state()
    }

    pub fn health(&self) -> SessionHealth {
        self.inner.session.health()
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Connect the MQTT session and start the platform heartbeat.
    pub async fn connect(&self) -> Result<(), BridgeError> {
        self.inner.session.connect().await?;
        self.start_heartbeat().await;
        Ok(())
    }

    /// Stop the heartbeat, abandon in-flight platform calls and
    /// disconnect the MQTT session.
    pub async fn disconnect(&self) {
        if let Some(heartbeat) = self.inner.heartbeat.lock().await.take() {
            heartbeat.cancel.cancel();
            let _ = heartbeat.handle.await;
        }

        let previous = self
            .inner
            .api_cancel
            .swap(Arc::new(CancellationToken::new()));
        previous.cancel();

        self.inner.session.disconnect().await;
        info!(parent: &self.inner.span, "bridge disconnected");
    }

    /// Serve platform callbacks on `addr`. Returns the bound address.
    pub async fn serve_callbacks(&self, addr: SocketAddr) -> Result<SocketAddr, BridgeError> {
        let mut server = self.inner.server.lock().await;
        if let Some(running) = server.as_ref() {
            return Err(BridgeError::config(format!(
                "callback server already listening on {}",
                running.local_addr()
            )));
        }

        let router = callback::router(
            Arc::clone(&self.inner.callbacks),
            Arc::clone(&self.inner.registry),
            self.inner.config.handler_timeout(),
        );
        let started = CallbackServer::bind(addr, router, self.inner.span.clone()).await?;
        let local_addr = started.local_addr();
        *server = Some(started);
        Ok(local_addr)
    }

    /// Stop the callback server (if any) and disconnect.
    pub async fn shutdown(&self) -> Result<(), BridgeError> {
        let server = self.inner.server.lock().await.take();
        let stopped = match server {
            Some(server) => server.shutdown().await,
            None => Ok(()),
        };
        self.disconnect().await;
        stopped
    }

    async fn start_heartbeat(&self) {
        let (Some(platform), Some(service)) = (
            self.inner.platform.as_ref(),
            self.inner.config.service_identifier(),
        ) else {
            return;
        };

        let mut slot = self.inner.heartbeat.lock().await;
        if slot.as_ref().is_some_and(|h| !h.handle.is_finished()) {
            return;
        }

        let cancel = CancellationToken::new();
        let client = platform.clone().with_cancellation(cancel.clone());
        let handle = tokio::spawn(
            heartbeat_task(
                client,
                service.to_owned(),
                self.inner.config.heartbeat_interval(),
                cancel.clone(),
            )
            .instrument(self.inner.span.clone()),
        );
        *slot = Some(Heartbeat { cancel, handle });
    }

    // ── Messaging ────────────────────────────────────────────────────

    /// Publish a device online/offline status to `devices/status/{device_id}`.
    pub async fn send_status(&self, device_id: &str, status: &str) -> Result<(), BridgeError> {
        let topic = topics::status_topic(device_id);
        self.publish(&topic, Bytes::copy_from_slice(status.as_bytes()))
            .await
    }

    /// Publish telemetry to `plugin/{service}/devices/{device_id}/datas`.
    pub async fn send_data(
        &self,
        service_identifier: &str,
        device_id: &str,
        data: &str,
    ) -> Result<(), BridgeError> {
        let topic = topics::data_topic(service_identifier, device_id);
        self.publish(&topic, Bytes::copy_from_slice(data.as_bytes()))
            .await
    }

    /// Publish raw bytes with the configured default QoS.
    pub async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BridgeError> {
        self.inner
            .session
            .publish(topic, payload, self.inner.config.default_qos())
            .await?;
        Ok(())
    }

    /// Subscribe to `pattern` with the configured default QoS.
    pub async fn subscribe<F>(&self, pattern: &str, handler: F) -> Result<(), BridgeError>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        self.inner
            .session
            .subscribe(pattern, self.inner.config.default_qos(), handler)
            .await?;
        Ok(())
    }

    /// Subscribe to `plugin/{service}/devices/+/commands` for the configured
    /// service identifier.
    pub async fn subscribe_commands<F>(&self, handler: F) -> Result<(), BridgeError>
    where
        F: Fn(Command) + Send + Sync + 'static,
    {
        let service = self.service_identifier()?;
        let filter = topics::commands_filter(service);
        self.subscribe(&filter, move |message: Message| {
            let Some(device_id) = topics::command_device_id(&message.topic) else {
                return;
            };
            handler(Command {
                device_id: device_id.to_owned(),
                message,
            });
        })
        .await
    }

    // ── Platform API ─────────────────────────────────────────────────

    pub async fn device_dynamic_auth(
        &self,
        template_secret: &str,
        device_number: &str,
    ) -> Result<ApiResponse<Credentials>, BridgeError> {
        let client = self.platform()?;
        Ok(client.device_dynamic_auth(template_secret, device_number).await)
    }

    /// Fetch a device's configuration; on success the device is upserted
    /// into the registry.
    pub async fn get_device_config(
        &self,
        device_id: &str,
        voucher: &str,
        device_number: &str,
    ) -> Result<ApiResponse<Device>, BridgeError> {
        let client = self.platform()?;
        let response = client
            .get_device_config(device_id, voucher, device_number)
            .await;
        if let Some(device) = response.data() {
            self.inner.registry.upsert(device.clone());
        }
        Ok(response)
    }

    pub async fn get_service_access(&self) -> Result<ApiResponse<AccessInfo>, BridgeError> {
        let client = self.platform()?;
        let service = self.service_identifier()?;
        Ok(client.get_service_access(service).await)
    }

    pub async fn send_heartbeat(&self) -> Result<ApiResponse<()>, BridgeError> {
        let client = self.platform()?;
        let service = self.service_identifier()?;
        Ok(client.send_heartbeat(service).await)
    }

    fn platform(&self) -> Result<PlatformClient, BridgeError> {
        let client = self
            .inner
            .platform
            .as_ref()
            .ok_or_else(|| BridgeError::config("no platform API base URL configured"))?;
        let cancel = (**self.inner.api_cancel.load()).clone();
        Ok(client.clone().with_cancellation(cancel))
    }

    fn service_identifier(&self) -> Result<&str, BridgeError> {
        self.inner
            .config
            .service_identifier()
            .ok_or_else(|| BridgeError::config("no service identifier configured"))
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("broker", &self.inner.config.broker())
            .field("client_id", &self.inner.config.client_id())
            .field("state", &self.inner.session.state())
            .field("devices", &self.inner.registry.len())
            .finish_non_exhaustive()
    }
}

async fn heartbeat_task(
    client: PlatformClient,
    service: String,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                let response = client.send_heartbeat(&service).await;
                if response.is_success() {
                    debug!(service = %service, "heartbeat sent");
                } else if !cancel.is_cancelled() {
                    warn!(service = %service, error = %response.message(), "heartbeat failed");
                }
            }
        }
    }
    debug!("heartbeat task exiting");
}
