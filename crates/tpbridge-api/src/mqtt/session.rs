// ── MQTT session ─────────────────────────────────────────────────────
//
// Owns one broker connection at a time. `connect` performs the handshake
// inline and then hands the link to a background I/O task that polls it,
// routes inbound messages to dispatch workers and drives reconnection.
//
// Every state transition bumps a generation counter under the watch
// channel's lock. Work that finishes asynchronously (resubscribe + queue
// flush after a reconnect) only promotes the session to `Connected` if no
// other transition happened in between.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use bytes::Bytes;
use rumqttc::QoS;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, info, warn};

use crate::error::{ConnectError, PublishError, SubscribeError};
use crate::mqtt::dispatch::{Dispatcher, MessageHandler};
use crate::mqtt::link::{Connector, Link, LinkClient, LinkError, LinkEvent, Message};
use crate::mqtt::options::MqttOptions;
use crate::mqtt::rumqtt::RumqttConnector;
use crate::mqtt::topics;

/// How long `disconnect` lets the I/O task flush the DISCONNECT packet.
const DISCONNECT_GRACE: Duration = Duration::from_millis(500);

// ── State ────────────────────────────────────────────────────────────

/// Connection state of an [`MqttSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        })
    }
}

/// Point-in-time view of session health.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHealth {
    pub state: SessionState,
    /// Reconnect attempts since the link was last up.
    pub reconnect_attempts: u32,
    /// Publishes buffered while reconnecting.
    pub queued_publishes: usize,
    pub last_error: Option<String>,
}

struct Subscription {
    id: u64,
    filter: String,
    qos: QoS,
    handler: MessageHandler,
}

struct QueuedPublish {
    topic: String,
    payload: Bytes,
    qos: QoS,
}

struct Connection {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Stats {
    reconnect_attempts: u32,
    last_error: Option<String>,
}

// ── MqttSession ──────────────────────────────────────────────────────

/// Client-side MQTT session with automatic reconnection.
///
/// Cheap to clone; clones share the same connection.
#[derive(Clone)]
pub struct MqttSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    options: MqttOptions,
    connector: Arc<dyn Connector>,
    state: watch::Sender<SessionState>,
    generation: AtomicU64,
    client: Mutex<Option<Arc<dyn LinkClient>>>,
    subscriptions: RwLock<Vec<Subscription>>,
    next_subscription: AtomicU64,
    queue: tokio::sync::Mutex<VecDeque<QueuedPublish>>,
    queued: AtomicUsize,
    connection: Mutex<Option<Connection>>,
    lifecycle: tokio::sync::Mutex<()>,
    dispatcher: Dispatcher,
    stats: Mutex<Stats>,
    span: Span,
}

impl MqttSession {
    /// Session backed by `rumqttc`.
    pub fn new(options: MqttOptions) -> Self {
        Self::with_connector(options, Arc::new(RumqttConnector))
    }

    /// Session backed by any [`Connector`].
    pub fn with_connector(options: MqttOptions, connector: Arc<dyn Connector>) -> Self {
        Self::build(options, connector, Span::none())
    }

    /// Return a fresh, disconnected session whose tasks run inside `span`.
    #[must_use]
    pub fn with_span(self, span: Span) -> Self {
        Self::build(
            self.inner.options.clone(),
            Arc::clone(&self.inner.connector),
            span,
        )
    }

    fn build(options: MqttOptions, connector: Arc<dyn Connector>, span: Span) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        Self {
            inner: Arc::new(SessionInner {
                options,
                connector,
                state,
                generation: AtomicU64::new(0),
                client: Mutex::new(None),
                subscriptions: RwLock::new(Vec::new()),
                next_subscription: AtomicU64::new(0),
                queue: tokio::sync::Mutex::new(VecDeque::new()),
                queued: AtomicUsize::new(0),
                connection: Mutex::new(None),
                lifecycle: tokio::sync::Mutex::new(()),
                dispatcher: Dispatcher::new(span.clone()),
                stats: Mutex::new(Stats::default()),
                span,
            }),
        }
    }

    pub fn options(&self) -> &MqttOptions {
        &self.inner.options
    }

    pub fn state(&self) -> SessionState {
        self.inner.current_state()
    }

    /// Watch state transitions.
    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn health(&self) -> SessionHealth {
        let stats = self.inner.stats.lock().unwrap_or_else(PoisonError::into_inner);
        SessionHealth {
            state: self.inner.current_state(),
            reconnect_attempts: stats.reconnect_attempts,
            queued_publishes: self.inner.queued.load(Ordering::SeqCst),
            last_error: stats.last_error.clone(),
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Connect to the broker and wait for it to accept the session.
    ///
    /// A no-op while connected. A previous attempt that never finished is
    /// torn down first. Failures are returned as-is; there is no retry.
    /// Every subscription registered on this session is (re)issued.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        let inner = &self.inner;
        let _lifecycle = inner.lifecycle.lock().await;

        match inner.current_state() {
            SessionState::Connected => return Ok(()),
            SessionState::Connecting | SessionState::Reconnecting => {
                debug!(parent: &inner.span, "tearing down previous connection attempt");
                inner.teardown(false).await;
            }
            SessionState::Disconnected => {}
        }

        let generation = inner.set_state(SessionState::Connecting);
        info!(
            parent: &inner.span,
            endpoint = %inner.options.endpoint,
            client_id = %inner.options.client_id,
            "connecting to broker"
        );

        let result = Arc::clone(inner)
            .establish(generation)
            .instrument(inner.span.clone())
            .await;
        if let Err(e) = &result {
            warn!(parent: &inner.span, error = %e, "broker connection failed");
            inner.record_error(e.to_string());
            inner.set_state(SessionState::Disconnected);
        }
        result
    }

    /// Disconnect from the broker.
    ///
    /// Stops reconnection, drops queued publishes and pending handler
    /// work, and sends a best-effort DISCONNECT. Idempotent. Registered
    /// subscriptions are kept for the next [`connect`](Self::connect).
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        let _lifecycle = inner.lifecycle.lock().await;
        let has_connection = inner
            .connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some();
        if inner.current_state() == SessionState::Disconnected && !has_connection {
            return;
        }
        inner.teardown(true).await;
        info!(parent: &inner.span, "disconnected from broker");
    }

    // ── Messaging ────────────────────────────────────────────────────

    /// Publish `payload` to `topic`.
    ///
    /// Sent immediately while connected. While reconnecting the message is
    /// queued (oldest dropped when the queue is full) and flushed in order
    /// once the link is back.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
    ) -> Result<(), PublishError> {
        topics::validate_topic(topic).map_err(|_| PublishError::InvalidTopic {
            topic: topic.to_owned(),
        })?;
        let payload = payload.into();
        let inner = &self.inner;

        // The queue lock orders live publishes after a flush in progress.
        let mut queue = inner.queue.lock().await;
        match inner.current_state() {
            SessionState::Disconnected | SessionState::Connecting => {
                Err(PublishError::NotConnected)
            }
            SessionState::Reconnecting => {
                let capacity = inner.options.queue_capacity.max(1);
                if queue.len() >= capacity {
                    if let Some(dropped) = queue.pop_front() {
                        warn!(
                            parent: &inner.span,
                            topic = %dropped.topic,
                            capacity,
                            "publish queue full, dropping oldest message"
                        );
                    }
                }
                queue.push_back(QueuedPublish {
                    topic: topic.to_owned(),
                    payload,
                    qos,
                });
                inner.queued.store(queue.len(), Ordering::SeqCst);
                debug!(parent: &inner.span, topic, queued = queue.len(), "publish queued while reconnecting");
                Ok(())
            }
            SessionState::Connected => {
                let client = inner.current_client().ok_or(PublishError::NotConnected)?;
                debug!(parent: &inner.span, topic, bytes = payload.len(), "publish");
                client
                    .publish(topic.to_owned(), payload, qos, false)
                    .await
                    .map_err(|e| PublishError::BrokerRejected {
                        topic: topic.to_owned(),
                        reason: e.to_string(),
                    })
            }
        }
    }

    /// Subscribe to `pattern` and route matching messages to `handler`.
    ///
    /// Subscribing again with the same pattern replaces its handler.
    /// Handlers run on the blocking pool, never on the I/O task.
    pub async fn subscribe<F>(&self, pattern: &str, qos: QoS, handler: F) -> Result<(), SubscribeError>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        topics::validate_filter(pattern).map_err(|reason| SubscribeError::InvalidPattern {
            pattern: pattern.to_owned(),
            reason: reason.to_owned(),
        })?;
        let inner = &self.inner;
        if inner.current_state() != SessionState::Connected {
            return Err(SubscribeError::NotConnected);
        }
        let client = inner.current_client().ok_or(SubscribeError::NotConnected)?;

        client
            .subscribe(pattern.to_owned(), qos)
            .await
            .map_err(|e| SubscribeError::BrokerRejected {
                pattern: pattern.to_owned(),
                reason: e.to_string(),
            })?;

        let subscription = Subscription {
            id: inner.next_subscription.fetch_add(1, Ordering::Relaxed),
            filter: pattern.to_owned(),
            qos,
            handler: Arc::new(handler),
        };
        let mut subs = inner
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match subs.iter_mut().find(|s| s.filter == pattern) {
            Some(existing) => *existing = subscription,
            None => subs.push(subscription),
        }
        info!(parent: &inner.span, pattern, "subscribed");
        Ok(())
    }

    /// Registered subscription filters, in registration order.
    pub fn subscriptions(&self) -> Vec<String> {
        self.inner
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|s| s.filter.clone())
            .collect()
    }
}

impl fmt::Debug for MqttSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqttSession")
            .field("endpoint", &self.inner.options.endpoint)
            .field("client_id", &self.inner.options.client_id)
            .field("state", &self.inner.current_state())
            .finish_non_exhaustive()
    }
}

// ── Internals ────────────────────────────────────────────────────────

impl SessionInner {
    fn current_state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn current_client(&self) -> Option<Arc<dyn LinkClient>> {
        self.client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Transition to `next` and return the new generation.
    fn set_state(&self, next: SessionState) -> u64 {
        let mut generation = 0;
        self.state.send_modify(|state| {
            *state = next;
            generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        });
        generation
    }

    /// Move to `Connected` unless another transition happened since
    /// `expected` was observed.
    fn promote(&self, expected: u64) -> bool {
        self.state.send_if_modified(|state| {
            if self.generation.load(Ordering::SeqCst) != expected {
                return false;
            }
            self.generation.fetch_add(1, Ordering::SeqCst);
            *state = SessionState::Connected;
            true
        })
    }

    fn record_error(&self, error: String) {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last_error = Some(error);
    }

    async fn establish(self: Arc<Self>, generation: u64) -> Result<(), ConnectError> {
        let (client, mut link) = self.connector.open(&self.options)?;

        let timeout = self.options.connect_timeout;
        match tokio::time::timeout(timeout, wait_for_connack(link.as_mut())).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e.into_connect_error()),
            Err(_) => {
                return Err(ConnectError::Timeout {
                    timeout_secs: timeout.as_secs(),
                });
            }
        }

        *self.client.lock().unwrap_or_else(PoisonError::into_inner) = Some(client);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(
            Arc::clone(&self)
                .io_loop(link, cancel.clone())
                .instrument(self.span.clone()),
        );
        *self.connection.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(Connection { cancel, handle });

        self.restore(generation).await;
        Ok(())
    }

    /// Re-issue subscriptions, flush the queue, then go `Connected`.
    async fn restore(&self, generation: u64) {
        let Some(client) = self.current_client() else {
            return;
        };

        let filters: Vec<(String, QoS)> = self
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|s| (s.filter.clone(), s.qos))
            .collect();
        for (filter, qos) in filters {
            if let Err(e) = client.subscribe(filter.clone(), qos).await {
                warn!(pattern = %filter, error = %e, "resubscribe failed");
            }
        }

        let mut queue = self.queue.lock().await;
        let pending = queue.len();
        while self.generation.load(Ordering::SeqCst) == generation {
            let Some(item) = queue.pop_front() else {
                break;
            };
            if let Err(e) = client.publish(item.topic.clone(), item.payload, item.qos, false).await {
                warn!(topic = %item.topic, error = %e, "dropping queued publish");
            }
        }
        self.queued.store(queue.len(), Ordering::SeqCst);

        if self.promote(generation) {
            self.stats
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .reconnect_attempts = 0;
            info!(flushed = pending, "connected to broker");
        }
    }

    /// Background task: poll the link until cancelled or disconnected.
    async fn io_loop(self: Arc<Self>, mut link: Box<dyn Link>, cancel: CancellationToken) {
        let mut attempt: u32 = 0;

        loop {
            let event = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                event = link.poll() => event,
            };

            match event {
                Ok(LinkEvent::Connected) => {
                    if self.current_state() != SessionState::Reconnecting {
                        continue;
                    }
                    info!(attempt, "broker link re-established");
                    attempt = 0;
                    let generation = self.generation.load(Ordering::SeqCst);
                    let inner = Arc::clone(&self);
                    tokio::spawn(
                        async move { inner.restore(generation).await }.instrument(Span::current()),
                    );
                }
                Ok(LinkEvent::Message(message)) => self.route(message),
                Ok(LinkEvent::Other) => {}
                Err(e) => {
                    if cancel.is_cancelled() || self.current_state() == SessionState::Disconnected {
                        break;
                    }
                    attempt = attempt.saturating_add(1);
                    if !self.on_link_error(&e, attempt, &cancel) {
                        break;
                    }

                    let delay = self.options.reconnect.delay(attempt - 1);
                    debug!(delay_ms = delay.as_millis() as u64, attempt, "waiting before reconnect");
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => break,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        debug!("broker I/O task exiting");
    }

    /// Move to `Reconnecting` after a link failure. Returns `false` when
    /// the session was disconnected concurrently and the I/O task must stop.
    fn on_link_error(&self, error: &LinkError, attempt: u32, cancel: &CancellationToken) -> bool {
        let lost = self.state.send_if_modified(|state| {
            if *state == SessionState::Disconnected || cancel.is_cancelled() {
                return false;
            }
            self.generation.fetch_add(1, Ordering::SeqCst);
            *state = SessionState::Reconnecting;
            true
        });
        if !lost {
            debug!(error = %error, "link closed after disconnect");
            return false;
        }

        warn!(error = %error, attempt, "broker link lost");
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        stats.reconnect_attempts = attempt;
        stats.last_error = Some(error.to_string());
        true
    }

    fn route(&self, message: Message) {
        let subs = self
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut matched = false;
        for sub in subs.iter().filter(|s| topics::matches(&s.filter, &message.topic)) {
            matched = true;
            self.dispatcher.dispatch(sub.id, &sub.handler, message.clone());
        }
        if !matched {
            debug!(topic = %message.topic, "no subscription for inbound message");
        }
    }

    /// Stop the I/O task and return to `Disconnected`.
    async fn teardown(&self, send_disconnect: bool) {
        let previous = self.current_state();
        self.set_state(SessionState::Disconnected);

        let client = self
            .client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        {
            let mut queue = self.queue.lock().await;
            if !queue.is_empty() {
                debug!(parent: &self.span, dropped = queue.len(), "discarding queued publishes");
            }
            queue.clear();
            self.queued.store(0, Ordering::SeqCst);
        }
        self.dispatcher.clear();
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reconnect_attempts = 0;

        let client = client.filter(|_| send_disconnect && previous == SessionState::Connected);
        let graceful = client.is_some();
        if let Some(client) = client {
            match tokio::time::timeout(DISCONNECT_GRACE, client.disconnect()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(parent: &self.span, error = %e, "DISCONNECT not sent"),
                Err(_) => debug!(parent: &self.span, "DISCONNECT timed out"),
            }
        }

        let connection = self
            .connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(Connection { cancel, mut handle }) = connection {
            // Without a DISCONNECT in flight the task is parked in a poll or
            // a backoff sleep and only exits once cancelled.
            if !graceful {
                cancel.cancel();
            }
            if tokio::time::timeout(DISCONNECT_GRACE, &mut handle).await.is_err() {
                cancel.cancel();
                let _ = handle.await;
            }
            cancel.cancel();
        }
    }
}

async fn wait_for_connack(link: &mut dyn Link) -> Result<(), LinkError> {
    loop {
        if let LinkEvent::Connected = link.poll().await? {
            return Ok(());
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::mqtt::backoff::ReconnectConfig;
    use crate::mqtt::testing::{BrokerRequest, Handshake, SimBroker};
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;

    const WAIT: Duration = Duration::from_secs(5);

    fn options() -> MqttOptions {
        let mut options = MqttOptions::new("tcp://localhost:1883", "test-client");
        options.reconnect = ReconnectConfig {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
        };
        options
    }

    fn session(broker: &SimBroker) -> MqttSession {
        MqttSession::with_connector(options(), Arc::new(broker.clone()))
    }

    async fn wait_for_state(session: &MqttSession, target: SessionState) {
        let mut rx = session.state_changes();
        tokio::time::timeout(WAIT, rx.wait_for(|s| *s == target))
            .await
            .expect("state change timed out")
            .expect("session dropped");
    }

    fn channel_handler() -> (
        impl Fn(Message) + Send + Sync + 'static,
        mpsc::UnboundedReceiver<Message>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            move |m: Message| {
                let _ = tx.send(m);
            },
            rx,
        )
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<Message>) -> Message {
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("no message delivered")
            .expect("handler dropped")
    }

    #[tokio::test]
    async fn publish_while_connected_sends_exactly_one_message() {
        let broker = SimBroker::new();
        let session = session(&broker);
        session.connect().await.unwrap();
        broker.clear_requests();

        session
            .publish("devices/status/dev1", "online", QoS::AtLeastOnce)
            .await
            .unwrap();

        assert_eq!(
            broker.requests(),
            vec![BrokerRequest::Publish {
                topic: "devices/status/dev1".into(),
                payload: Bytes::from_static(b"online"),
                qos: QoS::AtLeastOnce,
            }]
        );
    }

    #[tokio::test]
    async fn disconnected_session_never_touches_the_broker() {
        let broker = SimBroker::new();
        let session = session(&broker);

        let publish = session.publish("a/b", "x", QoS::AtMostOnce).await;
        assert_eq!(publish, Err(PublishError::NotConnected));

        let subscribe = session.subscribe("a/#", QoS::AtMostOnce, |_| {}).await;
        assert_eq!(subscribe, Err(SubscribeError::NotConnected));

        assert!(broker.requests().is_empty());
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let broker = SimBroker::new();
        let session = session(&broker);
        session.connect().await.unwrap();
        session.connect().await.unwrap();

        let connects = broker
            .requests()
            .into_iter()
            .filter(|r| matches!(r, BrokerRequest::Connect { .. }))
            .count();
        assert_eq!(connects, 1);
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn connect_failures_are_classified() {
        let broker = SimBroker::new();
        let session = session(&broker);

        broker.set_handshake(Handshake::RejectCredentials);
        assert!(matches!(
            session.connect().await,
            Err(ConnectError::AuthRejected { .. })
        ));
        assert_eq!(session.state(), SessionState::Disconnected);

        broker.set_handshake(Handshake::Unreachable);
        assert!(matches!(
            session.connect().await,
            Err(ConnectError::NetworkUnreachable { .. })
        ));
        assert!(session.health().last_error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_broker_times_out() {
        let broker = SimBroker::new();
        broker.set_handshake(Handshake::Hang);
        let session = session(&broker);

        let err = session.connect().await.unwrap_err();
        assert_eq!(err, ConnectError::Timeout { timeout_secs: 10 });
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn invalid_endpoint_is_reported() {
        let broker = SimBroker::new();
        let mut options = options();
        options.endpoint = "http://nope".into();
        let session = MqttSession::with_connector(options, Arc::new(broker.clone()));

        assert!(matches!(
            session.connect().await,
            Err(ConnectError::InvalidEndpoint { .. })
        ));
    }

    #[tokio::test]
    async fn invalid_topics_and_patterns_are_rejected() {
        let broker = SimBroker::new();
        let session = session(&broker);
        session.connect().await.unwrap();

        assert!(matches!(
            session.publish("a/+/b", "x", QoS::AtMostOnce).await,
            Err(PublishError::InvalidTopic { .. })
        ));
        assert!(matches!(
            session.subscribe("a/#/b", QoS::AtMostOnce, |_| {}).await,
            Err(SubscribeError::InvalidPattern { .. })
        ));
    }

    #[tokio::test]
    async fn reconnect_after_disconnect_restores_subscriptions() {
        let broker = SimBroker::new();
        let session = session(&broker);
        session.connect().await.unwrap();

        let (handler, mut rx) = channel_handler();
        session
            .subscribe("plugin/svc/devices/+/commands", QoS::AtLeastOnce, handler)
            .await
            .unwrap();

        session.disconnect().await;
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(broker.subscriptions().is_empty());

        session.connect().await.unwrap();
        assert_eq!(broker.subscriptions(), vec!["plugin/svc/devices/+/commands"]);

        broker.inject("plugin/svc/devices/d1/commands", r#"{"on":true}"#);
        let message = recv(&mut rx).await;
        assert_eq!(message.topic, "plugin/svc/devices/d1/commands");
        assert_eq!(message.payload_str(), r#"{"on":true}"#);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let broker = SimBroker::new();
        let session = session(&broker);
        session.disconnect().await;
        session.connect().await.unwrap();
        session.disconnect().await;
        session.disconnect().await;

        let disconnects = broker
            .requests()
            .into_iter()
            .filter(|r| *r == BrokerRequest::Disconnect)
            .count();
        assert_eq!(disconnects, 1);
    }

    #[tokio::test]
    async fn link_loss_queues_and_flushes_in_order() {
        let broker = SimBroker::new();
        let session = session(&broker);
        session.connect().await.unwrap();

        broker.set_handshake(Handshake::Unreachable);
        broker.drop_link();
        wait_for_state(&session, SessionState::Reconnecting).await;
        broker.clear_requests();

        for n in 1..=3 {
            session
                .publish("plugin/svc/devices/d1/datas", format!("{n}"), QoS::AtLeastOnce)
                .await
                .unwrap();
        }
        assert_eq!(session.health().queued_publishes, 3);
        assert!(broker.published().is_empty());

        broker.set_handshake(Handshake::Accept);
        wait_for_state(&session, SessionState::Connected).await;

        let payloads: Vec<String> = broker.published().into_iter().map(|(_, p)| p).collect();
        assert_eq!(payloads, ["1", "2", "3"]);
        let health = session.health();
        assert_eq!(health.queued_publishes, 0);
        assert_eq!(health.reconnect_attempts, 0);
        assert!(health.last_error.is_some());
    }

    #[tokio::test]
    async fn link_error_after_disconnect_keeps_session_disconnected() {
        let broker = SimBroker::new();
        let session = session(&broker);
        session.connect().await.unwrap();
        session.disconnect().await;

        let cancel = CancellationToken::new();
        let error = LinkError::Network("connection reset".into());
        assert!(!session.inner.on_link_error(&error, 1, &cancel));

        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(session.health().reconnect_attempts, 0);
        let publish = session.publish("a/b", "x", QoS::AtMostOnce).await;
        assert_eq!(publish, Err(PublishError::NotConnected));
    }

    #[tokio::test]
    async fn link_error_on_cancelled_task_is_ignored() {
        let broker = SimBroker::new();
        let session = session(&broker);
        session.connect().await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let error = LinkError::Network("connection reset".into());
        assert!(!session.inner.on_link_error(&error, 1, &cancel));
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_during_backoff_does_not_wait_for_grace() {
        let broker = SimBroker::new();
        let mut options = options();
        options.reconnect = ReconnectConfig {
            initial_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60),
        };
        let session = MqttSession::with_connector(options, Arc::new(broker.clone()));
        session.connect().await.unwrap();

        broker.set_handshake(Handshake::Unreachable);
        broker.drop_link();
        wait_for_state(&session, SessionState::Reconnecting).await;
        broker.set_handshake(Handshake::Accept);

        let started = tokio::time::Instant::now();
        session.connect().await.unwrap();
        assert!(started.elapsed() < DISCONNECT_GRACE);
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn full_queue_drops_oldest() {
        let broker = SimBroker::new();
        let mut options = options();
        options.queue_capacity = 2;
        let session = MqttSession::with_connector(options, Arc::new(broker.clone()));
        session.connect().await.unwrap();

        broker.set_handshake(Handshake::Unreachable);
        broker.drop_link();
        wait_for_state(&session, SessionState::Reconnecting).await;

        for payload in ["a", "b", "c"] {
            session.publish("t", payload, QoS::AtMostOnce).await.unwrap();
        }
        assert_eq!(session.health().queued_publishes, 2);

        broker.clear_requests();
        broker.set_handshake(Handshake::Accept);
        wait_for_state(&session, SessionState::Connected).await;

        let payloads: Vec<String> = broker.published().into_iter().map(|(_, p)| p).collect();
        assert_eq!(payloads, ["b", "c"]);
    }

    #[tokio::test]
    async fn subscribe_while_reconnecting_is_refused() {
        let broker = SimBroker::new();
        let session = session(&broker);
        session.connect().await.unwrap();

        broker.set_handshake(Handshake::Unreachable);
        broker.drop_link();
        wait_for_state(&session, SessionState::Reconnecting).await;

        let result = session.subscribe("a/b", QoS::AtMostOnce, |_| {}).await;
        assert_eq!(result, Err(SubscribeError::NotConnected));
        assert!(session.health().reconnect_attempts >= 1);
    }

    #[tokio::test]
    async fn disconnect_while_reconnecting_drops_queue() {
        let broker = SimBroker::new();
        let session = session(&broker);
        session.connect().await.unwrap();

        broker.set_handshake(Handshake::Unreachable);
        broker.drop_link();
        wait_for_state(&session, SessionState::Reconnecting).await;
        session.publish("t", "lost", QoS::AtMostOnce).await.unwrap();

        session.disconnect().await;
        let health = session.health();
        assert_eq!(health.state, SessionState::Disconnected);
        assert_eq!(health.queued_publishes, 0);

        broker.set_handshake(Handshake::Accept);
        broker.clear_requests();
        session.connect().await.unwrap();
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn overlapping_subscriptions_are_each_invoked() {
        let broker = SimBroker::new();
        let session = session(&broker);
        session.connect().await.unwrap();

        let (exact, mut exact_rx) = channel_handler();
        let (wildcard, mut wildcard_rx) = channel_handler();
        session.subscribe("a/b", QoS::AtMostOnce, exact).await.unwrap();
        session.subscribe("a/#", QoS::AtMostOnce, wildcard).await.unwrap();

        session.publish("a/b", "hello", QoS::AtMostOnce).await.unwrap();

        assert_eq!(recv(&mut exact_rx).await.payload_str(), "hello");
        assert_eq!(recv(&mut wildcard_rx).await.payload_str(), "hello");
    }

    #[tokio::test]
    async fn resubscribing_replaces_handler() {
        let broker = SimBroker::new();
        let session = session(&broker);
        session.connect().await.unwrap();

        let (first, mut first_rx) = channel_handler();
        let (second, mut second_rx) = channel_handler();
        session.subscribe("x", QoS::AtMostOnce, first).await.unwrap();
        session.subscribe("x", QoS::AtMostOnce, second).await.unwrap();
        assert_eq!(session.subscriptions(), vec!["x"]);

        broker.inject("x", "1");
        assert_eq!(recv(&mut second_rx).await.payload_str(), "1");
        assert!(first_rx.try_recv().is_err());
    }
}
