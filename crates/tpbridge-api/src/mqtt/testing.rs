//! In-process broker stand-in for exercising [`MqttSession`](super::MqttSession)
//! without a network.
//!
//! [`SimBroker`] implements [`Connector`]. Every request a session sends
//! towards the broker is recorded as a [`BrokerRequest`]; publishes that
//! match an active subscription are routed back as inbound messages. Tests
//! can refuse connections, hang the handshake, drop the live link and
//! inject messages.
//!
//! ```rust,ignore
//! let broker = SimBroker::new();
//! let session = MqttSession::with_connector(options, Arc::new(broker.clone()));
//! session.connect().await?;
//! broker.drop_link();
//! ```

use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use rumqttc::QoS;
use tokio::sync::mpsc;

use crate::error::ConnectError;
use crate::mqtt::link::{Connector, Link, LinkClient, LinkError, LinkEvent, Message};
use crate::mqtt::options::{Endpoint, MqttOptions};
use crate::mqtt::topics;

/// A request that reached the simulated broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerRequest {
    Connect { client_id: String },
    Publish { topic: String, payload: Bytes, qos: QoS },
    Subscribe { filter: String },
    Disconnect,
}

/// How the broker answers the next handshake.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Handshake {
    #[default]
    Accept,
    RejectCredentials,
    Unreachable,
    /// Never answer.
    Hang,
}

#[derive(Default)]
struct State {
    handshake: Handshake,
    requests: Vec<BrokerRequest>,
    subscriptions: Vec<String>,
    link_tx: Option<mpsc::UnboundedSender<Result<LinkEvent, LinkError>>>,
    online: bool,
}

/// Cheap to clone; clones observe the same broker.
#[derive(Clone, Default)]
pub struct SimBroker {
    state: Arc<Mutex<State>>,
}

impl SimBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        f(&mut self.state.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Decide how subsequent handshakes are answered.
    pub fn set_handshake(&self, handshake: Handshake) {
        self.with_state(|s| s.handshake = handshake);
    }

    /// Every request received so far, oldest first.
    pub fn requests(&self) -> Vec<BrokerRequest> {
        self.with_state(|s| s.requests.clone())
    }

    pub fn clear_requests(&self) {
        self.with_state(|s| s.requests.clear());
    }

    /// Publishes received so far as `(topic, payload)`.
    pub fn published(&self) -> Vec<(String, String)> {
        self.with_state(|s| {
            s.requests
                .iter()
                .filter_map(|r| match r {
                    BrokerRequest::Publish { topic, payload, .. } => Some((
                        topic.clone(),
                        String::from_utf8_lossy(payload).into_owned(),
                    )),
                    _ => None,
                })
                .collect()
        })
    }

    /// Filters subscribed on the current connection.
    pub fn subscriptions(&self) -> Vec<String> {
        self.with_state(|s| s.subscriptions.clone())
    }

    pub fn is_online(&self) -> bool {
        self.with_state(|s| s.online)
    }

    /// Break the live connection. The session sees a network error; its
    /// next poll performs a fresh handshake.
    pub fn drop_link(&self) {
        self.with_state(|s| {
            s.online = false;
            s.subscriptions.clear();
            if let Some(tx) = &s.link_tx {
                let _ = tx.send(Err(LinkError::Network("connection reset by peer".into())));
            }
        });
    }

    /// Deliver a message as if another client had published it.
    pub fn inject(&self, topic: &str, payload: &str) {
        self.with_state(|s| deliver(s, topic, Bytes::copy_from_slice(payload.as_bytes())));
    }
}

fn deliver(state: &State, topic: &str, payload: Bytes) {
    if !state.online {
        return;
    }
    if !state.subscriptions.iter().any(|f| topics::matches(f, topic)) {
        return;
    }
    if let Some(tx) = &state.link_tx {
        let _ = tx.send(Ok(LinkEvent::Message(Message {
            topic: topic.to_owned(),
            payload,
            qos: QoS::AtMostOnce,
            retain: false,
        })));
    }
}

impl Connector for SimBroker {
    fn open(
        &self,
        options: &MqttOptions,
    ) -> Result<(Arc<dyn LinkClient>, Box<dyn Link>), ConnectError> {
        Endpoint::parse(&options.endpoint)?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.with_state(|s| {
            s.link_tx = Some(tx);
            s.online = false;
        });
        Ok((
            Arc::new(SimClient {
                broker: self.clone(),
            }),
            Box::new(SimLink {
                broker: self.clone(),
                client_id: options.client_id.clone(),
                rx,
                needs_handshake: true,
            }),
        ))
    }
}

struct SimClient {
    broker: SimBroker,
}

impl SimClient {
    fn record(&self, request: BrokerRequest) -> Result<(), LinkError> {
        self.broker.with_state(|s| {
            s.requests.push(request.clone());
            match request {
                BrokerRequest::Publish { topic, payload, .. } => deliver(s, &topic, payload),
                BrokerRequest::Subscribe { filter } => s.subscriptions.push(filter),
                BrokerRequest::Disconnect => {
                    s.online = false;
                    s.subscriptions.clear();
                    if let Some(tx) = &s.link_tx {
                        let _ = tx.send(Err(LinkError::Network("closed by client".into())));
                    }
                }
                BrokerRequest::Connect { .. } => {}
            }
        });
        Ok(())
    }
}

impl LinkClient for SimClient {
    fn publish(
        &self,
        topic: String,
        payload: Bytes,
        qos: QoS,
        _retain: bool,
    ) -> BoxFuture<'_, Result<(), LinkError>> {
        let result = self.record(BrokerRequest::Publish {
            topic,
            payload,
            qos,
        });
        async move { result }.boxed()
    }

    fn subscribe(&self, filter: String, _qos: QoS) -> BoxFuture<'_, Result<(), LinkError>> {
        let result = self.record(BrokerRequest::Subscribe { filter });
        async move { result }.boxed()
    }

    fn disconnect(&self) -> BoxFuture<'_, Result<(), LinkError>> {
        let result = self.record(BrokerRequest::Disconnect);
        async move { result }.boxed()
    }
}

struct SimLink {
    broker: SimBroker,
    client_id: String,
    rx: mpsc::UnboundedReceiver<Result<LinkEvent, LinkError>>,
    needs_handshake: bool,
}

impl SimLink {
    fn handshake(&mut self) -> Option<Result<LinkEvent, LinkError>> {
        let client_id = self.client_id.clone();
        self.broker.with_state(|s| match s.handshake {
            Handshake::Accept => {
                s.requests.push(BrokerRequest::Connect { client_id });
                s.online = true;
                self.needs_handshake = false;
                Some(Ok(LinkEvent::Connected))
            }
            Handshake::RejectCredentials => {
                Some(Err(LinkError::AuthRejected("BadUserNamePassword".into())))
            }
            Handshake::Unreachable => Some(Err(LinkError::Network("connection refused".into()))),
            Handshake::Hang => None,
        })
    }
}

impl Link for SimLink {
    fn poll(&mut self) -> BoxFuture<'_, Result<LinkEvent, LinkError>> {
        async move {
            if self.needs_handshake {
                return match self.handshake() {
                    Some(result) => result,
                    None => std::future::pending().await,
                };
            }
            match self.rx.recv().await {
                Some(Err(e)) => {
                    self.needs_handshake = true;
                    Err(e)
                }
                Some(Ok(event)) => Ok(event),
                None => std::future::pending().await,
            }
        }
        .boxed()
    }
}
