// Transport seam between the session and an MQTT client library.
//
// A `Connector` opens a `(LinkClient, Link)` pair: the client half issues
// requests, the link half is polled by the session's I/O task and yields
// connection events and inbound messages. `RumqttConnector` is the
// production implementation; `testing::SimBroker` is an in-process one.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use rumqttc::QoS;
use thiserror::Error;

use crate::error::ConnectError;
use crate::mqtt::options::MqttOptions;

/// A message received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

impl Message {
    /// Payload as UTF-8, lossily.
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// What one poll of a link produced.
#[derive(Debug)]
pub enum LinkEvent {
    /// The broker accepted the connection (initial or after a reconnect).
    Connected,
    Message(Message),
    /// Protocol traffic the session does not care about.
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("credentials rejected: {0}")]
    AuthRejected(String),

    #[error("connection refused: {0}")]
    Refused(String),

    #[error("network error: {0}")]
    Network(String),

    /// A request could not be handed to the client library.
    #[error("request failed: {0}")]
    Request(String),
}

impl LinkError {
    pub(crate) fn into_connect_error(self) -> ConnectError {
        match self {
            Self::AuthRejected(reason) => ConnectError::AuthRejected { reason },
            Self::Refused(reason) | Self::Request(reason) => ConnectError::Refused { reason },
            Self::Network(reason) => ConnectError::NetworkUnreachable { reason },
        }
    }
}

/// Request half of a broker connection.
pub trait LinkClient: Send + Sync {
    fn publish(
        &self,
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> BoxFuture<'_, Result<(), LinkError>>;

    fn subscribe(&self, filter: String, qos: QoS) -> BoxFuture<'_, Result<(), LinkError>>;

    fn disconnect(&self) -> BoxFuture<'_, Result<(), LinkError>>;
}

/// Event half of a broker connection.
///
/// After an error the next `poll` attempts to re-establish the connection.
pub trait Link: Send {
    fn poll(&mut self) -> BoxFuture<'_, Result<LinkEvent, LinkError>>;
}

/// Opens broker connections. Opening is synchronous; the broker's answer
/// arrives as the first [`LinkEvent`].
pub trait Connector: Send + Sync {
    fn open(
        &self,
        options: &MqttOptions,
    ) -> Result<(Arc<dyn LinkClient>, Box<dyn Link>), ConnectError>;
}
