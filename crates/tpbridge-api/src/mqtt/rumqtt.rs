// rumqttc-backed transport.
//
// `AsyncClient` is the request half, `EventLoop` the event half. The
// event loop re-establishes the TCP/TLS connection on the poll following
// an error, which is how the session's reconnect loop drives reconnection.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, Packet, QoS, Transport,
};
use secrecy::ExposeSecret;

use crate::error::ConnectError;
use crate::mqtt::link::{Connector, Link, LinkClient, LinkError, LinkEvent, Message};
use crate::mqtt::options::{Endpoint, MqttOptions};

/// rumqttc refuses keep-alive intervals below this.
const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);

/// Requests that can sit in the client channel before `publish` waits.
const MIN_REQUEST_CAPACITY: usize = 64;

/// Production connector backed by `rumqttc`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RumqttConnector;

impl Connector for RumqttConnector {
    fn open(
        &self,
        options: &MqttOptions,
    ) -> Result<(Arc<dyn LinkClient>, Box<dyn Link>), ConnectError> {
        let endpoint = Endpoint::parse(&options.endpoint)?;

        let mut mqtt = rumqttc::MqttOptions::new(&options.client_id, &endpoint.host, endpoint.port);
        mqtt.set_keep_alive(options.keep_alive.max(MIN_KEEP_ALIVE));
        mqtt.set_clean_session(options.clean_session);
        if let Some(username) = &options.username {
            let password = options
                .password
                .as_ref()
                .map(|p| p.expose_secret().to_owned())
                .unwrap_or_default();
            mqtt.set_credentials(username, password);
        }
        if endpoint.tls {
            mqtt.set_transport(Transport::tls_with_default_config());
        }

        let capacity = options.queue_capacity.max(MIN_REQUEST_CAPACITY);
        let (client, eventloop) = AsyncClient::new(mqtt, capacity);
        Ok((
            Arc::new(RumqttClient { client }),
            Box::new(RumqttLink { eventloop }),
        ))
    }
}

struct RumqttClient {
    client: AsyncClient,
}

impl LinkClient for RumqttClient {
    fn publish(
        &self,
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> BoxFuture<'_, Result<(), LinkError>> {
        async move {
            self.client
                .publish_bytes(topic, qos, retain, payload)
                .await
                .map_err(|e| LinkError::Request(e.to_string()))
        }
        .boxed()
    }

    fn subscribe(&self, filter: String, qos: QoS) -> BoxFuture<'_, Result<(), LinkError>> {
        async move {
            self.client
                .subscribe(filter, qos)
                .await
                .map_err(|e| LinkError::Request(e.to_string()))
        }
        .boxed()
    }

    fn disconnect(&self) -> BoxFuture<'_, Result<(), LinkError>> {
        async move {
            self.client
                .disconnect()
                .await
                .map_err(|e| LinkError::Request(e.to_string()))
        }
        .boxed()
    }
}

struct RumqttLink {
    eventloop: EventLoop,
}

impl Link for RumqttLink {
    fn poll(&mut self) -> BoxFuture<'_, Result<LinkEvent, LinkError>> {
        async move {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => match ack.code {
                    ConnectReturnCode::Success => Ok(LinkEvent::Connected),
                    code => Err(refusal(code)),
                },
                Ok(Event::Incoming(Packet::Publish(publish))) => Ok(LinkEvent::Message(Message {
                    topic: publish.topic,
                    payload: publish.payload,
                    qos: publish.qos,
                    retain: publish.retain,
                })),
                Ok(_) => Ok(LinkEvent::Other),
                Err(e) => Err(map_connection_error(e)),
            }
        }
        .boxed()
    }
}

fn refusal(code: ConnectReturnCode) -> LinkError {
    match code {
        ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized => {
            LinkError::AuthRejected(format!("{code:?}"))
        }
        other => LinkError::Refused(format!("{other:?}")),
    }
}

fn map_connection_error(err: ConnectionError) -> LinkError {
    match err {
        ConnectionError::ConnectionRefused(code) => refusal(code),
        ConnectionError::Io(e) => LinkError::Network(e.to_string()),
        ConnectionError::NetworkTimeout => LinkError::Network("network timeout".into()),
        other => LinkError::Network(other.to_string()),
    }
}
