// MQTT transport session
//
// Client-side session management on top of rumqttc: connect/disconnect,
// publish with a reconnect queue, wildcard subscriptions with ordered
// per-topic dispatch, and ThingsPanel topic conventions.

pub mod backoff;
mod dispatch;
pub mod link;
pub mod options;
pub mod rumqtt;
pub mod session;
pub mod topics;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use backoff::ReconnectConfig;
pub use dispatch::MessageHandler;
pub use link::{Connector, Link, LinkClient, LinkError, LinkEvent, Message};
pub use options::{Endpoint, MqttOptions};
pub use rumqtt::RumqttConnector;
pub use session::{MqttSession, SessionHealth, SessionState};

pub use rumqttc::QoS;
