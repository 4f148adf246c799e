// tpbridge-api: MQTT session and REST client for the ThingsPanel platform

pub mod error;
pub mod mqtt;
pub mod platform;
pub mod response;
pub mod transport;

pub use error::{ApiError, ApiErrorKind, ConnectError, PublishError, SubscribeError};
pub use mqtt::{Message, MqttOptions, MqttSession, QoS, SessionHealth, SessionState};
pub use platform::{AccessInfo, Credentials, Device, PlatformClient, SubDevice};
pub use response::ApiResponse;
pub use transport::{TlsMode, TransportConfig};
