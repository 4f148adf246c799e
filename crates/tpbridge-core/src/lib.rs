// tpbridge-core: device registry, platform callbacks and the bridge facade
//
// Ties the MQTT session and the platform REST client from `tpbridge-api`
// together with the in-memory device registry and the HTTP callback
// surface the platform calls into.

pub mod bridge;
pub mod callback;
pub mod config;
pub mod error;
pub mod model;
pub mod registry;

pub use bridge::{Bridge, Command};
pub use callback::{
    CallbackHandler, CallbackKind, CallbackRegistry, CallbackServer, DisconnectRequest,
    FormConfigQuery, HandlerError,
};
pub use config::{BridgeConfig, BridgeConfigBuilder};
pub use error::BridgeError;
pub use model::{AccessInfo, Credentials, Device, SubDevice};
pub use registry::{DeviceRegistry, DeviceSnapshot};

pub use tpbridge_api::mqtt::ReconnectConfig;
pub use tpbridge_api::{
    ApiErrorKind, ApiResponse, ConnectError, Message, PublishError, QoS, SessionHealth,
    SessionState, SubscribeError, TlsMode,
};
