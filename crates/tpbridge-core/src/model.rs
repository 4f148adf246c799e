// Domain types shared with the platform client.

pub use tpbridge_api::platform::{AccessInfo, Credentials, Device, SubDevice};
