// Platform REST API
//
// Hand-written client for the four plugin-facing ThingsPanel endpoints.
// Every call resolves to an `ApiResponse`; errors never escape as `Err`.

pub mod client;
pub mod device;
pub mod models;
pub mod service;

pub use client::PlatformClient;
pub use models::{AccessInfo, Credentials, Device, SubDevice};
