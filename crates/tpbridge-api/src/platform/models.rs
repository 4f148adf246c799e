// Platform API request and response types
//
// Request bodies are the exact snake_case shapes the platform expects.
// Responses may arrive bare or wrapped in the `{ code, message, data }`
// envelope; the client unwraps either form. Unknown fields are ignored.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ── Request bodies ───────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub(crate) struct DeviceConfigRequest<'a> {
    pub device_id: &'a str,
    pub voucher: &'a str,
    pub device_number: &'a str,
}

#[derive(Debug, Serialize)]
pub(crate) struct DeviceAuthRequest<'a> {
    pub template_secret: &'a str,
    pub device_number: &'a str,
}

/// Body shared by the service access and heartbeat endpoints.
#[derive(Debug, Serialize)]
pub(crate) struct ServiceRequest<'a> {
    pub service_identifier: &'a str,
}

// ── Response envelope ────────────────────────────────────────────────

/// Standard platform envelope:
/// ```json
/// { "code": 200, "message": "success", "data": { ... } }
/// ```
/// Endpoints that answer with the payload directly are decoded as-is; see
/// [`Envelope::detect`].
#[derive(Debug, Deserialize)]
pub(crate) struct Envelope {
    pub code: i64,
    #[serde(default, alias = "msg")]
    pub message: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
}

impl Envelope {
    /// `code` value the platform uses for success.
    pub(crate) const OK: i64 = 200;

    /// A body is an envelope when it has a numeric `code` next to a
    /// `data` or `message` field.
    pub(crate) fn detect(value: &Value) -> bool {
        let Some(obj) = value.as_object() else {
            return false;
        };
        obj.get("code").is_some_and(Value::is_i64)
            && (obj.contains_key("data") || obj.contains_key("message") || obj.contains_key("msg"))
    }
}

// ── Device ───────────────────────────────────────────────────────────

/// A device managed by this plugin, as returned by the config endpoint.
///
/// `device_id` (the platform also calls it `id`) and `voucher` are
/// required; everything else defaults when absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    #[serde(alias = "id")]
    pub device_id: String,
    pub voucher: String,
    #[serde(default)]
    pub device_number: String,
    #[serde(default)]
    pub device_type: String,
    #[serde(default)]
    pub protocol_type: String,
    /// Opaque per-device configuration.
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(default)]
    pub sub_devices: Vec<SubDevice>,
}

/// A child device reached through its parent (gateway) on some bus address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubDevice {
    pub device_id: String,
    #[serde(default)]
    pub voucher: String,
    #[serde(default)]
    pub device_number: String,
    #[serde(default, alias = "sub_device_addr")]
    pub address: String,
}

impl Device {
    pub fn new(
        device_id: impl Into<String>,
        voucher: impl Into<String>,
        device_number: impl Into<String>,
        device_type: impl Into<String>,
        protocol_type: impl Into<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            voucher: voucher.into(),
            device_number: device_number.into(),
            device_type: device_type.into(),
            protocol_type: protocol_type.into(),
            config: Map::new(),
            sub_devices: Vec::new(),
        }
    }

    /// Add a sub-device, replacing an existing one with the same
    /// `(device_number, address)` pair in place.
    pub fn push_sub_device(&mut self, sub: SubDevice) {
        match self
            .sub_devices
            .iter_mut()
            .find(|s| s.device_number == sub.device_number && s.address == sub.address)
        {
            Some(existing) => *existing = sub,
            None => self.sub_devices.push(sub),
        }
    }

    /// Collapse duplicate `(device_number, address)` pairs: the first
    /// position is kept, the last value wins.
    pub fn dedup_sub_devices(&mut self) {
        let subs = std::mem::take(&mut self.sub_devices);
        for sub in subs {
            self.push_sub_device(sub);
        }
    }

    pub fn sub_device_by_address(&self, address: &str) -> Option<&SubDevice> {
        self.sub_devices.iter().find(|s| s.address == address)
    }

    pub fn config_value(&self, key: &str) -> Option<&Value> {
        self.config.get(key)
    }
}

impl SubDevice {
    pub fn new(
        device_id: impl Into<String>,
        voucher: impl Into<String>,
        device_number: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            voucher: voucher.into(),
            device_number: device_number.into(),
            address: address.into(),
        }
    }
}

// ── Credentials / access info ────────────────────────────────────────

/// Result of dynamic device authentication.
///
/// The platform's field set varies by template; everything it sends is
/// kept in `fields`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Credentials {
    pub fn device_id(&self) -> Option<&str> {
        self.fields.get("device_id").and_then(Value::as_str)
    }

    pub fn voucher(&self) -> Option<&str> {
        self.fields.get("voucher").and_then(Value::as_str)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

/// Service access point information.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccessInfo {
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl AccessInfo {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}
