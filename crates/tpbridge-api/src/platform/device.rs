// Platform device endpoints
//
// Dynamic authentication for template-provisioned devices and the
// per-device configuration fetch.

use tracing::debug;

use crate::platform::client::PlatformClient;
use crate::platform::models::{Credentials, Device, DeviceAuthRequest, DeviceConfigRequest};
use crate::response::ApiResponse;

impl PlatformClient {
    /// Exchange a template secret for device credentials.
    ///
    /// `POST /api/v1/device/auth` with `{template_secret, device_number}`
    pub async fn device_dynamic_auth(
        &self,
        template_secret: &str,
        device_number: &str,
    ) -> ApiResponse<Credentials> {
        debug!(device_number, "dynamic device auth");
        let body = DeviceAuthRequest {
            template_secret,
            device_number,
        };
        ApiResponse::from_result(self.call("api/v1/device/auth", &body).await)
    }

    /// Fetch the configuration of one device (and its sub-devices).
    ///
    /// `POST /api/v1/plugin/device/config` with `{device_id, voucher, device_number}`
    pub async fn get_device_config(
        &self,
        device_id: &str,
        voucher: &str,
        device_number: &str,
    ) -> ApiResponse<Device> {
        debug!(device_id, device_number, "fetching device config");
        let body = DeviceConfigRequest {
            device_id,
            voucher,
            device_number,
        };
        let mut response: ApiResponse<Device> =
            ApiResponse::from_result(self.call("api/v1/plugin/device/config", &body).await);
        if let Some(device) = response.data_mut() {
            device.dedup_sub_devices();
        }
        response
    }
}
