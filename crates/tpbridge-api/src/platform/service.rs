// Platform service endpoints

use tracing::debug;

use crate::platform::client::PlatformClient;
use crate::platform::models::{AccessInfo, ServiceRequest};
use crate::response::ApiResponse;

impl PlatformClient {
    /// `POST /api/v1/plugin/service/access` with `{service_identifier}`
    pub async fn get_service_access(&self, service_identifier: &str) -> ApiResponse<AccessInfo> {
        debug!(service_identifier, "fetching service access");
        let body = ServiceRequest { service_identifier };
        ApiResponse::from_result(self.call("api/v1/plugin/service/access", &body).await)
    }

    /// Tell the platform this service is alive.
    ///
    /// `POST /api/v1/plugin/heartbeat` with `{service_identifier}`. Any 2xx
    /// answer counts as success; the body is not inspected.
    pub async fn send_heartbeat(&self, service_identifier: &str) -> ApiResponse<()> {
        debug!(service_identifier, "sending heartbeat");
        let body = ServiceRequest { service_identifier };
        let result = self
            .post_json("api/v1/plugin/heartbeat", &body)
            .await
            .map(|raw| (raw, ()));
        ApiResponse::from_result(result)
    }
}
