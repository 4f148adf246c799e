#![allow(clippy::unwrap_used)]
// Integration tests for `PlatformClient` using wiremock.

use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use tpbridge_api::{ApiErrorKind, PlatformClient, TransportConfig};

// ── Helpers ─────────────────────────────────────────────────────────

async fn setup() -> (MockServer, PlatformClient) {
    let server = MockServer::start().await;
    let client = PlatformClient::new(&server.uri(), &TransportConfig::default()).unwrap();
    (server, client)
}

fn device_json() -> serde_json::Value {
    json!({
        "device_id": "dev-1",
        "voucher": "{\"username\":\"dev-1\"}",
        "device_number": "SN-001",
        "device_type": "2",
        "protocol_type": "MODBUS_RTU",
        "config": { "interval": 5 },
        "sub_devices": [
            { "device_id": "sub-1", "voucher": "v", "device_number": "SUB-1", "address": "1" },
            { "device_id": "sub-2", "voucher": "v", "device_number": "SUB-2", "address": "2" }
        ]
    })
}

// ── Device config ───────────────────────────────────────────────────

#[tokio::test]
async fn test_get_device_config_bare_body() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/api/v1/plugin/device/config"))
        .and(header("content-type", "application/json"))
        .and(body_json(json!({
            "device_id": "dev-1",
            "voucher": "secret",
            "device_number": "SN-001"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(device_json()))
        .expect(1)
        .mount(&server)
        .await;

    let resp = client.get_device_config("dev-1", "secret", "SN-001").await;

    assert!(resp.is_success(), "unexpected failure: {}", resp.message());
    let device = resp.data().unwrap();
    assert_eq!(device.device_id, "dev-1");
    assert_eq!(device.protocol_type, "MODBUS_RTU");
    assert_eq!(device.config_value("interval"), Some(&json!(5)));
    assert_eq!(device.sub_devices.len(), 2);
    assert_eq!(device.sub_device_by_address("2").unwrap().device_id, "sub-2");
}

#[tokio::test]
async fn test_get_device_config_enveloped_body() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/api/v1/plugin/device/config"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 200,
            "message": "success",
            "data": device_json()
        })))
        .mount(&server)
        .await;

    let resp = client.get_device_config("dev-1", "secret", "SN-001").await;
    assert_eq!(resp.into_data().unwrap().device_number, "SN-001");
}

#[tokio::test]
async fn test_get_device_config_not_found() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/api/v1/plugin/device/config"))
        .respond_with(ResponseTemplate::new(404).set_body_string("device not found"))
        .expect(1)
        .mount(&server)
        .await;

    let resp = client.get_device_config("missing", "v", "n").await;

    assert!(!resp.is_success());
    assert!(resp.data().is_none());
    assert_eq!(resp.message(), "device not found");
    assert_eq!(resp.error_kind(), Some(ApiErrorKind::HttpStatus(404)));
}

#[tokio::test]
async fn test_envelope_with_error_code_is_failure() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/api/v1/plugin/device/config"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 400,
            "message": "invalid voucher"
        })))
        .mount(&server)
        .await;

    let resp = client.get_device_config("dev-1", "bad", "SN").await;
    assert!(!resp.is_success());
    assert_eq!(resp.message(), "invalid voucher");
    assert_eq!(resp.error_kind(), Some(ApiErrorKind::Rejected));
}

#[tokio::test]
async fn test_missing_required_field_is_decode_failure() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/api/v1/plugin/device/config"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "device_id": "dev-1" })))
        .expect(1)
        .mount(&server)
        .await;

    let resp = client.get_device_config("dev-1", "v", "n").await;
    assert!(!resp.is_success());
    assert!(resp.data().is_none());
    assert_eq!(resp.error_kind(), Some(ApiErrorKind::DecodeFailure));
    assert!(resp.message().contains("voucher"), "{}", resp.message());
}

// ── Dynamic auth ────────────────────────────────────────────────────

#[tokio::test]
async fn test_device_dynamic_auth() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/api/v1/device/auth"))
        .and(body_json(json!({
            "template_secret": "tpl-secret",
            "device_number": "SN-9"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "device_id": "new-id",
            "voucher": "new-voucher",
            "expires_in": 3600
        })))
        .mount(&server)
        .await;

    let resp = client.device_dynamic_auth("tpl-secret", "SN-9").await;

    let creds = resp.into_data().unwrap();
    assert_eq!(creds.device_id(), Some("new-id"));
    assert_eq!(creds.voucher(), Some("new-voucher"));
    assert_eq!(creds.get("expires_in"), Some(&json!(3600)));
}

// ── Service endpoints ───────────────────────────────────────────────

#[tokio::test]
async fn test_get_service_access() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/api/v1/plugin/service/access"))
        .and(body_json(json!({ "service_identifier": "modbus" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 200,
            "message": "ok",
            "data": { "host": "10.0.0.2", "port": 502 }
        })))
        .mount(&server)
        .await;

    let resp = client.get_service_access("modbus").await;
    let info = resp.into_data().unwrap();
    assert_eq!(info.get("host"), Some(&json!("10.0.0.2")));
}

#[tokio::test]
async fn test_send_heartbeat_ignores_body() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/api/v1/plugin/heartbeat"))
        .and(body_json(json!({ "service_identifier": "modbus" })))
        .respond_with(ResponseTemplate::new(200).set_body_string("pong"))
        .expect(1)
        .mount(&server)
        .await;

    let resp = client.send_heartbeat("modbus").await;
    assert!(resp.is_success());
    assert_eq!(resp.message(), "pong");
}

#[tokio::test]
async fn test_server_error_with_empty_body() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/api/v1/plugin/heartbeat"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;

    let resp = client.send_heartbeat("modbus").await;
    assert!(!resp.is_success());
    assert_eq!(resp.message(), "HTTP 503");
}

// ── Retry & cancellation ────────────────────────────────────────────

#[tokio::test]
async fn test_timeout_is_retried_once() {
    let server = MockServer::start().await;
    let transport = TransportConfig {
        timeout: Duration::from_millis(200),
        ..TransportConfig::default()
    };
    let client = PlatformClient::new(&server.uri(), &transport).unwrap();

    Mock::given(method("POST"))
        .and(path("/api/v1/plugin/heartbeat"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .expect(2)
        .mount(&server)
        .await;

    let resp = client.send_heartbeat("svc").await;
    assert!(!resp.is_success());
    assert_eq!(resp.error_kind(), Some(ApiErrorKind::Timeout));
}

#[tokio::test]
async fn test_client_error_is_not_retried() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/api/v1/device/auth"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad secret"))
        .expect(1)
        .mount(&server)
        .await;

    let resp = client.device_dynamic_auth("x", "y").await;
    assert_eq!(resp.message(), "bad secret");
}

#[tokio::test]
async fn test_cancelled_client_sends_nothing() {
    let (server, client) = setup().await;
    let cancel = CancellationToken::new();
    let client = client.with_cancellation(cancel.clone());

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(0)
        .mount(&server)
        .await;

    cancel.cancel();
    let resp = client.send_heartbeat("svc").await;
    assert_eq!(resp.error_kind(), Some(ApiErrorKind::Cancelled));
}

#[tokio::test]
async fn test_cancel_aborts_in_flight_request() {
    let (server, client) = setup().await;
    let cancel = CancellationToken::new();
    let client = client.with_cancellation(cancel.clone());

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let call = tokio::spawn(async move { client.send_heartbeat("svc").await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();

    let resp = tokio::time::timeout(Duration::from_secs(2), call)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(resp.error_kind(), Some(ApiErrorKind::Cancelled));
}

#[tokio::test]
async fn test_unreachable_platform_is_network_failure() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client =
        PlatformClient::new(&format!("http://{addr}/"), &TransportConfig::default()).unwrap();
    let resp = client.get_service_access("svc").await;

    assert!(!resp.is_success());
    assert_eq!(resp.error_kind(), Some(ApiErrorKind::Network));
    assert!(!resp.message().is_empty());
}
