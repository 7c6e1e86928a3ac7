// HTTP contract tests for `NrfCloudClient` using wiremock.

use serde_json::json;
use wiremock::matchers::{body_string, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use trackersim_device::{CloudApi, NrfCloudClient};

// ── Helpers ─────────────────────────────────────────────────────────

async fn setup() -> (MockServer, NrfCloudClient) {
    let server = MockServer::start().await;
    let client = NrfCloudClient::new(
        server.uri(),
        "test-key",
        format!("{}/AmazonRootCA1.pem", server.uri()),
    )
    .unwrap();
    (server, client)
}

// ── Happy-path tests ────────────────────────────────────────────────

#[tokio::test]
async fn test_get_account_sends_bearer_token() {
    let (server, client) = setup().await;

    Mock::given(method("GET"))
        .and(path("/v1/account"))
        .and(header("authorization", "Bearer test-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "mqttEndpoint": "mqtt.example.test",
            "mqttTopicPrefix": "prod/tenant-9/",
            "team": {"tenantId": "tenant-9"},
            "plan": {"type": "DEVELOPER"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let account = client.get_account().await.unwrap();
    assert_eq!(account.mqtt_host(), "mqtt.example.test");
    assert_eq!(account.topic_prefix(), "prod/tenant-9");
    assert_eq!(account.tenant_id().as_deref(), Some("tenant-9"));
}

#[tokio::test]
async fn test_get_device_reads_pairing_topics() {
    let (server, client) = setup().await;

    Mock::given(method("GET"))
        .and(path("/v1/devices/dev-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "dev-1",
            "tags": ["simulator"],
            "state": {"desired": {"pairing": {"topics": {
                "d2c": "prod/t/m/d/dev-1/d2c",
                "c2d": "prod/t/m/d/dev-1/+/r"
            }}}}
        })))
        .mount(&server)
        .await;

    let record = client.get_device("dev-1").await.unwrap();
    assert_eq!(record.tags, vec!["simulator".to_string()]);
    assert_eq!(
        record.assigned_topics(),
        Some((
            "prod/t/m/d/dev-1/d2c".to_string(),
            "prod/t/m/d/dev-1/+/r".to_string()
        ))
    );
}

#[tokio::test]
async fn test_onboard_uploads_csv_line() {
    let (server, client) = setup().await;
    let pem = "-----BEGIN CERTIFICATE-----\nABC\n-----END CERTIFICATE-----\n";

    Mock::given(method("POST"))
        .and(path("/v1/devices"))
        .and(header("content-type", "application/octet-stream"))
        .and(header("authorization", "Bearer test-key"))
        .and(body_string(
            "dev-1,,simulator,,\"-----BEGIN CERTIFICATE-----\nABC\n-----END CERTIFICATE-----\n\"",
        ))
        .respond_with(ResponseTemplate::new(202).set_body_json(json!({"bulkOpsRequestId": "x"})))
        .expect(1)
        .mount(&server)
        .await;

    client.onboard_device("dev-1", pem).await.unwrap();
}

#[tokio::test]
async fn test_patch_device_state() {
    let (server, client) = setup().await;

    Mock::given(method("PATCH"))
        .and(path("/v1/devices/dev-1/state"))
        .and(header("content-type", "application/json"))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    client
        .update_device_state("dev-1", &json!({"desired": {"config": {"locationInterval": 60}}}))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_fetch_root_ca() {
    let (server, client) = setup().await;

    Mock::given(method("GET"))
        .and(path("/AmazonRootCA1.pem"))
        .respond_with(ResponseTemplate::new(200).set_body_string("PEM"))
        .mount(&server)
        .await;

    assert_eq!(client.fetch_root_ca().await.unwrap(), b"PEM".to_vec());
}

// ── Error mapping ───────────────────────────────────────────────────

#[tokio::test]
async fn test_conflict_status_is_detectable() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/v1/devices"))
        .respond_with(ResponseTemplate::new(409).set_body_string("device exists"))
        .mount(&server)
        .await;

    let err = client.onboard_device("dev-1", "PEM").await.unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(err.status(), Some(409));
    assert!(err.to_string().contains("device exists"));
}

#[tokio::test]
async fn test_not_found_status_is_detectable() {
    let (server, client) = setup().await;

    Mock::given(method("GET"))
        .and(path("/v1/devices/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let err = client.get_device("missing").await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_invalid_json_is_a_decode_error() {
    let (server, client) = setup().await;

    Mock::given(method("GET"))
        .and(path("/v1/account"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
        .mount(&server)
        .await;

    let err = client.get_account().await.unwrap_err();
    assert!(matches!(err, trackersim_device::CloudError::Decode { .. }));
    assert_eq!(err.status(), None);
}
