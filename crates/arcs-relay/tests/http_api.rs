//! HTTP surface: health, metrics, and device registration.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use arcs_relay::{RelayConfig, RelayServer};

async fn test_server() -> (RelayServer, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let config = RelayConfig {
        token_secret: "integration-test-secret".to_string(),
        registry_path: dir.path().join("devices.db"),
        audit_log_path: dir.path().join("audit.log"),
        ..Default::default()
    };
    (RelayServer::new(config).await.unwrap(), dir)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn register_request(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/devices/register")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn health_reports_ok_and_session_count() {
    let (server, _dir) = test_server().await;

    let response = server
        .router()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["sessions"], 0);
    assert!(body["timestamp"].is_i64());
}

#[tokio::test]
async fn metrics_exports_prometheus_text() {
    let (server, _dir) = test_server().await;

    let response = server
        .router()
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("arcs_relay_active_sessions"));
}

#[tokio::test]
async fn register_then_duplicate_then_bad_request() {
    let (server, _dir) = test_server().await;

    let response = server
        .router()
        .oneshot(register_request(json!({
            "device_id": "d1",
            "device_secret": "s1",
            "device_model": "P7"
        })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["deviceId"], "d1");
    assert!(!body["token"].as_str().unwrap().is_empty());

    // Same id again: refused, secret untouched.
    let response = server
        .router()
        .oneshot(register_request(json!({
            "device_id": "d1",
            "device_secret": "other",
            "device_model": "P8"
        })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body = body_json(response).await;
    assert_eq!(body["success"], false);
    assert!(server.state().registry.authenticate("d1", "s1").await.unwrap());

    // Empty credentials never hit the store.
    let response = server
        .router()
        .oneshot(register_request(json!({
            "device_id": "",
            "device_secret": ""
        })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
