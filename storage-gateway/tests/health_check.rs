mod common;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use common::{test_config, TestApp};
use std::time::Duration;
use storage_gateway::services::{MemoryCredentialStore, MemoryObjectStore};

fn health_request() -> Request<Body> {
    Request::builder().uri("/health").body(Body::empty()).unwrap()
}

#[tokio::test]
async fn health_check_reports_both_dependencies() {
    let app = TestApp::spawn();

    let response = app.send(health_request()).await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["status"], "healthy");
    assert_eq!(response.body["checks"]["database"], "up");
    assert_eq!(response.body["checks"]["object_store"], "up");
    assert!(response.headers.contains_key("x-request-id"));
}

#[tokio::test]
async fn unreachable_object_store_is_unavailable() {
    let mut config = test_config();
    config.storage.timeout_seconds = 1;
    let app = TestApp::with_stores(
        config,
        MemoryCredentialStore::new(),
        MemoryObjectStore::new().with_latency(Duration::from_secs(3)),
    );

    let response = app.send(health_request()).await;

    assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
}
