#![allow(dead_code)]

use axum::{
    body::{to_bytes, Body},
    http::{header, HeaderMap, Method, Request, StatusCode},
    Router,
};
use secrecy::Secret;
use serde_json::Value;
use service_core::config::Config as CoreConfig;
use std::sync::Arc;
use std::time::Duration;
use storage_gateway::{
    build_router,
    config::{
        AdminConfig, DatabaseConfig, Environment, GatewayConfig, JwtConfig, RateLimitConfig,
        SecurityConfig, StorageConfig,
    },
    models::InviteCode,
    services::{CredentialStore, JwtService, MemoryCredentialStore, MemoryObjectStore, SasSigner},
    AppState,
};
use tower::util::ServiceExt;

pub const ADMIN_USERNAME: &str = "admin";
pub const ADMIN_PASSWORD: &str = "admin-password";
pub const TEST_ACCOUNT: &str = "gatewaytest";
pub const TEST_CONTAINER: &str = "files";
pub const MULTIPART_BOUNDARY: &str = "gateway-test-boundary";

pub fn test_config() -> GatewayConfig {
    GatewayConfig {
        common: CoreConfig { port: 0 },
        environment: Environment::Dev,
        service_name: "storage-gateway-test".to_string(),
        service_version: "0.0.0".to_string(),
        log_level: "error".to_string(),
        otlp_endpoint: None,
        database: DatabaseConfig {
            url: Secret::new("postgres://unused".to_string()),
            max_connections: 1,
            min_connections: 0,
            timeout_seconds: 5,
            connect_attempts: 1,
            connect_retry_seconds: 1,
        },
        storage: StorageConfig {
            account: TEST_ACCOUNT.to_string(),
            access_key: Secret::new("Z2F0ZXdheS10ZXN0LXNpZ25pbmcta2V5LTAxMjM0NTY3ODk=".to_string()),
            container: TEST_CONTAINER.to_string(),
            endpoint: None,
            timeout_seconds: 5,
            sas_validity_minutes: 60,
            sas_clock_skew_minutes: 1,
            upload_block_bytes: 1024,
            upload_max_in_flight: 4,
            list_page_size: None,
        },
        jwt: JwtConfig {
            secret: Secret::new("integration-test-secret".to_string()),
            token_expiry_hours: 24,
        },
        admin: AdminConfig {
            username: ADMIN_USERNAME.to_string(),
            password: Secret::new(ADMIN_PASSWORD.to_string()),
        },
        security: SecurityConfig {
            allowed_origins: vec!["*".to_string()],
            max_upload_bytes: 64 * 1024,
        },
        rate_limit: RateLimitConfig {
            auth_attempts: 1000,
            auth_window_seconds: 60,
            trust_forwarded_for: false,
        },
    }
}

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

/// Router wired to in-memory stores, driven with `oneshot`.
pub struct TestApp {
    pub router: Router,
    pub config: GatewayConfig,
    pub credentials: Arc<MemoryCredentialStore>,
    pub objects: MemoryObjectStore,
    pub signer: SasSigner,
    pub jwt: JwtService,
}

impl TestApp {
    pub fn spawn() -> Self {
        Self::with_stores(
            test_config(),
            MemoryCredentialStore::new(),
            MemoryObjectStore::new(),
        )
    }

    pub fn with_page_size(page_size: usize) -> Self {
        Self::with_stores(
            test_config(),
            MemoryCredentialStore::new(),
            MemoryObjectStore::new().with_page_size(page_size),
        )
    }

    pub fn with_stores(
        config: GatewayConfig,
        credentials: MemoryCredentialStore,
        objects: MemoryObjectStore,
    ) -> Self {
        let credentials = Arc::new(credentials);
        let signer = SasSigner::new(&config.storage).expect("Failed to build signer");
        let jwt = JwtService::new(&config.jwt).expect("Failed to build JWT service");

        let state = AppState::new(
            config.clone(),
            credentials.clone(),
            Arc::new(objects.clone()),
            signer.clone(),
        )
        .expect("Failed to build app state");

        TestApp {
            router: build_router(state),
            config,
            credentials,
            objects,
            signer,
            jwt,
        }
    }

    pub async fn send(&self, request: Request<Body>) -> TestResponse {
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("Router failed");

        let status = response.status();
        let headers = response.headers().clone();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("Failed to read body");
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(&bytes).into_owned())
            })
        };

        TestResponse {
            status,
            headers,
            body,
        }
    }

    pub async fn post_json(&self, uri: &str, body: Value) -> TestResponse {
        self.send(
            Request::builder()
                .method(Method::POST)
                .uri(uri)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
    }

    pub async fn get_authed(&self, uri: &str, token: &str) -> TestResponse {
        self.send(
            Request::builder()
                .method(Method::GET)
                .uri(uri)
                .header(header::AUTHORIZATION, format!("Bearer {}", token))
                .body(Body::empty())
                .unwrap(),
        )
        .await
    }

    pub async fn delete_authed(&self, uri: &str, token: &str) -> TestResponse {
        self.send(
            Request::builder()
                .method(Method::DELETE)
                .uri(uri)
                .header(header::AUTHORIZATION, format!("Bearer {}", token))
                .body(Body::empty())
                .unwrap(),
        )
        .await
    }

    pub async fn upload(&self, uri: &str, token: &str, file_name: &str, content: &[u8]) -> TestResponse {
        let body = multipart_body("file", Some(file_name), content);
        self.send(
            Request::builder()
                .method(Method::POST)
                .uri(uri)
                .header(header::AUTHORIZATION, format!("Bearer {}", token))
                .header(
                    header::CONTENT_TYPE,
                    format!("multipart/form-data; boundary={}", MULTIPART_BOUNDARY),
                )
                .header(header::CONTENT_LENGTH, body.len())
                .body(Body::from(body))
                .unwrap(),
        )
        .await
    }

    pub async fn seed_invite(&self, code: &str) {
        self.credentials
            .insert_invite(&InviteCode::new(code.to_string()))
            .await
            .expect("Failed to seed invite");
    }

    pub async fn invite_used(&self, code: &str) -> bool {
        self.credentials
            .find_invite(code)
            .await
            .expect("Failed to read invite")
            .map(|invite| invite.used)
            .unwrap_or(false)
    }

    pub async fn signup(&self, username: &str, password: &str, invite: &str) -> TestResponse {
        self.post_json(
            "/signup",
            serde_json::json!({
                "username": username,
                "password": password,
                "invite": invite,
            }),
        )
        .await
    }

    pub async fn login(&self, username: &str, password: &str) -> TestResponse {
        self.post_json(
            "/login",
            serde_json::json!({ "username": username, "password": password }),
        )
        .await
    }

    /// A session token for `username` without going through signup.
    pub fn token_for(&self, username: &str) -> String {
        self.jwt
            .issue_session_token(username)
            .expect("Failed to issue token")
            .token
    }
}

pub fn multipart_body(field: &str, file_name: Option<&str>, content: &[u8]) -> Vec<u8> {
    let disposition = match file_name {
        Some(file_name) => format!(
            "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
            field, file_name
        ),
        None => format!("Content-Disposition: form-data; name=\"{}\"\r\n", field),
    };

    let mut body = Vec::new();
    body.extend_from_slice(format!("--{}\r\n", MULTIPART_BOUNDARY).as_bytes());
    body.extend_from_slice(disposition.as_bytes());
    body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{}--\r\n", MULTIPART_BOUNDARY).as_bytes());
    body
}

pub fn slow_credentials(latency: Duration) -> MemoryCredentialStore {
    MemoryCredentialStore::new().with_latency(latency)
}
