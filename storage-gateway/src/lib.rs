pub mod config;
pub mod db;
pub mod dtos;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod utils;

use axum::{
    extract::{DefaultBodyLimit, State},
    http::{header, HeaderName, HeaderValue, Method},
    middleware::{from_fn, from_fn_with_state},
    routing::{delete, get, post},
    Json, Router,
};
use service_core::error::AppError;
use service_core::middleware::{
    metrics::metrics_middleware,
    rate_limit::{ip_rate_limit_middleware, IpRateLimit},
    security_headers::security_headers_middleware,
    tracing::{request_id_middleware, REQUEST_ID_HEADER},
};
use std::sync::Arc;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

use crate::config::GatewayConfig;
use crate::handlers::files::SKIPPED_ENTRIES_HEADER;
use crate::services::{
    timeout::within, AuthService, CredentialStore, InviteLedger, JwtService, ObjectDirectory,
    ObjectStore, SasSigner,
};

#[derive(Clone)]
pub struct AppState {
    pub config: GatewayConfig,
    pub credentials: Arc<dyn CredentialStore>,
    pub jwt: JwtService,
    pub auth_service: AuthService,
    pub invites: InviteLedger,
    pub directory: ObjectDirectory,
    pub auth_rate_limit: IpRateLimit,
}

impl AppState {
    /// Wires every component from one loaded configuration.
    pub fn new(
        config: GatewayConfig,
        credentials: Arc<dyn CredentialStore>,
        objects: Arc<dyn ObjectStore>,
        signer: SasSigner,
    ) -> Result<Self, AppError> {
        let jwt = JwtService::new(&config.jwt).map_err(AppError::ConfigError)?;
        let db_timeout = config.database.timeout();

        let auth_service = AuthService::new(
            credentials.clone(),
            jwt.clone(),
            config.admin.clone(),
            db_timeout,
        );
        let invites = InviteLedger::new(credentials.clone(), db_timeout);
        let directory = ObjectDirectory::new(objects, signer, config.storage.timeout());
        let auth_rate_limit = IpRateLimit::new(
            config.rate_limit.auth_attempts,
            config.rate_limit.auth_window_seconds,
            config.rate_limit.trust_forwarded_for,
        );

        Ok(Self {
            config,
            credentials,
            jwt,
            auth_service,
            invites,
            directory,
            auth_rate_limit,
        })
    }
}

/// Routes shared by the root and the `/api` prefix.
fn api_routes(state: &AppState) -> Router<AppState> {
    let auth_routes = Router::new()
        .route("/signup", post(handlers::auth::signup))
        .route("/login", post(handlers::auth::login))
        .route("/admin/invite", post(handlers::invite::create_invite))
        .route("/verify-invite", post(handlers::invite::verify_invite))
        .layer(from_fn_with_state(
            state.auth_rate_limit.clone(),
            ip_rate_limit_middleware,
        ));

    let upload_limit = usize::try_from(state.config.security.max_upload_bytes).unwrap_or(usize::MAX);

    let file_routes = Router::new()
        .route("/files", get(handlers::files::list_files))
        .route("/files/", delete(handlers::files::delete_without_name))
        .route("/files/*filename", delete(handlers::files::delete_file))
        .route(
            "/upload",
            post(handlers::files::upload_file).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .layer(from_fn_with_state(
            state.clone(),
            middleware::auth_middleware,
        ));

    auth_routes.merge(file_routes)
}

pub fn build_router(state: AppState) -> Router {
    let api = api_routes(&state);

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(handlers::metrics::metrics))
        .merge(api.clone())
        .nest("/api", api)
        .with_state(state.clone())
        .layer(from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http().make_span_with(
            |request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get(REQUEST_ID_HEADER)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri().path(),
                    version = ?request.version(),
                )
            },
        ))
        .layer(from_fn(request_id_middleware))
        .layer(from_fn(security_headers_middleware))
        .layer(cors_layer(&state.config.security.allowed_origins))
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let allow_origin = if allowed_origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(allowed_origins.iter().filter_map(|o| {
            o.parse::<HeaderValue>()
                .map_err(|e| tracing::error!(origin = %o, error = %e, "Ignoring invalid CORS origin"))
                .ok()
        }))
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static(REQUEST_ID_HEADER),
        ])
        .expose_headers([
            HeaderName::from_static(REQUEST_ID_HEADER),
            HeaderName::from_static(SKIPPED_ENTRIES_HEADER),
        ])
}

/// Reports whether the database and the container are reachable.
pub async fn health_check(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    within(
        state.config.database.timeout(),
        "database",
        state.credentials.health_check(),
    )
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "Database health check failed");
        AppError::ServiceUnavailable
    })?;

    state.directory.health_check().await.map_err(|e| {
        tracing::error!(error = %e, "Object store health check failed");
        AppError::ServiceUnavailable
    })?;

    Ok(Json(serde_json::json!({
        "status": "healthy",
        "service": state.config.service_name,
        "version": state.config.service_version,
        "checks": {
            "database": "up",
            "object_store": "up"
        }
    })))
}
