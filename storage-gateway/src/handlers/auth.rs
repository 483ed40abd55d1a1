use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use service_core::error::AppError;

use crate::{
    dtos::{
        auth::{LoginRequest, LoginResponse, SignupRequest},
        MessageResponse,
    },
    utils::ValidatedJson,
    AppState,
};

/// Register with an invite code.
pub async fn signup(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<SignupRequest>,
) -> Result<impl IntoResponse, AppError> {
    state
        .auth_service
        .register(&req.username, req.password, &req.invite)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(MessageResponse::new("User created successfully")),
    ))
}

/// Exchange credentials for a session token.
pub async fn login(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<LoginRequest>,
) -> Result<impl IntoResponse, AppError> {
    let session = state
        .auth_service
        .login(&req.username, req.password)
        .await?;

    Ok(Json(LoginResponse {
        token: session.token,
    }))
}
