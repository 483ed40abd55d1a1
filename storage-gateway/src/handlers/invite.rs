use axum::{extract::State, response::IntoResponse, Json};
use service_core::error::AppError;

use crate::{
    dtos::{
        auth::{AdminCredentials, InviteResponse, VerifyInviteRequest},
        MessageResponse,
    },
    utils::ValidatedJson,
    AppState,
};

pub async fn create_invite(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<AdminCredentials>,
) -> Result<impl IntoResponse, AppError> {
    state
        .auth_service
        .authorize_admin(&req.username, &req.password)
        .map_err(|_| AppError::Unauthorized(anyhow::anyhow!("Invalid admin credentials")))?;

    let invite = state.invites.issue().await?;

    Ok(Json(InviteResponse { code: invite.code }))
}

/// Read-only check; the code stays redeemable.
pub async fn verify_invite(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<VerifyInviteRequest>,
) -> Result<impl IntoResponse, AppError> {
    if state.invites.check(&req.code).await? {
        Ok(Json(MessageResponse::new("Invite code is valid!")))
    } else {
        Err(AppError::Unauthorized(anyhow::anyhow!(
            "Invite code is invalid or already used"
        )))
    }
}
