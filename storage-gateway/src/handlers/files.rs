use axum::{
    extract::{multipart::MultipartError, Multipart, Path, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures::{StreamExt, TryStreamExt};
use service_core::error::AppError;

use crate::{
    dtos::{files::FileResponse, MessageResponse},
    middleware::AuthUser,
    services::StoreError,
    AppState,
};

/// Number of objects left out of a listing because they could not be signed.
pub const SKIPPED_ENTRIES_HEADER: &str = "x-skipped-entries";

const UPLOAD_FIELD: &str = "file";

pub async fn list_files(
    State(state): State<AppState>,
    AuthUser(_claims): AuthUser,
) -> Result<Response, AppError> {
    let listing = state.directory.list().await?;
    let files: Vec<FileResponse> = listing.files.into_iter().map(Into::into).collect();

    let mut response = Json(files).into_response();
    if listing.skipped > 0 {
        response.headers_mut().insert(
            HeaderName::from_static(SKIPPED_ENTRIES_HEADER),
            HeaderValue::from(listing.skipped),
        );
    }
    Ok(response)
}

/// Streams the multipart field `file` into the container under its
/// client-supplied file name.
pub async fn upload_file(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<FileResponse>, AppError> {
    let max_bytes = state.config.security.max_upload_bytes;
    if let Some(declared) = declared_length(&headers) {
        if declared > max_bytes {
            tracing::warn!(declared, max_bytes, "Rejected oversized upload");
            return Err(AppError::BadRequest(anyhow::anyhow!("File too large")));
        }
    }

    while let Some(field) = multipart.next_field().await.map_err(multipart_rejection)? {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }

        let file_name = field
            .file_name()
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .ok_or_else(|| AppError::BadRequest(anyhow::anyhow!("Error retrieving file")))?;
        let content_type = field.content_type().map(str::to_string);

        let body = field.map_err(body_error).boxed();
        let entry = state
            .directory
            .upload(&file_name, content_type.as_deref(), body)
            .await?;

        tracing::info!(user = %claims.sub, object = %entry.name, "Upload accepted");
        return Ok(Json(entry.into()));
    }

    Err(AppError::BadRequest(anyhow::anyhow!("Error retrieving file")))
}

pub async fn delete_file(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    Path(filename): Path<String>,
) -> Result<Json<MessageResponse>, AppError> {
    if filename.trim().is_empty() {
        return Err(missing_file_name());
    }

    state.directory.delete(&filename).await?;

    tracing::info!(user = %claims.sub, object = %filename, "Delete accepted");
    Ok(Json(MessageResponse::new("File deleted successfully")))
}

/// `DELETE /files/` with nothing after the slash.
pub async fn delete_without_name(AuthUser(_claims): AuthUser) -> AppError {
    missing_file_name()
}

fn missing_file_name() -> AppError {
    AppError::BadRequest(anyhow::anyhow!("File name is required"))
}

fn declared_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

fn is_too_large(err: &MultipartError) -> bool {
    err.status() == StatusCode::PAYLOAD_TOO_LARGE
}

fn multipart_rejection(err: MultipartError) -> AppError {
    if is_too_large(&err) {
        AppError::BadRequest(anyhow::anyhow!("File too large"))
    } else {
        tracing::debug!(error = %err.body_text(), "Malformed multipart body");
        AppError::BadRequest(anyhow::anyhow!("Error retrieving file"))
    }
}

fn body_error(err: MultipartError) -> StoreError {
    if is_too_large(&err) {
        StoreError::Body("File too large".to_string())
    } else {
        StoreError::Body("Error reading upload".to_string())
    }
}
