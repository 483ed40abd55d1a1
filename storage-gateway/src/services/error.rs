use service_core::error::AppError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),

    #[error("Upstream timeout: {0}")]
    Timeout(String),

    #[error("Missing required fields")]
    MissingFields,

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Username already taken")]
    UsernameTaken,

    #[error("Invalid or already used invite code")]
    InvalidInvite,

    #[error("Invite code already exists")]
    DuplicateInviteCode,
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Database(e) => AppError::DatabaseError(anyhow::Error::new(e)),
            ServiceError::Internal(e) => AppError::InternalError(e),
            ServiceError::Timeout(what) => AppError::GatewayTimeout(what),
            ServiceError::MissingFields => {
                AppError::BadRequest(anyhow::anyhow!("Missing required fields"))
            }
            ServiceError::InvalidCredentials => {
                AppError::AuthError(anyhow::anyhow!("Invalid credentials"))
            }
            ServiceError::UsernameTaken => {
                AppError::Conflict(anyhow::anyhow!("Username already taken"))
            }
            ServiceError::InvalidInvite => {
                AppError::Forbidden(anyhow::anyhow!("Invalid or already used invite code"))
            }
            ServiceError::DuplicateInviteCode => {
                AppError::InternalError(anyhow::anyhow!("Invite code collision"))
            }
        }
    }
}
