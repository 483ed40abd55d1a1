use chrono::{DateTime, Utc};
use sqlx::FromRow;

/// A registered account. The hash never leaves the service.
#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}
