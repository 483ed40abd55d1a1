use serde::{Deserialize, Serialize};
use std::fmt;
use validator::Validate;

/// Absent fields deserialize as empty so they fail validation with the
/// same message as blank ones.
#[derive(Deserialize, Validate)]
pub struct SignupRequest {
    #[serde(default)]
    #[validate(length(min = 1, message = "Missing required fields"))]
    pub username: String,

    #[serde(default)]
    #[validate(length(min = 1, message = "Missing required fields"))]
    pub password: String,

    #[serde(default)]
    #[validate(length(min = 1, message = "Missing required fields"))]
    pub invite: String,
}

#[derive(Deserialize, Validate)]
pub struct LoginRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginResponse {
    pub token: String,
}

/// Body of `POST /admin/invite`.
#[derive(Deserialize, Validate)]
pub struct AdminCredentials {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InviteResponse {
    pub code: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct VerifyInviteRequest {
    pub code: String,
}

macro_rules! redacted_debug {
    ($($ty:ident),*) => {
        $(impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($ty))
                    .field("username", &self.username)
                    .field("password", &"[REDACTED]")
                    .finish_non_exhaustive()
            }
        })*
    };
}

redacted_debug!(SignupRequest, LoginRequest, AdminCredentials);
