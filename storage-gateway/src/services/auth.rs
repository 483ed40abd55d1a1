use secrecy::ExposeSecret;
use service_core::utils::signature::constant_time_eq;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

use crate::config::AdminConfig;
use crate::models::User;
use crate::services::credential_store::{CredentialStore, Registration};
use crate::services::jwt::{JwtService, SessionToken};
use crate::services::timeout::within;
use crate::services::ServiceError;
use crate::utils::password::{hash_password_blocking, verify_password_blocking, Password};

/// Hash checked against when the username is unknown, so both failure
/// paths cost one Argon2 verification.
static DUMMY_HASH: OnceCell<String> = OnceCell::const_new();

#[derive(Clone)]
pub struct AuthService {
    store: Arc<dyn CredentialStore>,
    jwt: JwtService,
    admin: AdminConfig,
    timeout: Duration,
}

impl AuthService {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        jwt: JwtService,
        admin: AdminConfig,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            jwt,
            admin,
            timeout,
        }
    }

    /// Creates an account, redeeming `invite` in the same unit of work.
    pub async fn register(
        &self,
        username: &str,
        password: String,
        invite: &str,
    ) -> Result<User, ServiceError> {
        if username.is_empty() || password.is_empty() || invite.is_empty() {
            return Err(ServiceError::MissingFields);
        }

        if within(self.timeout, "database", self.store.username_exists(username)).await? {
            record_registration("username_taken");
            return Err(ServiceError::UsernameTaken);
        }

        let password_hash = hash_password_blocking(Password::new(password)).await?;

        let outcome = within(
            self.timeout,
            "database",
            self.store
                .register_with_invite(username, &password_hash, invite),
        )
        .await?;

        match outcome {
            Registration::Created(user) => {
                record_registration("created");
                tracing::info!(user_id = user.id, "User registered");
                Ok(user)
            }
            Registration::UsernameTaken => {
                record_registration("username_taken");
                Err(ServiceError::UsernameTaken)
            }
            Registration::InviteRejected => {
                record_registration("invite_rejected");
                tracing::warn!("Registration rejected: invite invalid or already used");
                Err(ServiceError::InvalidInvite)
            }
        }
    }

    /// Verifies credentials and issues a session token. Unknown user and
    /// wrong password are indistinguishable to the caller.
    pub async fn login(&self, username: &str, password: String) -> Result<SessionToken, ServiceError> {
        let stored = within(
            self.timeout,
            "database",
            self.store.find_password_hash(username),
        )
        .await?;

        let (password_hash, known_user) = match stored {
            Some(hash) => (hash, true),
            None => (dummy_hash().await?, false),
        };

        let matches = verify_password_blocking(Password::new(password), password_hash).await?;
        if !(known_user && matches) {
            metrics::counter!("logins_total", "outcome" => "rejected").increment(1);
            return Err(ServiceError::InvalidCredentials);
        }

        let token = self.jwt.issue_session_token(username)?;
        metrics::counter!("logins_total", "outcome" => "success").increment(1);
        tracing::info!("User logged in");

        Ok(token)
    }

    /// Compares both fields in constant time before deciding.
    pub fn authorize_admin(&self, username: &str, password: &str) -> Result<(), ServiceError> {
        let username_ok = constant_time_eq(&self.admin.username, username);
        let password_ok = constant_time_eq(self.admin.password.expose_secret(), password);

        if username_ok & password_ok {
            Ok(())
        } else {
            tracing::warn!("Rejected admin credentials");
            Err(ServiceError::InvalidCredentials)
        }
    }
}

async fn dummy_hash() -> Result<String, ServiceError> {
    let hash = DUMMY_HASH
        .get_or_try_init(|| {
            hash_password_blocking(Password::new(uuid::Uuid::new_v4().to_string()))
        })
        .await?;
    Ok(hash.clone())
}

fn record_registration(outcome: &'static str) {
    metrics::counter!("registrations_total", "outcome" => outcome).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JwtConfig;
    use crate::models::InviteCode;
    use crate::services::credential_store::MemoryCredentialStore;
    use secrecy::Secret;

    async fn service_with_invite(code: &str) -> AuthService {
        let store = Arc::new(MemoryCredentialStore::new());
        store
            .insert_invite(&InviteCode::new(code.to_string()))
            .await
            .unwrap();

        let jwt = JwtService::new(&JwtConfig {
            secret: Secret::new("unit-test-secret".to_string()),
            token_expiry_hours: 24,
        })
        .unwrap();
        let admin = AdminConfig {
            username: "admin".to_string(),
            password: Secret::new("letmein".to_string()),
        };

        AuthService::new(store, jwt, admin, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_register_then_login() {
        let auth = service_with_invite("ABC12345").await;

        let user = auth
            .register("alice", "s3cret".to_string(), "ABC12345")
            .await
            .unwrap();
        assert_eq!(user.username, "alice");
        assert!(user.password_hash.starts_with("$argon2id$"));

        let token = auth.login("alice", "s3cret".to_string()).await.unwrap();
        assert!(!token.token.is_empty());
    }

    #[tokio::test]
    async fn test_missing_fields() {
        let auth = service_with_invite("ABC12345").await;

        for (username, password, invite) in [
            ("", "pw", "ABC12345"),
            ("alice", "", "ABC12345"),
            ("alice", "pw", ""),
        ] {
            assert!(matches!(
                auth.register(username, password.to_string(), invite).await,
                Err(ServiceError::MissingFields)
            ));
        }
    }

    #[tokio::test]
    async fn test_login_failures_are_uniform() {
        let auth = service_with_invite("ABC12345").await;
        auth.register("alice", "s3cret".to_string(), "ABC12345")
            .await
            .unwrap();

        let wrong_password = auth.login("alice", "nope".to_string()).await;
        let unknown_user = auth.login("mallory", "s3cret".to_string()).await;

        assert!(matches!(wrong_password, Err(ServiceError::InvalidCredentials)));
        assert!(matches!(unknown_user, Err(ServiceError::InvalidCredentials)));
    }

    #[tokio::test]
    async fn test_authorize_admin() {
        let auth = service_with_invite("ABC12345").await;

        assert!(auth.authorize_admin("admin", "letmein").is_ok());
        assert!(auth.authorize_admin("admin", "letmein!").is_err());
        assert!(auth.authorize_admin("root", "letmein").is_err());
        assert!(auth.authorize_admin("", "").is_err());
    }

    #[tokio::test]
    async fn test_slow_database_times_out() {
        let store = Arc::new(MemoryCredentialStore::new().with_latency(Duration::from_secs(5)));
        let jwt = JwtService::new(&JwtConfig {
            secret: Secret::new("unit-test-secret".to_string()),
            token_expiry_hours: 24,
        })
        .unwrap();
        let admin = AdminConfig {
            username: "admin".to_string(),
            password: Secret::new("letmein".to_string()),
        };
        let auth = AuthService::new(store, jwt, admin, Duration::from_millis(20));

        assert!(matches!(
            auth.login("alice", "pw".to_string()).await,
            Err(ServiceError::Timeout(_))
        ));
    }
}
