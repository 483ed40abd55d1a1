//! Persistence for accounts and invite codes.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::models::{InviteCode, User};
use crate::services::ServiceError;

const UNIQUE_VIOLATION: &str = "23505";

/// Result of the registration unit of work.
#[derive(Debug)]
pub enum Registration {
    Created(User),
    UsernameTaken,
    InviteRejected,
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn username_exists(&self, username: &str) -> Result<bool, ServiceError>;

    async fn find_password_hash(&self, username: &str) -> Result<Option<String>, ServiceError>;

    /// Fails with `DuplicateInviteCode` if the code is already present.
    async fn insert_invite(&self, invite: &InviteCode) -> Result<(), ServiceError>;

    async fn find_invite(&self, code: &str) -> Result<Option<InviteCode>, ServiceError>;

    /// Creates the user and consumes the invite as one atomic step. Either
    /// both happen or neither does.
    async fn register_with_invite(
        &self,
        username: &str,
        password_hash: &str,
        invite_code: &str,
    ) -> Result<Registration, ServiceError>;

    async fn health_check(&self) -> Result<(), ServiceError>;
}

#[derive(Clone)]
pub struct PgCredentialStore {
    pool: PgPool,
}

impl PgCredentialStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION))
}

#[async_trait]
impl CredentialStore for PgCredentialStore {
    async fn username_exists(&self, username: &str) -> Result<bool, ServiceError> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM users WHERE username = $1)")
                .bind(username)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    async fn find_password_hash(&self, username: &str) -> Result<Option<String>, ServiceError> {
        let hash: Option<String> =
            sqlx::query_scalar("SELECT password_hash FROM users WHERE username = $1")
                .bind(username)
                .fetch_optional(&self.pool)
                .await?;
        Ok(hash)
    }

    async fn insert_invite(&self, invite: &InviteCode) -> Result<(), ServiceError> {
        sqlx::query("INSERT INTO invite_codes (code, used, created_at) VALUES ($1, FALSE, $2)")
            .bind(&invite.code)
            .bind(invite.created_at)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    ServiceError::DuplicateInviteCode
                } else {
                    ServiceError::Database(e)
                }
            })?;
        Ok(())
    }

    async fn find_invite(&self, code: &str) -> Result<Option<InviteCode>, ServiceError> {
        let invite = sqlx::query_as::<_, InviteCode>(
            "SELECT code, used, used_by, created_at, used_at FROM invite_codes WHERE code = $1",
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        Ok(invite)
    }

    async fn register_with_invite(
        &self,
        username: &str,
        password_hash: &str,
        invite_code: &str,
    ) -> Result<Registration, ServiceError> {
        let mut tx = self.pool.begin().await?;

        // A concurrent insert of the same name blocks here until the other
        // transaction settles, then yields no row.
        let user = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (username, password_hash)
            VALUES ($1, $2)
            ON CONFLICT (username) DO NOTHING
            RETURNING id, username, password_hash, created_at
            "#,
        )
        .bind(username)
        .bind(password_hash)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(user) = user else {
            tx.rollback().await?;
            return Ok(Registration::UsernameTaken);
        };

        let consumed = sqlx::query(
            r#"
            UPDATE invite_codes
            SET used = TRUE, used_by = $1, used_at = NOW()
            WHERE code = $2 AND used = FALSE
            "#,
        )
        .bind(user.id)
        .bind(invite_code)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if consumed != 1 {
            tx.rollback().await?;
            return Ok(Registration::InviteRejected);
        }

        tx.commit().await?;
        Ok(Registration::Created(user))
    }

    async fn health_check(&self) -> Result<(), ServiceError> {
        crate::db::health_check(&self.pool).await?;
        Ok(())
    }
}

#[derive(Default)]
struct MemoryState {
    users: HashMap<String, User>,
    invites: HashMap<String, InviteCode>,
    next_user_id: i64,
}

/// Credential store held in process memory. The registration step runs
/// under a single lock, matching the transactional guarantee of Postgres.
#[derive(Default)]
pub struct MemoryCredentialStore {
    state: Mutex<MemoryState>,
    latency: Option<Duration>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every call, for exercising upstream timeouts.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>, ServiceError> {
        self.state
            .lock()
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!("Credential store mutex poisoned: {}", e)))
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn username_exists(&self, username: &str) -> Result<bool, ServiceError> {
        self.simulate_latency().await;
        Ok(self.lock()?.users.contains_key(username))
    }

    async fn find_password_hash(&self, username: &str) -> Result<Option<String>, ServiceError> {
        self.simulate_latency().await;
        Ok(self
            .lock()?
            .users
            .get(username)
            .map(|u| u.password_hash.clone()))
    }

    async fn insert_invite(&self, invite: &InviteCode) -> Result<(), ServiceError> {
        self.simulate_latency().await;
        let mut state = self.lock()?;
        if state.invites.contains_key(&invite.code) {
            return Err(ServiceError::DuplicateInviteCode);
        }
        state.invites.insert(invite.code.clone(), invite.clone());
        Ok(())
    }

    async fn find_invite(&self, code: &str) -> Result<Option<InviteCode>, ServiceError> {
        self.simulate_latency().await;
        Ok(self.lock()?.invites.get(code).cloned())
    }

    async fn register_with_invite(
        &self,
        username: &str,
        password_hash: &str,
        invite_code: &str,
    ) -> Result<Registration, ServiceError> {
        self.simulate_latency().await;
        let mut state = self.lock()?;

        if state.users.contains_key(username) {
            return Ok(Registration::UsernameTaken);
        }

        let user_id = state.next_user_id + 1;
        let redeemed = match state.invites.get_mut(invite_code) {
            Some(invite) => invite.redeem(user_id),
            None => false,
        };
        if !redeemed {
            return Ok(Registration::InviteRejected);
        }

        let user = User {
            id: user_id,
            username: username.to_string(),
            password_hash: password_hash.to_string(),
            created_at: Utc::now(),
        };
        state.next_user_id = user_id;
        state.users.insert(username.to_string(), user.clone());

        Ok(Registration::Created(user))
    }

    async fn health_check(&self) -> Result<(), ServiceError> {
        self.lock().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_registration_consumes_invite() {
        let store = MemoryCredentialStore::new();
        store
            .insert_invite(&InviteCode::new("ABC12345".to_string()))
            .await
            .unwrap();

        let first = store
            .register_with_invite("alice", "hash", "ABC12345")
            .await
            .unwrap();
        assert!(matches!(first, Registration::Created(ref u) if u.username == "alice"));

        let second = store
            .register_with_invite("bob", "hash", "ABC12345")
            .await
            .unwrap();
        assert!(matches!(second, Registration::InviteRejected));
        assert!(!store.username_exists("bob").await.unwrap());

        let invite = store.find_invite("ABC12345").await.unwrap().unwrap();
        assert!(invite.used);
        assert_eq!(invite.used_by, Some(1));
    }

    #[tokio::test]
    async fn test_memory_taken_username_keeps_invite() {
        let store = MemoryCredentialStore::new();
        for code in ["AAAA1111", "BBBB2222"] {
            store
                .insert_invite(&InviteCode::new(code.to_string()))
                .await
                .unwrap();
        }
        store
            .register_with_invite("alice", "hash", "AAAA1111")
            .await
            .unwrap();

        let result = store
            .register_with_invite("alice", "hash", "BBBB2222")
            .await
            .unwrap();

        assert!(matches!(result, Registration::UsernameTaken));
        let untouched = store.find_invite("BBBB2222").await.unwrap().unwrap();
        assert!(!untouched.used);
    }

    #[tokio::test]
    async fn test_memory_duplicate_invite_code() {
        let store = MemoryCredentialStore::new();
        let invite = InviteCode::new("DUPL1CAT".to_string());
        store.insert_invite(&invite).await.unwrap();

        assert!(matches!(
            store.insert_invite(&invite).await,
            Err(ServiceError::DuplicateInviteCode)
        ));
    }

    #[tokio::test]
    #[ignore] // Requires running PostgreSQL
    async fn test_pg_registration_is_atomic() {
        let url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/gateway_test".to_string());
        let pool = PgPool::connect(&url).await.unwrap();
        crate::db::run_migrations(&pool).await.unwrap();
        let store = PgCredentialStore::new(pool);

        let code = format!("T{}", &uuid::Uuid::new_v4().simple().to_string()[..7]).to_uppercase();
        let username = format!("user-{}", uuid::Uuid::new_v4());
        store
            .insert_invite(&InviteCode::new(code.clone()))
            .await
            .unwrap();

        let first = store
            .register_with_invite(&username, "hash", &code)
            .await
            .unwrap();
        assert!(matches!(first, Registration::Created(_)));

        let other = format!("user-{}", uuid::Uuid::new_v4());
        let second = store.register_with_invite(&other, "hash", &code).await.unwrap();
        assert!(matches!(second, Registration::InviteRejected));
        assert!(!store.username_exists(&other).await.unwrap());
    }

    #[tokio::test]
    #[ignore] // Requires running PostgreSQL
    async fn test_pg_concurrent_registrations_share_one_invite() {
        let url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/gateway_test".to_string());
        let pool = PgPool::connect(&url).await.unwrap();
        crate::db::run_migrations(&pool).await.unwrap();
        let store = PgCredentialStore::new(pool.clone());

        let code = format!("R{}", &uuid::Uuid::new_v4().simple().to_string()[..7]).to_uppercase();
        store
            .insert_invite(&InviteCode::new(code.clone()))
            .await
            .unwrap();

        let usernames: Vec<String> = (0..10)
            .map(|i| format!("racer-{}-{}", i, uuid::Uuid::new_v4()))
            .collect();
        let outcomes = futures::future::join_all(
            usernames
                .iter()
                .map(|name| store.register_with_invite(name, "hash", &code)),
        )
        .await;

        let mut created = Vec::new();
        let mut rejected = Vec::new();
        for (name, outcome) in usernames.iter().zip(outcomes) {
            match outcome.unwrap() {
                Registration::Created(user) => created.push(user),
                Registration::InviteRejected => rejected.push(name.clone()),
                Registration::UsernameTaken => panic!("usernames are distinct"),
            }
        }
        assert_eq!(created.len(), 1);
        assert_eq!(rejected.len(), 9);

        let orphans: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE username = ANY($1)")
            .bind(&rejected)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(orphans, 0);

        let invite = store.find_invite(&code).await.unwrap().unwrap();
        assert!(invite.used);
        assert_eq!(invite.used_by, Some(created[0].id));
    }
}
