//! PostgreSQL connection management.

use crate::config::DatabaseConfig;
use backoff::{future::retry, ExponentialBackoff};
use secrecy::ExposeSecret;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::future::Future;
use std::time::Duration;

/// Create a PostgreSQL connection pool.
pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    tracing::info!("Connecting to PostgreSQL...");

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.timeout())
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(config.url.expose_secret())
        .await?;

    tracing::info!("Successfully connected to PostgreSQL");

    Ok(pool)
}

/// Connect, retrying while the database is still starting up.
///
/// Gives up after `connect_attempts` tries spaced `connect_retry_seconds` apart.
/// Time spent inside a failed attempt does not count against the budget.
pub async fn connect_with_retry(config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    let interval = Duration::from_secs(config.connect_retry_seconds);

    retry_attempts(config.connect_attempts, interval, |attempt| async move {
        create_pool(config).await.map_err(|e| {
            tracing::warn!(
                error = %e,
                attempt,
                max_attempts = config.connect_attempts,
                "Database not ready"
            );
            e
        })
    })
    .await
}

/// Runs `op` at most `attempts` times with a fixed pause between failures.
async fn retry_attempts<T, E, F, Fut>(attempts: u32, interval: Duration, mut op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = attempts.max(1);
    let backoff = ExponentialBackoff {
        current_interval: interval,
        initial_interval: interval,
        max_interval: interval,
        multiplier: 1.0,
        randomization_factor: 0.0,
        max_elapsed_time: None,
        ..Default::default()
    };

    let mut attempt = 0;
    retry(backoff, || {
        attempt += 1;
        let fut = op(attempt);
        let last = attempt >= attempts;
        async move {
            fut.await.map_err(|e| {
                if last {
                    backoff::Error::permanent(e)
                } else {
                    backoff::Error::transient(e)
                }
            })
        }
    })
    .await
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("Database migrations completed");
    Ok(())
}

/// Check database health.
pub async fn health_check(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}
