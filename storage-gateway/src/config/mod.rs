use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_JWT_SECRET: &str = "your-secret-key";

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(flatten)]
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub jwt: JwtConfig,
    pub admin: AdminConfig,
    pub security: SecurityConfig,
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Prod,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: Secret<String>,
    pub max_connections: u32,
    pub min_connections: u32,
    /// Upper bound for a single credential store call.
    pub timeout_seconds: u64,
    pub connect_attempts: u32,
    pub connect_retry_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub account: String,
    /// Base64 shared key of the storage account.
    pub access_key: Secret<String>,
    pub container: String,
    /// Overrides `https://{account}.blob.core.windows.net`, e.g. for an emulator.
    pub endpoint: Option<String>,
    pub timeout_seconds: u64,
    pub sas_validity_minutes: i64,
    pub sas_clock_skew_minutes: i64,
    pub upload_block_bytes: usize,
    pub upload_max_in_flight: usize,
    pub list_page_size: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: Secret<String>,
    pub token_expiry_hours: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdminConfig {
    pub username: String,
    pub password: Secret<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    pub allowed_origins: Vec<String>,
    pub max_upload_bytes: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    pub auth_attempts: u32,
    pub auth_window_seconds: u64,
    /// Key on `x-forwarded-for` instead of the peer address.
    pub trust_forwarded_for: bool,
}

impl DatabaseConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

impl StorageConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn endpoint_url(&self) -> String {
        self.endpoint
            .clone()
            .unwrap_or_else(|| format!("https://{}.blob.core.windows.net", self.account))
    }
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;

        let env_str = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let environment: Environment = env_str
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let is_prod = environment == Environment::Prod;

        let config = GatewayConfig {
            common: common_config,
            environment: environment.clone(),
            service_name: get_env("SERVICE_NAME", Some("storage-gateway"), false)?,
            service_version: get_env("SERVICE_VERSION", Some(env!("CARGO_PKG_VERSION")), false)?,
            log_level: get_env("LOG_LEVEL", Some("info"), false)?,
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            database: DatabaseConfig {
                url: Secret::new(get_env("DATABASE_URL", None, is_prod)?),
                max_connections: parse_env("DB_MAX_CONNECTIONS", "10")?,
                min_connections: parse_env("DB_MIN_CONNECTIONS", "1")?,
                timeout_seconds: parse_env("DB_TIMEOUT_SECONDS", "5")?,
                connect_attempts: parse_env("DB_CONNECT_ATTEMPTS", "10")?,
                connect_retry_seconds: parse_env("DB_CONNECT_RETRY_SECONDS", "5")?,
            },
            storage: StorageConfig {
                account: get_env("AZURE_STORAGE_ACCOUNT", None, is_prod)?,
                access_key: Secret::new(get_env("AZURE_STORAGE_ACCESS_KEY", None, is_prod)?),
                container: get_env("AZURE_STORAGE_CONTAINER", None, is_prod)?,
                endpoint: env::var("AZURE_STORAGE_ENDPOINT").ok(),
                timeout_seconds: parse_env("STORAGE_TIMEOUT_SECONDS", "30")?,
                sas_validity_minutes: parse_env("SAS_VALIDITY_MINUTES", "60")?,
                sas_clock_skew_minutes: parse_env("SAS_CLOCK_SKEW_MINUTES", "1")?,
                upload_block_bytes: parse_env("UPLOAD_BLOCK_BYTES", "4194304")?,
                upload_max_in_flight: parse_env("UPLOAD_MAX_IN_FLIGHT", "16")?,
                list_page_size: env::var("LIST_PAGE_SIZE")
                    .ok()
                    .map(|v| v.parse())
                    .transpose()
                    .map_err(|e: std::num::ParseIntError| {
                        AppError::ConfigError(anyhow::anyhow!("LIST_PAGE_SIZE: {}", e))
                    })?,
            },
            jwt: JwtConfig {
                secret: Secret::new(get_env("JWT_SECRET", Some(DEFAULT_JWT_SECRET), is_prod)?),
                token_expiry_hours: parse_env("JWT_TOKEN_EXPIRY_HOURS", "24")?,
            },
            admin: AdminConfig {
                username: get_env("ADMIN_USERNAME", None, is_prod)?,
                password: Secret::new(get_env("ADMIN_PASSWORD", None, is_prod)?),
            },
            security: SecurityConfig {
                allowed_origins: get_env("ALLOWED_ORIGINS", Some("*"), is_prod)?
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
                max_upload_bytes: parse_env("MAX_UPLOAD_BYTES", "33554432")?,
            },
            rate_limit: RateLimitConfig {
                auth_attempts: parse_env("RATE_LIMIT_AUTH_ATTEMPTS", "20")?,
                auth_window_seconds: parse_env("RATE_LIMIT_AUTH_WINDOW_SECONDS", "60")?,
                trust_forwarded_for: parse_env("TRUST_FORWARDED_FOR", "false")?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.common.port == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "PORT must be greater than 0"
            )));
        }

        if self.jwt.token_expiry_hours <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "JWT_TOKEN_EXPIRY_HOURS must be positive"
            )));
        }

        if self.storage.sas_validity_minutes <= 0 || self.storage.sas_clock_skew_minutes < 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "SAS validity must be positive and clock skew non-negative"
            )));
        }

        if self.storage.upload_block_bytes == 0 || self.storage.upload_max_in_flight == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "Upload block size and in-flight limit must be positive"
            )));
        }

        if self.admin.username.is_empty() || self.admin.password.expose_secret().is_empty() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "ADMIN_USERNAME and ADMIN_PASSWORD must not be empty"
            )));
        }

        if self.jwt.secret.expose_secret() == DEFAULT_JWT_SECRET {
            if self.environment == Environment::Prod {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "JWT_SECRET must be changed from the default in production"
                )));
            }
            tracing::warn!("JWT_SECRET is not set, using the insecure default");
        }

        if self.environment == Environment::Prod
            && self.security.allowed_origins.iter().any(|o| o == "*")
        {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "Wildcard CORS origin not allowed in production"
            )));
        }

        Ok(())
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required in production but not set",
                    key
                )))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required but not set",
                    key
                )))
            }
        }
    }
}

fn parse_env<T>(key: &str, default: &str) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get_env(key, Some(default), false)?
        .parse()
        .map_err(|e: T::Err| AppError::ConfigError(anyhow::anyhow!("{}: {}", key, e)))
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}
