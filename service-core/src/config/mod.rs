use crate::error::AppError;
use config::{Config as Cfg, File};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    8080
}

impl Config {
    /// Loads `.env`, an optional `configuration` file and `APP__*` variables.
    ///
    /// A bare `PORT` variable wins over everything else so the usual
    /// platform convention keeps working.
    pub fn load() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();

        let port_override = match std::env::var("PORT") {
            Ok(raw) => Some(raw.parse::<u16>().map_err(|e| {
                AppError::ConfigError(anyhow::anyhow!("PORT must be a valid port number: {}", e))
            })?),
            Err(_) => None,
        };

        let config = Cfg::builder()
            .add_source(File::with_name("configuration").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .set_override_option("port", port_override.map(i64::from))?
            .build()?;

        Ok(config.try_deserialize()?)
    }
}
