//! services/api/src/config.rs
//!
//! Defines the application's configuration structure and loading logic.
//!
//! All configuration is loaded from environment variables at startup. The `.env`
//! file is used for local development.

use bedtime_core::pipeline::DEFAULT_RULES_KEY;

/// Blob holding the story model's standing instructions.
pub const DEFAULT_SYSTEM_PROMPT_KEY: &str = "system_instructions.json";
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing the environment variable {0}")]
    MissingVar(String),
    #[error("Invalid value for the environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub database_url: String,
    pub log_level: Level,
    pub openai_api_key: Option<String>,
    pub openai_api_base: Option<String>,
    pub story_model: String,
    pub summary_model: String,
    pub image_model: String,
    pub blob_root: PathBuf,
    pub rules_blob_key: String,
    pub system_prompt_blob_key: String,
    pub cover_font_path: Option<PathBuf>,
    pub cors_origin: String,
    pub worker_concurrency: usize,
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// It will look for a `.env` file in the current directory for development,
    /// but this is skipped in test environments to ensure tests are hermetic.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination.
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from any variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var_or = |name: &str, default: &str| lookup(name).unwrap_or_else(|| default.to_string());

        // --- Load Server and Database Settings ---
        let bind_address_str = var_or("BIND_ADDRESS", "0.0.0.0:3000");
        let bind_address = bind_address_str.parse::<SocketAddr>().map_err(|e| {
            ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string())
        })?;

        let database_url =
            lookup("DATABASE_URL").ok_or_else(|| ConfigError::MissingVar("DATABASE_URL".to_string()))?;

        let log_level_str = var_or("RUST_LOG", "INFO");
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        // --- Load Model Settings ---
        let openai_api_key = lookup("OPENAI_API_KEY");
        let openai_api_base = lookup("OPENAI_API_BASE");
        let story_model = var_or("STORY_MODEL", "gpt-4o");
        let summary_model = var_or("SUMMARY_MODEL", "gpt-4o-mini");
        let image_model = var_or("IMAGE_MODEL", "dall-e-3");

        // --- Load Storage and Worker Settings ---
        let blob_root = PathBuf::from(var_or("BLOB_ROOT", "./blobs"));
        let rules_blob_key = var_or("RULES_BLOB_KEY", DEFAULT_RULES_KEY);
        let system_prompt_blob_key = var_or("SYSTEM_PROMPT_BLOB_KEY", DEFAULT_SYSTEM_PROMPT_KEY);
        let cover_font_path = lookup("COVER_FONT_PATH").map(PathBuf::from);
        let cors_origin = var_or("CORS_ORIGIN", "http://localhost:3000");

        let concurrency_str = var_or("WORKER_CONCURRENCY", "2");
        let worker_concurrency = match concurrency_str.parse::<usize>() {
            Ok(n) if n > 0 => n,
            _ => {
                return Err(ConfigError::InvalidValue(
                    "WORKER_CONCURRENCY".to_string(),
                    format!("'{}' is not a positive integer", concurrency_str),
                ))
            }
        };

        Ok(Self {
            bind_address,
            database_url,
            log_level,
            openai_api_key,
            openai_api_base,
            story_model,
            summary_model,
            image_model,
            blob_root,
            rules_blob_key,
            system_prompt_blob_key,
            cover_font_path,
            cors_origin,
            worker_concurrency,
        })
    }
}
