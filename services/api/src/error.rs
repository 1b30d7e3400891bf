//! services/api/src/error.rs
//!
//! Startup and shutdown failures of the story server. Request-level failures
//! never reach this type; handlers map `PortError` to HTTP statuses.

use crate::config::ConfigError;
use bedtime_core::ports::PortError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A model, storage or story database call failed while the server was starting.
    #[error("Story service unavailable: {0}")]
    Port(#[from] PortError),

    #[error("Could not reach the story database: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Story schema migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Binding the listener, opening the blob root or reading the cover font.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0} is required to generate stories")]
    MissingCredential(&'static str),

    #[error("Invalid CORS origin '{origin}': {reason}")]
    InvalidCorsOrigin { origin: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_failing_piece() {
        let missing = ApiError::MissingCredential("OPENAI_API_KEY");
        assert_eq!(missing.to_string(), "OPENAI_API_KEY is required to generate stories");

        let port: ApiError = PortError::NotFound("blob rules/story_rules.txt".into()).into();
        assert!(port.to_string().starts_with("Story service unavailable"));

        let config: ApiError = ConfigError::MissingVar("DATABASE_URL".into()).into();
        assert_eq!(
            config.to_string(),
            "Configuration error: Missing the environment variable DATABASE_URL"
        );
    }
}
