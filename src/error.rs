//! Error taxonomy for the AI routing pipeline.
//!
//! None of these ever reach an end user: the router recovers provider and
//! cache failures (next provider, canned fallback) and swallows persistence
//! failures into the operational log. They surface only through the CLI
//! modes and the backup/health admin endpoints.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("provider {0} is unavailable")]
    ProviderUnavailable(&'static str),

    #[error("provider call failed: {0}")]
    ProviderCall(String),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("persistence error: {0}")]
    Persistence(#[from] rusqlite::Error),

    #[error("backup failed: {0}")]
    Backup(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<redis::RedisError> for RouterError {
    fn from(e: redis::RedisError) -> Self {
        RouterError::Cache(e.to_string())
    }
}

pub type Result<T, E = RouterError> = std::result::Result<T, E>;
