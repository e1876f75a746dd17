//! Error types shared across QQBot crates.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, QqBotError>;

/// Every failure a QQBot library call can surface.
///
/// Lookups that miss (unknown task id and similar) are not errors; they come
/// back as `None`/`false` from the owning API.
#[derive(Debug, Error)]
pub enum QqBotError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid task configuration: {0}")]
    InvalidTask(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Executor error: {0}")]
    Executor(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}
