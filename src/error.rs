use thiserror::Error;

/// Application-wide error types
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Discord error: {0}")]
    Discord(#[from] poise::serenity_prelude::Error),

    #[error("Voice error: {0}")]
    Voice(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Catalog lookup failed: {0}")]
    Catalog(String),

    #[error("Play queue is full")]
    QueueFull,

    #[error("Queue is shut down")]
    QueueBlocked,

    #[error("Object storage error: {0}")]
    Storage(String),

    #[error("Player not active in guild {0}")]
    PlayerGone(u64),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn catalog<S: Into<String>>(msg: S) -> Self {
        Self::Catalog(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }
}

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;
