//! Error types for Sunblock
//!
//! All errors in the application are converted to `AppError`.
//! Reconcilers use [`AppError::aborts_pass`] to decide whether a failure
//! is confined to one account or ends the current pass.

use thiserror::Error;

/// Application-wide error type
#[derive(Debug, Error)]
pub enum AppError {
    /// Record or remote entity not found
    #[error("Resource not found")]
    NotFound,

    /// Insert attempted for a key that already exists
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// Session missing, expired or rejected by the service
    #[error("Authentication required")]
    Unauthorized,

    /// The remote service rejected the request with HTTP 429
    #[error("Rate limit exceeded")]
    RateLimited,

    /// Malformed input or remote data
    #[error("Validation error: {0}")]
    Validation(String),

    /// Non-success XRPC response
    #[error("Remote error (HTTP {status}): {error}: {message}")]
    Remote {
        status: u16,
        error: String,
        message: String,
    },

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// HTTP client error
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl AppError {
    /// Whether this error ends the reconciler pass it occurred in.
    ///
    /// Per-account failures (a profile that cannot be fetched, a record the
    /// service refuses) are skipped; session, quota and storage failures
    /// would fail every remaining item the same way.
    pub fn aborts_pass(&self) -> bool {
        matches!(
            self,
            AppError::Unauthorized
                | AppError::RateLimited
                | AppError::Database(_)
                | AppError::Config(_)
                | AppError::Internal(_)
        )
    }

    /// Short label used for metrics and log fields
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::NotFound => "not_found",
            AppError::DuplicateKey(_) => "duplicate_key",
            AppError::Unauthorized => "unauthorized",
            AppError::RateLimited => "rate_limited",
            AppError::Validation(_) => "validation",
            AppError::Remote { .. } => "remote",
            AppError::Database(_) => "database",
            AppError::HttpClient(_) => "http_client",
            AppError::Config(_) => "config",
            AppError::Internal(_) => "internal",
        }
    }
}
