//! Error types for Polycast

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PolycastError>;

#[derive(Error, Debug)]
pub enum PolycastError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),
}

impl PolycastError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            PolycastError::InvalidInput(_) | PolycastError::NotFound(_) => 3,
            PolycastError::Config(_) | PolycastError::Database(_) => 2,
            PolycastError::Publish(_) | PolycastError::Conflict(_) => 1,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database operation failed: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Corrupt column {column}: {reason}")]
    Corrupt { column: &'static str, reason: String },
}

/// Failure reported by a publisher adapter.
///
/// Every variant maps to exactly one [`ErrorKind`]; the dispatch worker
/// derives its retry decision from that kind alone.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PublishError {
    #[error("Content validation failed: {0}")]
    Validation(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Content policy violation: {0}")]
    ContentPolicy(String),

    #[error("Rate limit exceeded: {message}")]
    RateLimit {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Ambiguous outcome: {0}")]
    Ambiguous(String),
}

impl PublishError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PublishError::Validation(_) => ErrorKind::Validation,
            PublishError::Authentication(_) => ErrorKind::Auth,
            PublishError::ContentPolicy(_) => ErrorKind::ContentPolicy,
            PublishError::RateLimit { .. } => ErrorKind::RateLimit,
            PublishError::Network(_) => ErrorKind::Network,
            PublishError::Ambiguous(_) => ErrorKind::Ambiguous,
        }
    }

    /// Platform-reported wait before the next attempt, if any
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            PublishError::RateLimit { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Classification stored on a schedule entry as `last_error_kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Content violates platform constraints (permanent, pre-flight or remote)
    Validation,
    /// Credential invalid or revoked (permanent)
    Auth,
    /// Platform refused the content on policy grounds (permanent)
    ContentPolicy,
    /// Platform or local rate limit (transient)
    RateLimit,
    /// Timeout, connection failure or 5xx (transient)
    Network,
    /// The call may have succeeded server-side (transient, lower ceiling)
    Ambiguous,
    /// A worker lost its claim before publishing (transient)
    LeaseExpired,
    /// Referenced records missing, organization disabled, no adapter (permanent)
    Precondition,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Auth => "auth",
            ErrorKind::ContentPolicy => "content_policy",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Network => "network",
            ErrorKind::Ambiguous => "ambiguous",
            ErrorKind::LeaseExpired => "lease_expired",
            ErrorKind::Precondition => "precondition",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "validation" => Some(ErrorKind::Validation),
            "auth" => Some(ErrorKind::Auth),
            "content_policy" => Some(ErrorKind::ContentPolicy),
            "rate_limit" => Some(ErrorKind::RateLimit),
            "network" => Some(ErrorKind::Network),
            "ambiguous" => Some(ErrorKind::Ambiguous),
            "lease_expired" => Some(ErrorKind::LeaseExpired),
            "precondition" => Some(ErrorKind::Precondition),
            _ => None,
        }
    }

    /// Permanent kinds are never retried automatically
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ErrorKind::Validation
                | ErrorKind::Auth
                | ErrorKind::ContentPolicy
                | ErrorKind::Precondition
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
