//! Error types

use redis::RedisError;

/// Cache-related errors
///
/// Only [`CacheError::InvalidKey`] ever reaches callers of
/// [`crate::CacheService`]; every other variant is produced by the remote
/// store adapter and absorbed by the service's fallback path.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Redis {op} timed out after {millis}ms")]
    Timeout { op: &'static str, millis: u128 },

    #[error("Remote store unavailable")]
    Unavailable,

    #[error("Invalid cache key: {0:?}")]
    InvalidKey(String),
}

/// Boxed error returned by backing-store implementations
pub type BackendError = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by the read-through services
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    Conflict(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Authentication failures
///
/// Every variant maps to a 401-class outcome except [`AuthError::Forbidden`]
/// (403) and [`AuthError::Cache`] (500).
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("No token provided")]
    MissingToken,

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Token expired")]
    Expired,

    #[error("Session revoked or superseded")]
    Revoked,

    #[error("User not found")]
    UnknownUser,

    #[error("Wrong email or password")]
    InvalidCredentials,

    #[error("Access restricted to administrators")]
    Forbidden,

    #[error("Token signing failed: {0}")]
    Signing(String),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("Backend error: {0}")]
    Backend(BackendError),
}

impl AuthError {
    /// Stable machine-readable code for response bodies
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingToken => "MISSING_TOKEN",
            Self::InvalidToken(_) => "INVALID_TOKEN",
            Self::Expired => "TOKEN_EXPIRED",
            Self::Revoked => "SESSION_REVOKED",
            Self::UnknownUser => "USER_NOT_FOUND",
            Self::InvalidCredentials => "INVALID_CREDENTIALS",
            Self::Forbidden => "FORBIDDEN",
            Self::Signing(_) | Self::Cache(_) | Self::Backend(_) => "SERVER_ERROR",
        }
    }

    /// HTTP status the boundary should answer with
    pub fn status(&self) -> u16 {
        match self {
            Self::Forbidden => 403,
            Self::Signing(_) | Self::Cache(_) | Self::Backend(_) => 500,
            _ => 401,
        }
    }
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => Self::Expired,
            _ => Self::InvalidToken(err.to_string()),
        }
    }
}
