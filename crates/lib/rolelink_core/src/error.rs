//! Error taxonomy for the synchronization engine.
//!
//! Every variant is scoped to a single user's operation; none of them is
//! fatal to the process.

use thiserror::Error;

use crate::platform::PlatformError;

/// Synchronization engine errors.
#[derive(Debug, Error)]
pub enum LinkError {
    /// The callback `state` did not match the cookie-bound nonce, or the
    /// nonce was unknown, already consumed, or expired.
    #[error("OAuth state verification failed")]
    StateMismatch,

    #[error("Token exchange failed: {0}")]
    TokenExchangeFailed(String),

    /// The refresh token was rejected. The stored record has been removed.
    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("Role-connection push failed: HTTP {status}: {body}")]
    PushFailed { status: u16, body: String },

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Database error: {0}")]
    DbError(#[from] sqlx::Error),
}
