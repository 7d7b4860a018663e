use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// The security core's error type.
///
/// Verification-path variants (expired, revoked, locked, mismatched) are
/// expected outcomes: callers receive them as typed results and the HTTP
/// mapping collapses them into a uniform "Access denied" so a client cannot
/// probe which invariant failed. Management-path variants are operational
/// failures and are logged with context.
#[derive(Error, Debug)]
pub enum SecurityError {
    /// No key record exists under the requested id.
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// The key exists but was retired and inactive access was not requested.
    #[error("Key is inactive: {0}")]
    KeyInactive(String),

    /// Entropy or storage failed while minting a key.
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    /// The master key cannot be loaded or persisted. Fatal at startup.
    #[error("Master key unavailable: {0}")]
    MasterKeyUnavailable(String),

    /// A token past its expiry.
    #[error("Token expired")]
    TokenExpired,

    /// Bad signature, malformed claims, or wrong token type.
    #[error("Invalid token: {0}")]
    TokenInvalid(String),

    /// The token's id is on the blacklist.
    #[error("Token revoked")]
    TokenRevoked,

    /// No live record backs the presented refresh token.
    #[error("Refresh token not found")]
    RefreshTokenNotFound,

    /// The per-user refresh token cap was reached.
    #[error("Too many active refresh tokens")]
    TooManyActiveTokens,

    /// No session record exists under the requested id.
    #[error("Session not found")]
    SessionNotFound,

    /// The session passed its deadline.
    #[error("Session expired")]
    SessionExpired,

    /// The session is held by a lock.
    #[error("Session locked")]
    SessionLocked,

    /// The per-user session cap was reached.
    #[error("Too many active sessions")]
    TooManySessions,

    /// The presented device context does not match the session's.
    #[error("Session fingerprint mismatch")]
    FingerprintMismatch,

    /// A store round-trip failed or timed out.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// A store payload could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// An encryption error.
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// An I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A `Result` type that uses `SecurityError` as the error type.
pub type Result<T> = std::result::Result<T, SecurityError>;

impl From<redis::RedisError> for SecurityError {
    fn from(e: redis::RedisError) -> Self {
        SecurityError::StoreUnavailable(e.to_string())
    }
}

impl SecurityError {
    /// Whether this is an expected verification outcome rather than an
    /// operational failure.
    pub fn is_denial(&self) -> bool {
        matches!(
            self,
            SecurityError::TokenExpired
                | SecurityError::TokenInvalid(_)
                | SecurityError::TokenRevoked
                | SecurityError::RefreshTokenNotFound
                | SecurityError::SessionNotFound
                | SecurityError::SessionExpired
                | SecurityError::SessionLocked
                | SecurityError::FingerprintMismatch
        )
    }
}

impl IntoResponse for SecurityError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            // The precise denial kind stays in server-side logs only.
            ref e if e.is_denial() => {
                tracing::debug!("Access denied: {}", e);
                (StatusCode::UNAUTHORIZED, "Access denied".to_string())
            }

            SecurityError::TooManySessions => {
                tracing::warn!("Session limit reached");
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    "Too many active sessions".to_string(),
                )
            }

            SecurityError::TooManyActiveTokens => {
                tracing::warn!("Refresh token limit reached");
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    "Too many active tokens".to_string(),
                )
            }

            SecurityError::StoreUnavailable(ref msg) => {
                tracing::error!("Store unavailable: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }

            ref e => {
                tracing::error!("Security core error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        let body = sonic_rs::to_string(&sonic_rs::json!({
            "error": message
        }))
        .unwrap_or_else(|_| r#"{"error":"Internal server error"}"#.to_string());

        (status, body).into_response()
    }
}
