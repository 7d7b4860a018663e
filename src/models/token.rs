use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Discriminates access tokens from refresh tokens inside signed claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

/// Claims carried by every signed token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub device_info: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(rename = "type")]
    pub token_type: TokenKind,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
    pub aud: String,
    pub jti: Uuid,
}

fn default_role() -> String {
    "user".to_string()
}

/// The discriminated outcome of access-token verification.
///
/// Expiry is a first-class outcome, not an error: an expired token is the
/// routine end of its lifecycle.
#[derive(Debug)]
pub enum TokenVerification {
    Valid { claims: TokenClaims },
    Expired,
    Invalid { reason: String },
}

impl TokenVerification {
    pub fn is_valid(&self) -> bool {
        matches!(self, TokenVerification::Valid { .. })
    }

    pub fn claims(&self) -> Option<&TokenClaims> {
        match self {
            TokenVerification::Valid { claims } => Some(claims),
            _ => None,
        }
    }
}

/// The stored record backing a refresh token. The record's id doubles as
/// the signed token's jti.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshTokenRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub session_id: Option<Uuid>,
    #[serde(default)]
    pub device_info: HashMap<String, String>,
    pub ip_address: Option<String>,
    pub created: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_active: bool,
    pub usage_count: u64,
}

/// A fresh access token, with its rotated refresh token when requested.
#[derive(Debug, Serialize)]
pub struct RefreshedTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: u64,
    pub token_type: &'static str,
}

/// Current profile data the token layer needs when minting access tokens.
/// Owned by the user-profile collaborator, not by this crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserData {
    pub email: Option<String>,
    pub role: String,
    pub permissions: Vec<String>,
}

/// Outcome of a bulk revocation. Best-effort: `failures` says exactly what
/// was not revoked.
#[derive(Debug, Default)]
pub struct RevocationReport {
    pub tokens_revoked: usize,
    pub sessions_revoked: usize,
    pub failures: Vec<String>,
}
