//! Token security: stateless RS256 access tokens, store-backed refresh
//! tokens, revocation.
//!
//! A refresh token's life runs issued → active → rotated | revoked |
//! expired. Rotation and revocation both land the token's jti on the
//! blacklist; expiry needs no transition, verification simply fails past
//! `expires_at`. The signing keypair is parsed once at construction and is
//! immutable for the process lifetime.

use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::config::SecurityConfig;
use crate::error::{Result, SecurityError};
use crate::events::{EventBus, SecurityEvent};
use crate::models::token::{
    RefreshTokenRecord, RefreshedTokens, RevocationReport, TokenClaims, TokenKind,
    TokenVerification, UserData,
};
use crate::services::sessions::{self, SessionManager};
use crate::store::KeyValueStore;

fn refresh_slot(id: &Uuid) -> String {
    format!("refresh_token:{}", id)
}

fn user_tokens_slot(user_id: &Uuid) -> String {
    format!("user_refresh_tokens:{}", user_id)
}

fn blacklist_slot(jti: &Uuid) -> String {
    format!("blacklisted_tokens:{}", jti)
}

/// Context for minting an access token.
#[derive(Debug, Clone)]
pub struct AccessTokenRequest {
    pub user_id: Uuid,
    pub email: Option<String>,
    pub role: String,
    pub permissions: Vec<String>,
    pub session_id: Option<Uuid>,
    pub device_info: HashMap<String, String>,
    pub ip_address: Option<String>,
}

impl AccessTokenRequest {
    /// A request with the default role and no extra context.
    pub fn new(user_id: Uuid) -> Self {
        Self {
            user_id,
            email: None,
            role: "user".to_string(),
            permissions: Vec::new(),
            session_id: None,
            device_info: HashMap::new(),
            ip_address: None,
        }
    }
}

/// Context for minting a refresh token.
#[derive(Debug, Clone, Default)]
pub struct RefreshTokenOptions {
    pub session_id: Option<Uuid>,
    pub device_info: HashMap<String, String>,
    pub ip_address: Option<String>,
    /// Overrides the configured refresh lifetime.
    pub expires_in: Option<Duration>,
}

/// User-profile lookup the token layer calls but does not implement.
#[async_trait::async_trait]
pub trait UserDirectory: Send + Sync {
    async fn get_user_data(&self, user_id: Uuid) -> Result<UserData>;
}

/// Health snapshot of the token subsystem.
#[derive(Debug)]
pub struct TokenHealth {
    pub healthy: bool,
    pub store_reachable: bool,
}

/// Issues and verifies access and refresh tokens.
pub struct TokenService {
    store: Arc<dyn KeyValueStore>,
    events: EventBus,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
    audience: String,
    access_token_expiry: Duration,
    refresh_token_expiry: Duration,
    max_refresh_tokens_per_user: usize,
    token_blacklist_ttl: Duration,
    leeway: u64,
}

impl TokenService {
    /// Parses the signing keypair once and builds the service.
    pub fn new(
        config: &SecurityConfig,
        store: Arc<dyn KeyValueStore>,
        events: EventBus,
    ) -> Result<Self> {
        let encoding_key = EncodingKey::from_rsa_pem(&config.jwt_private_key)
            .map_err(|e| SecurityError::TokenInvalid(format!("Invalid private key: {}", e)))?;
        let decoding_key = DecodingKey::from_rsa_pem(&config.jwt_public_key)
            .map_err(|e| SecurityError::TokenInvalid(format!("Invalid public key: {}", e)))?;

        Ok(Self {
            store,
            events,
            encoding_key,
            decoding_key,
            issuer: config.issuer.clone(),
            audience: config.audience.clone(),
            access_token_expiry: config.access_token_expiry,
            refresh_token_expiry: config.refresh_token_expiry,
            max_refresh_tokens_per_user: config.max_refresh_tokens_per_user,
            token_blacklist_ttl: config.token_blacklist_ttl,
            leeway: config.jwt_leeway_secs,
        })
    }

    fn validation(&self) -> Validation {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.leeway = self.leeway;
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);
        validation
    }

    fn sign(&self, claims: &TokenClaims) -> Result<String> {
        encode(&Header::new(Algorithm::RS256), claims, &self.encoding_key)
            .map_err(|e| SecurityError::TokenInvalid(format!("Token encoding failed: {}", e)))
    }

    /// Signs an access token for the given context. No store side effects.
    pub fn generate_access_token(
        &self,
        request: AccessTokenRequest,
        expires_in: Option<Duration>,
    ) -> Result<String> {
        let now = Utc::now();
        let ttl = expires_in.unwrap_or(self.access_token_expiry);

        let claims = TokenClaims {
            sub: request.user_id.to_string(),
            email: request.email,
            role: request.role,
            permissions: request.permissions,
            session_id: request.session_id,
            device_info: request.device_info,
            ip_address: request.ip_address,
            token_type: TokenKind::Access,
            iat: now.timestamp(),
            exp: now.timestamp() + ttl.as_secs() as i64,
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            jti: Uuid::new_v4(),
        };

        self.sign(&claims)
    }

    /// Verifies an access token.
    ///
    /// Signature, issuer, audience, and expiry first; then the jti against
    /// the blacklist; then, when the claims carry a session id, the session
    /// itself. Expiry and revocation are outcomes, never errors — and a
    /// store that cannot answer fails closed.
    pub async fn verify_access_token(&self, token: &str) -> TokenVerification {
        let claims = match decode::<TokenClaims>(token, &self.decoding_key, &self.validation()) {
            Ok(data) => data.claims,
            Err(e) => {
                return match e.kind() {
                    jsonwebtoken::errors::ErrorKind::ExpiredSignature => TokenVerification::Expired,
                    _ => TokenVerification::Invalid {
                        reason: e.to_string(),
                    },
                };
            }
        };

        if claims.token_type != TokenKind::Access {
            return TokenVerification::Invalid {
                reason: "Not an access token".to_string(),
            };
        }

        match self.store.exists(&blacklist_slot(&claims.jti)).await {
            Ok(false) => {}
            Ok(true) => {
                tracing::debug!("Token {} is blacklisted", claims.jti);
                return TokenVerification::Invalid {
                    reason: "Token revoked".to_string(),
                };
            }
            Err(e) => {
                tracing::error!("❌ Blacklist check failed, denying: {}", e);
                return TokenVerification::Invalid {
                    reason: "Store unavailable".to_string(),
                };
            }
        }

        if let Some(session_id) = claims.session_id {
            match sessions::is_session_usable(self.store.as_ref(), session_id).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!("Session {} cannot back token", session_id);
                    return TokenVerification::Invalid {
                        reason: "Session is invalid".to_string(),
                    };
                }
                Err(e) => {
                    tracing::error!("❌ Session check failed, denying: {}", e);
                    return TokenVerification::Invalid {
                        reason: "Store unavailable".to_string(),
                    };
                }
            }
        }

        TokenVerification::Valid { claims }
    }

    /// Mints a refresh token: persists the backing record, tracks it under
    /// the user, signs the token, and evicts beyond the per-user cap.
    pub async fn generate_refresh_token(
        &self,
        user_id: Uuid,
        options: RefreshTokenOptions,
    ) -> Result<String> {
        let now = Utc::now();
        let ttl = options.expires_in.unwrap_or(self.refresh_token_expiry);

        let record = RefreshTokenRecord {
            id: Uuid::new_v4(),
            user_id,
            session_id: options.session_id,
            device_info: options.device_info,
            ip_address: options.ip_address,
            created: now,
            last_used: now,
            expires_at: now + chrono::Duration::seconds(ttl.as_secs().min(i64::MAX as u64) as i64),
            is_active: true,
            usage_count: 0,
        };

        self.put_record(&record, ttl).await?;
        self.store
            .sadd(&user_tokens_slot(&user_id), &record.id.to_string())
            .await?;

        if let Some(session_id) = record.session_id {
            if let Err(e) =
                sessions::bind_refresh_token(self.store.as_ref(), session_id, record.id).await
            {
                tracing::warn!(
                    "Could not bind refresh token {} to session {}: {}",
                    record.id,
                    session_id,
                    e
                );
            }
        }

        self.enforce_token_cap(user_id).await?;

        let claims = TokenClaims {
            sub: user_id.to_string(),
            email: None,
            role: "user".to_string(),
            permissions: Vec::new(),
            session_id: record.session_id,
            device_info: HashMap::new(),
            ip_address: None,
            token_type: TokenKind::Refresh,
            iat: now.timestamp(),
            exp: record.expires_at.timestamp(),
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            jti: record.id,
        };

        tracing::debug!("🔑 Issued refresh token {} for user {}", record.id, user_id);
        self.sign(&claims)
    }

    /// Keeps at most the configured number of live refresh tokens per user,
    /// revoking the oldest by creation time. Eviction blacklists — a
    /// previously issued copy of an evicted token must not verify.
    async fn enforce_token_cap(&self, user_id: Uuid) -> Result<()> {
        let slot = user_tokens_slot(&user_id);
        let members = self.store.smembers(&slot).await?;
        if members.len() <= self.max_refresh_tokens_per_user {
            return Ok(());
        }

        let mut by_age: Vec<(DateTime<Utc>, Uuid)> = Vec::new();
        for raw in &members {
            let Ok(id) = raw.parse::<Uuid>() else {
                continue;
            };
            match load_refresh_record(self.store.as_ref(), id).await? {
                Some(record) => by_age.push((record.created, id)),
                // Record already gone (expired); drop the stale member.
                None => self.store.srem(&slot, raw).await?,
            }
        }
        by_age.sort_by_key(|(created, _)| *created);

        let excess = by_age.len().saturating_sub(self.max_refresh_tokens_per_user);
        let mut evicted = 0;
        for (_, id) in by_age.into_iter().take(excess) {
            self.revoke_refresh_token(id).await?;
            evicted += 1;
        }

        if evicted > 0 {
            self.events.publish(SecurityEvent::TokensEvicted {
                user_id,
                count: evicted,
            });
            tracing::info!("Evicted {} refresh tokens for user {}", evicted, user_id);
        }
        Ok(())
    }

    /// Verifies a refresh token and returns its live backing record, with
    /// usage statistics updated.
    pub async fn verify_refresh_token(&self, token: &str) -> Result<RefreshTokenRecord> {
        let claims = decode::<TokenClaims>(token, &self.decoding_key, &self.validation())
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => SecurityError::TokenExpired,
                _ => SecurityError::TokenInvalid(e.to_string()),
            })?
            .claims;

        if claims.token_type != TokenKind::Refresh {
            return Err(SecurityError::TokenInvalid(
                "Not a refresh token".to_string(),
            ));
        }

        let mut record = load_refresh_record(self.store.as_ref(), claims.jti)
            .await?
            .ok_or(SecurityError::RefreshTokenNotFound)?;
        if !record.is_active {
            return Err(SecurityError::RefreshTokenNotFound);
        }

        record.last_used = Utc::now();
        record.usage_count += 1;
        let remaining = (record.expires_at - Utc::now()).to_std().unwrap_or_default();
        if remaining.is_zero() {
            return Err(SecurityError::TokenExpired);
        }
        self.put_record(&record, remaining).await?;

        Ok(record)
    }

    /// Exchanges a refresh token for a fresh access token bound to the same
    /// session and device context.
    ///
    /// With `rotate_refresh_token` the presented token is revoked before its
    /// successor is handed out, closing the window where a stolen copy could
    /// be replayed alongside the legitimate client.
    pub async fn refresh_access_token<U: UserDirectory + ?Sized>(
        &self,
        refresh_token: &str,
        rotate_refresh_token: bool,
        users: &U,
    ) -> Result<RefreshedTokens> {
        let record = self.verify_refresh_token(refresh_token).await?;
        let user = users.get_user_data(record.user_id).await?;

        let access_token = self.generate_access_token(
            AccessTokenRequest {
                user_id: record.user_id,
                email: user.email,
                role: user.role,
                permissions: user.permissions,
                session_id: record.session_id,
                device_info: record.device_info.clone(),
                ip_address: record.ip_address.clone(),
            },
            None,
        )?;

        let refresh_token = if rotate_refresh_token {
            self.revoke_refresh_token(record.id).await?;
            Some(
                self.generate_refresh_token(
                    record.user_id,
                    RefreshTokenOptions {
                        session_id: record.session_id,
                        device_info: record.device_info,
                        ip_address: record.ip_address,
                        expires_in: None,
                    },
                )
                .await?,
            )
        } else {
            None
        };

        Ok(RefreshedTokens {
            access_token,
            refresh_token,
            expires_in: self.access_token_expiry.as_secs(),
            token_type: "Bearer",
        })
    }

    /// Revokes a refresh token: blacklists the id, removes the record,
    /// untracks it from the user. Revoking an already-revoked id is a no-op.
    pub async fn revoke_refresh_token(&self, id: Uuid) -> Result<()> {
        revoke_refresh_record(self.store.as_ref(), id, self.token_blacklist_ttl).await?;
        self.events.publish(SecurityEvent::TokenRevoked { token_id: id });
        Ok(())
    }

    /// Revokes every refresh token and session for a user, e.g. on password
    /// reset. Best-effort: the report says exactly how far it got.
    pub async fn revoke_all_user_sessions(
        &self,
        user_id: Uuid,
        sessions: &SessionManager,
    ) -> RevocationReport {
        let mut report = RevocationReport::default();

        match self.store.smembers(&user_tokens_slot(&user_id)).await {
            Ok(members) => {
                for raw in members {
                    let Ok(id) = raw.parse::<Uuid>() else {
                        continue;
                    };
                    match self.revoke_refresh_token(id).await {
                        Ok(()) => report.tokens_revoked += 1,
                        Err(e) => report.failures.push(format!("token {}: {}", id, e)),
                    }
                }
            }
            Err(e) => report.failures.push(format!("token enumeration: {}", e)),
        }

        match sessions.invalidate_user_sessions(user_id, None).await {
            Ok(count) => report.sessions_revoked = count,
            Err(e) => report.failures.push(format!("session invalidation: {}", e)),
        }

        tracing::info!(
            "Revoked {} tokens and {} sessions for user {} ({} failures)",
            report.tokens_revoked,
            report.sessions_revoked,
            user_id,
            report.failures.len()
        );
        report
    }

    /// RFC 7662-shaped introspection payload for an access token.
    pub async fn introspect(&self, token: &str) -> sonic_rs::Value {
        match self.verify_access_token(token).await {
            TokenVerification::Valid { claims } => sonic_rs::json!({
                "active": true,
                "token_type": "access_token",
                "client_id": self.audience,
                "username": claims.email,
                "scope": claims.permissions.join(" "),
                "sub": claims.sub,
                "exp": claims.exp,
                "iat": claims.iat,
                "aud": claims.aud,
                "iss": claims.iss,
                "jti": claims.jti.to_string(),
            }),
            _ => sonic_rs::json!({
                "active": false,
                "token_type": "access_token",
            }),
        }
    }

    /// One pass over stored refresh tokens, revoking any past expiry. The
    /// store's TTLs make this redundant in the common case; the sweep covers
    /// delayed expiry and keeps user sets tidy.
    pub async fn cleanup_expired_tokens(&self) -> Result<usize> {
        let now = Utc::now();
        let mut cleaned = 0;

        for key in self.store.scan_prefix("refresh_token:").await? {
            let Some(raw_id) = key.strip_prefix("refresh_token:") else {
                continue;
            };
            let Ok(id) = raw_id.parse::<Uuid>() else {
                continue;
            };
            if let Some(record) = load_refresh_record(self.store.as_ref(), id).await? {
                if record.expires_at <= now {
                    self.revoke_refresh_token(id).await?;
                    cleaned += 1;
                }
            }
        }

        Ok(cleaned)
    }

    /// Reports whether the subsystem can serve token requests.
    pub async fn health_check(&self) -> TokenHealth {
        let store_reachable = self.store.exists("health_probe").await.is_ok();
        TokenHealth {
            healthy: store_reachable,
            store_reachable,
        }
    }

    async fn put_record(&self, record: &RefreshTokenRecord, ttl: Duration) -> Result<()> {
        let json = sonic_rs::to_string(record)
            .map_err(|e| SecurityError::Serialization(e.to_string()))?;
        self.store
            .set(&refresh_slot(&record.id), &json, Some(ttl))
            .await
    }
}

pub(crate) async fn load_refresh_record(
    store: &dyn KeyValueStore,
    id: Uuid,
) -> Result<Option<RefreshTokenRecord>> {
    match store.get(&refresh_slot(&id)).await? {
        Some(raw) => sonic_rs::from_str(&raw)
            .map(Some)
            .map_err(|e| SecurityError::Serialization(e.to_string())),
        None => Ok(None),
    }
}

/// Blacklists and removes a refresh-token record. Session invalidation uses
/// this too: a dying session takes its refresh token with it.
pub(crate) async fn revoke_refresh_record(
    store: &dyn KeyValueStore,
    id: Uuid,
    blacklist_ttl: Duration,
) -> Result<()> {
    store
        .set(&blacklist_slot(&id), "revoked", Some(blacklist_ttl))
        .await?;
    if let Some(record) = load_refresh_record(store, id).await? {
        store.del(&refresh_slot(&id)).await?;
        store
            .srem(&user_tokens_slot(&record.user_id), &id.to_string())
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testkeys;

    struct StubDirectory;

    #[async_trait::async_trait]
    impl UserDirectory for StubDirectory {
        async fn get_user_data(&self, _user_id: Uuid) -> Result<UserData> {
            Ok(UserData {
                email: Some("user@example.com".to_string()),
                role: "tutor".to_string(),
                permissions: vec!["articles:read".to_string()],
            })
        }
    }

    fn service_with(store: Arc<MemoryStore>) -> TokenService {
        let config = testkeys::test_config();
        let (events, _rx) = EventBus::new(64);
        TokenService::new(&config, store, events).unwrap()
    }

    fn service() -> (TokenService, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (service_with(store.clone()), store)
    }

    fn past_claims(service: &TokenService, user_id: Uuid) -> TokenClaims {
        let now = Utc::now().timestamp();
        TokenClaims {
            sub: user_id.to_string(),
            email: None,
            role: "user".to_string(),
            permissions: Vec::new(),
            session_id: None,
            device_info: HashMap::new(),
            ip_address: None,
            token_type: TokenKind::Access,
            iat: now - 1000,
            exp: now - 100,
            iss: service.issuer.clone(),
            aud: service.audience.clone(),
            jti: Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn access_token_round_trip() {
        let (service, _store) = service();
        let user_id = Uuid::new_v4();
        let session_id = Uuid::new_v4();

        let mut request = AccessTokenRequest::new(user_id);
        request.email = Some("user@example.com".to_string());
        request.role = "tutor".to_string();
        request.permissions = vec!["articles:read".to_string()];
        request.session_id = Some(session_id);

        let token = service.generate_access_token(request, None).unwrap();
        // No session record exists, but these claims carry no usable session
        // until one is created; session_id present means the check runs.
        let outcome = service.verify_access_token(&token).await;
        match outcome {
            TokenVerification::Invalid { ref reason } => {
                assert!(reason.contains("Session"), "got: {}", reason)
            }
            other => panic!("expected session-invalid, got {:?}", other),
        }

        // Without a session binding the round trip is clean.
        let mut request = AccessTokenRequest::new(user_id);
        request.email = Some("user@example.com".to_string());
        request.role = "tutor".to_string();
        let token = service.generate_access_token(request, None).unwrap();
        let outcome = service.verify_access_token(&token).await;
        let claims = outcome.claims().expect("token should verify");
        assert_eq!(claims.sub, user_id.to_string());
        assert_eq!(claims.role, "tutor");
        assert_eq!(claims.email.as_deref(), Some("user@example.com"));
        assert_eq!(claims.token_type, TokenKind::Access);
    }

    #[tokio::test]
    async fn expired_token_is_expired_not_invalid() {
        let (service, _store) = service();
        let claims = past_claims(&service, Uuid::new_v4());
        let token = service.sign(&claims).unwrap();

        match service.verify_access_token(&token).await {
            TokenVerification::Expired => {}
            other => panic!("expected Expired, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn foreign_signature_is_invalid() {
        let (service, _store) = service();
        let token = service
            .generate_access_token(AccessTokenRequest::new(Uuid::new_v4()), None)
            .unwrap();

        let mut config = testkeys::test_config();
        config.jwt_public_key = testkeys::WRONG_PUBLIC_KEY.to_vec();
        let (events, _rx) = EventBus::new(64);
        let verifier =
            TokenService::new(&config, Arc::new(MemoryStore::new()), events).unwrap();

        match verifier.verify_access_token(&token).await {
            TokenVerification::Invalid { .. } => {}
            other => panic!("expected Invalid, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn garbage_token_is_invalid() {
        let (service, _store) = service();
        match service.verify_access_token("not.a.token").await {
            TokenVerification::Invalid { .. } => {}
            other => panic!("expected Invalid, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn blacklisted_jti_defeats_a_valid_token() {
        let (service, store) = service();
        let token = service
            .generate_access_token(AccessTokenRequest::new(Uuid::new_v4()), None)
            .unwrap();

        let jti = service
            .verify_access_token(&token)
            .await
            .claims()
            .unwrap()
            .jti;
        store
            .set(&blacklist_slot(&jti), "revoked", None)
            .await
            .unwrap();

        match service.verify_access_token(&token).await {
            TokenVerification::Invalid { reason } => assert!(reason.contains("revoked")),
            other => panic!("expected Invalid, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn refresh_token_lifecycle() {
        let (service, _store) = service();
        let user_id = Uuid::new_v4();

        let token = service
            .generate_refresh_token(user_id, RefreshTokenOptions::default())
            .await
            .unwrap();

        let record = service.verify_refresh_token(&token).await.unwrap();
        assert_eq!(record.user_id, user_id);
        assert_eq!(record.usage_count, 1);

        let again = service.verify_refresh_token(&token).await.unwrap();
        assert_eq!(again.usage_count, 2);
    }

    #[tokio::test]
    async fn refresh_token_is_not_an_access_token() {
        let (service, _store) = service();
        let token = service
            .generate_refresh_token(Uuid::new_v4(), RefreshTokenOptions::default())
            .await
            .unwrap();

        match service.verify_access_token(&token).await {
            TokenVerification::Invalid { reason } => {
                assert!(reason.contains("access"), "got: {}", reason)
            }
            other => panic!("expected Invalid, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn rotation_invalidates_the_predecessor() {
        let (service, _store) = service();
        let user_id = Uuid::new_v4();

        let rt1 = service
            .generate_refresh_token(user_id, RefreshTokenOptions::default())
            .await
            .unwrap();

        let refreshed = service
            .refresh_access_token(&rt1, true, &StubDirectory)
            .await
            .unwrap();
        let rt2 = refreshed.refresh_token.expect("rotation yields a successor");
        assert_eq!(refreshed.token_type, "Bearer");

        let err = service.verify_refresh_token(&rt1).await.unwrap_err();
        assert!(matches!(err, SecurityError::RefreshTokenNotFound));

        // The successor works, and carries the user's current profile.
        let outcome = service.verify_access_token(&refreshed.access_token).await;
        let claims = outcome.claims().expect("fresh access token verifies");
        assert_eq!(claims.role, "tutor");
        assert!(service.verify_refresh_token(&rt2).await.is_ok());
    }

    #[tokio::test]
    async fn revocation_is_idempotent() {
        let (service, store) = service();
        let user_id = Uuid::new_v4();

        let token = service
            .generate_refresh_token(user_id, RefreshTokenOptions::default())
            .await
            .unwrap();
        let record = service.verify_refresh_token(&token).await.unwrap();

        service.revoke_refresh_token(record.id).await.unwrap();
        service.revoke_refresh_token(record.id).await.unwrap();

        assert!(store.exists(&blacklist_slot(&record.id)).await.unwrap());
        let err = service.verify_refresh_token(&token).await.unwrap_err();
        assert!(matches!(err, SecurityError::RefreshTokenNotFound));
    }

    #[tokio::test]
    async fn token_cap_evicts_and_blacklists_the_oldest() {
        let store = Arc::new(MemoryStore::new());
        let mut config = testkeys::test_config();
        config.max_refresh_tokens_per_user = 2;
        let (events, _rx) = EventBus::new(64);
        let service = TokenService::new(&config, store.clone(), events).unwrap();

        let user_id = Uuid::new_v4();
        let first = service
            .generate_refresh_token(user_id, RefreshTokenOptions::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let _second = service
            .generate_refresh_token(user_id, RefreshTokenOptions::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let _third = service
            .generate_refresh_token(user_id, RefreshTokenOptions::default())
            .await
            .unwrap();

        let live = store.smembers(&user_tokens_slot(&user_id)).await.unwrap();
        assert_eq!(live.len(), 2);

        // The evicted token was revoked, not merely untracked.
        let err = service.verify_refresh_token(&first).await.unwrap_err();
        assert!(matches!(err, SecurityError::RefreshTokenNotFound));
    }

    #[tokio::test]
    async fn introspection_reflects_validity() {
        let (service, _store) = service();
        let mut request = AccessTokenRequest::new(Uuid::new_v4());
        request.permissions = vec!["a".to_string(), "b".to_string()];
        let token = service.generate_access_token(request, None).unwrap();

        let body = service.introspect(&token).await;
        let text = sonic_rs::to_string(&body).unwrap();
        assert!(text.contains(r#""active":true"#));
        assert!(text.contains(r#""scope":"a b""#));

        let body = service.introspect("junk").await;
        let text = sonic_rs::to_string(&body).unwrap();
        assert!(text.contains(r#""active":false"#));
    }
}
