//! Session management: device-bound login sessions, risk scoring, locking.
//!
//! A session runs created → active → expired | invalidated, with a
//! reversible locked state on the side. Terminated session ids are fenced on
//! a blacklist so a replayed id is provably rejected even after the record
//! is gone.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::config::SecurityConfig;
use crate::crypto::hmac;
use crate::error::{Result, SecurityError};
use crate::events::{EventBus, SecurityEvent};
use crate::models::session::{
    NewSession, Session, SessionActivity, SessionLock, SessionStats,
};
use crate::services::tokens;
use crate::store::KeyValueStore;

fn session_slot(id: &Uuid) -> String {
    format!("session:{}", id)
}

fn user_sessions_slot(user_id: &Uuid) -> String {
    format!("user_sessions:{}", user_id)
}

fn lock_slot(id: &Uuid) -> String {
    format!("session_lock:{}", id)
}

fn session_blacklist_slot(id: &Uuid) -> String {
    format!("blacklisted_session:{}", id)
}

/// Length of the stored fingerprint in hex characters.
const FINGERPRINT_LEN: usize = 16;

/// Health snapshot of the session subsystem.
#[derive(Debug)]
pub struct SessionHealth {
    pub healthy: bool,
    pub store_reachable: bool,
    pub active_sessions: usize,
}

/// Owns session and session-lock records.
pub struct SessionManager {
    store: Arc<dyn KeyValueStore>,
    events: EventBus,
    session_timeout: Duration,
    max_sessions_per_user: usize,
    session_blacklist_ttl: Duration,
    token_blacklist_ttl: Duration,
    fingerprint_prefix_len: usize,
}

impl SessionManager {
    pub fn new(config: &SecurityConfig, store: Arc<dyn KeyValueStore>, events: EventBus) -> Self {
        Self {
            store,
            events,
            session_timeout: config.session_timeout,
            max_sessions_per_user: config.max_sessions_per_user,
            session_blacklist_ttl: config.session_blacklist_ttl,
            token_blacklist_ttl: config.token_blacklist_ttl,
            fingerprint_prefix_len: config.fingerprint_prefix_len,
        }
    }

    /// Creates a session for a fresh login.
    ///
    /// Refuses with `TooManySessions` when the user is already at the cap;
    /// expired sessions found while counting are invalidated on the way.
    pub async fn create_session(&self, user_id: Uuid, context: NewSession) -> Result<Session> {
        let active = self.user_active_sessions(user_id).await?;
        if active.len() >= self.max_sessions_per_user {
            tracing::warn!("User {} is at the session cap", user_id);
            return Err(SecurityError::TooManySessions);
        }

        let now = Utc::now();
        let mut session = Session {
            id: Uuid::new_v4(),
            user_id,
            created: now,
            last_activity: now,
            expires: now
                + chrono::Duration::seconds(
                    self.session_timeout.as_secs().min(i64::MAX as u64) as i64,
                ),
            is_active: true,
            device_info: context.device_info,
            ip_address: context.ip_address,
            user_agent: context.user_agent,
            risk_score: 0,
            fingerprint: None,
            biometric_verified: context.biometric_verified,
            two_factor_verified: context.two_factor_verified,
            refresh_token_id: None,
            data: context.data,
        };
        session.fingerprint = Some(self.generate_fingerprint(
            &session,
            session.user_agent.as_deref(),
            session.ip_address.as_deref(),
        ));

        self.put_session(&session).await?;
        self.store
            .sadd(&user_sessions_slot(&user_id), &session.id.to_string())
            .await?;

        self.events.publish(SecurityEvent::SessionCreated {
            session_id: session.id,
            user_id,
        });
        tracing::info!("✅ Session created: {} for user {}", session.id, user_id);
        Ok(session)
    }

    /// Fetches a session without touching it. Locked sessions are returned
    /// too — audit needs to see them; activity paths gate separately.
    pub async fn get_session(&self, session_id: Uuid) -> Result<Session> {
        self.load_session(session_id)
            .await?
            .ok_or(SecurityError::SessionNotFound)
    }

    /// Records activity on a session and recomputes its risk score.
    ///
    /// An expired session is invalidated as a side effect — it is never left
    /// looking active in the store. The deadline itself is not extended;
    /// that is [`SessionManager::renew_session`]'s job.
    pub async fn update_session_activity(
        &self,
        session_id: Uuid,
        activity: SessionActivity,
    ) -> Result<Session> {
        let mut session = self
            .load_session(session_id)
            .await?
            .ok_or(SecurityError::SessionNotFound)?;

        if session.is_expired(Utc::now()) {
            self.invalidate_session(session_id).await?;
            return Err(SecurityError::SessionExpired);
        }
        if self.is_session_locked(session_id).await? {
            return Err(SecurityError::SessionLocked);
        }

        session.risk_score = calculate_risk_score(&session, &activity);
        session.last_activity = Utc::now();
        session.data.extend(activity.data);

        self.put_session(&session).await?;
        Ok(session)
    }

    /// Explicitly extends a live session's deadline by the configured
    /// timeout.
    pub async fn renew_session(&self, session_id: Uuid) -> Result<Session> {
        let mut session = self
            .load_session(session_id)
            .await?
            .ok_or(SecurityError::SessionNotFound)?;

        if session.is_expired(Utc::now()) {
            self.invalidate_session(session_id).await?;
            return Err(SecurityError::SessionExpired);
        }
        if self.is_session_locked(session_id).await? {
            return Err(SecurityError::SessionLocked);
        }

        session.expires = Utc::now()
            + chrono::Duration::seconds(self.session_timeout.as_secs().min(i64::MAX as u64) as i64);
        self.put_session(&session).await?;
        Ok(session)
    }

    /// Derives the fingerprint binding a session to its device/network
    /// context: a digest over user agent, IP, device info, user id, and
    /// creation time, truncated to 16 hex chars.
    pub fn generate_fingerprint(
        &self,
        session: &Session,
        user_agent: Option<&str>,
        ip_address: Option<&str>,
    ) -> String {
        // HashMap iteration order must not change the digest.
        let mut device: Vec<(&String, &String)> = session.device_info.iter().collect();
        device.sort();

        let material = format!(
            "{}|{}|{:?}|{}|{}",
            user_agent.unwrap_or(""),
            ip_address.unwrap_or(""),
            device,
            session.user_id,
            session.created.timestamp(),
        );

        let digest = hmac::sha256_hex(material.as_bytes());
        digest[..FINGERPRINT_LEN].to_string()
    }

    /// Compares the stored fingerprint against a freshly derived one.
    ///
    /// Only the configured prefix is compared, in constant time: the prefix
    /// tolerates benign proxy/NAT drift while still catching wholesale
    /// device changes. The prefix length is a tunable trade-off between
    /// false lockouts and detection, not strong device binding.
    pub async fn validate_fingerprint(&self, session_id: Uuid, candidate: &str) -> Result<bool> {
        let Some(session) = self.load_session(session_id).await? else {
            return Ok(false);
        };
        let Some(stored) = session.fingerprint else {
            return Ok(false);
        };

        let n = self.fingerprint_prefix_len;
        if stored.len() < n || candidate.len() < n {
            return Ok(false);
        }
        Ok(hmac::ct_eq(stored[..n].as_bytes(), candidate[..n].as_bytes()))
    }

    /// Locks a session. Without a duration the lock holds until explicitly
    /// cleared; with one it expires on its own.
    pub async fn lock_session(
        &self,
        session_id: Uuid,
        reason: &str,
        duration: Option<Duration>,
    ) -> Result<()> {
        let lock = SessionLock {
            session_id,
            locked_at: Utc::now(),
            reason: reason.to_string(),
            expires_at: duration.map(|d| {
                Utc::now() + chrono::Duration::seconds(d.as_secs().min(i64::MAX as u64) as i64)
            }),
        };

        let json =
            sonic_rs::to_string(&lock).map_err(|e| SecurityError::Serialization(e.to_string()))?;
        self.store.set(&lock_slot(&session_id), &json, duration).await?;

        self.events.publish(SecurityEvent::SessionLocked {
            session_id,
            reason: lock.reason,
        });
        tracing::warn!("🔒 Session locked: {} - {}", session_id, reason);
        Ok(())
    }

    /// Clears a session lock.
    pub async fn unlock_session(&self, session_id: Uuid) -> Result<()> {
        self.store.del(&lock_slot(&session_id)).await?;
        self.events
            .publish(SecurityEvent::SessionUnlocked { session_id });
        tracing::info!("Session unlocked: {}", session_id);
        Ok(())
    }

    /// Whether a session is currently locked. An expired lock clears itself
    /// on this check.
    pub async fn is_session_locked(&self, session_id: Uuid) -> Result<bool> {
        let Some(raw) = self.store.get(&lock_slot(&session_id)).await? else {
            return Ok(false);
        };
        let lock: SessionLock =
            sonic_rs::from_str(&raw).map_err(|e| SecurityError::Serialization(e.to_string()))?;

        if let Some(expires_at) = lock.expires_at {
            if Utc::now() > expires_at {
                self.unlock_session(session_id).await?;
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Terminates a session: deletes the record, untracks it, fences the id
    /// on the blacklist, and revokes the session's refresh token. Calling it
    /// again for the same id is a no-op.
    pub async fn invalidate_session(&self, session_id: Uuid) -> Result<()> {
        let Some(session) = self.load_session(session_id).await? else {
            return Ok(());
        };

        self.store.del(&session_slot(&session_id)).await?;
        self.store
            .srem(&user_sessions_slot(&session.user_id), &session_id.to_string())
            .await?;

        if let Some(token_id) = session.refresh_token_id {
            if let Err(e) = tokens::revoke_refresh_record(
                self.store.as_ref(),
                token_id,
                self.token_blacklist_ttl,
            )
            .await
            {
                tracing::warn!(
                    "Could not revoke refresh token {} with session {}: {}",
                    token_id,
                    session_id,
                    e
                );
            }
        }

        self.store
            .set(
                &session_blacklist_slot(&session_id),
                &session.user_id.to_string(),
                Some(self.session_blacklist_ttl),
            )
            .await?;

        self.events.publish(SecurityEvent::SessionInvalidated {
            session_id,
            user_id: session.user_id,
        });
        tracing::info!("Session invalidated: {}", session_id);
        Ok(())
    }

    /// Invalidates all of a user's sessions, optionally sparing one — the
    /// session performing a password change survives it.
    pub async fn invalidate_user_sessions(
        &self,
        user_id: Uuid,
        exclude_session_id: Option<Uuid>,
    ) -> Result<usize> {
        let mut count = 0;
        for id in self.user_active_sessions(user_id).await? {
            if Some(id) == exclude_session_id {
                continue;
            }
            self.invalidate_session(id).await?;
            count += 1;
        }
        tracing::info!("Invalidated {} sessions for user {}", count, user_id);
        Ok(count)
    }

    /// Whether a terminated session id is still on the blacklist.
    pub async fn is_session_blacklisted(&self, session_id: Uuid) -> Result<bool> {
        self.store.exists(&session_blacklist_slot(&session_id)).await
    }

    /// One pass of the expiry sweep: invalidates sessions past their
    /// deadline. Reactive enforcement at verification time happens anyway;
    /// this keeps the store tidy when nobody touches a dead session.
    pub async fn cleanup_expired_sessions(&self) -> Result<usize> {
        let now = Utc::now();
        let mut cleaned = 0;

        for key in self.store.scan_prefix("session:").await? {
            let Some(raw_id) = key.strip_prefix("session:") else {
                continue;
            };
            let Ok(id) = raw_id.parse::<Uuid>() else {
                continue;
            };
            if let Some(session) = self.load_session(id).await? {
                if session.is_expired(now) {
                    self.invalidate_session(id).await?;
                    cleaned += 1;
                }
            }
        }

        tracing::info!("Cleaned up {} expired sessions", cleaned);
        Ok(cleaned)
    }

    /// Aggregate counters over live sessions.
    pub async fn session_stats(&self) -> Result<SessionStats> {
        let now = Utc::now();
        let mut stats = SessionStats {
            total: 0,
            active: 0,
            low_risk: 0,
            medium_risk: 0,
            high_risk: 0,
            average_age_minutes: 0.0,
        };
        let mut age_sum_minutes = 0.0;

        for key in self.store.scan_prefix("session:").await? {
            let Some(raw_id) = key.strip_prefix("session:") else {
                continue;
            };
            let Ok(id) = raw_id.parse::<Uuid>() else {
                continue;
            };
            let Some(session) = self.load_session(id).await? else {
                continue;
            };

            stats.total += 1;
            if session.is_active && !session.is_expired(now) {
                stats.active += 1;
                match session.risk_score {
                    0..=2 => stats.low_risk += 1,
                    3..=5 => stats.medium_risk += 1,
                    _ => stats.high_risk += 1,
                }
                age_sum_minutes += (now - session.created).num_seconds() as f64 / 60.0;
            }
        }

        if stats.active > 0 {
            stats.average_age_minutes = age_sum_minutes / stats.active as f64;
        }
        Ok(stats)
    }

    /// Reports whether the subsystem can serve session requests.
    pub async fn health_check(&self) -> SessionHealth {
        match self.session_stats().await {
            Ok(stats) => SessionHealth {
                healthy: true,
                store_reachable: true,
                active_sessions: stats.active,
            },
            Err(_) => SessionHealth {
                healthy: false,
                store_reachable: false,
                active_sessions: 0,
            },
        }
    }

    /// Live session ids for a user. Expired members found along the way are
    /// invalidated; dangling ids are dropped from the set.
    async fn user_active_sessions(&self, user_id: Uuid) -> Result<Vec<Uuid>> {
        let slot = user_sessions_slot(&user_id);
        let now = Utc::now();
        let mut active = Vec::new();

        for raw in self.store.smembers(&slot).await? {
            let Ok(id) = raw.parse::<Uuid>() else {
                continue;
            };
            match self.load_session(id).await? {
                Some(session) if session.is_active && !session.is_expired(now) => active.push(id),
                Some(_) => self.invalidate_session(id).await?,
                None => self.store.srem(&slot, &raw).await?,
            }
        }
        Ok(active)
    }

    async fn load_session(&self, session_id: Uuid) -> Result<Option<Session>> {
        match self.store.get(&session_slot(&session_id)).await? {
            Some(raw) => sonic_rs::from_str(&raw)
                .map(Some)
                .map_err(|e| SecurityError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    async fn put_session(&self, session: &Session) -> Result<()> {
        let json = sonic_rs::to_string(session)
            .map_err(|e| SecurityError::Serialization(e.to_string()))?;
        let remaining = (session.expires - Utc::now())
            .to_std()
            .unwrap_or_default()
            .max(Duration::from_secs(1));
        self.store
            .set(&session_slot(&session.id), &json, Some(remaining))
            .await
    }
}

/// Risk heuristic: strictly additive over the stored score, clamped to 10.
/// +1 for a session older than a day, +2 for an IP change, +2 for a user
/// agent change. Advisory — callers decide whether to demand
/// re-authentication.
pub fn calculate_risk_score(session: &Session, activity: &SessionActivity) -> u8 {
    let mut score = session.risk_score as u32;

    if Utc::now() - session.created > chrono::Duration::hours(24) {
        score += 1;
    }
    if let Some(ip) = &activity.ip_address {
        if session.ip_address.as_deref() != Some(ip.as_str()) {
            score += 2;
        }
    }
    if let Some(ua) = &activity.user_agent {
        if session.user_agent.as_deref() != Some(ua.as_str()) {
            score += 2;
        }
    }

    score.min(10) as u8
}

/// Whether a session can back a credential right now: present, active,
/// unexpired, unlocked, and not blacklisted. Token verification calls this
/// against the shared store.
pub(crate) async fn is_session_usable(
    store: &dyn KeyValueStore,
    session_id: Uuid,
) -> Result<bool> {
    if store.exists(&session_blacklist_slot(&session_id)).await? {
        return Ok(false);
    }

    let Some(raw) = store.get(&session_slot(&session_id)).await? else {
        return Ok(false);
    };
    let session: Session =
        sonic_rs::from_str(&raw).map_err(|e| SecurityError::Serialization(e.to_string()))?;
    if !session.is_active || session.is_expired(Utc::now()) {
        return Ok(false);
    }

    if let Some(raw_lock) = store.get(&lock_slot(&session_id)).await? {
        let lock: SessionLock =
            sonic_rs::from_str(&raw_lock).map_err(|e| SecurityError::Serialization(e.to_string()))?;
        let lapsed = lock.expires_at.is_some_and(|at| Utc::now() > at);
        if !lapsed {
            return Ok(false);
        }
    }

    Ok(true)
}

/// Records the session's current refresh token id, so invalidation can take
/// the token down with the session.
pub(crate) async fn bind_refresh_token(
    store: &dyn KeyValueStore,
    session_id: Uuid,
    token_id: Uuid,
) -> Result<()> {
    let Some(raw) = store.get(&session_slot(&session_id)).await? else {
        return Ok(());
    };
    let mut session: Session =
        sonic_rs::from_str(&raw).map_err(|e| SecurityError::Serialization(e.to_string()))?;

    session.refresh_token_id = Some(token_id);
    let remaining = (session.expires - Utc::now()).to_std().unwrap_or_default();
    if remaining.is_zero() {
        return Ok(());
    }

    let json =
        sonic_rs::to_string(&session).map_err(|e| SecurityError::Serialization(e.to_string()))?;
    store
        .set(&session_slot(&session_id), &json, Some(remaining))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testkeys;

    fn manager_with(config: SecurityConfig) -> (SessionManager, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let (events, _rx) = EventBus::new(64);
        (
            SessionManager::new(&config, store.clone(), events),
            store,
        )
    }

    fn manager() -> (SessionManager, Arc<MemoryStore>) {
        manager_with(testkeys::test_config())
    }

    fn login_context() -> NewSession {
        NewSession {
            ip_address: Some("1.2.3.4".to_string()),
            user_agent: Some("Mozilla/5.0".to_string()),
            ..NewSession::default()
        }
    }

    #[tokio::test]
    async fn create_and_get_session() {
        let (manager, _store) = manager();
        let user_id = Uuid::new_v4();

        let session = manager.create_session(user_id, login_context()).await.unwrap();
        assert!(session.is_active);
        assert_eq!(session.risk_score, 0);
        assert!(session.fingerprint.is_some());

        let loaded = manager.get_session(session.id).await.unwrap();
        assert_eq!(loaded.user_id, user_id);
        assert_eq!(loaded.fingerprint, session.fingerprint);
    }

    #[tokio::test]
    async fn session_cap_is_enforced_and_frees_up() {
        let mut config = testkeys::test_config();
        config.max_sessions_per_user = 2;
        let (manager, _store) = manager_with(config);
        let user_id = Uuid::new_v4();

        let first = manager.create_session(user_id, login_context()).await.unwrap();
        manager.create_session(user_id, login_context()).await.unwrap();

        let err = manager
            .create_session(user_id, login_context())
            .await
            .unwrap_err();
        assert!(matches!(err, SecurityError::TooManySessions));

        // Freeing a slot lets creation succeed again.
        manager.invalidate_session(first.id).await.unwrap();
        manager.create_session(user_id, login_context()).await.unwrap();
    }

    #[tokio::test]
    async fn activity_raises_risk_on_context_change() {
        let (manager, _store) = manager();
        let session = manager
            .create_session(Uuid::new_v4(), login_context())
            .await
            .unwrap();

        let same = manager
            .update_session_activity(
                session.id,
                SessionActivity {
                    ip_address: Some("1.2.3.4".to_string()),
                    user_agent: Some("Mozilla/5.0".to_string()),
                    ..SessionActivity::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(same.risk_score, 0);

        let moved = manager
            .update_session_activity(
                session.id,
                SessionActivity {
                    ip_address: Some("9.9.9.9".to_string()),
                    user_agent: Some("curl/8".to_string()),
                    ..SessionActivity::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(moved.risk_score, 4);

        // The score only rises, and it is capped at 10.
        for _ in 0..5 {
            manager
                .update_session_activity(
                    session.id,
                    SessionActivity {
                        ip_address: Some("9.9.9.9".to_string()),
                        ..SessionActivity::default()
                    },
                )
                .await
                .unwrap();
        }
        let final_state = manager.get_session(session.id).await.unwrap();
        assert!(final_state.risk_score <= 10);
        assert!(final_state.risk_score >= moved.risk_score);
    }

    #[tokio::test]
    async fn activity_never_slides_the_deadline_renewal_does() {
        let (manager, _store) = manager();
        let session = manager
            .create_session(Uuid::new_v4(), login_context())
            .await
            .unwrap();
        let before = session.expires;

        let touched = manager
            .update_session_activity(session.id, SessionActivity::default())
            .await
            .unwrap();
        assert_eq!(touched.expires, before);

        let renewed = manager.renew_session(session.id).await.unwrap();
        assert!(renewed.expires > before);
    }

    #[tokio::test]
    async fn expired_session_is_invalidated_when_touched() {
        let mut config = testkeys::test_config();
        config.session_timeout = Duration::from_millis(10);
        let (manager, _store) = manager_with(config);

        let session = manager
            .create_session(Uuid::new_v4(), login_context())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let err = manager
            .update_session_activity(session.id, SessionActivity::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SecurityError::SessionExpired));

        // The touch removed the record and fenced the id.
        let err = manager.get_session(session.id).await.unwrap_err();
        assert!(matches!(err, SecurityError::SessionNotFound));
        assert!(manager.is_session_blacklisted(session.id).await.unwrap());
    }

    #[tokio::test]
    async fn locked_session_rejects_activity_but_stays_queryable() {
        let (manager, _store) = manager();
        let session = manager
            .create_session(Uuid::new_v4(), login_context())
            .await
            .unwrap();

        manager
            .lock_session(session.id, "Suspicious activity", None)
            .await
            .unwrap();
        assert!(manager.is_session_locked(session.id).await.unwrap());

        let err = manager
            .update_session_activity(session.id, SessionActivity::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SecurityError::SessionLocked));

        // Still queryable for audit.
        assert!(manager.get_session(session.id).await.is_ok());

        manager.unlock_session(session.id).await.unwrap();
        assert!(!manager.is_session_locked(session.id).await.unwrap());
        assert!(
            manager
                .update_session_activity(session.id, SessionActivity::default())
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn timed_lock_expires_on_its_own() {
        let (manager, _store) = manager();
        let session = manager
            .create_session(Uuid::new_v4(), login_context())
            .await
            .unwrap();

        manager
            .lock_session(session.id, "Cooldown", Some(Duration::from_millis(10)))
            .await
            .unwrap();
        assert!(manager.is_session_locked(session.id).await.unwrap());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!manager.is_session_locked(session.id).await.unwrap());
    }

    #[tokio::test]
    async fn fingerprint_validation_tolerates_nothing_gross() {
        let (manager, _store) = manager();
        let session = manager
            .create_session(Uuid::new_v4(), login_context())
            .await
            .unwrap();

        let same = manager.generate_fingerprint(&session, Some("Mozilla/5.0"), Some("1.2.3.4"));
        assert!(manager.validate_fingerprint(session.id, &same).await.unwrap());

        let other_device =
            manager.generate_fingerprint(&session, Some("curl/8"), Some("9.9.9.9"));
        assert!(
            !manager
                .validate_fingerprint(session.id, &other_device)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn invalidation_is_idempotent_and_blacklists() {
        let (manager, _store) = manager();
        let session = manager
            .create_session(Uuid::new_v4(), login_context())
            .await
            .unwrap();

        manager.invalidate_session(session.id).await.unwrap();
        manager.invalidate_session(session.id).await.unwrap();

        assert!(manager.is_session_blacklisted(session.id).await.unwrap());
        assert!(matches!(
            manager.get_session(session.id).await.unwrap_err(),
            SecurityError::SessionNotFound
        ));
    }

    #[tokio::test]
    async fn bulk_invalidation_spares_the_excluded_session() {
        let (manager, _store) = manager();
        let user_id = Uuid::new_v4();

        let keeper = manager.create_session(user_id, login_context()).await.unwrap();
        manager.create_session(user_id, login_context()).await.unwrap();
        manager.create_session(user_id, login_context()).await.unwrap();

        let count = manager
            .invalidate_user_sessions(user_id, Some(keeper.id))
            .await
            .unwrap();
        assert_eq!(count, 2);
        assert!(manager.get_session(keeper.id).await.is_ok());
    }

    #[tokio::test]
    async fn cleanup_sweep_removes_expired_sessions() {
        let mut config = testkeys::test_config();
        config.session_timeout = Duration::from_millis(10);
        let (manager, store) = manager_with(config);

        let session = manager
            .create_session(Uuid::new_v4(), login_context())
            .await
            .unwrap();
        // Re-persist without a TTL so only the deadline field governs,
        // simulating a store whose TTL lags behind.
        let json = sonic_rs::to_string(&manager.get_session(session.id).await.unwrap()).unwrap();
        store
            .set(&session_slot(&session.id), &json, None)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        let cleaned = manager.cleanup_expired_sessions().await.unwrap();
        assert_eq!(cleaned, 1);
        assert!(manager.is_session_blacklisted(session.id).await.unwrap());
    }

    #[tokio::test]
    async fn stats_count_risk_bands() {
        let (manager, _store) = manager();
        let session = manager
            .create_session(Uuid::new_v4(), login_context())
            .await
            .unwrap();
        manager
            .update_session_activity(
                session.id,
                SessionActivity {
                    ip_address: Some("9.9.9.9".to_string()),
                    user_agent: Some("curl/8".to_string()),
                    ..SessionActivity::default()
                },
            )
            .await
            .unwrap();

        let stats = manager.session_stats().await.unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.medium_risk, 1);
    }
}
