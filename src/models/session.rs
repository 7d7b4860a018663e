use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// A logical login session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    /// The ID of the user this session belongs to.
    pub user_id: Uuid,
    pub created: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Absolute deadline. Extended only by explicit renewal, never as a side
    /// effect of activity.
    pub expires: DateTime<Utc>,
    pub is_active: bool,
    #[serde(default)]
    pub device_info: HashMap<String, String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    /// Advisory anomaly signal in [0, 10]. Only rises; never a gate here.
    pub risk_score: u8,
    /// Truncated digest of the device/network context at creation.
    pub fingerprint: Option<String>,
    pub biometric_verified: bool,
    pub two_factor_verified: bool,
    /// Back-reference to the session's current refresh token, if any.
    /// Invalidation takes the token down with the session.
    pub refresh_token_id: Option<Uuid>,
    #[serde(default)]
    pub data: HashMap<String, String>,
}

impl Session {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires
    }
}

/// Context captured at login for a new session.
#[derive(Debug, Clone, Default)]
pub struct NewSession {
    pub device_info: HashMap<String, String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub biometric_verified: bool,
    pub two_factor_verified: bool,
    pub data: HashMap<String, String>,
}

/// Per-request context observed while a session is in use.
#[derive(Debug, Clone, Default)]
pub struct SessionActivity {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub data: HashMap<String, String>,
}

/// An administrative or automatic hold on a session. The session record
/// stays queryable while locked; only operations against it are refused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionLock {
    pub session_id: Uuid,
    pub locked_at: DateTime<Utc>,
    pub reason: String,
    /// Locks without a deadline are held until explicitly cleared.
    pub expires_at: Option<DateTime<Utc>>,
}

/// Aggregate session counters for operators.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub total: usize,
    pub active: usize,
    pub low_risk: usize,
    pub medium_risk: usize,
    pub high_risk: usize,
    pub average_age_minutes: f64,
}
