use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use zeroize::Zeroizing;

/// A named data-encryption key, sealed under the master key at rest.
///
/// Plaintext material lives in `key_material` only after an explicit
/// decrypt and is never serialized; the durable record carries the sealed
/// form alone.
#[derive(Clone, Serialize, Deserialize)]
pub struct DataKey {
    pub id: String,
    /// Purpose tag, e.g. "encryption".
    #[serde(rename = "type")]
    pub key_type: String,
    pub algorithm: String,
    /// Decrypted key material. In-memory only.
    #[serde(skip)]
    pub key_material: Option<Zeroizing<Vec<u8>>>,
    /// Base64 of the material sealed under the master key.
    pub encrypted_key_material: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub created: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
    pub usage_count: u64,
    /// Incremented by exactly one per rotation.
    pub version: u32,
    pub is_active: bool,
}

impl DataKey {
    /// The non-sensitive view of this key for listings.
    pub fn summary(&self) -> KeySummary {
        KeySummary {
            id: self.id.clone(),
            key_type: self.key_type.clone(),
            algorithm: self.algorithm.clone(),
            metadata: self.metadata.clone(),
            created: self.created,
            last_used: self.last_used,
            usage_count: self.usage_count,
            version: self.version,
            is_active: self.is_active,
        }
    }
}

/// Key information without any sensitive material.
#[derive(Debug, Clone, Serialize)]
pub struct KeySummary {
    pub id: String,
    #[serde(rename = "type")]
    pub key_type: String,
    pub algorithm: String,
    pub metadata: HashMap<String, String>,
    pub created: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
    pub usage_count: u64,
    pub version: u32,
    pub is_active: bool,
}
