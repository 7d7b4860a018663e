//! Key management: master-key custody, named data keys, rotation.
//!
//! Every data key is sealed under the master key before it touches the
//! store; the master key itself lives on disk (mode 0600) and in process
//! memory. Rotation of the master key is a single-writer critical section:
//! key access on this process waits for it, other processes keep serving
//! reads under the previous master key until they reload.

use base64::{Engine as _, engine::general_purpose};
use chrono::Utc;
use rand::{RngCore, rngs::OsRng};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::config::SecurityConfig;
use crate::crypto::aes;
use crate::error::{Result, SecurityError};
use crate::events::{EventBus, SecurityEvent};
use crate::models::key::{DataKey, KeySummary};
use crate::store::KeyValueStore;

/// Metadata key recording which key a successor replaced.
const ROTATED_FROM: &str = "rotated_from";
const ROTATION_REASON: &str = "rotation_reason";

/// Store set holding every known key id. Master-key rotation and the
/// scheduled sweep enumerate through it instead of scanning.
const KEY_INDEX: &str = "key_index";

/// Bound on the decrypted-key cache.
const KEY_CACHE_CAP: usize = 64;

fn key_slot(id: &str) -> String {
    format!("key:{}", id)
}

/// Options for [`KeyManager::generate_key`].
#[derive(Debug, Clone, Default)]
pub struct GenerateKeyOptions {
    /// Explicit id; a fresh UUID when absent.
    pub id: Option<String>,
    /// Purpose tag, "encryption" when absent.
    pub key_type: Option<String>,
    /// Algorithm label, "aes-256-gcm" when absent.
    pub algorithm: Option<String>,
    pub metadata: HashMap<String, String>,
}

/// Access modifiers for [`KeyManager::get_key`].
#[derive(Debug, Clone, Copy)]
pub struct KeyAccess {
    /// Decrypt the sealed material into `key_material`.
    pub decrypt: bool,
    /// Allow retired keys. Needed to decrypt data sealed under a key that
    /// has since been rotated with `keep_old`.
    pub allow_inactive: bool,
}

impl Default for KeyAccess {
    fn default() -> Self {
        Self {
            decrypt: true,
            allow_inactive: false,
        }
    }
}

/// Options for [`KeyManager::rotate_key`].
#[derive(Debug, Clone, Copy)]
pub struct RotateKeyOptions {
    /// Mint a successor (the default). `false` only deactivates.
    pub create_new: bool,
    /// Retain the old key decrypt-only instead of wiping it.
    pub keep_old: bool,
}

impl Default for RotateKeyOptions {
    fn default() -> Self {
        Self {
            create_new: true,
            keep_old: false,
        }
    }
}

/// Report from a master-key rotation. Partial failure leaves the caller
/// with an exact list to resume from.
#[derive(Debug, Default)]
pub struct MasterKeyRotation {
    pub resealed: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// Health snapshot of the key subsystem.
#[derive(Debug)]
pub struct KmsHealth {
    pub healthy: bool,
    pub master_key_loaded: bool,
    pub store_reachable: bool,
    pub key_count: usize,
}

/// Owns the master key and the lifecycle of every data key.
pub struct KeyManager {
    store: Arc<dyn KeyValueStore>,
    events: EventBus,
    master_key: RwLock<Zeroizing<[u8; aes::KEY_SIZE]>>,
    master_key_path: PathBuf,
    /// Read-through cache of decrypted material, explicitly bounded and
    /// busted on rotation. The store stays authoritative.
    cache: RwLock<HashMap<String, Zeroizing<Vec<u8>>>>,
    rotation_interval: chrono::Duration,
}

impl KeyManager {
    /// Loads (or creates) the master key and returns a ready manager.
    ///
    /// A master key file that exists but cannot be read is fatal:
    /// regenerating would orphan every record sealed under the real key.
    pub async fn initialize(
        config: &SecurityConfig,
        store: Arc<dyn KeyValueStore>,
        events: EventBus,
    ) -> Result<Self> {
        let master_key = load_or_create_master_key(&config.master_key_path).await?;
        let rotation_interval = chrono::Duration::seconds(
            config.key_rotation_interval.as_secs().min(i64::MAX as u64) as i64,
        );
        tracing::info!("✅ Key manager initialized");

        Ok(Self {
            store,
            events,
            master_key: RwLock::new(master_key),
            master_key_path: config.master_key_path.clone(),
            cache: RwLock::new(HashMap::new()),
            rotation_interval,
        })
    }

    /// Mints a new data key sealed under the master key and returns its id.
    pub async fn generate_key(&self, options: GenerateKeyOptions) -> Result<String> {
        let key_type = options
            .key_type
            .unwrap_or_else(|| "encryption".to_string());
        let algorithm = options
            .algorithm
            .unwrap_or_else(|| "aes-256-gcm".to_string());
        self.mint_key(options.id, key_type, algorithm, options.metadata, 1)
            .await
    }

    async fn mint_key(
        &self,
        id: Option<String>,
        key_type: String,
        algorithm: String,
        metadata: HashMap<String, String>,
        version: u32,
    ) -> Result<String> {
        let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut material = Zeroizing::new(vec![0u8; aes::KEY_SIZE]);
        OsRng.fill_bytes(&mut material);

        let sealed = {
            let master = self.master_key.read().await;
            aes::seal(&master, &material)
                .map_err(|e| SecurityError::KeyGeneration(e.to_string()))?
        };

        let record = DataKey {
            id: id.clone(),
            key_type: key_type.clone(),
            algorithm,
            key_material: None,
            encrypted_key_material: general_purpose::STANDARD.encode(&sealed),
            metadata,
            created: Utc::now(),
            last_used: None,
            usage_count: 0,
            version,
            is_active: true,
        };

        self.put_record(&record)
            .await
            .map_err(|e| SecurityError::KeyGeneration(e.to_string()))?;
        self.store
            .sadd(KEY_INDEX, &id)
            .await
            .map_err(|e| SecurityError::KeyGeneration(e.to_string()))?;

        self.events
            .publish(SecurityEvent::KeyGenerated { key_id: id.clone() });
        tracing::info!("✅ Generated new {} key: {}", key_type, id);
        Ok(id)
    }

    /// Retrieves a key record, updating its usage statistics.
    ///
    /// With `access.decrypt` the sealed material is opened into
    /// `key_material`; retired keys require `access.allow_inactive`.
    pub async fn get_key(&self, key_id: &str, access: KeyAccess) -> Result<DataKey> {
        let mut record = self
            .load_record(key_id)
            .await?
            .ok_or_else(|| SecurityError::KeyNotFound(key_id.to_string()))?;

        if !record.is_active && !access.allow_inactive {
            return Err(SecurityError::KeyInactive(key_id.to_string()));
        }

        record.last_used = Some(Utc::now());
        record.usage_count += 1;
        self.put_record(&record).await?;

        if access.decrypt {
            record.key_material = Some(self.decrypt_material(&record).await?);
        }

        Ok(record)
    }

    async fn decrypt_material(&self, record: &DataKey) -> Result<Zeroizing<Vec<u8>>> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.get(&record.id) {
                tracing::debug!("Key {} served from cache", record.id);
                return Ok(cached.clone());
            }
        }

        let sealed = general_purpose::STANDARD
            .decode(&record.encrypted_key_material)
            .map_err(|e| SecurityError::Encryption(format!("Invalid sealed key material: {}", e)))?;

        let material = {
            let master = self.master_key.read().await;
            Zeroizing::new(aes::open(&master, &sealed)?)
        };

        let mut cache = self.cache.write().await;
        if cache.len() >= KEY_CACHE_CAP {
            if let Some(evict) = cache.keys().next().cloned() {
                cache.remove(&evict);
            }
        }
        cache.insert(record.id.clone(), material.clone());

        Ok(material)
    }

    /// Rotates a key: mints a successor, deactivates the predecessor.
    ///
    /// Safe to retry. If a previous attempt crashed after minting the
    /// successor, the retry finds it through its lineage metadata and only
    /// finishes the deactivation — it never mints a second successor.
    pub async fn rotate_key(&self, key_id: &str, options: RotateKeyOptions) -> Result<String> {
        let old = self
            .load_record(key_id)
            .await?
            .ok_or_else(|| SecurityError::KeyNotFound(key_id.to_string()))?;

        let new_id = match self.find_successor(key_id).await? {
            Some(existing) => {
                tracing::warn!(
                    "Key {} already has successor {}, finishing deactivation",
                    key_id,
                    existing
                );
                existing
            }
            None if options.create_new => {
                let mut metadata = old.metadata.clone();
                metadata.insert(ROTATED_FROM.to_string(), key_id.to_string());
                metadata.insert(ROTATION_REASON.to_string(), "scheduled_rotation".to_string());
                self.mint_key(
                    None,
                    old.key_type.clone(),
                    old.algorithm.clone(),
                    metadata,
                    old.version + 1,
                )
                .await?
            }
            None => key_id.to_string(),
        };

        if options.keep_old {
            let mut retired = old;
            retired.is_active = false;
            self.put_record(&retired).await?;
            self.cache.write().await.remove(key_id);
        } else {
            self.destroy_key(key_id).await?;
        }

        self.events.publish(SecurityEvent::KeyRotated {
            old_key_id: key_id.to_string(),
            new_key_id: new_id.clone(),
        });
        tracing::info!("🔑 Key rotated: {} -> {}", key_id, new_id);
        Ok(new_id)
    }

    async fn find_successor(&self, key_id: &str) -> Result<Option<String>> {
        for id in self.store.smembers(KEY_INDEX).await? {
            if id == key_id {
                continue;
            }
            if let Some(record) = self.load_record(&id).await? {
                if record.is_active
                    && record.metadata.get(ROTATED_FROM).map(String::as_str) == Some(key_id)
                {
                    return Ok(Some(id));
                }
            }
        }
        Ok(None)
    }

    /// Wipes and removes a key record. The cached plaintext is dropped
    /// (zeroized on drop); the sealed store copy is deleted.
    async fn destroy_key(&self, key_id: &str) -> Result<()> {
        if let Some(mut material) = self.cache.write().await.remove(key_id) {
            aes::secure_wipe(&mut material);
        }
        self.store.del(&key_slot(key_id)).await?;
        self.store.srem(KEY_INDEX, key_id).await?;
        tracing::info!("Key securely wiped: {}", key_id);
        Ok(())
    }

    /// Re-seals every data key under a freshly generated master key.
    ///
    /// Runs under the master-key write lock. The report lists which keys
    /// were re-sealed and which failed, so a partially-migrated store can be
    /// resumed instead of guessed at. The new master key is persisted to
    /// disk before the in-memory swap; a failure there aborts with the old
    /// key still in effect.
    pub async fn rotate_master_key(&self) -> Result<MasterKeyRotation> {
        let mut current = self.master_key.write().await;

        let mut new_master = Zeroizing::new([0u8; aes::KEY_SIZE]);
        OsRng.fill_bytes(&mut *new_master);

        let mut report = MasterKeyRotation::default();
        for id in self.store.smembers(KEY_INDEX).await? {
            match self.reseal(&id, &current, &new_master).await {
                Ok(()) => report.resealed.push(id),
                Err(e) => {
                    tracing::error!("❌ Failed to re-seal key {}: {}", id, e);
                    report.failed.push((id, e.to_string()));
                }
            }
        }

        persist_master_key(&self.master_key_path, &new_master).await?;
        *current = new_master;
        self.cache.write().await.clear();

        self.events.publish(SecurityEvent::MasterKeyRotated {
            resealed: report.resealed.len(),
            failed: report.failed.len(),
        });
        tracing::info!(
            "🔑 Master key rotated ({} resealed, {} failed)",
            report.resealed.len(),
            report.failed.len()
        );
        Ok(report)
    }

    async fn reseal(
        &self,
        id: &str,
        old_master: &[u8; aes::KEY_SIZE],
        new_master: &[u8; aes::KEY_SIZE],
    ) -> Result<()> {
        let mut record = self
            .load_record(id)
            .await?
            .ok_or_else(|| SecurityError::KeyNotFound(id.to_string()))?;

        let sealed = general_purpose::STANDARD
            .decode(&record.encrypted_key_material)
            .map_err(|e| SecurityError::Encryption(format!("Invalid sealed key material: {}", e)))?;
        let material = Zeroizing::new(aes::open(old_master, &sealed)?);
        record.encrypted_key_material =
            general_purpose::STANDARD.encode(aes::seal(new_master, &material)?);

        self.put_record(&record).await
    }

    /// One pass of the scheduled rotation check: rotates active keys whose
    /// age exceeds the configured interval. Best-effort; a key that fails to
    /// rotate is retried on the next tick.
    pub async fn rotation_sweep(&self) -> Result<usize> {
        let now = Utc::now();
        let mut rotated = 0;

        for id in self.store.smembers(KEY_INDEX).await? {
            let record = match self.load_record(&id).await {
                Ok(Some(record)) => record,
                _ => continue,
            };
            if record.is_active && now - record.created >= self.rotation_interval {
                tracing::info!("Rotating key {} due to age", id);
                match self.rotate_key(&id, RotateKeyOptions::default()).await {
                    Ok(_) => rotated += 1,
                    Err(e) => tracing::error!("❌ Scheduled rotation of {} failed: {}", id, e),
                }
            }
        }

        Ok(rotated)
    }

    /// Lists keys without their sensitive material.
    pub async fn list_keys(
        &self,
        active_only: bool,
        key_type: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<KeySummary>> {
        let mut summaries = Vec::new();
        for id in self.store.smembers(KEY_INDEX).await? {
            if let Some(record) = self.load_record(&id).await? {
                if active_only && !record.is_active {
                    continue;
                }
                if let Some(wanted) = key_type {
                    if record.key_type != wanted {
                        continue;
                    }
                }
                summaries.push(record.summary());
                if limit.is_some_and(|cap| summaries.len() >= cap) {
                    break;
                }
            }
        }
        Ok(summaries)
    }

    /// Reports whether the subsystem can serve key requests.
    pub async fn health_check(&self) -> KmsHealth {
        let (store_reachable, key_count) = match self.store.smembers(KEY_INDEX).await {
            Ok(ids) => (true, ids.len()),
            Err(_) => (false, 0),
        };
        KmsHealth {
            healthy: store_reachable,
            master_key_loaded: true,
            store_reachable,
            key_count,
        }
    }

    async fn load_record(&self, key_id: &str) -> Result<Option<DataKey>> {
        match self.store.get(&key_slot(key_id)).await? {
            Some(raw) => sonic_rs::from_str(&raw)
                .map(Some)
                .map_err(|e| SecurityError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    async fn put_record(&self, record: &DataKey) -> Result<()> {
        let json = sonic_rs::to_string(record)
            .map_err(|e| SecurityError::Serialization(e.to_string()))?;
        self.store.set(&key_slot(&record.id), &json, None).await
    }
}

async fn load_or_create_master_key(path: &Path) -> Result<Zeroizing<[u8; aes::KEY_SIZE]>> {
    match tokio::fs::read_to_string(path).await {
        Ok(hex_data) => {
            let bytes = hex::decode(hex_data.trim()).map_err(|e| {
                SecurityError::MasterKeyUnavailable(format!(
                    "Master key at {} is not valid hex: {}",
                    path.display(),
                    e
                ))
            })?;
            let key: [u8; aes::KEY_SIZE] = bytes.as_slice().try_into().map_err(|_| {
                SecurityError::MasterKeyUnavailable(format!(
                    "Master key at {} must be exactly {} bytes",
                    path.display(),
                    aes::KEY_SIZE
                ))
            })?;
            tracing::info!("Master key loaded from {}", path.display());
            Ok(Zeroizing::new(key))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let mut key = Zeroizing::new([0u8; aes::KEY_SIZE]);
            OsRng.fill_bytes(&mut *key);
            persist_master_key(path, &key).await?;
            tracing::info!("New master key generated at {}", path.display());
            Ok(key)
        }
        // Present but unreadable: regenerating would orphan every record
        // sealed under the real key, so initialization stops here.
        Err(e) => Err(SecurityError::MasterKeyUnavailable(format!(
            "Cannot read {}: {}",
            path.display(),
            e
        ))),
    }
}

async fn persist_master_key(path: &Path, key: &[u8; aes::KEY_SIZE]) -> Result<()> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await.map_err(|e| {
            SecurityError::MasterKeyUnavailable(format!(
                "Cannot create {}: {}",
                dir.display(),
                e
            ))
        })?;
    }

    tokio::fs::write(path, hex::encode(key)).await.map_err(|e| {
        SecurityError::MasterKeyUnavailable(format!("Cannot write {}: {}", path.display(), e))
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .await
            .map_err(|e| {
                SecurityError::MasterKeyUnavailable(format!(
                    "Cannot set permissions on {}: {}",
                    path.display(),
                    e
                ))
            })?;
    }

    Ok(())
}
