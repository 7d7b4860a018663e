use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::SecurityConfig;
use crate::error::Result;
use crate::events::{EventBus, SecurityEvent};
use crate::maintenance;
use crate::services::kms::KeyManager;
use crate::services::sessions::SessionManager;
use crate::services::tokens::TokenService;
use crate::store::{KeyValueStore, RedisStore};

/// Event channel depth before publishers start dropping.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// The wired-up security core: key management, token security, and session
/// management over one shared store.
#[derive(Clone)]
pub struct SecurityCore {
    pub keys: Arc<KeyManager>,
    pub tokens: Arc<TokenService>,
    pub sessions: Arc<SessionManager>,
    pub config: SecurityConfig,
}

impl SecurityCore {
    /// Connects to the configured store and builds every component.
    ///
    /// Returns the consumer end of the event channel alongside the core;
    /// the caller decides what observes lifecycle events.
    pub async fn new(config: SecurityConfig) -> Result<(Self, mpsc::Receiver<SecurityEvent>)> {
        let store: Arc<dyn KeyValueStore> =
            Arc::new(RedisStore::connect(&config.store_url, config.store_timeout).await?);
        Self::with_store(config, store).await
    }

    /// Builds the core over an injected store. Tests pass a `MemoryStore`.
    pub async fn with_store(
        config: SecurityConfig,
        store: Arc<dyn KeyValueStore>,
    ) -> Result<(Self, mpsc::Receiver<SecurityEvent>)> {
        let (events, receiver) = EventBus::new(EVENT_CHANNEL_CAPACITY);

        let keys = Arc::new(KeyManager::initialize(&config, store.clone(), events.clone()).await?);
        let tokens = Arc::new(TokenService::new(&config, store.clone(), events.clone())?);
        let sessions = Arc::new(SessionManager::new(&config, store, events));
        tracing::info!("✅ Security core initialized");

        Ok((
            Self {
                keys,
                tokens,
                sessions,
                config,
            },
            receiver,
        ))
    }

    /// Starts the three background sweeps at the configured interval.
    pub fn start_maintenance(&self) -> Vec<tokio::task::JoinHandle<()>> {
        let interval = self.config.maintenance_interval;
        vec![
            maintenance::spawn_key_rotation_sweep(self.keys.clone(), interval),
            maintenance::spawn_session_cleanup_sweep(self.sessions.clone(), interval),
            maintenance::spawn_token_cleanup_sweep(self.tokens.clone(), interval),
        ]
    }
}
