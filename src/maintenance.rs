//! Background maintenance loops.
//!
//! Each sweep runs on its own timer, decoupled from request handling, and
//! holds no lock foreground traffic waits on. A failed pass is logged and
//! retried on the next tick; the store's own TTLs bound how much state can
//! accumulate in the meantime.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::services::kms::KeyManager;
use crate::services::sessions::SessionManager;
use crate::services::tokens::TokenService;

/// Spawns the scheduled key-rotation check.
pub fn spawn_key_rotation_sweep(keys: Arc<KeyManager>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            tracing::info!("🧹 Running scheduled key rotation check...");
            match keys.rotation_sweep().await {
                Ok(rotated) => {
                    tracing::info!("✅ Key rotation check completed ({} rotated)", rotated)
                }
                Err(e) => tracing::error!("❌ Key rotation check failed: {}", e),
            }
        }
    })
}

/// Spawns the expired-session sweep.
pub fn spawn_session_cleanup_sweep(
    sessions: Arc<SessionManager>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            tracing::info!("🧹 Running scheduled cleanup of expired sessions...");
            match sessions.cleanup_expired_sessions().await {
                Ok(cleaned) => {
                    tracing::info!("✅ Session cleanup completed ({} cleaned)", cleaned)
                }
                Err(e) => tracing::error!("❌ Session cleanup failed: {}", e),
            }
        }
    })
}

/// Spawns the expired-refresh-token sweep.
pub fn spawn_token_cleanup_sweep(
    tokens: Arc<TokenService>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            tracing::info!("🧹 Running scheduled cleanup of expired tokens...");
            match tokens.cleanup_expired_tokens().await {
                Ok(cleaned) => tracing::info!("✅ Token cleanup completed ({} cleaned)", cleaned),
                Err(e) => tracing::error!("❌ Token cleanup failed: {}", e),
            }
        }
    })
}
