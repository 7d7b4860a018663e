//! Security event publication.
//!
//! Lifecycle side effects are explicit messages on a bounded channel rather
//! than in-process listeners: observability or incident-response consumers
//! drain the receiver, and a lagging consumer drops events instead of
//! blocking request handling.

use tokio::sync::mpsc;
use uuid::Uuid;

/// Events emitted by the security core.
#[derive(Debug, Clone)]
pub enum SecurityEvent {
    SessionCreated {
        session_id: Uuid,
        user_id: Uuid,
    },
    SessionInvalidated {
        session_id: Uuid,
        user_id: Uuid,
    },
    SessionLocked {
        session_id: Uuid,
        reason: String,
    },
    SessionUnlocked {
        session_id: Uuid,
    },
    TokenRevoked {
        token_id: Uuid,
    },
    /// Oldest refresh tokens revoked to honor the per-user cap.
    TokensEvicted {
        user_id: Uuid,
        count: usize,
    },
    KeyGenerated {
        key_id: String,
    },
    KeyRotated {
        old_key_id: String,
        new_key_id: String,
    },
    MasterKeyRotated {
        resealed: usize,
        failed: usize,
    },
}

/// Cloneable publisher handle over a bounded event channel.
#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::Sender<SecurityEvent>,
}

impl EventBus {
    /// Creates a bus with the given capacity, returning the consumer end.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<SecurityEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Publishes without blocking. If the channel is full or the consumer is
    /// gone, the event is dropped with a warning.
    pub fn publish(&self, event: SecurityEvent) {
        if let Err(e) = self.tx.try_send(event) {
            tracing::warn!("Dropping security event: {}", e);
        }
    }
}
