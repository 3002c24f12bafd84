//! Mutual exclusion over a state key.
//!
//! Locks never expire. A holder that crashed leaves its lock in place until
//! an operator calls [`LockManager::force_release`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::StateKey;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub key: StateKey,
    pub id: String,
    pub holder: String,
    pub operation: String,
    pub acquired_at: DateTime<Utc>,
}

impl LockInfo {
    pub fn new(key: &StateKey, holder: &str, operation: &str) -> Self {
        Self {
            key: key.clone(),
            id: uuid::Uuid::new_v4().to_string(),
            holder: holder.to_string(),
            operation: operation.to_string(),
            acquired_at: Utc::now(),
        }
    }

    pub fn token(&self) -> LockToken { LockToken { key: self.key.clone(), id: self.id.clone() } }
}

/// Proof of holding the lock for `key`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken {
    pub key: StateKey,
    pub id: String,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LockError {
    #[error("state '{key}' is locked by {holder} since {since} (lock id {id})")]
    AlreadyLocked { key: StateKey, holder: String, since: DateTime<Utc>, id: String },
    #[error("lock token {id} does not match the current lock on '{key}'")]
    InvalidToken { key: StateKey, id: String },
    #[error("lock manager unavailable: {0}")]
    Unavailable(String),
}

impl From<&LockInfo> for LockError {
    fn from(held: &LockInfo) -> Self {
        LockError::AlreadyLocked { key: held.key.clone(), holder: held.holder.clone(), since: held.acquired_at, id: held.id.clone() }
    }
}

#[async_trait]
pub trait LockManager: Send + Sync {
    async fn acquire(&self, key: &StateKey, holder: &str, operation: &str) -> Result<LockToken, LockError>;

    /// No-op when nothing is held; `InvalidToken` when someone else holds it.
    async fn release(&self, token: &LockToken) -> Result<(), LockError>;

    /// Operator escape hatch. Removes whatever lock is held, returning it.
    async fn force_release(&self, key: &StateKey) -> Result<Option<LockInfo>, LockError>;

    async fn current(&self, key: &StateKey) -> Result<Option<LockInfo>, LockError>;

    async fn validate(&self, token: &LockToken) -> Result<(), LockError> {
        match self.current(&token.key).await? {
            Some(held) if held.id == token.id => Ok(()),
            _ => Err(LockError::InvalidToken { key: token.key.clone(), id: token.id.clone() }),
        }
    }
}

/// Audit record for a forced release.
pub fn log_forced_release(key: &StateKey, removed: Option<&LockInfo>) {
    match removed {
        Some(l) => tracing::warn!(
            key = %key, lock_id = %l.id, holder = %l.holder, operation = %l.operation, since = %l.acquired_at,
            "lock forcibly released"
        ),
        None => tracing::warn!(key = %key, "force release requested but no lock was held"),
    }
}
