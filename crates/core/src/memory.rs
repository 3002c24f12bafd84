//! In-process state store and lock manager.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::lock::{log_forced_release, LockError, LockInfo, LockManager, LockToken};
use crate::state::{check_expected, StateKey, StateSnapshot, StateStore, StoreError, VersionId};

#[derive(Default)]
struct Inner {
    versions: HashMap<StateKey, Vec<StateSnapshot>>,
    locks: HashMap<StateKey, LockInfo>,
    unavailable_for: u32,
}

/// Keeps every version in memory. Used by tests and by embedders that
/// bring their own persistence.
#[derive(Default)]
pub struct MemoryBackend {
    inner: Mutex<Inner>,
}

impl MemoryBackend {
    pub fn new() -> Self { Self::default() }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Makes the next `n` store calls fail with `Unavailable`.
    pub fn fail_next(&self, n: u32) { self.inner().unavailable_for = n; }

    fn check_available(inner: &mut Inner) -> Result<(), StoreError> {
        if inner.unavailable_for > 0 {
            inner.unavailable_for -= 1;
            return Err(StoreError::Unavailable("injected outage".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for MemoryBackend {
    async fn load(&self, key: &StateKey) -> Result<StateSnapshot, StoreError> {
        let mut inner = self.inner();
        Self::check_available(&mut inner)?;
        inner
            .versions
            .get(key)
            .and_then(|v| v.last().cloned())
            .ok_or_else(|| StoreError::NotFound(key.clone()))
    }

    async fn load_version(&self, key: &StateKey, version: VersionId) -> Result<StateSnapshot, StoreError> {
        let mut inner = self.inner();
        Self::check_available(&mut inner)?;
        inner
            .versions
            .get(key)
            .and_then(|v| v.iter().find(|s| s.version == Some(version)).cloned())
            .ok_or_else(|| StoreError::NotFound(key.clone()))
    }

    async fn save(
        &self,
        key: &StateKey,
        token: &LockToken,
        expected: Option<VersionId>,
        snapshot: &StateSnapshot,
    ) -> Result<VersionId, StoreError> {
        let mut inner = self.inner();
        Self::check_available(&mut inner)?;
        match inner.locks.get(key) {
            Some(held) if token.key == *key && held.id == token.id => {}
            _ => return Err(LockError::InvalidToken { key: key.clone(), id: token.id.clone() }.into()),
        }
        let latest = inner.versions.get(key).and_then(|v| v.last()).and_then(|s| s.version);
        let next = check_expected(key, expected, latest)?;
        let mut stored = snapshot.clone();
        stored.version = Some(next);
        inner.versions.entry(key.clone()).or_default().push(stored);
        Ok(next)
    }

    async fn list_versions(&self, key: &StateKey) -> Result<Vec<VersionId>, StoreError> {
        let mut inner = self.inner();
        Self::check_available(&mut inner)?;
        Ok(inner.versions.get(key).map(|v| v.iter().filter_map(|s| s.version).collect()).unwrap_or_default())
    }
}

#[async_trait]
impl LockManager for MemoryBackend {
    async fn acquire(&self, key: &StateKey, holder: &str, operation: &str) -> Result<LockToken, LockError> {
        let mut inner = self.inner();
        if let Some(held) = inner.locks.get(key) {
            return Err(held.into());
        }
        let info = LockInfo::new(key, holder, operation);
        let token = info.token();
        inner.locks.insert(key.clone(), info);
        Ok(token)
    }

    async fn release(&self, token: &LockToken) -> Result<(), LockError> {
        let mut inner = self.inner();
        match inner.locks.get(&token.key) {
            None => Ok(()),
            Some(held) if held.id == token.id => {
                inner.locks.remove(&token.key);
                Ok(())
            }
            Some(_) => Err(LockError::InvalidToken { key: token.key.clone(), id: token.id.clone() }),
        }
    }

    async fn force_release(&self, key: &StateKey) -> Result<Option<LockInfo>, LockError> {
        let removed = self.inner().locks.remove(key);
        log_forced_release(key, removed.as_ref());
        Ok(removed)
    }

    async fn current(&self, key: &StateKey) -> Result<Option<LockInfo>, LockError> {
        Ok(self.inner().locks.get(key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn concurrent_acquire_has_one_winner() {
        let backend = Arc::new(MemoryBackend::new());
        let key = StateKey::from("lab");
        let (a, b) = tokio::join!(
            { let b = backend.clone(); let k = key.clone(); async move { b.acquire(&k, "alice", "apply").await } },
            { let b = backend.clone(); let k = key.clone(); async move { b.acquire(&k, "bob", "apply").await } },
        );
        assert_eq!([a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(), 1);
        let loser = if a.is_err() { a } else { b };
        assert!(matches!(loser, Err(LockError::AlreadyLocked { .. })));
    }

    #[tokio::test]
    async fn release_semantics() {
        let backend = MemoryBackend::new();
        let key = StateKey::from("lab");
        let token = backend.acquire(&key, "alice", "apply").await.unwrap();
        backend.release(&token).await.unwrap();
        backend.release(&token).await.unwrap();

        let other = backend.acquire(&key, "bob", "apply").await.unwrap();
        assert!(matches!(backend.release(&token).await, Err(LockError::InvalidToken { .. })));
        let forced = backend.force_release(&key).await.unwrap();
        assert_eq!(forced.map(|l| l.id), Some(other.id));
        assert_eq!(backend.current(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn save_requires_current_lock_and_version() {
        let backend = MemoryBackend::new();
        let key = StateKey::from("lab");
        let token = backend.acquire(&key, "alice", "apply").await.unwrap();
        let v1 = backend.save(&key, &token, None, &StateSnapshot::default()).await.unwrap();
        assert_eq!(v1, VersionId(1));
        assert!(matches!(
            backend.save(&key, &token, None, &StateSnapshot::default()).await,
            Err(StoreError::VersionConflict { .. })
        ));
        backend.release(&token).await.unwrap();
        assert!(matches!(
            backend.save(&key, &token, Some(v1), &StateSnapshot::default()).await,
            Err(StoreError::Lock(LockError::InvalidToken { .. }))
        ));
        assert_eq!(backend.load(&key).await.unwrap().version, Some(v1));
        assert_eq!(backend.list_versions(&key).await.unwrap(), vec![v1]);
    }
}
