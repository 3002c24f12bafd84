use async_trait::async_trait;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use rekon_core::lock::log_forced_release;
use rekon_core::state::check_expected;
use rekon_core::{LockError, LockInfo, LockManager, LockToken, StateKey, StateSnapshot, StateStore, StoreError, VersionId};

/// Versioned state files plus an exclusive-create lock file per key.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
}

fn unavailable(e: impl std::fmt::Display) -> StoreError { StoreError::Unavailable(e.to_string()) }

fn version_file(v: VersionId) -> String { format!("v{:06}.json", v.0) }

fn parse_version(name: &str) -> Option<VersionId> {
    name.strip_prefix('v')?.strip_suffix(".json")?.parse().ok().map(VersionId)
}

/// Writes to a temporary sibling, then links it into place. Fails with
/// `AlreadyExists` rather than overwrite.
fn write_new(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist_noclobber(path).map_err(|e| e.error)?;
    Ok(())
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self { Self { root: root.into() } }

    pub fn root(&self) -> &Path { &self.root }

    fn check_key(key: &StateKey) -> Result<(), String> {
        let ok = !key.0.is_empty()
            && key.0 != "."
            && key.0 != ".."
            && key.0.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if ok { Ok(()) } else { Err(format!("invalid state key '{key}': use letters, digits, '-', '_' and '.'")) }
    }

    fn key_dir(&self, key: &StateKey) -> Result<PathBuf, StoreError> {
        Self::check_key(key).map_err(|reason| StoreError::Corrupt { key: key.clone(), reason })?;
        Ok(self.root.join("state").join(&key.0))
    }

    fn lock_path(&self, key: &StateKey) -> Result<PathBuf, LockError> {
        Self::check_key(key).map_err(LockError::Unavailable)?;
        Ok(self.root.join("locks").join(format!("{}.lock", key.0)))
    }

    async fn versions_in(&self, key: &StateKey) -> Result<Vec<VersionId>, StoreError> {
        let dir = self.key_dir(key)?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(unavailable(e)),
        };
        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(unavailable)? {
            if let Some(v) = entry.file_name().to_str().and_then(parse_version) {
                out.push(v);
            }
        }
        out.sort();
        Ok(out)
    }

    async fn read_version(&self, key: &StateKey, v: VersionId) -> Result<StateSnapshot, StoreError> {
        let path = self.key_dir(key)?.join(version_file(v));
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(StoreError::NotFound(key.clone())),
            Err(e) => return Err(unavailable(e)),
        };
        let mut snap: StateSnapshot = serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::Corrupt { key: key.clone(), reason: format!("{}: {e}", path.display()) })?;
        snap.version = Some(v);
        Ok(snap)
    }

    async fn read_lock(&self, key: &StateKey) -> Result<Option<LockInfo>, LockError> {
        let path = self.lock_path(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| LockError::Unavailable(format!("unreadable lock file {}: {e}", path.display()))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(LockError::Unavailable(e.to_string())),
        }
    }
}

#[async_trait]
impl StateStore for LocalBackend {
    async fn load(&self, key: &StateKey) -> Result<StateSnapshot, StoreError> {
        match self.versions_in(key).await?.last() {
            Some(&v) => self.read_version(key, v).await,
            None => Err(StoreError::NotFound(key.clone())),
        }
    }

    async fn load_version(&self, key: &StateKey, version: VersionId) -> Result<StateSnapshot, StoreError> {
        self.read_version(key, version).await
    }

    async fn save(
        &self,
        key: &StateKey,
        token: &LockToken,
        expected: Option<VersionId>,
        snapshot: &StateSnapshot,
    ) -> Result<VersionId, StoreError> {
        self.validate(token).await?;
        if token.key != *key {
            return Err(LockError::InvalidToken { key: key.clone(), id: token.id.clone() }.into());
        }
        let latest = self.versions_in(key).await?.last().copied();
        let next = check_expected(key, expected, latest)?;

        let mut stored = snapshot.clone();
        stored.version = Some(next);
        let bytes = serde_json::to_vec_pretty(&stored).map_err(unavailable)?;
        let dir = self.key_dir(key)?;
        let path = dir.join(version_file(next));
        let res = tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&dir)?;
            write_new(&path, &bytes)
        })
        .await
        .map_err(unavailable)?;
        match res {
            Ok(()) => Ok(next),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(StoreError::VersionConflict {
                key: key.clone(),
                expected: expected.map(|v| v.to_string()).unwrap_or_else(|| "<none>".into()),
                found: next.to_string(),
            }),
            Err(e) => Err(unavailable(e)),
        }
    }

    async fn list_versions(&self, key: &StateKey) -> Result<Vec<VersionId>, StoreError> {
        self.versions_in(key).await
    }
}

#[async_trait]
impl LockManager for LocalBackend {
    async fn acquire(&self, key: &StateKey, holder: &str, operation: &str) -> Result<LockToken, LockError> {
        let path = self.lock_path(key)?;
        let info = LockInfo::new(key, holder, operation);
        let bytes = serde_json::to_vec_pretty(&info).map_err(|e| LockError::Unavailable(e.to_string()))?;
        let res = tokio::task::spawn_blocking(move || {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            write_new(&path, &bytes)
        })
        .await
        .map_err(|e| LockError::Unavailable(e.to_string()))?;
        match res {
            Ok(()) => Ok(info.token()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => match self.read_lock(key).await? {
                Some(held) => Err((&held).into()),
                None => Err(LockError::Unavailable("lock file vanished while acquiring; retry".into())),
            },
            Err(e) => Err(LockError::Unavailable(e.to_string())),
        }
    }

    async fn release(&self, token: &LockToken) -> Result<(), LockError> {
        match self.read_lock(&token.key).await? {
            None => Ok(()),
            Some(held) if held.id == token.id => {
                match tokio::fs::remove_file(self.lock_path(&token.key)?).await {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                    Err(e) => Err(LockError::Unavailable(e.to_string())),
                }
            }
            Some(_) => Err(LockError::InvalidToken { key: token.key.clone(), id: token.id.clone() }),
        }
    }

    async fn force_release(&self, key: &StateKey) -> Result<Option<LockInfo>, LockError> {
        // An unreadable lock file is still removed.
        let held = self.read_lock(key).await.unwrap_or(None);
        match tokio::fs::remove_file(self.lock_path(key)?).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(LockError::Unavailable(e.to_string())),
        }
        log_forced_release(key, held.as_ref());
        Ok(held)
    }

    async fn current(&self, key: &StateKey) -> Result<Option<LockInfo>, LockError> {
        self.read_lock(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rekon_core::{ResourceId, ResourceState};
    use std::sync::Arc;

    fn snapshot_with(name: &str) -> StateSnapshot {
        let mut s = StateSnapshot::default();
        s.resources.insert(
            ResourceId::new("t", name),
            ResourceState { provider_id: format!("t-{name}"), attributes: Default::default(), computed: Default::default(), dependencies: vec![] },
        );
        s
    }

    #[tokio::test]
    async fn saves_are_versioned_and_reloadable() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        let key = StateKey::from("lab");
        assert!(matches!(backend.load(&key).await, Err(StoreError::NotFound(_))));

        let token = backend.acquire(&key, "alice", "apply").await.unwrap();
        let v1 = backend.save(&key, &token, None, &snapshot_with("a")).await.unwrap();
        let v2 = backend.save(&key, &token, Some(v1), &snapshot_with("b")).await.unwrap();
        backend.release(&token).await.unwrap();

        assert_eq!(backend.list_versions(&key).await.unwrap(), vec![VersionId(1), VersionId(2)]);
        let latest = backend.load(&key).await.unwrap();
        assert_eq!(latest.version, Some(v2));
        assert!(latest.get(&ResourceId::new("t", "b")).is_some());
        let first = backend.load_version(&key, v1).await.unwrap();
        assert!(first.get(&ResourceId::new("t", "a")).is_some());
        assert!(dir.path().join("state").join("lab").join("v000002.json").exists());
    }

    #[tokio::test]
    async fn stale_expected_version_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        let key = StateKey::from("lab");
        let token = backend.acquire(&key, "alice", "apply").await.unwrap();
        backend.save(&key, &token, None, &snapshot_with("a")).await.unwrap();
        let err = backend.save(&key, &token, None, &snapshot_with("b")).await.unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { .. }));
    }

    #[tokio::test]
    async fn save_without_lock_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        let key = StateKey::from("lab");
        let token = backend.acquire(&key, "alice", "apply").await.unwrap();
        backend.release(&token).await.unwrap();
        let err = backend.save(&key, &token, None, &snapshot_with("a")).await.unwrap_err();
        assert!(matches!(err, StoreError::Lock(LockError::InvalidToken { .. })));
    }

    #[tokio::test]
    async fn concurrent_lock_files_have_one_winner() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(LocalBackend::new(dir.path()));
        let key = StateKey::from("lab");
        let mut handles = Vec::new();
        for i in 0..8 {
            let b = backend.clone();
            let k = key.clone();
            handles.push(tokio::spawn(async move { b.acquire(&k, &format!("worker-{i}"), "apply").await }));
        }
        let mut wins = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => wins += 1,
                Err(e) => assert!(matches!(e, LockError::AlreadyLocked { .. }), "unexpected {e:?}"),
            }
        }
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn force_release_clears_a_stale_lock() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        let key = StateKey::from("lab");
        let stale = backend.acquire(&key, "crashed", "apply").await.unwrap();
        let held = backend.current(&key).await.unwrap().unwrap();
        assert_eq!(held.id, stale.id);

        let removed = backend.force_release(&key).await.unwrap();
        assert_eq!(removed.map(|l| l.holder), Some("crashed".to_string()));
        assert!(backend.acquire(&key, "operator", "apply").await.is_ok());
        assert!(matches!(backend.release(&stale).await, Err(LockError::InvalidToken { .. })));
    }

    #[tokio::test]
    async fn lock_and_provider_file_names_do_not_shadow_state_keys() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        std::fs::write(dir.path().join("objects.json"), b"{}").unwrap();
        let plain = StateKey::from("x");
        let _held = backend.acquire(&plain, "alice", "apply").await.unwrap();

        for key in [StateKey::from("x.lock"), StateKey::from("objects.json")] {
            let token = backend.acquire(&key, "bob", "apply").await.unwrap();
            let v = backend.save(&key, &token, None, &snapshot_with("a")).await.unwrap();
            assert_eq!(backend.load(&key).await.unwrap().version, Some(v));
            backend.release(&token).await.unwrap();
        }
        assert_eq!(backend.current(&plain).await.unwrap().map(|l| l.holder), Some("alice".to_string()));
        assert!(matches!(backend.load(&plain).await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn path_like_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        assert!(backend.acquire(&StateKey::from("../escape"), "x", "plan").await.is_err());
        assert!(matches!(backend.load(&StateKey::from("a/b")).await, Err(StoreError::Corrupt { .. })));
    }
}
