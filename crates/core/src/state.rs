//! Persisted record of what was last applied.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use crate::lock::{LockError, LockToken};
use crate::model::{Reference, ResolvedAttributes, ResourceId};

/// Identity of one state snapshot lineage (the "backend key").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateKey(pub String);

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl From<&str> for StateKey {
    fn from(s: &str) -> Self { Self(s.to_string()) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionId(pub u64);

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "v{}", self.0) }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    pub provider_id: String,
    /// Declared inputs, resolved, as last sent to the provider.
    #[serde(default)]
    pub attributes: ResolvedAttributes,
    /// Provider-assigned outputs.
    #[serde(default)]
    pub computed: ResolvedAttributes,
    #[serde(default)]
    pub dependencies: Vec<ResourceId>,
}

impl ResourceState {
    /// Looks up a referenced field: `id` is the provider id, then declared
    /// attributes, then computed outputs.
    pub fn field(&self, field: &str) -> Option<Json> {
        if field == "id" && !self.computed.contains_key("id") {
            return Some(Json::String(self.provider_id.clone()));
        }
        self.attributes.get(field).or_else(|| self.computed.get(field)).cloned()
    }
}

/// Last-applied state. A saved snapshot is never modified; saving produces a
/// new version that supersedes it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Version this snapshot was loaded as, `None` for a fresh lineage.
    #[serde(default)]
    pub version: Option<VersionId>,
    #[serde(default)]
    pub resources: BTreeMap<ResourceId, ResourceState>,
}

impl StateSnapshot {
    pub fn get(&self, id: &ResourceId) -> Option<&ResourceState> { self.resources.get(id) }

    pub fn resolve(&self, r: &Reference) -> Option<Json> {
        self.resources.get(&r.resource).and_then(|s| s.field(&r.field))
    }

    pub fn is_empty(&self) -> bool { self.resources.is_empty() }

    pub fn len(&self) -> usize { self.resources.len() }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("no state stored under key '{0}'")]
    NotFound(StateKey),
    #[error("state store unavailable: {0}")]
    Unavailable(String),
    #[error("state '{key}' moved to {found} since it was loaded at {expected}; re-run plan against the new state")]
    VersionConflict { key: StateKey, expected: String, found: String },
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("corrupt state '{key}': {reason}")]
    Corrupt { key: StateKey, reason: String },
}

impl StoreError {
    /// Only availability problems are worth retrying.
    pub fn is_retryable(&self) -> bool { matches!(self, StoreError::Unavailable(_)) }
}

/// Versioned snapshot storage. Writes must be atomic and require a token
/// for the key's current lock.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self, key: &StateKey) -> Result<StateSnapshot, StoreError>;

    async fn load_version(&self, key: &StateKey, version: VersionId) -> Result<StateSnapshot, StoreError>;

    /// `expected` is the version the caller planned against (`None` if the
    /// key had no state).
    async fn save(
        &self,
        key: &StateKey,
        token: &LockToken,
        expected: Option<VersionId>,
        snapshot: &StateSnapshot,
    ) -> Result<VersionId, StoreError>;

    /// Oldest first.
    async fn list_versions(&self, key: &StateKey) -> Result<Vec<VersionId>, StoreError>;
}

pub(crate) fn describe(v: Option<VersionId>) -> String {
    v.map(|v| v.to_string()).unwrap_or_else(|| "<none>".to_string())
}

/// Checks the optimistic-concurrency precondition for a save.
pub fn check_expected(key: &StateKey, expected: Option<VersionId>, latest: Option<VersionId>) -> Result<VersionId, StoreError> {
    if expected != latest {
        return Err(StoreError::VersionConflict { key: key.clone(), expected: describe(expected), found: describe(latest) });
    }
    Ok(VersionId(latest.map_or(1, |v| v.0 + 1)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn id_field_falls_back_to_provider_id() {
        let st = ResourceState {
            provider_id: "b-1".into(),
            attributes: [("bucket".to_string(), json!("logs"))].into(),
            computed: [("arn".to_string(), json!("arn:b-1"))].into(),
            dependencies: vec![],
        };
        assert_eq!(st.field("id"), Some(json!("b-1")));
        assert_eq!(st.field("bucket"), Some(json!("logs")));
        assert_eq!(st.field("arn"), Some(json!("arn:b-1")));
        assert_eq!(st.field("missing"), None);
    }

    #[test]
    fn expected_version_must_match_latest() {
        let key = StateKey::from("k");
        assert_eq!(check_expected(&key, None, None).unwrap(), VersionId(1));
        assert_eq!(check_expected(&key, Some(VersionId(3)), Some(VersionId(3))).unwrap(), VersionId(4));
        assert!(matches!(
            check_expected(&key, Some(VersionId(3)), Some(VersionId(4))),
            Err(StoreError::VersionConflict { .. })
        ));
    }

    #[test]
    fn snapshot_serializes_with_string_keys() {
        let mut snap = StateSnapshot::default();
        snap.resources.insert(
            "t.a".parse().unwrap(),
            ResourceState { provider_id: "1".into(), attributes: Default::default(), computed: Default::default(), dependencies: vec![] },
        );
        let text = serde_json::to_string(&snap).unwrap();
        let back: StateSnapshot = serde_json::from_str(&text).unwrap();
        assert_eq!(back, snap);
    }
}
