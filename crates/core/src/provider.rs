//! The executor's only window onto real infrastructure.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::model::ResolvedAttributes;

#[derive(Debug, Clone, PartialEq)]
pub struct Created {
    pub provider_id: String,
    pub computed: ResolvedAttributes,
}

/// Opaque create/read/update/delete keyed by resource type.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn create(&self, type_name: &str, attrs: &ResolvedAttributes) -> Result<Created>;

    /// `None` when the object no longer exists.
    async fn read(&self, type_name: &str, provider_id: &str) -> Result<Option<ResolvedAttributes>>;

    async fn update(&self, type_name: &str, provider_id: &str, attrs: &ResolvedAttributes) -> Result<ResolvedAttributes>;

    async fn delete(&self, type_name: &str, provider_id: &str) -> Result<()>;
}

#[derive(Default)]
struct Objects {
    next: u64,
    live: BTreeMap<String, (String, ResolvedAttributes)>,
    failing: HashSet<String>,
    delays: HashMap<String, Duration>,
    calls: Vec<String>,
}

/// Provider that keeps objects in memory and assigns `<type>-<n>` ids and a
/// matching `arn`. Failures and latency can be injected per resource type.
#[derive(Default)]
pub struct MemoryProvider {
    objects: Mutex<Objects>,
}

impl MemoryProvider {
    pub fn new() -> Self { Self::default() }

    fn objects(&self) -> MutexGuard<'_, Objects> {
        match self.objects.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Every create/update/delete of `type_name` fails from now on.
    pub fn fail_type(&self, type_name: &str) { self.objects().failing.insert(type_name.to_string()); }

    pub fn heal_type(&self, type_name: &str) { self.objects().failing.remove(type_name); }

    pub fn delay_type(&self, type_name: &str, delay: Duration) {
        self.objects().delays.insert(type_name.to_string(), delay);
    }

    /// Calls in the order they started, e.g. `create t`.
    pub fn calls(&self) -> Vec<String> { self.objects().calls.clone() }

    pub fn live_count(&self) -> usize { self.objects().live.len() }

    /// Simulates out-of-band deletion.
    pub fn forget(&self, provider_id: &str) { self.objects().live.remove(provider_id); }

    async fn enter(&self, op: &str, type_name: &str) -> Result<()> {
        let delay = {
            let mut objects = self.objects();
            objects.calls.push(format!("{op} {type_name}"));
            if objects.failing.contains(type_name) {
                anyhow::bail!("injected failure for {op} {type_name}");
            }
            objects.delays.get(type_name).copied()
        };
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        Ok(())
    }
}

#[async_trait]
impl ProviderClient for MemoryProvider {
    async fn create(&self, type_name: &str, attrs: &ResolvedAttributes) -> Result<Created> {
        self.enter("create", type_name).await?;
        let mut objects = self.objects();
        objects.next += 1;
        let provider_id = format!("{type_name}-{}", objects.next);
        objects.live.insert(provider_id.clone(), (type_name.to_string(), attrs.clone()));
        let computed = BTreeMap::from([("arn".to_string(), json!(format!("arn:mem:{type_name}:{provider_id}")))]);
        Ok(Created { provider_id, computed })
    }

    async fn read(&self, _type_name: &str, provider_id: &str) -> Result<Option<ResolvedAttributes>> {
        Ok(self.objects().live.get(provider_id).map(|(_, attrs)| attrs.clone()))
    }

    async fn update(&self, type_name: &str, provider_id: &str, attrs: &ResolvedAttributes) -> Result<ResolvedAttributes> {
        self.enter("update", type_name).await?;
        let mut objects = self.objects();
        let Some(entry) = objects.live.get_mut(provider_id) else {
            anyhow::bail!("{type_name} {provider_id} does not exist");
        };
        entry.1 = attrs.clone();
        Ok(BTreeMap::from([("arn".to_string(), json!(format!("arn:mem:{type_name}:{provider_id}")))]))
    }

    async fn delete(&self, type_name: &str, provider_id: &str) -> Result<()> {
        self.enter("delete", type_name).await?;
        self.objects().live.remove(provider_id);
        Ok(())
    }
}
