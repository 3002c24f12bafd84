use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::Mutex;

use rekon_core::{Created, ProviderClient, ResolvedAttributes};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Object {
    type_name: String,
    attributes: ResolvedAttributes,
}

/// Provider that "creates" resources as entries in a JSON file. Useful for
/// dry runs of a stack and for exercising the CLI end to end.
#[derive(Debug)]
pub struct LocalProvider {
    path: PathBuf,
    // Serializes read-modify-write cycles on the objects file.
    guard: Mutex<()>,
}

impl LocalProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { path: root.into().join("objects.json"), guard: Mutex::new(()) }
    }

    async fn load(&self) -> Result<BTreeMap<String, Object>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", self.path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e).with_context(|| format!("reading {}", self.path.display())),
        }
    }

    async fn store(&self, objects: &BTreeMap<String, Object>) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(objects)?).await?;
        tokio::fs::rename(&tmp, &self.path).await.with_context(|| format!("writing {}", self.path.display()))?;
        Ok(())
    }

    fn computed(type_name: &str, id: &str) -> ResolvedAttributes {
        [("arn".to_string(), Json::String(format!("arn:local:{type_name}:{id}")))].into()
    }
}

#[async_trait]
impl ProviderClient for LocalProvider {
    async fn create(&self, type_name: &str, attrs: &ResolvedAttributes) -> Result<Created> {
        let _g = self.guard.lock().await;
        let mut objects = self.load().await?;
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        let id = format!("{type_name}-{}", &uuid[..8]);
        objects.insert(id.clone(), Object { type_name: type_name.to_string(), attributes: attrs.clone() });
        self.store(&objects).await?;
        tracing::debug!(%type_name, %id, "local object created");
        let computed = Self::computed(type_name, &id);
        Ok(Created { provider_id: id, computed })
    }

    async fn read(&self, _type_name: &str, provider_id: &str) -> Result<Option<ResolvedAttributes>> {
        let _g = self.guard.lock().await;
        Ok(self.load().await?.remove(provider_id).map(|o| o.attributes))
    }

    async fn update(&self, type_name: &str, provider_id: &str, attrs: &ResolvedAttributes) -> Result<ResolvedAttributes> {
        let _g = self.guard.lock().await;
        let mut objects = self.load().await?;
        match objects.get_mut(provider_id) {
            Some(obj) => obj.attributes = attrs.clone(),
            None => bail!("{type_name} {provider_id} does not exist"),
        }
        self.store(&objects).await?;
        Ok(Self::computed(type_name, provider_id))
    }

    async fn delete(&self, type_name: &str, provider_id: &str) -> Result<()> {
        let _g = self.guard.lock().await;
        let mut objects = self.load().await?;
        if objects.remove(provider_id).is_none() {
            tracing::debug!(%type_name, %provider_id, "delete of absent object");
            return Ok(());
        }
        self.store(&objects).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn objects_survive_a_new_provider_instance() {
        let dir = tempfile::tempdir().unwrap();
        let attrs: ResolvedAttributes = [("bucket".to_string(), json!("logs"))].into();
        let created = LocalProvider::new(dir.path()).create("aws_s3_bucket", &attrs).await.unwrap();
        assert!(created.provider_id.starts_with("aws_s3_bucket-"));
        assert_eq!(created.computed["arn"], json!(format!("arn:local:aws_s3_bucket:{}", created.provider_id)));

        let reopened = LocalProvider::new(dir.path());
        assert_eq!(reopened.read("aws_s3_bucket", &created.provider_id).await.unwrap(), Some(attrs));
    }

    #[tokio::test]
    async fn update_then_delete() {
        let dir = tempfile::tempdir().unwrap();
        let p = LocalProvider::new(dir.path());
        let created = p.create("t", &[("a".to_string(), json!(1))].into()).await.unwrap();
        p.update("t", &created.provider_id, &[("a".to_string(), json!(2))].into()).await.unwrap();
        assert_eq!(p.read("t", &created.provider_id).await.unwrap().unwrap()["a"], json!(2));

        p.delete("t", &created.provider_id).await.unwrap();
        assert_eq!(p.read("t", &created.provider_id).await.unwrap(), None);
        // Deleting again is harmless.
        p.delete("t", &created.provider_id).await.unwrap();
        assert!(p.update("t", &created.provider_id, &Default::default()).await.is_err());
    }
}
