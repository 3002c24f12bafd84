//! Stack documents: YAML files, directories of them, or age-encrypted files.

use anyhow::{bail, Context, Result};
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::{Map, Value as Json};
use std::path::{Path, PathBuf};

use rekon_core::{Declaration, ResourceId, ResourceSpec, Value};
use rekon_policy::PolicyConfig;

#[derive(Debug, Deserialize)]
pub struct Stack {
    pub project: Option<String>,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub resources: Vec<ResourceDoc>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub path: PathBuf,
    /// Defaults to the project name.
    pub key: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self { Self { path: PathBuf::from(".rekon"), key: None } }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub parallelism: usize,
    pub action_timeout_secs: u64,
    pub refresh: bool,
    pub retry_attempts: u32,
    pub retry_base_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self { parallelism: 4, action_timeout_secs: 300, refresh: false, retry_attempts: 4, retry_base_ms: 200 }
    }
}

#[derive(Debug, Deserialize)]
pub struct ResourceDoc {
    #[serde(rename = "type")]
    pub type_name: String,
    pub name: String,
    #[serde(default = "one")]
    pub count: u8,
    #[serde(default)]
    pub depends_on: Vec<ResourceId>,
    #[serde(default)]
    pub immutable: Vec<String>,
    #[serde(default)]
    pub attributes: Map<String, Json>,
}

fn one() -> u8 { 1 }

impl Stack {
    pub fn state_key(&self) -> String {
        self.backend.key.clone().or_else(|| self.project.clone()).unwrap_or_else(|| "default".to_string())
    }

    pub fn declarations(&self) -> Result<Vec<Declaration>> {
        self.resources
            .iter()
            .map(|r| {
                let id = ResourceId::parse_parts(&r.type_name, &r.name)
                    .map_err(anyhow::Error::msg)
                    .with_context(|| format!("resource '{}.{}'", r.type_name, r.name))?;
                let mut spec = ResourceSpec::new(id);
                for (k, v) in &r.attributes {
                    let value = Value::from_json(v.clone()).map_err(anyhow::Error::msg).with_context(|| format!("{}.{k}", spec.id))?;
                    spec = spec.attr(k, value);
                }
                for dep in &r.depends_on {
                    spec = spec.depends_on(dep.clone());
                }
                for attr in &r.immutable {
                    spec = spec.immutable(attr);
                }
                Ok(Declaration { spec, count: r.count })
            })
            .collect()
    }
}

/// Deep-merges maps; `resources` lists are concatenated, anything else in
/// `b` wins.
fn merge(a: Json, b: Json) -> Json {
    match (a, b) {
        (Json::Object(mut ma), Json::Object(mb)) => {
            for (k, v) in mb {
                let merged = match (k.as_str(), ma.remove(&k)) {
                    ("resources", Some(Json::Array(mut xs))) => match v {
                        Json::Array(ys) => {
                            xs.extend(ys);
                            Json::Array(xs)
                        }
                        other => other,
                    },
                    (_, Some(existing)) => merge(existing, v),
                    (_, None) => v,
                };
                ma.insert(k, merged);
            }
            Json::Object(ma)
        }
        (_, v) => v,
    }
}

fn parse_yaml(bytes: &[u8], origin: &Path) -> Result<Json> {
    let doc: Json = serde_yaml::from_slice(bytes).with_context(|| format!("parsing {}", origin.display()))?;
    Ok(if doc.is_null() { Json::Object(Map::new()) } else { doc })
}

fn is_yaml(p: &Path) -> bool {
    matches!(p.extension().and_then(|s| s.to_str()), Some("yaml" | "yml"))
}

pub fn load(path: &Path, age_ids: &[PathBuf]) -> Result<Stack> {
    let doc = if path.is_dir() {
        let mut files: Vec<PathBuf> = std::fs::read_dir(path)
            .with_context(|| format!("reading {}", path.display()))?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && is_yaml(p))
            .collect();
        files.sort();
        if files.is_empty() {
            bail!("{} contains no .yaml or .yml files", path.display());
        }
        let mut doc = Json::Object(Map::new());
        for f in &files {
            tracing::debug!(file = %f.display(), "loading stack document");
            doc = merge(doc, parse_yaml(&std::fs::read(f)?, f)?);
        }
        doc
    } else if path.extension().and_then(|s| s.to_str()) == Some("age") {
        if age_ids.is_empty() {
            bail!("{} is encrypted; pass --age-identity", path.display());
        }
        let mut ids = Vec::new();
        for p in age_ids {
            ids.extend(rekon_crypto::load_identities(p)?);
        }
        let f = std::fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
        let plain = rekon_crypto::decrypt_age_bytes(std::io::BufReader::new(f), &ids)?;
        parse_yaml(plain.expose_secret(), path)?
    } else {
        parse_yaml(&std::fs::read(path).with_context(|| format!("reading {}", path.display()))?, path)?
    };
    serde_json::from_value(doc).with_context(|| format!("invalid stack document {}", path.display()))
}
