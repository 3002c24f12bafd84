use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value as Json;

use rekon_core::{AttributeDiff, ResourceSpec, RiskPolicy, Value};

/// `policy:` section of a stack document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub allow_high_risk: bool,
    /// Extra rules on top of [`Policy::DEFAULT_UNIQUE_NAMES`].
    pub unique_names: Vec<UniqueNameConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UniqueNameConfig {
    /// Regex matched against the whole resource type.
    #[serde(rename = "type")]
    pub type_pattern: String,
    pub attribute: String,
}

struct UniqueNameRule {
    type_pattern: Regex,
    attribute: String,
}

/// Plan-time checks on replacements. A resource whose name is globally
/// unique is released by the delete half of a replace; another account can
/// claim it before the create half runs.
pub struct Policy {
    pub allow_high_risk: bool,
    rules: Vec<UniqueNameRule>,
}

impl Policy {
    pub const DEFAULT_UNIQUE_NAMES: &'static [(&'static str, &'static str)] = &[
        ("aws_s3_bucket", "bucket"),
        ("aws_iam_role", "name"),
        ("aws_iam_policy", "name"),
        ("aws_dynamodb_table", "name"),
    ];

    pub fn new(allow_high_risk: bool) -> Self {
        let rules = Self::DEFAULT_UNIQUE_NAMES
            .iter()
            .filter_map(|(t, a)| {
                let type_pattern = Regex::new(&format!("^{}$", regex::escape(t))).ok()?;
                Some(UniqueNameRule { type_pattern, attribute: a.to_string() })
            })
            .collect();
        Self { allow_high_risk, rules }
    }

    pub fn from_config(cfg: &PolicyConfig) -> Result<Self> {
        let mut policy = Self::new(cfg.allow_high_risk);
        for rule in &cfg.unique_names {
            let type_pattern = Regex::new(&format!("^(?:{})$", rule.type_pattern))
                .with_context(|| format!("policy.unique_names: bad type pattern '{}'", rule.type_pattern))?;
            policy.rules.push(UniqueNameRule { type_pattern, attribute: rule.attribute.clone() });
        }
        Ok(policy)
    }

    fn name_of(spec: &ResourceSpec, diffs: &[AttributeDiff], attribute: &str) -> Option<String> {
        match spec.attributes.get(attribute) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(_) => Some(format!("<{attribute}>")),
            // Undeclared now; fall back to what the old object carried.
            None => diffs
                .iter()
                .find(|d| d.name == attribute)
                .and_then(|d| d.before.as_ref())
                .map(|b| match b {
                    Json::String(s) => s.clone(),
                    other => other.to_string(),
                }),
        }
    }
}

impl RiskPolicy for Policy {
    fn replacement_risk(&self, spec: &ResourceSpec, diffs: &[AttributeDiff]) -> Option<String> {
        let rule = self.rules.iter().find(|r| r.type_pattern.is_match(&spec.id.type_name))?;
        let name = Self::name_of(spec, diffs, &rule.attribute)?;
        Some(format!("replacing {} releases globally unique {} '{}'", spec.id, rule.attribute, name))
    }
}
