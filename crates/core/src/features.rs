//! Feature manifests and resolved features
//!
//! A feature directory carries a mandatory `devcontainer-feature.json` and an
//! `install.sh` entrypoint. This module models the manifest, resolves user
//! options against the declared schema, and normalizes option names into the
//! environment-variable form the install script sees.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{LifecycleCommand, MountSpec};
use crate::errors::{FetchError, Result};
use crate::feature_ref::FeatureRef;
use crate::hashing::canonical_json;

/// File name of the per-feature manifest.
pub const FEATURE_MANIFEST: &str = "devcontainer-feature.json";

/// File name of the per-feature install entrypoint.
pub const INSTALL_SCRIPT: &str = "install.sh";

/// Schema of a single option in a feature manifest.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct FeatureOptionSchema {
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub option_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, rename = "enum", skip_serializing_if = "Vec::is_empty")]
    pub allowed: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub proposals: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// The `devcontainer-feature.json` manifest.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureManifest {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub options: IndexMap<String, FeatureOptionSchema>,
    /// Hard dependencies: reference -> option overrides
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub depends_on: IndexMap<String, Value>,
    /// Soft ordering constraints; ignored when the named feature is absent
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub installs_after: Vec<String>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub container_env: IndexMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cap_add: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub security_opt: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub privileged: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<MountSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_create_command: Option<LifecycleCommand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_content_command: Option<LifecycleCommand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_create_command: Option<LifecycleCommand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_start_command: Option<LifecycleCommand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_attach_command: Option<LifecycleCommand>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub customizations: Value,
}

impl FeatureManifest {
    /// Parse a manifest from a feature directory.
    pub fn load(feature_dir: &Path) -> Result<Self> {
        let path = feature_dir.join(FEATURE_MANIFEST);
        let bytes = std::fs::read(&path).map_err(|e| FetchError::LocalFeature {
            path: feature_dir.display().to_string(),
            message: format!("missing {}: {}", FEATURE_MANIFEST, e),
        })?;
        Self::from_bytes(&bytes, &path.display().to_string())
    }

    /// Parse manifest bytes, reported against `origin` on failure.
    pub fn from_bytes(bytes: &[u8], origin: &str) -> Result<Self> {
        let manifest: FeatureManifest =
            serde_json::from_slice(bytes).map_err(|e| FetchError::InvalidManifest {
                reference: origin.to_string(),
                message: e.to_string(),
            })?;
        if manifest.id.is_empty() {
            return Err(FetchError::InvalidManifest {
                reference: origin.to_string(),
                message: "manifest id is empty".to_string(),
            }
            .into());
        }
        Ok(manifest)
    }
}

/// Normalize an option name into its environment-variable form: every
/// non-word character becomes `_`, any leading run of digits or underscores
/// collapses to a single `_`, and the result is uppercased.
pub fn option_env_name(option: &str) -> String {
    let replaced: String = option
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();

    let trimmed = replaced.trim_start_matches(|c: char| c.is_ascii_digit() || c == '_');
    let normalized = if trimmed.len() == replaced.len() {
        replaced
    } else {
        format!("_{}", trimmed)
    };
    normalized.to_ascii_uppercase()
}

/// Render an option value for the install environment.
pub fn option_env_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// A feature after fetching: identity, source, options, on-disk content.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedFeature {
    /// Manifest id, falling back to the original reference string
    pub id: String,
    /// Where the feature came from
    pub reference: FeatureRef,
    /// User options merged over schema defaults
    pub options: IndexMap<String, Value>,
    /// Directory holding the feature content (cache entry or local path)
    pub content_dir: PathBuf,
    pub manifest: FeatureManifest,
}

impl ResolvedFeature {
    /// Identity string `<id>:<version>:<canonical-json(options)>` used in
    /// the features content hash.
    pub fn identity(&self) -> String {
        let options = Value::Object(
            self.options
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        );
        format!(
            "{}:{}:{}",
            self.id,
            self.manifest.version.as_deref().unwrap_or("latest"),
            canonical_json(&options)
        )
    }

    /// Effective option values in schema order: the user value when
    /// supplied, else the schema default.
    pub fn effective_options(&self) -> IndexMap<String, Value> {
        let mut out = IndexMap::new();
        for (name, schema) in &self.manifest.options {
            let value = self
                .options
                .get(name)
                .cloned()
                .or_else(|| schema.default.clone())
                .unwrap_or(Value::Null);
            out.insert(name.clone(), value);
        }
        // Options the user supplied that the schema does not declare are
        // still exported; the install script decides what to do with them.
        for (name, value) in &self.options {
            out.entry(name.clone()).or_insert_with(|| value.clone());
        }
        out
    }

    /// Normalized `NAME=value` pairs for the install script environment.
    pub fn option_env(&self) -> Vec<(String, String)> {
        self.effective_options()
            .iter()
            .map(|(name, value)| (option_env_name(name), option_env_value(value)))
            .collect()
    }

    /// Soft ordering dependencies, verbatim from the manifest.
    pub fn installs_after(&self) -> &[String] {
        &self.manifest.installs_after
    }

    /// Hard dependency references, verbatim from the manifest.
    pub fn depends_on(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.manifest.depends_on.iter()
    }
}
