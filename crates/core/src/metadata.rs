//! Image metadata parsing and configuration merging
//!
//! The `devcontainer.metadata` image label holds a JSON array of partial
//! configurations. This module parses that label, derives the partial
//! configuration a feature contributes, and merges an ordered chain
//! `[image-embedded.., features.., local]` into one record. Pairs merge
//! left to right; the local configuration is always last and therefore wins
//! scalar conflicts.
//!
//! Per-field rules: scalars take the right side only when set; string
//! arrays union with left order preserved; mount unions are keyed by target
//! with the left entry retained; env maps merge with the later (local) side
//! winning key conflicts; the features map is left-biased; lifecycle
//! commands aggregate rather than overwrite.

use indexmap::IndexMap;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::config::{DevContainerConfig, LifecycleCommand, MountSpec};
use crate::errors::{ConfigError, Result};
use crate::features::ResolvedFeature;

/// Image/container label that carries merged metadata.
pub const METADATA_LABEL: &str = "devcontainer.metadata";

/// Parse the `devcontainer.metadata` label value: a JSON array of partial
/// configurations (a single object is tolerated and treated as a 1-element
/// array).
pub fn parse_metadata_label(label: &str) -> Result<Vec<DevContainerConfig>> {
    let value: Value = serde_json::from_str(label).map_err(|e| ConfigError::ParseInvalid {
        path: METADATA_LABEL.to_string(),
        message: e.to_string(),
    })?;

    let entries = match value {
        Value::Array(items) => items,
        obj @ Value::Object(_) => vec![obj],
        other => {
            return Err(ConfigError::SchemaMismatch {
                field: METADATA_LABEL.to_string(),
                message: format!("expected array of objects, got {}", other),
            }
            .into())
        }
    };

    entries
        .into_iter()
        .map(|entry| {
            serde_json::from_value(entry).map_err(|e| {
                ConfigError::SchemaMismatch {
                    field: METADATA_LABEL.to_string(),
                    message: e.to_string(),
                }
                .into()
            })
        })
        .collect()
}

/// Serialize a metadata chain back into the label value.
pub fn render_metadata_label(chain: &[DevContainerConfig]) -> Result<String> {
    let values: Vec<Value> = chain
        .iter()
        .map(|c| serde_json::to_value(c))
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| ConfigError::SchemaMismatch {
            field: METADATA_LABEL.to_string(),
            message: e.to_string(),
        })?;
    Ok(Value::Array(values).to_string())
}

/// The partial configuration a feature contributes to the metadata chain:
/// capabilities, security options, privileged/init, mounts, lifecycle
/// commands, and customizations. `containerEnv` is deliberately excluded
/// because it is baked into the image at build time.
pub fn feature_contribution(feature: &ResolvedFeature) -> DevContainerConfig {
    let manifest = &feature.manifest;
    DevContainerConfig {
        cap_add: manifest.cap_add.clone(),
        security_opt: manifest.security_opt.clone(),
        privileged: manifest.privileged,
        init: manifest.init,
        mounts: manifest.mounts.clone(),
        on_create_command: manifest.on_create_command.clone(),
        update_content_command: manifest.update_content_command.clone(),
        post_create_command: manifest.post_create_command.clone(),
        post_start_command: manifest.post_start_command.clone(),
        post_attach_command: manifest.post_attach_command.clone(),
        customizations: manifest.customizations.clone(),
        ..DevContainerConfig::default()
    }
}

/// Merge an ordered chain into one configuration. Empty chains produce the
/// default record; the raw bytes and path of the final (local) element are
/// preserved.
#[instrument(skip_all, fields(chain_len = chain.len()))]
pub fn merge_chain(chain: &[DevContainerConfig]) -> DevContainerConfig {
    let mut merged = DevContainerConfig::default();
    for entry in chain {
        merged = merge_two(merged, entry);
    }
    debug!("metadata chain merged");
    merged
}

fn merge_two(mut left: DevContainerConfig, right: &DevContainerConfig) -> DevContainerConfig {
    // Scalars: right wins only when set.
    macro_rules! scalar {
        ($field:ident) => {
            if right.$field.is_some() {
                left.$field = right.$field.clone();
            }
        };
    }
    scalar!(name);
    scalar!(image);
    scalar!(dockerfile);
    scalar!(build);
    scalar!(docker_compose_file);
    scalar!(service);
    scalar!(workspace_folder);
    scalar!(workspace_mount);
    scalar!(remote_user);
    scalar!(container_user);
    scalar!(update_remote_user_uid);
    scalar!(app_port);
    scalar!(shutdown_action);
    scalar!(override_command);
    scalar!(host_requirements);
    // Boolean-pointer scalars: right wins when set, absent preserves left.
    scalar!(privileged);
    scalar!(init);

    left.run_services = union_strings(&left.run_services, &right.run_services);
    left.cap_add = union_strings(&left.cap_add, &right.cap_add);
    left.security_opt = union_strings(&left.security_opt, &right.security_opt);
    left.run_args = union_strings(&left.run_args, &right.run_args);
    left.forward_ports = union_ports(&left.forward_ports, &right.forward_ports);
    left.mounts = union_mounts(&left.mounts, &right.mounts);

    // Env maps: the later (local) side wins key conflicts.
    for (k, v) in &right.container_env {
        left.container_env.insert(k.clone(), v.clone());
    }
    for (k, v) in &right.remote_env {
        left.remote_env.insert(k.clone(), v.clone());
    }

    // Features map is left-biased on keys.
    for (k, v) in &right.features {
        left.features.entry(k.clone()).or_insert_with(|| v.clone());
    }
    if left.override_feature_install_order.is_empty() {
        left.override_feature_install_order = right.override_feature_install_order.clone();
    }

    left.customizations = merge_customizations(&left.customizations, &right.customizations);

    left.initialize_command =
        merge_lifecycle(left.initialize_command.take(), &right.initialize_command);
    left.on_create_command =
        merge_lifecycle(left.on_create_command.take(), &right.on_create_command);
    left.update_content_command = merge_lifecycle(
        left.update_content_command.take(),
        &right.update_content_command,
    );
    left.post_create_command =
        merge_lifecycle(left.post_create_command.take(), &right.post_create_command);
    left.post_start_command =
        merge_lifecycle(left.post_start_command.take(), &right.post_start_command);
    left.post_attach_command =
        merge_lifecycle(left.post_attach_command.take(), &right.post_attach_command);

    if !right.raw_bytes.is_empty() {
        left.raw_bytes = right.raw_bytes.clone();
    }
    if !right.path.as_os_str().is_empty() {
        left.path = right.path.clone();
    }

    left
}

/// Union two string arrays: left order, then right entries not already
/// present.
pub fn union_strings(left: &[String], right: &[String]) -> Vec<String> {
    let mut out = left.to_vec();
    for item in right {
        if !out.contains(item) {
            out.push(item.clone());
        }
    }
    out
}

fn union_ports(
    left: &[crate::config::PortSpec],
    right: &[crate::config::PortSpec],
) -> Vec<crate::config::PortSpec> {
    let mut out = left.to_vec();
    for item in right {
        if !out.contains(item) {
            out.push(item.clone());
        }
    }
    out
}

/// Union two mount lists keyed by target. Right entries whose target is
/// already present are dropped; the left entry is retained.
pub fn union_mounts(left: &[MountSpec], right: &[MountSpec]) -> Vec<MountSpec> {
    let mut out = left.to_vec();
    let mut seen: Vec<String> = left
        .iter()
        .filter_map(|m| m.normalize().ok().map(|m| m.target))
        .collect();
    for item in right {
        match item.normalize() {
            Ok(normalized) => {
                if !seen.contains(&normalized.target) {
                    seen.push(normalized.target);
                    out.push(item.clone());
                }
            }
            // Unparseable entries cannot collide on target; keep them.
            Err(_) => out.push(item.clone()),
        }
    }
    out
}

/// Deep-merge customizations: objects merge recursively with right filling
/// and overriding scalars, arrays (extension lists) union preserving left
/// order.
fn merge_customizations(left: &Value, right: &Value) -> Value {
    match (left, right) {
        (Value::Null, right) => right.clone(),
        (left, Value::Null) => left.clone(),
        (Value::Object(l), Value::Object(r)) => {
            let mut out = l.clone();
            for (k, rv) in r {
                let merged = match out.get(k) {
                    Some(lv) => merge_customizations(lv, rv),
                    None => rv.clone(),
                };
                out.insert(k.clone(), merged);
            }
            Value::Object(out)
        }
        (Value::Array(l), Value::Array(r)) => {
            let mut out = l.clone();
            for item in r {
                if !out.contains(item) {
                    out.push(item.clone());
                }
            }
            Value::Array(out)
        }
        (_, right) => right.clone(),
    }
}

/// Aggregate lifecycle commands: both sides run, left first. Unnamed
/// entries get positional keys so the named form stays collision-free.
fn merge_lifecycle(
    left: Option<LifecycleCommand>,
    right: &Option<LifecycleCommand>,
) -> Option<LifecycleCommand> {
    match (left, right) {
        (left, None) => left,
        (None, Some(right)) => Some(right.clone()),
        (Some(left), Some(right)) => {
            let mut map = IndexMap::new();
            for (idx, entry) in left.entries().into_iter().chain(right.entries()).enumerate() {
                let key = entry
                    .name
                    .unwrap_or_else(|| format!("command-{}", idx));
                // A repeated name keeps the earlier command.
                map.entry(key).or_insert(entry.command);
            }
            Some(LifecycleCommand::Named(map))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CommandForm, FeatureOptionValue, Mount};
    use serde_json::json;

    fn partial(json: Value) -> DevContainerConfig {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn label_parses_array_of_partials() {
        let chain = parse_metadata_label(
            r#"[{"remoteUser":"ubuntu"},{"capAdd":["SYS_PTRACE"]}]"#,
        )
        .unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].remote_user.as_deref(), Some("ubuntu"));
        assert_eq!(chain[1].cap_add, vec!["SYS_PTRACE"]);
    }

    #[test]
    fn label_tolerates_single_object() {
        let chain = parse_metadata_label(r#"{"remoteUser":"dev"}"#).unwrap();
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn label_rejects_scalars() {
        assert!(parse_metadata_label(r#""string""#).is_err());
        assert!(parse_metadata_label("not json").is_err());
    }

    #[test]
    fn merge_precedence_scenario() {
        // Base image metadata, a feature contribution, then local config.
        let base = partial(json!({"remoteUser": "ubuntu", "containerEnv": {"A": "1"}}));
        let feature = partial(json!({"capAdd": ["SYS_PTRACE"]}));
        let local = partial(json!({"remoteUser": "vscode", "containerEnv": {"A": "2", "B": "3"}}));

        let merged = merge_chain(&[base, feature, local]);
        assert_eq!(merged.remote_user.as_deref(), Some("vscode"));
        assert_eq!(merged.container_env["A"], "2");
        assert_eq!(merged.container_env["B"], "3");
        assert_eq!(merged.cap_add, vec!["SYS_PTRACE"]);
    }

    #[test]
    fn scalars_absent_preserve_left() {
        let left = partial(json!({"remoteUser": "dev", "init": true}));
        let right = partial(json!({"image": "alpine"}));
        let merged = merge_chain(&[left, right]);
        assert_eq!(merged.remote_user.as_deref(), Some("dev"));
        assert_eq!(merged.init, Some(true));
        assert_eq!(merged.image.as_deref(), Some("alpine"));
    }

    #[test]
    fn boolean_pointer_no_or_semantics() {
        // right explicitly false overrides left true; absent right keeps left
        let left = partial(json!({"privileged": true}));
        let right = partial(json!({"privileged": false}));
        assert_eq!(merge_chain(&[left, right]).privileged, Some(false));
    }

    #[test]
    fn string_arrays_union_preserving_left_order() {
        let left = partial(json!({"capAdd": ["A", "B"]}));
        let right = partial(json!({"capAdd": ["B", "C"]}));
        assert_eq!(merge_chain(&[left, right]).cap_add, vec!["A", "B", "C"]);
    }

    #[test]
    fn mounts_union_keeps_left_on_duplicate_target() {
        let left = vec![MountSpec::Object(Mount {
            source: Some("/left".into()),
            target: "/data".into(),
            mount_type: "bind".into(),
            readonly: false,
        })];
        let right = vec![
            MountSpec::Object(Mount {
                source: Some("/right".into()),
                target: "/data".into(),
                mount_type: "bind".into(),
                readonly: false,
            }),
            MountSpec::Raw("source=/cache,target=/cache,type=bind".into()),
        ];
        let merged = union_mounts(&left, &right);
        assert_eq!(merged.len(), 2);
        match &merged[0] {
            MountSpec::Object(m) => assert_eq!(m.source.as_deref(), Some("/left")),
            other => panic!("unexpected {other:?}"),
        }

        // Unique targets across the result.
        let targets: Vec<String> = merged
            .iter()
            .map(|m| m.normalize().unwrap().target)
            .collect();
        let mut deduped = targets.clone();
        deduped.dedup();
        assert_eq!(targets, deduped);
    }

    #[test]
    fn features_map_is_left_biased() {
        let left = partial(json!({"features": {"f": {"version": "1"}}}));
        let right = partial(json!({"features": {"f": {"version": "2"}, "g": true}}));
        let merged = merge_chain(&[left, right]);
        match &merged.features["f"] {
            FeatureOptionValue::Options(opts) => assert_eq!(opts["version"], json!("1")),
            other => panic!("unexpected {other:?}"),
        }
        assert!(merged.features.contains_key("g"));
    }

    #[test]
    fn customization_extensions_union() {
        let left = partial(json!({"customizations": {"vscode": {"extensions": ["a", "b"]}}}));
        let right = partial(json!({"customizations": {"vscode": {"extensions": ["b", "c"], "settings": {"x": 1}}}}));
        let merged = merge_chain(&[left, right]);
        assert_eq!(
            merged.customizations["vscode"]["extensions"],
            json!(["a", "b", "c"])
        );
        assert_eq!(merged.customizations["vscode"]["settings"]["x"], json!(1));
    }

    #[test]
    fn lifecycle_commands_aggregate() {
        let left = partial(json!({"postCreateCommand": "feature-setup"}));
        let right = partial(json!({"postCreateCommand": "local-setup"}));
        let merged = merge_chain(&[left, right]);
        let entries = merged.post_create_command.unwrap().entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].command, CommandForm::Shell("feature-setup".into()));
        assert_eq!(entries[1].command, CommandForm::Shell("local-setup".into()));
    }

    #[test]
    fn feature_contribution_excludes_container_env() {
        let manifest: crate::features::FeatureManifest = serde_json::from_value(json!({
            "id": "tool",
            "containerEnv": {"TOOL_HOME": "/opt/tool"},
            "capAdd": ["NET_ADMIN"],
            "privileged": true,
            "postCreateCommand": "tool init"
        }))
        .unwrap();
        let feature = ResolvedFeature {
            id: "tool".into(),
            reference: crate::feature_ref::parse_feature_ref("ghcr.io/x/tool:1").unwrap(),
            options: IndexMap::new(),
            content_dir: std::path::PathBuf::from("/tmp"),
            manifest,
        };
        let contribution = feature_contribution(&feature);
        assert!(contribution.container_env.is_empty());
        assert_eq!(contribution.cap_add, vec!["NET_ADMIN"]);
        assert_eq!(contribution.privileged, Some(true));
        assert!(contribution.post_create_command.is_some());
    }

    #[test]
    fn render_round_trips() {
        let chain = vec![
            partial(json!({"remoteUser": "dev"})),
            partial(json!({"capAdd": ["SYS_PTRACE"]})),
        ];
        let label = render_metadata_label(&chain).unwrap();
        let parsed = parse_metadata_label(&label).unwrap();
        assert_eq!(parsed, chain);
    }
}
