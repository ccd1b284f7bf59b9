//! End-to-end resolution scenarios over real temp workspaces.

use dcx_core::config::{discover_config, DevContainerConfig, PlanKind};
use dcx_core::features::FeatureManifest;
use dcx_core::hashing::sha256_hex;
use dcx_core::ordering::order_features;
use dcx_core::state::{plan, ContainerState, PlanAction};
use dcx_core::variable::SubstitutionContext;
use dcx_core::workspace::{
    resolve_workspace, ExecutionPlan, LABEL_CONFIG_HASH, LABEL_PLAN_TYPE, LABEL_WORKSPACE_ID,
};
use indexmap::IndexMap;
use std::path::PathBuf;
use tempfile::TempDir;

fn workspace(config_json: &str) -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();
    let dc = dir.path().join(".devcontainer");
    std::fs::create_dir(&dc).unwrap();
    let path = dc.join("devcontainer.json");
    std::fs::write(&path, config_json).unwrap();
    (dir, path)
}

/// Image-only plan, cold start: plan type, workspace id shape, and the
/// labels a fresh container would be created with.
#[test]
fn image_only_cold_start() {
    let (dir, path) = workspace(r#"{"image":"alpine:3.19","workspaceFolder":"/workspaces/proj"}"#);
    assert_eq!(discover_config(dir.path()).unwrap(), path);

    let config = DevContainerConfig::load(&path).unwrap();
    let raw = config.raw_bytes.clone();
    let context = SubstitutionContext::new(dir.path(), config.workspace_folder.as_deref(), false)
        .unwrap();
    let ws = resolve_workspace(dir.path(), config, Vec::new(), &context).unwrap();

    assert!(matches!(ws.plan, ExecutionPlan::Image { ref reference } if reference == "alpine:3.19"));

    // id = base32(sha256(realpath(root)))[0:12], lowercase
    assert_eq!(ws.id.len(), 12);
    assert!(ws.id.chars().all(|c| c.is_ascii_lowercase() || ('2'..='7').contains(&c)));
    assert_eq!(ws.id, dcx_core::hashing::workspace_id(dir.path()).unwrap());

    let labels = ws.labels();
    assert_eq!(labels[LABEL_WORKSPACE_ID], ws.id);
    assert_eq!(labels[LABEL_PLAN_TYPE], "image");
    assert_eq!(labels[LABEL_CONFIG_HASH], ws.hashes.overall);
    assert_eq!(ws.hashes.config, sha256_hex(&raw));
    assert_eq!(ws.workspace_folder, "/workspaces/proj");

    // A cold workspace plans a rebuild.
    let decision = plan(ContainerState::Absent, false, false);
    assert_eq!(decision.action, PlanAction::Rebuild);
    assert_eq!(decision.reason, "no container exists");
}

/// Dockerfile plan: rewriting the dockerfile flips the overall hash, which
/// is exactly the stale signal the classifier keys on.
#[test]
fn dockerfile_rewrite_goes_stale() {
    let dir = TempDir::new().unwrap();
    let dc = dir.path().join(".devcontainer");
    std::fs::create_dir(&dc).unwrap();
    std::fs::write(dc.join("Dockerfile"), "FROM alpine:3.19\n").unwrap();
    let path = dc.join("devcontainer.json");
    std::fs::write(&path, r#"{"build":{"dockerfile":"Dockerfile"}}"#).unwrap();

    let resolve = |root: &std::path::Path, path: &std::path::Path| {
        let config = DevContainerConfig::load(path).unwrap();
        let context =
            SubstitutionContext::new(root, config.workspace_folder.as_deref(), false).unwrap();
        resolve_workspace(root, config, Vec::new(), &context).unwrap()
    };

    let before = resolve(dir.path(), &path);
    std::fs::write(dc.join("Dockerfile"), "FROM alpine:3.20\nRUN apk add git\n").unwrap();
    let after = resolve(dir.path(), &path);

    assert_eq!(before.hashes.config, after.hashes.config);
    assert_ne!(before.hashes.dockerfile, after.hashes.dockerfile);
    assert_ne!(before.hashes.overall, after.hashes.overall);

    // A stale container plans a rebuild without any user intent.
    let decision = plan(ContainerState::Stale, false, false);
    assert_eq!(decision.action, PlanAction::Rebuild);
    assert_eq!(decision.reason, "configuration changed");
}

fn feature(id: &str, depends_on: &[&str], installs_after: &[&str]) -> dcx_core::features::ResolvedFeature {
    let manifest: FeatureManifest = serde_json::from_value(serde_json::json!({
        "id": id,
        "dependsOn": depends_on
            .iter()
            .map(|d| (d.to_string(), serde_json::json!({})))
            .collect::<serde_json::Map<_, _>>(),
        "installsAfter": installs_after,
    }))
    .unwrap();
    dcx_core::features::ResolvedFeature {
        id: id.to_string(),
        reference: dcx_core::feature_ref::parse_feature_ref(&format!("ghcr.io/t/{id}:1")).unwrap(),
        options: IndexMap::new(),
        content_dir: PathBuf::from("/tmp/unused"),
        manifest,
    }
}

/// Mutually dependent features always fail ordering.
#[test]
fn feature_cycle_fails() {
    let err = order_features(
        vec![feature("a", &["b"], &[]), feature("b", &["a"], &[])],
        &[],
    )
    .unwrap_err();
    assert!(err.to_string().contains("circular dependency"));
}

/// Soft-edge ordering: z installs after x and y, so z is last; x and y may
/// come in either order.
#[test]
fn soft_edges_keep_dependent_last() {
    let ordered = order_features(
        vec![
            feature("z", &[], &["x", "y"]),
            feature("x", &[], &[]),
            feature("y", &[], &[]),
        ],
        &[],
    )
    .unwrap();
    let ids: Vec<&str> = ordered.iter().map(|f| f.id.as_str()).collect();
    assert_eq!(ids[2], "z");
    assert!(ids[..2].contains(&"x") && ids[..2].contains(&"y"));
}

/// Feature order feeds the features hash: permuting declaration order does
/// not change the hash, changing options does.
#[test]
fn feature_hash_is_order_insensitive_but_option_sensitive() {
    use dcx_core::hashing::ContentHashes;

    let a = ContentHashes::compute(b"c", b"", b"", &[feature("x", &[], &[]), feature("y", &[], &[])]);
    let b = ContentHashes::compute(b"c", b"", b"", &[feature("y", &[], &[]), feature("x", &[], &[])]);
    assert_eq!(a.features, b.features);

    let mut changed = feature("x", &[], &[]);
    changed
        .options
        .insert("version".to_string(), serde_json::json!("2"));
    let c = ContentHashes::compute(b"c", b"", b"", &[changed, feature("y", &[], &[])]);
    assert_ne!(a.features, c.features);
}

/// The config workspace folder must be declared in the container's plan
/// kind context: compose roots at `/`, others at `/workspaces/<basename>`.
#[test]
fn default_container_workspace_folder_varies_by_plan() {
    let (dir, path) = workspace(r#"{"image":"alpine:3.19"}"#);
    let config = DevContainerConfig::load(&path).unwrap();
    let context = SubstitutionContext::new(dir.path(), None, false).unwrap();
    let ws = resolve_workspace(dir.path(), config, Vec::new(), &context).unwrap();
    let basename = dir.path().file_name().unwrap().to_string_lossy();
    assert_eq!(ws.workspace_folder, format!("/workspaces/{basename}"));
    assert_eq!(ws.plan.kind(), PlanKind::Image);
}
