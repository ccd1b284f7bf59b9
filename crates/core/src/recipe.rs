//! Derived-image recipe generation
//!
//! Emits the multi-stage build recipe that installs features on top of the
//! base image, and the separate UID-remap recipe. Both are plain Dockerfile
//! text handed to the runtime's build subcommand against a context directory
//! staged by [`stage_build_context`]. Identical inputs produce identical
//! recipes and identical image tags, so re-running is a no-op against the
//! runtime's layer cache.

use std::path::Path;

use tracing::{debug, instrument};

use crate::errors::{BuildError, Result};
use crate::features::ResolvedFeature;
use crate::hashing::ContentHashes;
use crate::metadata::METADATA_LABEL;

/// Fixed in-container root the staged feature content is copied to.
pub const FEATURES_CONTAINER_ROOT: &str = "/tmp/dcx-features";

/// Name of the product, used as the tag namespace.
pub const PRODUCT: &str = "dcx";

/// Deterministic tag of the feature-augmented image:
/// `dcx/<workspaceId>:<configHash[0:12]>-features`.
pub fn derived_image_tag(workspace_id: &str, hashes: &ContentHashes) -> String {
    format!("{}/{}:{}-features", PRODUCT, workspace_id, hashes.short())
}

/// Deterministic tag of the UID-remap layer.
pub fn remap_image_tag(workspace_id: &str, hashes: &ContentHashes) -> String {
    format!("{}/{}:{}-uid", PRODUCT, workspace_id, hashes.short())
}

/// Generate the feature-installation recipe.
///
/// For each feature, in installation order: copy its staged content from
/// `./features/<i>/` in the build context, export every option as a
/// normalized environment variable, and run its `install.sh`. The merged
/// metadata JSON array is embedded as a label on the final image.
#[instrument(skip_all, fields(base = base_image, features = features.len()))]
pub fn generate_feature_recipe(
    base_image: &str,
    features: &[ResolvedFeature],
    metadata_label_json: &str,
) -> Result<String> {
    if base_image.is_empty() {
        return Err(BuildError::Recipe {
            message: "base image is empty".to_string(),
        }
        .into());
    }
    if features.is_empty() {
        return Err(BuildError::Recipe {
            message: "no features to install".to_string(),
        }
        .into());
    }

    let mut recipe = String::new();
    recipe.push_str(&format!("FROM {}\n\n", base_image));

    for (idx, feature) in features.iter().enumerate() {
        let target = format!("{}/{}", FEATURES_CONTAINER_ROOT, idx);
        recipe.push_str(&format!("# {}\n", feature.id));
        recipe.push_str(&format!("COPY ./features/{}/ {}/\n", idx, target));

        recipe.push_str("RUN ");
        for (name, value) in feature.option_env() {
            recipe.push_str(&format!("{}={} \\\n    ", name, quote(&value)));
        }
        recipe.push_str(&format!(
            "cd {} && chmod +x install.sh && ./install.sh\n\n",
            target
        ));
    }

    recipe.push_str(&format!(
        "LABEL {}={}\n",
        METADATA_LABEL,
        quote(metadata_label_json)
    ));

    debug!(bytes = recipe.len(), "feature recipe generated");
    Ok(recipe)
}

/// Double-quote a value for Dockerfile use, escaping backslashes and quotes.
fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Copy each feature's content into `<context>/features/<i>/` so the recipe's
/// COPY directives resolve.
#[instrument(skip_all, fields(context = %context_dir.display()))]
pub fn stage_build_context(context_dir: &Path, features: &[ResolvedFeature]) -> Result<()> {
    for (idx, feature) in features.iter().enumerate() {
        let dest = context_dir.join("features").join(idx.to_string());
        copy_dir(&feature.content_dir, &dest).map_err(|e| BuildError::Context {
            path: dest.display().to_string(),
            message: e.to_string(),
        })?;
    }
    Ok(())
}

fn copy_dir(src: &Path, dest: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else if file_type.is_symlink() {
            #[cfg(unix)]
            std::os::unix::fs::symlink(std::fs::read_link(entry.path())?, &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Whether the UID-remap stage applies.
///
/// Skipped when the effective user is root (or "0"), when the host runs as
/// root, and when disabled via `updateRemoteUserUID = false`.
pub fn should_remap_user(effective_user: Option<&str>, host_uid: u32, update_enabled: bool) -> bool {
    if !update_enabled || host_uid == 0 {
        return false;
    }
    match effective_user {
        None | Some("root") | Some("0") => false,
        Some(user) => !user.is_empty(),
    }
}

/// Generate the UID-remap recipe: a single stage that rewrites the target
/// user's UID/GID in `/etc/passwd` and `/etc/group` and re-owns the user's
/// home. The rewrite is conditional inside the layer, so images whose user
/// already matches produce a no-op layer.
pub fn generate_remap_recipe(base_image: &str, user: &str, uid: u32, gid: u32) -> Result<String> {
    if base_image.is_empty() || user.is_empty() {
        return Err(BuildError::Recipe {
            message: "remap recipe needs a base image and a user".to_string(),
        }
        .into());
    }

    Ok(format!(
        r#"FROM {base}

USER root
RUN set -eu; \
    if ! grep -q "^{user}:" /etc/passwd; then echo "user {user} not present" >&2; exit 1; fi; \
    old_uid="$(grep "^{user}:" /etc/passwd | cut -d: -f3)"; \
    old_gid="$(grep "^{user}:" /etc/passwd | cut -d: -f4)"; \
    home="$(grep "^{user}:" /etc/passwd | cut -d: -f6)"; \
    if [ "$old_uid" != "{uid}" ] || [ "$old_gid" != "{gid}" ]; then \
        sed -i "s/^\({user}:[^:]*\):$old_uid:$old_gid:/\1:{uid}:{gid}:/" /etc/passwd; \
        sed -i "s/^\([^:]*:[^:]*\):$old_gid:/\1:{gid}:/" /etc/group; \
        chown -R {uid}:{gid} "$home"; \
    fi
USER {user}
"#,
        base = base_image,
        user = user,
        uid = uid,
        gid = gid,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::FeatureManifest;
    use indexmap::IndexMap;
    use serde_json::json;
    use std::path::PathBuf;

    fn feature(id: &str, options_schema: serde_json::Value, user_options: serde_json::Value) -> ResolvedFeature {
        let manifest: FeatureManifest = serde_json::from_value(json!({
            "id": id,
            "options": options_schema,
        }))
        .unwrap();
        let options: IndexMap<String, serde_json::Value> = match user_options {
            serde_json::Value::Object(map) => map.into_iter().collect(),
            _ => IndexMap::new(),
        };
        ResolvedFeature {
            id: id.to_string(),
            reference: crate::feature_ref::parse_feature_ref(&format!("ghcr.io/t/{id}:1")).unwrap(),
            options,
            content_dir: PathBuf::from("/tmp/unused"),
            manifest,
        }
    }

    #[test]
    fn recipe_shape() {
        let features = vec![
            feature("node", json!({"version": {"default": "20"}}), json!({"version": "18"})),
            feature("go", json!({}), json!({})),
        ];
        let recipe =
            generate_feature_recipe("ubuntu:22.04", &features, r#"[{"remoteUser":"dev"}]"#)
                .unwrap();

        assert!(recipe.starts_with("FROM ubuntu:22.04\n"));
        assert!(recipe.contains("COPY ./features/0/ /tmp/dcx-features/0/"));
        assert!(recipe.contains("COPY ./features/1/ /tmp/dcx-features/1/"));
        assert!(recipe.contains(r#"VERSION="18""#), "user option value wins");
        assert!(recipe.contains("cd /tmp/dcx-features/0 && chmod +x install.sh && ./install.sh"));
        assert!(recipe.contains(
            r#"LABEL devcontainer.metadata="[{\"remoteUser\":\"dev\"}]""#
        ));
    }

    #[test]
    fn recipe_is_deterministic() {
        let make = || vec![feature("node", json!({"version": {"default": "20"}}), json!({}))];
        let a = generate_feature_recipe("alpine", &make(), "[]").unwrap();
        let b = generate_feature_recipe("alpine", &make(), "[]").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn recipe_rejects_degenerate_input() {
        assert!(generate_feature_recipe("", &[feature("f", json!({}), json!({}))], "[]").is_err());
        assert!(generate_feature_recipe("alpine", &[], "[]").is_err());
    }

    #[test]
    fn tags_are_deterministic() {
        let hashes = ContentHashes::compute(b"cfg", b"", b"", &[]);
        let tag = derived_image_tag("abc123def456", &hashes);
        assert_eq!(tag, format!("dcx/abc123def456:{}-features", hashes.short()));
        assert_eq!(tag, derived_image_tag("abc123def456", &hashes));
    }

    #[test]
    fn remap_gating() {
        assert!(should_remap_user(Some("dev"), 1000, true));
        assert!(!should_remap_user(Some("root"), 1000, true));
        assert!(!should_remap_user(Some("0"), 1000, true));
        assert!(!should_remap_user(None, 1000, true));
        assert!(!should_remap_user(Some("dev"), 0, true), "host root skips remap");
        assert!(!should_remap_user(Some("dev"), 1000, false), "explicit opt-out");
    }

    #[test]
    fn remap_recipe_shape() {
        let recipe = generate_remap_recipe("dcx/ws:abc-features", "dev", 1000, 1000).unwrap();
        assert!(recipe.starts_with("FROM dcx/ws:abc-features\n"));
        assert!(recipe.contains("/etc/passwd"));
        assert!(recipe.contains("/etc/group"));
        assert!(recipe.contains("chown -R 1000:1000"));
        assert!(recipe.trim_end().ends_with("USER dev"));
    }

    #[test]
    fn staging_copies_feature_content() -> anyhow::Result<()> {
        let src = tempfile::TempDir::new()?;
        std::fs::write(src.path().join("devcontainer-feature.json"), r#"{"id":"f"}"#)?;
        std::fs::write(src.path().join("install.sh"), "#!/bin/sh\n")?;
        std::fs::create_dir(src.path().join("lib"))?;
        std::fs::write(src.path().join("lib/util.sh"), "")?;

        let mut f = feature("f", json!({}), json!({}));
        f.content_dir = src.path().to_path_buf();

        let ctx = tempfile::TempDir::new()?;
        stage_build_context(ctx.path(), &[f])?;

        assert!(ctx.path().join("features/0/install.sh").is_file());
        assert!(ctx.path().join("features/0/lib/util.sh").is_file());
        Ok(())
    }
}
