//! Resolved workspace construction
//!
//! Folds the substituted, metadata-merged configuration plus the ordered
//! feature set into one immutable record holding every value the downstream
//! components need: identity, plan variant, effective user, environment,
//! mounts, ports, labels, and content hashes. Constructed once per
//! invocation and never mutated afterwards.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::compose::ComposeProject;
use crate::config::{
    DevContainerConfig, GpuRequest, Mount, PlanKind, PortForward,
};
use crate::errors::{ConfigError, Result};
use crate::features::ResolvedFeature;
use crate::hashing::ContentHashes;
use crate::io::lexical_clean;
use crate::recipe;
use crate::runtime::CreateSpec;
use crate::state::WorkspaceIdentity;
use crate::variable::SubstitutionContext;

/// Container label: workspace identifier.
pub const LABEL_WORKSPACE_ID: &str = "dcx.workspace.id";
/// Container label: sanitized human name.
pub const LABEL_WORKSPACE_NAME: &str = "dcx.workspace.name";
/// Container label: overall content hash at creation time.
pub const LABEL_CONFIG_HASH: &str = "dcx.config.hash";
/// Container label: plan variant (`image` | `dockerfile` | `compose`).
pub const LABEL_PLAN_TYPE: &str = "dcx.plan.type";
/// Container label: absolute configuration file path.
pub const LABEL_CONFIG_PATH: &str = "dcx.config.path";

/// The execution plan: exactly one of three variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionPlan {
    /// Run a pre-built image
    Image { reference: String },
    /// Build from a dockerfile first
    Dockerfile {
        dockerfile: PathBuf,
        context: PathBuf,
        build_args: IndexMap<String, String>,
        target: Option<String>,
        cache_from: Vec<String>,
    },
    /// Delegate to compose
    Compose(ComposeProject),
}

impl ExecutionPlan {
    pub fn kind(&self) -> PlanKind {
        match self {
            ExecutionPlan::Image { .. } => PlanKind::Image,
            ExecutionPlan::Dockerfile { .. } => PlanKind::Dockerfile,
            ExecutionPlan::Compose(_) => PlanKind::Compose,
        }
    }
}

/// The immutable record every downstream component works from.
#[derive(Debug, Clone)]
pub struct ResolvedWorkspace {
    /// Deterministic workspace identifier
    pub id: String,
    /// Sanitized human name
    pub name: String,
    pub workspace_root: PathBuf,
    pub config_path: PathBuf,
    pub plan: ExecutionPlan,
    pub remote_user: Option<String>,
    pub container_user: Option<String>,
    pub host_uid: u32,
    pub host_gid: u32,
    /// Workspace path inside the container
    pub workspace_folder: String,
    pub container_env: IndexMap<String, String>,
    pub remote_env: IndexMap<String, String>,
    /// Normalized mounts, unique by target, workspace mount first
    pub mounts: Vec<Mount>,
    pub cap_add: Vec<String>,
    pub security_opt: Vec<String>,
    pub privileged: bool,
    pub init: bool,
    pub override_command: bool,
    pub forward_ports: Vec<PortForward>,
    /// Features in installation order
    pub features: Vec<ResolvedFeature>,
    pub hashes: ContentHashes,
    pub customizations: Value,
    pub gpu: Option<GpuRequest>,
    /// Tag of the feature-augmented image, when features are present
    pub derived_image_tag: Option<String>,
    pub update_remote_user_uid: bool,
    /// The merged configuration, kept for lifecycle hooks
    pub merged: DevContainerConfig,
}

impl ResolvedWorkspace {
    /// The effective user: `remoteUser` falling back to `containerUser`.
    pub fn effective_user(&self) -> Option<&str> {
        self.remote_user
            .as_deref()
            .or(self.container_user.as_deref())
    }

    /// Deterministic container name for single-container plans.
    pub fn container_name(&self) -> String {
        format!("dcx-{}", self.id)
    }

    /// The labels written onto containers at create time.
    pub fn labels(&self) -> IndexMap<String, String> {
        IndexMap::from([
            (LABEL_WORKSPACE_ID.to_string(), self.id.clone()),
            (LABEL_WORKSPACE_NAME.to_string(), self.name.clone()),
            (LABEL_CONFIG_HASH.to_string(), self.hashes.overall.clone()),
            (LABEL_PLAN_TYPE.to_string(), self.plan.kind().to_string()),
            (
                LABEL_CONFIG_PATH.to_string(),
                self.config_path.display().to_string(),
            ),
        ])
    }

    /// What state classification needs.
    pub fn identity(&self) -> WorkspaceIdentity {
        WorkspaceIdentity {
            id: self.id.clone(),
            plan: self.plan.kind(),
            config_hash: self.hashes.overall.clone(),
            compose: match &self.plan {
                ExecutionPlan::Compose(project) => Some(project.clone()),
                _ => None,
            },
        }
    }

    /// The image the container runs: the derived image when features are
    /// installed, else the given base.
    pub fn runtime_image(&self, base: &str) -> String {
        self.derived_image_tag
            .clone()
            .unwrap_or_else(|| base.to_string())
    }

    /// Build the create invocation for single-container plans.
    pub fn create_spec(&self, image: &str) -> CreateSpec {
        CreateSpec {
            image: image.to_string(),
            name: Some(self.container_name()),
            labels: self.labels(),
            env: self.container_env.clone(),
            mounts: self.mounts.clone(),
            ports: self.forward_ports.clone(),
            user: self.container_user.clone(),
            workdir: Some(self.workspace_folder.clone()),
            override_command: self.override_command,
            init: self.init,
            privileged: self.privileged,
            cap_add: self.cap_add.clone(),
            security_opt: self.security_opt.clone(),
            gpu: self.gpu.clone(),
            extra_args: self.merged.run_args.clone(),
        }
    }
}

/// Sanitize a human name for use in a label: keep alphanumerics, `-`, `_`
/// and `.`; everything else becomes `-`.
pub fn sanitize_name(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();
    sanitized.trim_matches('-').to_string()
}

/// Host UID/GID detection. Environment `UID`/`GID` win when present;
/// otherwise the `id` command answers. Shelling out beats reaching for
/// unsafe platform calls here.
#[cfg(unix)]
pub fn host_user_info() -> (u32, u32) {
    fn from_env(var: &str) -> Option<u32> {
        std::env::var(var).ok()?.parse().ok()
    }
    fn from_id(flag: &str) -> Option<u32> {
        let output = std::process::Command::new("id").arg(flag).output().ok()?;
        String::from_utf8_lossy(&output.stdout).trim().parse().ok()
    }

    let uid = from_env("UID").or_else(|| from_id("-u")).unwrap_or(0);
    let gid = from_env("GID").or_else(|| from_id("-g")).unwrap_or(uid);
    (uid, gid)
}

#[cfg(not(unix))]
pub fn host_user_info() -> (u32, u32) {
    (0, 0)
}

/// Assemble the resolved workspace.
///
/// `merged` is the substituted, metadata-merged configuration whose
/// `raw_bytes`/`path` still reflect the local file; `features` are already
/// in installation order.
#[instrument(skip_all, fields(workspace = %workspace_root.display()))]
pub fn resolve_workspace(
    workspace_root: &Path,
    merged: DevContainerConfig,
    features: Vec<ResolvedFeature>,
    context: &SubstitutionContext,
) -> Result<ResolvedWorkspace> {
    merged.validate()?;

    let config_path = merged.path.clone();
    let config_dir = config_path
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| workspace_root.to_path_buf());

    let plan = build_plan(&merged, &config_dir, &context.workspace_id)?;

    // Hash inputs: raw config bytes, dockerfile bytes, concatenated compose
    // bytes, and the feature identity multiset.
    let dockerfile_bytes = match &plan {
        ExecutionPlan::Dockerfile { dockerfile, .. } => {
            std::fs::read(dockerfile).map_err(|e| ConfigError::Io {
                path: dockerfile.display().to_string(),
                source: e,
            })?
        }
        _ => Vec::new(),
    };
    let compose_bytes = match &plan {
        ExecutionPlan::Compose(project) => {
            let mut bytes = Vec::new();
            for file in &project.files {
                let mut content = std::fs::read(file).map_err(|e| ConfigError::Io {
                    path: file.display().to_string(),
                    source: e,
                })?;
                bytes.append(&mut content);
            }
            bytes
        }
        _ => Vec::new(),
    };
    let hashes = ContentHashes::compute(
        &merged.raw_bytes,
        &dockerfile_bytes,
        &compose_bytes,
        &features,
    );

    let name = sanitize_name(
        merged
            .name
            .as_deref()
            .unwrap_or_else(|| context.local_workspace_folder.rsplit('/').next().unwrap_or("workspace")),
    );

    let workspace_folder = merged
        .workspace_folder
        .clone()
        .unwrap_or_else(|| context.container_workspace_folder.clone());

    let mounts = resolve_mounts(&merged, context, &workspace_folder, plan.kind())?;

    let forward_ports = {
        let mut ports: Vec<PortForward> = Vec::new();
        for spec in &merged.forward_ports {
            let forward = spec.normalize()?;
            if !ports.contains(&forward) {
                ports.push(forward);
            }
        }
        if let Some(app_port) = &merged.app_port {
            let forward = app_port.normalize()?;
            if !ports.contains(&forward) {
                ports.push(forward);
            }
        }
        ports
    };

    let gpu = merged
        .host_requirements
        .as_ref()
        .and_then(|hr| hr.gpu.as_ref())
        .map(|g| g.normalize())
        .transpose()?
        .filter(|g| g.enabled);

    let derived_image_tag = if features.is_empty() || plan.kind() == PlanKind::Compose {
        None
    } else {
        Some(recipe::derived_image_tag(&context.workspace_id, &hashes))
    };

    let (host_uid, host_gid) = host_user_info();

    let resolved = ResolvedWorkspace {
        id: context.workspace_id.clone(),
        name,
        workspace_root: workspace_root.to_path_buf(),
        config_path,
        plan,
        remote_user: merged.remote_user.clone(),
        container_user: merged.container_user.clone(),
        host_uid,
        host_gid,
        workspace_folder,
        container_env: merged.container_env.clone(),
        remote_env: merged.remote_env.clone(),
        mounts,
        cap_add: merged.cap_add.clone(),
        security_opt: merged.security_opt.clone(),
        privileged: merged.privileged.unwrap_or(false),
        init: merged.init.unwrap_or(false),
        override_command: merged.override_command.unwrap_or(true),
        forward_ports,
        features,
        hashes,
        customizations: merged.customizations.clone(),
        gpu,
        derived_image_tag,
        update_remote_user_uid: merged.update_remote_user_uid.unwrap_or(true),
        merged,
    };

    debug!(
        id = %resolved.id,
        plan = %resolved.plan.kind(),
        features = resolved.features.len(),
        hash = %resolved.hashes.short(),
        "workspace resolved"
    );
    Ok(resolved)
}

fn build_plan(
    merged: &DevContainerConfig,
    config_dir: &Path,
    workspace_id: &str,
) -> Result<ExecutionPlan> {
    match merged.plan_kind() {
        PlanKind::Image => Ok(ExecutionPlan::Image {
            reference: merged.image.clone().ok_or_else(|| ConfigError::Validation {
                field: "image".to_string(),
                message: "image plan without an image".to_string(),
            })?,
        }),
        PlanKind::Dockerfile => {
            let dockerfile_rel =
                merged
                    .dockerfile_path()
                    .unwrap_or_else(|| "Dockerfile".to_string());
            let dockerfile = absolutize(config_dir, &dockerfile_rel);
            let build = merged.build.clone().unwrap_or_default();
            let context_dir = match &build.context {
                Some(context) => absolutize(config_dir, context),
                None => dockerfile
                    .parent()
                    .map(|p| p.to_path_buf())
                    .unwrap_or_else(|| config_dir.to_path_buf()),
            };
            Ok(ExecutionPlan::Dockerfile {
                dockerfile,
                context: context_dir,
                build_args: build.args,
                target: build.target,
                cache_from: build.cache_from.map(|c| c.into_vec()).unwrap_or_default(),
            })
        }
        PlanKind::Compose => {
            let files: Vec<PathBuf> = merged
                .compose_files()
                .iter()
                .map(|f| absolutize(config_dir, f))
                .collect();
            Ok(ExecutionPlan::Compose(ComposeProject {
                project_name: workspace_id.to_string(),
                files,
                service: merged.service.clone().unwrap_or_default(),
                run_services: merged.run_services.clone(),
            }))
        }
    }
}

fn absolutize(base: &Path, value: &str) -> PathBuf {
    let path = Path::new(value);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        lexical_clean(&base.join(path))
    }
}

/// The workspace bind mount plus configured mounts, deduplicated by target
/// with earlier entries winning.
fn resolve_mounts(
    merged: &DevContainerConfig,
    context: &SubstitutionContext,
    workspace_folder: &str,
    plan: PlanKind,
) -> Result<Vec<Mount>> {
    let mut mounts: Vec<Mount> = Vec::new();

    // Compose plans mount the workspace through the compose file, not here.
    if plan != PlanKind::Compose {
        let workspace_mount = match &merged.workspace_mount {
            Some(raw) => crate::config::MountSpec::Raw(raw.clone()).normalize()?,
            None => Mount {
                source: Some(context.local_workspace_folder.clone()),
                target: workspace_folder.to_string(),
                mount_type: "bind".to_string(),
                readonly: false,
            },
        };
        mounts.push(workspace_mount);
    }

    for spec in &merged.mounts {
        let mount = spec.normalize()?;
        if !mounts.iter().any(|m| m.target == mount.target) {
            mounts.push(mount);
        }
    }
    Ok(mounts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MountSpec;
    use tempfile::TempDir;

    fn workspace_with(config_json: &str) -> (TempDir, DevContainerConfig, SubstitutionContext) {
        let dir = TempDir::new().unwrap();
        let dc_dir = dir.path().join(".devcontainer");
        std::fs::create_dir(&dc_dir).unwrap();
        let config_path = dc_dir.join("devcontainer.json");
        std::fs::write(&config_path, config_json).unwrap();

        let config = DevContainerConfig::load(&config_path).unwrap();
        let is_compose = config.plan_kind() == PlanKind::Compose;
        let context = SubstitutionContext::new(
            dir.path(),
            config.workspace_folder.as_deref(),
            is_compose,
        )
        .unwrap();
        (dir, config, context)
    }

    #[test]
    fn image_plan_resolution() {
        let (dir, config, context) =
            workspace_with(r#"{"image": "alpine:3.19", "workspaceFolder": "/workspaces/proj"}"#);
        let ws = resolve_workspace(dir.path(), config, Vec::new(), &context).unwrap();

        assert_eq!(
            ws.plan,
            ExecutionPlan::Image {
                reference: "alpine:3.19".to_string()
            }
        );
        assert_eq!(ws.id, context.workspace_id);
        assert_eq!(ws.workspace_folder, "/workspaces/proj");
        assert_eq!(ws.hashes.config, crate::hashing::sha256_hex(&ws.merged.raw_bytes));
        assert!(ws.derived_image_tag.is_none());
    }

    #[test]
    fn labels_are_complete() {
        let (dir, config, context) = workspace_with(r#"{"name": "My Proj!", "image": "alpine"}"#);
        let ws = resolve_workspace(dir.path(), config, Vec::new(), &context).unwrap();
        let labels = ws.labels();
        assert_eq!(labels[LABEL_WORKSPACE_ID], ws.id);
        assert_eq!(labels[LABEL_WORKSPACE_NAME], "My-Proj");
        assert_eq!(labels[LABEL_CONFIG_HASH], ws.hashes.overall);
        assert_eq!(labels[LABEL_PLAN_TYPE], "image");
        assert_eq!(labels[LABEL_CONFIG_PATH], ws.config_path.display().to_string());
    }

    #[test]
    fn dockerfile_plan_hashes_dockerfile() {
        let dir = TempDir::new().unwrap();
        let dc_dir = dir.path().join(".devcontainer");
        std::fs::create_dir(&dc_dir).unwrap();
        std::fs::write(dc_dir.join("Dockerfile"), "FROM alpine\n").unwrap();
        let config_path = dc_dir.join("devcontainer.json");
        std::fs::write(
            &config_path,
            r#"{"build": {"dockerfile": "Dockerfile"}}"#,
        )
        .unwrap();

        let config = DevContainerConfig::load(&config_path).unwrap();
        let context = SubstitutionContext::new(dir.path(), None, false).unwrap();
        let ws = resolve_workspace(dir.path(), config, Vec::new(), &context).unwrap();

        match &ws.plan {
            ExecutionPlan::Dockerfile { dockerfile, context: ctx, .. } => {
                assert!(dockerfile.is_absolute());
                assert!(dockerfile.ends_with(".devcontainer/Dockerfile"));
                assert_eq!(ctx, &dc_dir);
            }
            other => panic!("expected dockerfile plan, got {other:?}"),
        }
        assert_eq!(
            ws.hashes.dockerfile,
            crate::hashing::sha256_hex(b"FROM alpine\n")
        );

        // Rewriting the dockerfile flips the hash (stale detection input).
        std::fs::write(dc_dir.join("Dockerfile"), "FROM alpine:3.19\n").unwrap();
        let config2 = DevContainerConfig::load(&config_path).unwrap();
        let ws2 = resolve_workspace(dir.path(), config2, Vec::new(), &context).unwrap();
        assert_ne!(ws.hashes.overall, ws2.hashes.overall);
    }

    #[test]
    fn compose_plan_resolution() {
        let dir = TempDir::new().unwrap();
        let dc_dir = dir.path().join(".devcontainer");
        std::fs::create_dir(&dc_dir).unwrap();
        std::fs::write(dc_dir.join("docker-compose.yml"), "services: {}\n").unwrap();
        let config_path = dc_dir.join("devcontainer.json");
        std::fs::write(
            &config_path,
            r#"{"dockerComposeFile": "docker-compose.yml", "service": "app", "runServices": ["db"]}"#,
        )
        .unwrap();

        let config = DevContainerConfig::load(&config_path).unwrap();
        let context = SubstitutionContext::new(dir.path(), None, true).unwrap();
        let ws = resolve_workspace(dir.path(), config, Vec::new(), &context).unwrap();

        match &ws.plan {
            ExecutionPlan::Compose(project) => {
                assert_eq!(project.project_name, ws.id);
                assert_eq!(project.service, "app");
                assert_eq!(project.run_services, vec!["db"]);
                assert!(project.files[0].is_absolute());
            }
            other => panic!("expected compose plan, got {other:?}"),
        }
        // Compose plans do not synthesize a workspace bind mount.
        assert!(ws.mounts.is_empty());
        assert_eq!(ws.workspace_folder, "/");
    }

    #[test]
    fn effective_user_fallback() {
        let (dir, config, context) =
            workspace_with(r#"{"image": "x", "containerUser": "node"}"#);
        let ws = resolve_workspace(dir.path(), config, Vec::new(), &context).unwrap();
        assert_eq!(ws.effective_user(), Some("node"));

        let (dir2, config2, context2) = workspace_with(
            r#"{"image": "x", "containerUser": "node", "remoteUser": "dev"}"#,
        );
        let ws2 = resolve_workspace(dir2.path(), config2, Vec::new(), &context2).unwrap();
        assert_eq!(ws2.effective_user(), Some("dev"));
    }

    #[test]
    fn mounts_dedupe_by_target() {
        let (dir, mut config, context) = workspace_with(r#"{"image": "x"}"#);
        config.mounts = vec![
            MountSpec::Raw("source=/a,target=/data,type=bind".into()),
            MountSpec::Raw("source=/b,target=/data,type=bind".into()),
        ];
        let ws = resolve_workspace(dir.path(), config, Vec::new(), &context).unwrap();
        let data_mounts: Vec<&Mount> = ws.mounts.iter().filter(|m| m.target == "/data").collect();
        assert_eq!(data_mounts.len(), 1);
        assert_eq!(data_mounts[0].source.as_deref(), Some("/a"));
        // Workspace mount is present and first.
        assert_eq!(ws.mounts[0].target, ws.workspace_folder);
    }

    #[test]
    fn ports_dedupe() {
        let (dir, config, context) = workspace_with(
            r#"{"image": "x", "forwardPorts": [8080, "8080", 3000], "appPort": 3000}"#,
        );
        let ws = resolve_workspace(dir.path(), config, Vec::new(), &context).unwrap();
        assert_eq!(ws.forward_ports.len(), 2);
    }

    #[test]
    fn identity_matches_labels() {
        let (dir, config, context) = workspace_with(r#"{"image": "x"}"#);
        let ws = resolve_workspace(dir.path(), config, Vec::new(), &context).unwrap();
        let identity = ws.identity();
        assert_eq!(identity.id, ws.id);
        assert_eq!(identity.plan, PlanKind::Image);
        assert_eq!(identity.config_hash, ws.hashes.overall);
        assert!(identity.compose.is_none());
    }

    #[test]
    fn sanitize_names() {
        assert_eq!(sanitize_name("My Project"), "My-Project");
        assert_eq!(sanitize_name("a/b:c"), "a-b-c");
        assert_eq!(sanitize_name("--edge--"), "edge");
        assert_eq!(sanitize_name("ok-1.2_3"), "ok-1.2_3");
    }

    #[cfg(unix)]
    #[test]
    fn host_user_info_is_plausible() {
        let (uid, gid) = host_user_info();
        // Whatever the environment, the call answers without panicking and
        // root is only reported when we actually are root.
        let _ = gid;
        let id_out = std::process::Command::new("id").arg("-u").output().unwrap();
        let real: u32 = String::from_utf8_lossy(&id_out.stdout).trim().parse().unwrap();
        if std::env::var("UID").is_err() {
            assert_eq!(uid, real);
        }
    }

    #[test]
    fn create_spec_carries_workspace_values() {
        let (dir, config, context) = workspace_with(
            r#"{"image": "alpine", "containerEnv": {"A": "1"}, "forwardPorts": [80], "runArgs": ["--hostname=dev"]}"#,
        );
        let ws = resolve_workspace(dir.path(), config, Vec::new(), &context).unwrap();
        let spec = ws.create_spec("alpine");
        assert_eq!(spec.image, "alpine");
        assert_eq!(spec.name.as_deref(), Some(ws.container_name().as_str()));
        assert_eq!(spec.env["A"], "1");
        assert_eq!(spec.ports.len(), 1);
        assert_eq!(spec.extra_args, vec!["--hostname=dev"]);
        assert!(spec.override_command);
        assert_eq!(spec.labels[LABEL_CONFIG_HASH], ws.hashes.overall);
    }
}
