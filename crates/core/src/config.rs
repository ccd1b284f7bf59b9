//! Configuration model and parser
//!
//! Parses `devcontainer.json` (JSON-with-comments, trailing commas tolerated)
//! into a typed record. Fields that accept several JSON shapes are decoded by
//! dedicated decoders and normalized here, so downstream code only ever sees
//! single-shape values. The exact source bytes are retained for hashing.
//!
//! Parse failures are `ParseInvalid`; a recognized field with an unexpected
//! shape is `SchemaMismatch`; semantic problems surface from [`validate`]
//! as `Validation` with a field-path annotation.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::errors::{ConfigError, Result};
use crate::io::is_abs_config_path;
use crate::variable::{substitute_string, SubstitutionContext, SubstitutionReport};

/// A field that accepts a single string or an array of strings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum StringOrArray {
    One(String),
    Many(Vec<String>),
}

impl StringOrArray {
    /// Normalize to a vector; a single string becomes a 1-element sequence.
    pub fn into_vec(self) -> Vec<String> {
        match self {
            StringOrArray::One(s) => vec![s],
            StringOrArray::Many(v) => v,
        }
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.clone().into_vec()
    }
}

/// A mount as written in configuration: either the object form or one of the
/// two string forms (`k=v,k=v` or `host:container[:ro]`).
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum MountSpec {
    Raw(String),
    Object(Mount),
}

/// A normalized mount.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Mount {
    #[serde(default, alias = "src", skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(alias = "dst", alias = "destination")]
    pub target: String,
    #[serde(rename = "type", default = "Mount::default_type")]
    pub mount_type: String,
    #[serde(default)]
    pub readonly: bool,
}

impl Mount {
    fn default_type() -> String {
        "bind".to_string()
    }

    /// Render as a runtime `--mount` argument value.
    pub fn to_mount_arg(&self) -> String {
        let mut parts = vec![format!("type={}", self.mount_type)];
        if let Some(source) = &self.source {
            parts.push(format!("source={}", source));
        }
        parts.push(format!("target={}", self.target));
        if self.readonly {
            parts.push("readonly".to_string());
        }
        parts.join(",")
    }
}

impl MountSpec {
    /// Normalize either form into a [`Mount`].
    pub fn normalize(&self) -> Result<Mount> {
        match self {
            MountSpec::Object(mount) => Ok(mount.clone()),
            MountSpec::Raw(raw) => parse_mount_string(raw),
        }
    }
}

/// Parse the two mount string forms.
fn parse_mount_string(raw: &str) -> Result<Mount> {
    if raw.contains('=') {
        let mut source = None;
        let mut target = None;
        let mut mount_type = Mount::default_type();
        let mut readonly = false;
        for pair in raw.split(',') {
            match pair.split_once('=') {
                Some(("source" | "src", v)) => source = Some(v.to_string()),
                Some(("target" | "dst" | "destination", v)) => target = Some(v.to_string()),
                Some(("type", v)) => mount_type = v.to_string(),
                Some(("readonly" | "ro", v)) => readonly = v != "false",
                Some(_) => {}
                None if pair == "readonly" || pair == "ro" => readonly = true,
                None => {}
            }
        }
        let target = target.ok_or_else(|| ConfigError::SchemaMismatch {
            field: "mounts".to_string(),
            message: format!("mount '{}' has no target", raw),
        })?;
        Ok(Mount {
            source,
            target,
            mount_type,
            readonly,
        })
    } else {
        // host:container[:ro] shorthand
        let parts: Vec<&str> = raw.split(':').collect();
        match parts.as_slice() {
            [host, container] => Ok(Mount {
                source: Some(host.to_string()),
                target: container.to_string(),
                mount_type: Mount::default_type(),
                readonly: false,
            }),
            [host, container, "ro"] => Ok(Mount {
                source: Some(host.to_string()),
                target: container.to_string(),
                mount_type: Mount::default_type(),
                readonly: true,
            }),
            _ => Err(ConfigError::SchemaMismatch {
                field: "mounts".to_string(),
                message: format!("unrecognized mount shorthand '{}'", raw),
            }
            .into()),
        }
    }
}

/// Forwarded-port protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// A port forward as written: integer, `"host:container"`, `"port/proto"`,
/// or the object form.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum PortSpec {
    Number(u32),
    Text(String),
    Object {
        #[serde(rename = "containerPort")]
        container_port: u16,
        #[serde(rename = "hostPort", default, skip_serializing_if = "Option::is_none")]
        host_port: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        protocol: Option<Protocol>,
    },
}

/// A normalized port forward. When only a container port is given, the host
/// port equals it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PortForward {
    pub container: u16,
    pub host: u16,
    pub protocol: Protocol,
}

impl PortSpec {
    pub fn normalize(&self) -> Result<PortForward> {
        let mismatch = |message: String| ConfigError::SchemaMismatch {
            field: "forwardPorts".to_string(),
            message,
        };
        match self {
            PortSpec::Number(n) => {
                let port = u16::try_from(*n)
                    .map_err(|_| mismatch(format!("port {} out of range", n)))?;
                Ok(PortForward {
                    container: port,
                    host: port,
                    protocol: Protocol::Tcp,
                })
            }
            PortSpec::Object {
                container_port,
                host_port,
                protocol,
            } => Ok(PortForward {
                container: *container_port,
                host: host_port.unwrap_or(*container_port),
                protocol: protocol.unwrap_or(Protocol::Tcp),
            }),
            PortSpec::Text(text) => {
                let (body, protocol) = match text.split_once('/') {
                    Some((body, "tcp")) => (body, Protocol::Tcp),
                    Some((body, "udp")) => (body, Protocol::Udp),
                    Some((_, other)) => {
                        return Err(mismatch(format!("unknown protocol '{}'", other)).into())
                    }
                    None => (text.as_str(), Protocol::Tcp),
                };
                let parse = |s: &str| {
                    s.parse::<u16>()
                        .map_err(|_| mismatch(format!("invalid port '{}'", s)))
                };
                match body.split_once(':') {
                    Some((host, container)) => Ok(PortForward {
                        container: parse(container)?,
                        host: parse(host)?,
                        protocol,
                    }),
                    None => {
                        let port = parse(body)?;
                        Ok(PortForward {
                            container: port,
                            host: port,
                            protocol,
                        })
                    }
                }
            }
        }
    }
}

/// GPU requirement as written: bool, `"all"`, integer, or object form.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum GpuSpec {
    Flag(bool),
    Text(String),
    Count(i64),
    Object {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        count: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cores: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        memory: Option<String>,
    },
}

/// Normalized GPU requirement. `"all"` encodes as `count = -1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GpuRequest {
    pub enabled: bool,
    pub count: i64,
    pub cores: Option<i64>,
    pub memory: Option<String>,
}

impl GpuSpec {
    pub fn normalize(&self) -> Result<GpuRequest> {
        match self {
            GpuSpec::Flag(enabled) => Ok(GpuRequest {
                enabled: *enabled,
                count: if *enabled { -1 } else { 0 },
                cores: None,
                memory: None,
            }),
            GpuSpec::Text(text) if text == "all" => Ok(GpuRequest {
                enabled: true,
                count: -1,
                cores: None,
                memory: None,
            }),
            GpuSpec::Text(other) => Err(ConfigError::SchemaMismatch {
                field: "hostRequirements.gpu".to_string(),
                message: format!("unrecognized gpu value '{}'", other),
            }
            .into()),
            GpuSpec::Count(count) => Ok(GpuRequest {
                enabled: *count != 0,
                count: *count,
                cores: None,
                memory: None,
            }),
            GpuSpec::Object {
                count,
                cores,
                memory,
            } => Ok(GpuRequest {
                enabled: true,
                count: count.unwrap_or(-1),
                cores: *cores,
                memory: memory.clone(),
            }),
        }
    }
}

/// A command value inside a lifecycle field: shell string or argv.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum CommandForm {
    /// Delivered verbatim to an in-container shell
    Shell(String),
    /// Executed directly, no shell
    Args(Vec<String>),
}

/// A lifecycle command as written: string, argv, or a named map of either.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum LifecycleCommand {
    Single(CommandForm),
    Named(IndexMap<String, CommandForm>),
}

/// One normalized lifecycle entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LifecycleEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub command: CommandForm,
}

impl LifecycleCommand {
    /// Normalize to an ordered entry list; named entries keep map order.
    pub fn entries(&self) -> Vec<LifecycleEntry> {
        match self {
            LifecycleCommand::Single(command) => vec![LifecycleEntry {
                name: None,
                command: command.clone(),
            }],
            LifecycleCommand::Named(map) => map
                .iter()
                .map(|(name, command)| LifecycleEntry {
                    name: Some(name.clone()),
                    command: command.clone(),
                })
                .collect(),
        }
    }
}

/// A feature's value in the `features` map: `true` enables with defaults,
/// `false` skips, an object supplies options.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum FeatureOptionValue {
    Flag(bool),
    Options(IndexMap<String, Value>),
}

impl FeatureOptionValue {
    pub fn enabled(&self) -> bool {
        !matches!(self, FeatureOptionValue::Flag(false))
    }

    /// The user-supplied options, empty for the bare `true` form.
    pub fn options(&self) -> IndexMap<String, Value> {
        match self {
            FeatureOptionValue::Options(map) => map.clone(),
            FeatureOptionValue::Flag(_) => IndexMap::new(),
        }
    }
}

/// The `build` section of a dockerfile plan.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildSection {
    #[serde(default, alias = "dockerFile", skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub args: IndexMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_from: Option<StringOrArray>,
}

/// Host requirements; only the GPU portion is consumed here.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostRequirements {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu: Option<GpuSpec>,
}

/// Which of the three execution-plan variants a configuration selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanKind {
    Image,
    Dockerfile,
    Compose,
}

impl fmt::Display for PlanKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanKind::Image => write!(f, "image"),
            PlanKind::Dockerfile => write!(f, "dockerfile"),
            PlanKind::Compose => write!(f, "compose"),
        }
    }
}

/// The raw workspace configuration.
///
/// Mirrors the file schema; fields may be absent or polymorphic. The source
/// bytes and file path are carried along for hashing and error reporting.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DevContainerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Top-level shorthand for `build.dockerfile`
    #[serde(default, rename = "dockerFile", skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildSection>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_compose_file: Option<StringOrArray>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub run_services: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_folder: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_mount: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<MountSpec>,

    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub container_env: IndexMap<String, String>,

    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub remote_env: IndexMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_user: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_user: Option<String>,

    #[serde(default, rename = "updateRemoteUserUID", skip_serializing_if = "Option::is_none")]
    pub update_remote_user_uid: Option<bool>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub forward_ports: Vec<PortSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_port: Option<PortSpec>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub run_args: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub privileged: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init: Option<bool>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cap_add: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub security_opt: Vec<String>,

    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub features: IndexMap<String, FeatureOptionValue>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub override_feature_install_order: Vec<String>,

    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub customizations: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_requirements: Option<HostRequirements>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutdown_action: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_command: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initialize_command: Option<LifecycleCommand>,

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

    /// Exact bytes of the source file, for hashing
    #[serde(skip)]
    pub raw_bytes: Vec<u8>,

    /// Absolute path of the source file
    #[serde(skip)]
    pub path: PathBuf,
}

impl DevContainerConfig {
    /// Parse configuration bytes. Comments and trailing commas are stripped
    /// by the JSONC decoder before the typed decode runs.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn from_bytes(bytes: &[u8], path: &Path) -> Result<Self> {
        let text = std::str::from_utf8(bytes).map_err(|e| ConfigError::ParseInvalid {
            path: path.display().to_string(),
            message: format!("not valid UTF-8: {}", e),
        })?;

        let value: Value = json5::from_str(text).map_err(|e| ConfigError::ParseInvalid {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

        let mut config: DevContainerConfig =
            serde_json::from_value(value).map_err(|e| ConfigError::SchemaMismatch {
                field: path.display().to_string(),
                message: e.to_string(),
            })?;

        config.raw_bytes = bytes.to_vec();
        config.path = path.to_path_buf();
        debug!(plan = ?config.plan_kind(), "configuration parsed");
        Ok(config)
    }

    /// Read and parse a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_bytes(&bytes, path)
    }

    /// Which plan variant the configuration selects, before validation.
    pub fn plan_kind(&self) -> PlanKind {
        if self.docker_compose_file.is_some() {
            PlanKind::Compose
        } else if self.build.is_some() || self.dockerfile.is_some() {
            PlanKind::Dockerfile
        } else {
            PlanKind::Image
        }
    }

    /// Compose files as a normalized list.
    pub fn compose_files(&self) -> Vec<String> {
        self.docker_compose_file
            .as_ref()
            .map(|f| f.to_vec())
            .unwrap_or_default()
    }

    /// Effective dockerfile path string (`build.dockerfile` wins over the
    /// top-level shorthand).
    pub fn dockerfile_path(&self) -> Option<String> {
        self.build
            .as_ref()
            .and_then(|b| b.dockerfile.clone())
            .or_else(|| self.dockerfile.clone())
    }

    /// Validate the structural rules: exactly one plan source, compose
    /// completeness, build completeness, absolute workspace folder.
    pub fn validate(&self) -> Result<()> {
        let mut sources = Vec::new();
        if self.image.is_some() {
            sources.push("image");
        }
        if self.build.is_some() || self.dockerfile.is_some() {
            sources.push("build");
        }
        if self.docker_compose_file.is_some() {
            sources.push("dockerComposeFile");
        }
        if sources.len() != 1 {
            return Err(ConfigError::Validation {
                field: "image|build|dockerComposeFile".to_string(),
                message: if sources.is_empty() {
                    "exactly one of image, build, or dockerComposeFile is required".to_string()
                } else {
                    format!("conflicting plan sources: {}", sources.join(", "))
                },
            }
            .into());
        }

        if self.docker_compose_file.is_some() {
            if self.service.as_deref().unwrap_or("").is_empty() {
                return Err(ConfigError::Validation {
                    field: "service".to_string(),
                    message: "compose configurations must name a service".to_string(),
                }
                .into());
            }
            if self.compose_files().is_empty() {
                return Err(ConfigError::Validation {
                    field: "dockerComposeFile".to_string(),
                    message: "at least one compose file is required".to_string(),
                }
                .into());
            }
        }

        if let Some(build) = &self.build {
            if build.dockerfile.is_none() && self.dockerfile.is_none() && build.context.is_none() {
                return Err(ConfigError::Validation {
                    field: "build".to_string(),
                    message: "build requires a dockerfile or a context".to_string(),
                }
                .into());
            }
        }

        if let Some(folder) = &self.workspace_folder {
            if !folder.is_empty() && !is_abs_config_path(folder) {
                return Err(ConfigError::Validation {
                    field: "workspaceFolder".to_string(),
                    message: format!("'{}' must be an absolute path", folder),
                }
                .into());
            }
        }

        Ok(())
    }

    /// Apply variable substitution to every field the substitution pass
    /// covers: `image`, `workspaceFolder`, `workspaceMount`, `remoteUser`,
    /// build dockerfile/context/args, env maps, `runArgs`, and mounts.
    #[instrument(skip_all)]
    pub fn apply_variable_substitution(
        &self,
        context: &SubstitutionContext,
    ) -> (Self, SubstitutionReport) {
        let mut report = SubstitutionReport::new();
        let mut config = self.clone();

        let subst = |value: &str, report: &mut SubstitutionReport| {
            substitute_string(value, context, report)
        };

        if let Some(image) = &config.image {
            config.image = Some(subst(image, &mut report));
        }
        if let Some(folder) = &config.workspace_folder {
            config.workspace_folder = Some(subst(folder, &mut report));
        }
        if let Some(mount) = &config.workspace_mount {
            config.workspace_mount = Some(subst(mount, &mut report));
        }
        if let Some(user) = &config.remote_user {
            config.remote_user = Some(subst(user, &mut report));
        }
        if let Some(dockerfile) = &config.dockerfile {
            config.dockerfile = Some(subst(dockerfile, &mut report));
        }
        if let Some(build) = &mut config.build {
            if let Some(dockerfile) = &build.dockerfile {
                build.dockerfile = Some(substitute_string(dockerfile, context, &mut report));
            }
            if let Some(ctx_dir) = &build.context {
                build.context = Some(substitute_string(ctx_dir, context, &mut report));
            }
            build.args = build
                .args
                .iter()
                .map(|(k, v)| (k.clone(), substitute_string(v, context, &mut report)))
                .collect();
        }

        config.container_env = config
            .container_env
            .iter()
            .map(|(k, v)| (k.clone(), subst(v, &mut report)))
            .collect();
        config.remote_env = config
            .remote_env
            .iter()
            .map(|(k, v)| (k.clone(), subst(v, &mut report)))
            .collect();
        config.run_args = config
            .run_args
            .iter()
            .map(|arg| subst(arg, &mut report))
            .collect();

        config.mounts = config
            .mounts
            .iter()
            .map(|mount| match mount {
                MountSpec::Raw(raw) => MountSpec::Raw(subst(raw, &mut report)),
                MountSpec::Object(obj) => MountSpec::Object(Mount {
                    source: obj.source.as_deref().map(|s| subst(s, &mut report)),
                    target: subst(&obj.target, &mut report),
                    mount_type: obj.mount_type.clone(),
                    readonly: obj.readonly,
                }),
            })
            .collect();

        debug!(
            replacements = report.replacements.len(),
            unknown = report.unknown_variables.len(),
            "variable substitution complete"
        );
        (config, report)
    }

    /// Canonical JSON rendering of the parsed record (not the raw bytes).
    pub fn to_canonical_json(&self) -> Result<Value> {
        serde_json::to_value(self).map_err(|e| {
            ConfigError::ParseInvalid {
                path: self.path.display().to_string(),
                message: e.to_string(),
            }
            .into()
        })
    }
}

/// Locate the configuration file for a workspace root.
///
/// Order: `.devcontainer/devcontainer.json`, `.devcontainer.json`, exactly
/// one `.devcontainer/<folder>/devcontainer.json`, then the first `*.json`
/// directly under `.devcontainer`. Several folder candidates fail with
/// `Ambiguous` listing the choices; a missing root fails `WorkspaceNotFound`.
#[instrument(fields(root = %workspace_root.display()))]
pub fn discover_config(workspace_root: &Path) -> Result<PathBuf> {
    if !workspace_root.is_dir() {
        return Err(ConfigError::WorkspaceNotFound {
            path: workspace_root.display().to_string(),
        }
        .into());
    }

    let primary = workspace_root.join(".devcontainer").join("devcontainer.json");
    if primary.is_file() {
        return Ok(primary);
    }

    let dotfile = workspace_root.join(".devcontainer.json");
    if dotfile.is_file() {
        return Ok(dotfile);
    }

    let dc_dir = workspace_root.join(".devcontainer");
    if dc_dir.is_dir() {
        // Sort for deterministic results across platforms.
        let mut subdirs: BTreeMap<String, PathBuf> = BTreeMap::new();
        let mut loose_json: BTreeMap<String, PathBuf> = BTreeMap::new();
        for entry in std::fs::read_dir(&dc_dir).map_err(|e| ConfigError::Io {
            path: dc_dir.display().to_string(),
            source: e,
        })? {
            let entry = entry.map_err(|e| ConfigError::Io {
                path: dc_dir.display().to_string(),
                source: e,
            })?;
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            if path.is_dir() {
                let candidate = path.join("devcontainer.json");
                if candidate.is_file() {
                    subdirs.insert(name, candidate);
                }
            } else if path.extension().is_some_and(|e| e == "json") {
                loose_json.insert(name, path);
            }
        }

        match subdirs.len() {
            1 => return Ok(subdirs.into_values().next().expect("one candidate")),
            0 => {}
            _ => {
                return Err(ConfigError::Ambiguous {
                    candidates: subdirs.keys().cloned().collect(),
                }
                .into())
            }
        }

        if let Some(first) = loose_json.into_values().next() {
            return Ok(first);
        }
    }

    Err(ConfigError::NotFound {
        root: workspace_root.display().to_string(),
    }
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::DcxError;
    use tempfile::TempDir;

    fn parse(json: &str) -> Result<DevContainerConfig> {
        DevContainerConfig::from_bytes(json.as_bytes(), Path::new("/tmp/devcontainer.json"))
    }

    #[test]
    fn parses_jsonc_with_comments_and_trailing_commas() {
        let config = parse(
            r#"{
                // the base image
                "image": "alpine:3.19",
                /* block comment */
                "forwardPorts": [8080,],
            }"#,
        )
        .unwrap();
        assert_eq!(config.image.as_deref(), Some("alpine:3.19"));
        assert_eq!(config.forward_ports.len(), 1);
    }

    #[test]
    fn malformed_json_is_parse_invalid() {
        let err = parse("{ not json").unwrap_err();
        assert!(matches!(
            err,
            DcxError::Config(ConfigError::ParseInvalid { .. })
        ));
    }

    #[test]
    fn wrong_shape_is_schema_mismatch() {
        let err = parse(r#"{"image": "x", "forwardPorts": [true]}"#).unwrap_err();
        assert!(matches!(
            err,
            DcxError::Config(ConfigError::SchemaMismatch { .. })
        ));
    }

    #[test]
    fn raw_bytes_are_retained() {
        let src = r#"{"image": "alpine:3.19"} // tail"#;
        let config = parse(src).unwrap();
        assert_eq!(config.raw_bytes, src.as_bytes());
    }

    #[test]
    fn compose_files_string_or_array() {
        let one = parse(r#"{"dockerComposeFile": "docker-compose.yml", "service": "app"}"#).unwrap();
        assert_eq!(one.compose_files(), vec!["docker-compose.yml"]);

        let many = parse(
            r#"{"dockerComposeFile": ["a.yml", "b.yml"], "service": "app"}"#,
        )
        .unwrap();
        assert_eq!(many.compose_files(), vec!["a.yml", "b.yml"]);
    }

    #[test]
    fn port_spec_normalization_matrix() {
        // The four forms from the interface contract.
        let config = parse(
            r#"{"image":"x","forwardPorts":[8080, "3000:80", "9000/udp", {"containerPort": 5000}]}"#,
        )
        .unwrap();
        let forwards: Vec<PortForward> = config
            .forward_ports
            .iter()
            .map(|p| p.normalize().unwrap())
            .collect();
        assert_eq!(
            forwards,
            vec![
                PortForward { container: 8080, host: 8080, protocol: Protocol::Tcp },
                PortForward { container: 80, host: 3000, protocol: Protocol::Tcp },
                PortForward { container: 9000, host: 9000, protocol: Protocol::Udp },
                PortForward { container: 5000, host: 5000, protocol: Protocol::Tcp },
            ]
        );
    }

    #[test]
    fn bad_port_string_is_schema_mismatch() {
        let spec = PortSpec::Text("eighty".to_string());
        assert!(matches!(
            spec.normalize().unwrap_err(),
            DcxError::Config(ConfigError::SchemaMismatch { .. })
        ));
    }

    #[test]
    fn mount_string_forms() {
        let kv = parse_mount_string("source=/host,target=/container,type=bind,readonly").unwrap();
        assert_eq!(kv.source.as_deref(), Some("/host"));
        assert_eq!(kv.target, "/container");
        assert!(kv.readonly);

        let aliases = parse_mount_string("src=/h,dst=/c,type=volume").unwrap();
        assert_eq!(aliases.source.as_deref(), Some("/h"));
        assert_eq!(aliases.target, "/c");
        assert_eq!(aliases.mount_type, "volume");

        let short = parse_mount_string("/host:/container:ro").unwrap();
        assert_eq!(short.source.as_deref(), Some("/host"));
        assert_eq!(short.target, "/container");
        assert!(short.readonly);
    }

    #[test]
    fn mount_without_target_fails() {
        assert!(parse_mount_string("source=/host,type=bind").is_err());
    }

    #[test]
    fn gpu_spec_forms() {
        assert_eq!(
            GpuSpec::Flag(true).normalize().unwrap(),
            GpuRequest { enabled: true, count: -1, cores: None, memory: None }
        );
        assert!(!GpuSpec::Flag(false).normalize().unwrap().enabled);
        assert_eq!(GpuSpec::Text("all".into()).normalize().unwrap().count, -1);
        assert_eq!(GpuSpec::Count(2).normalize().unwrap().count, 2);
        let obj = GpuSpec::Object {
            count: Some(1),
            cores: Some(4),
            memory: Some("8gb".into()),
        }
        .normalize()
        .unwrap();
        assert_eq!(obj.cores, Some(4));
        assert_eq!(obj.memory.as_deref(), Some("8gb"));
    }

    #[test]
    fn lifecycle_command_forms() {
        let config = parse(
            r#"{
                "image": "x",
                "onCreateCommand": "make setup",
                "postCreateCommand": ["npm", "install"],
                "postStartCommand": {"server": "npm start", "watch": ["npm", "run", "watch"]}
            }"#,
        )
        .unwrap();

        let on_create = config.on_create_command.unwrap().entries();
        assert_eq!(on_create.len(), 1);
        assert_eq!(on_create[0].command, CommandForm::Shell("make setup".into()));

        let post_create = config.post_create_command.unwrap().entries();
        assert_eq!(
            post_create[0].command,
            CommandForm::Args(vec!["npm".into(), "install".into()])
        );

        let post_start = config.post_start_command.unwrap().entries();
        assert_eq!(post_start.len(), 2);
        assert_eq!(post_start[0].name.as_deref(), Some("server"));
        assert_eq!(post_start[1].name.as_deref(), Some("watch"));
    }

    #[test]
    fn feature_option_values() {
        let config = parse(
            r#"{"image":"x","features":{
                "ghcr.io/devcontainers/features/node:1": {"version": "20"},
                "ghcr.io/devcontainers/features/go:1": true,
                "ghcr.io/devcontainers/features/ruby:1": false
            }}"#,
        )
        .unwrap();
        let values: Vec<&FeatureOptionValue> = config.features.values().collect();
        assert!(values[0].enabled());
        assert_eq!(values[0].options()["version"], "20");
        assert!(values[1].enabled());
        assert!(values[1].options().is_empty());
        assert!(!values[2].enabled());
    }

    #[test]
    fn validation_requires_exactly_one_source() {
        let none = parse(r#"{"name": "empty"}"#).unwrap();
        assert!(none.validate().is_err());

        let both = parse(r#"{"image": "x", "build": {"dockerfile": "Dockerfile"}}"#).unwrap();
        assert!(both.validate().is_err());

        let image = parse(r#"{"image": "x"}"#).unwrap();
        image.validate().unwrap();
    }

    #[test]
    fn validation_compose_rules() {
        let missing_service = parse(r#"{"dockerComposeFile": "dc.yml"}"#).unwrap();
        assert!(missing_service.validate().is_err());

        let ok = parse(r#"{"dockerComposeFile": "dc.yml", "service": "app"}"#).unwrap();
        ok.validate().unwrap();
    }

    #[test]
    fn validation_build_rules() {
        let empty_build = parse(r#"{"build": {}}"#).unwrap();
        assert!(empty_build.validate().is_err());

        let with_context = parse(r#"{"build": {"context": "."}}"#).unwrap();
        with_context.validate().unwrap();
    }

    #[test]
    fn validation_workspace_folder_absolute() {
        let relative = parse(r#"{"image": "x", "workspaceFolder": "src"}"#).unwrap();
        let err = relative.validate().unwrap_err();
        assert!(matches!(
            err,
            DcxError::Config(ConfigError::Validation { ref field, .. }) if field == "workspaceFolder"
        ));

        parse(r#"{"image": "x", "workspaceFolder": "/workspaces/app"}"#)
            .unwrap()
            .validate()
            .unwrap();
        parse(r#"{"image": "x", "workspaceFolder": "C:\\work"}"#)
            .unwrap()
            .validate()
            .unwrap();
    }

    #[test]
    fn parser_round_trip() {
        // parse -> canonical encode -> re-parse is structurally equivalent
        // (modulo raw bytes and path).
        let src = r#"{
            "name": "proj",
            "image": "alpine:3.19",
            "forwardPorts": [8080, "3000:80"],
            "containerEnv": {"A": "1"},
            "mounts": ["source=/h,target=/c,type=bind"],
            "onCreateCommand": {"setup": "make"}
        }"#;
        let first = parse(src).unwrap();
        let encoded = serde_json::to_string(&first.to_canonical_json().unwrap()).unwrap();
        let second = parse(&encoded).unwrap();

        let mut first_cmp = first.clone();
        first_cmp.raw_bytes = Vec::new();
        let mut second_cmp = second;
        second_cmp.raw_bytes = Vec::new();
        assert_eq!(first_cmp, second_cmp);
    }

    #[test]
    fn discovery_order() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let root = dir.path();

        // Nothing yet
        assert!(matches!(
            discover_config(root).unwrap_err(),
            DcxError::Config(ConfigError::NotFound { .. })
        ));

        // Loose json under .devcontainer is the last resort
        std::fs::create_dir(root.join(".devcontainer"))?;
        std::fs::write(root.join(".devcontainer/custom.json"), "{}")?;
        assert_eq!(
            discover_config(root)?,
            root.join(".devcontainer/custom.json")
        );

        // A single folder candidate wins over loose json
        std::fs::create_dir(root.join(".devcontainer/rust"))?;
        std::fs::write(root.join(".devcontainer/rust/devcontainer.json"), "{}")?;
        assert_eq!(
            discover_config(root)?,
            root.join(".devcontainer/rust/devcontainer.json")
        );

        // Two folder candidates are ambiguous, not guessed
        std::fs::create_dir(root.join(".devcontainer/go"))?;
        std::fs::write(root.join(".devcontainer/go/devcontainer.json"), "{}")?;
        match discover_config(root).unwrap_err() {
            DcxError::Config(ConfigError::Ambiguous { candidates }) => {
                assert_eq!(candidates, vec!["go".to_string(), "rust".to_string()]);
            }
            other => panic!("expected Ambiguous, got {other:?}"),
        }

        // .devcontainer.json beats the folder forms
        std::fs::write(root.join(".devcontainer.json"), "{}")?;
        assert_eq!(discover_config(root)?, root.join(".devcontainer.json"));

        // The canonical location beats everything
        std::fs::write(root.join(".devcontainer/devcontainer.json"), "{}")?;
        assert_eq!(
            discover_config(root)?,
            root.join(".devcontainer/devcontainer.json")
        );
        Ok(())
    }

    #[test]
    fn discovery_missing_root() {
        assert!(matches!(
            discover_config(Path::new("/definitely/not/a/workspace")).unwrap_err(),
            DcxError::Config(ConfigError::WorkspaceNotFound { .. })
        ));
    }

    #[test]
    fn substitution_field_coverage() {
        let dir = TempDir::new().unwrap();
        let ctx = SubstitutionContext::new(dir.path(), None, false).unwrap();
        let config = parse(
            r#"{
                "image": "registry/${devcontainerId}:latest",
                "build": {"dockerfile": "${localWorkspaceFolder}/Dockerfile", "args": {"WS": "${localWorkspaceFolder}"}},
                "containerEnv": {"ROOT": "${localWorkspaceFolder}"},
                "remoteEnv": {"ID": "${devcontainerId}"},
                "runArgs": ["--hostname=${devcontainerId}"],
                "mounts": ["source=${localWorkspaceFolder}/.cache,target=/cache,type=bind"]
            }"#,
        )
        .unwrap();

        let (out, report) = config.apply_variable_substitution(&ctx);
        assert!(out.image.unwrap().contains(&ctx.workspace_id));
        assert!(out.build.as_ref().unwrap().dockerfile.as_ref().unwrap()
            .starts_with(&ctx.local_workspace_folder));
        assert_eq!(
            out.build.unwrap().args["WS"],
            ctx.local_workspace_folder
        );
        assert_eq!(out.container_env["ROOT"], ctx.local_workspace_folder);
        assert_eq!(out.remote_env["ID"], ctx.workspace_id);
        assert!(out.run_args[0].ends_with(&ctx.workspace_id));
        match &out.mounts[0] {
            MountSpec::Raw(raw) => assert!(raw.contains(&ctx.local_workspace_folder)),
            other => panic!("expected raw mount, got {other:?}"),
        }
        assert!(!report.replacements.is_empty());
    }
}
