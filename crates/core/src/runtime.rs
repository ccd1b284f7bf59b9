//! Container runtime CLI driver
//!
//! Typed wrappers around the subset of runtime subcommands this system uses.
//! All interaction goes through the CLI binary (`docker` unless overridden
//! via `DCX_RUNTIME`); argument construction sticks to long flags, with
//! `=`-separated values where ambiguity would otherwise arise. Output is
//! parsed from JSON or JSON-lines; the `Labels` field of list output is a
//! bare `k=v,k=v` string and is parsed tolerantly, skipping malformed pairs.
//!
//! The driver is available as a lazily initialized process global for
//! convenience, but everything that needs to be testable takes a handle (or
//! the [`Runtime`] trait) instead of reaching for the global.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use indexmap::IndexMap;
use once_cell::sync::OnceCell;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::{GpuRequest, Mount, PortForward};
use crate::errors::{DcxError, ExecError, Result, RuntimeError};

static GLOBAL_RUNTIME: OnceCell<RuntimeCli> = OnceCell::new();

/// The process-global driver, initialized on first use.
pub fn runtime() -> &'static RuntimeCli {
    GLOBAL_RUNTIME.get_or_init(RuntimeCli::from_env)
}

/// Host facts reported by the runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeInfo {
    pub ncpu: i64,
    pub mem_total: i64,
    pub os_type: String,
    pub architecture: String,
}

/// One row of `ps` output.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSummary {
    pub id: String,
    pub names: Vec<String>,
    pub state: String,
    pub labels: HashMap<String, String>,
}

/// Inspect output for a container, reduced to the fields consumed here.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerDetails {
    pub id: String,
    pub name: String,
    pub status: String,
    pub running: bool,
    pub started_at: Option<String>,
    pub labels: HashMap<String, String>,
    pub working_dir: Option<String>,
    pub mounts: Vec<MountPoint>,
}

/// One mount row from inspect output.
#[derive(Debug, Clone, PartialEq)]
pub struct MountPoint {
    pub source: String,
    pub destination: String,
}

/// Everything `create` needs to construct a `run --detach` invocation.
#[derive(Debug, Clone, Default)]
pub struct CreateSpec {
    pub image: String,
    pub name: Option<String>,
    pub labels: IndexMap<String, String>,
    pub env: IndexMap<String, String>,
    pub mounts: Vec<Mount>,
    pub ports: Vec<PortForward>,
    pub user: Option<String>,
    pub workdir: Option<String>,
    /// Replace the image command with an idle keeper so exec always has a
    /// running target
    pub override_command: bool,
    pub init: bool,
    pub privileged: bool,
    pub cap_add: Vec<String>,
    pub security_opt: Vec<String>,
    pub gpu: Option<GpuRequest>,
    /// Verbatim extra arguments from `runArgs`
    pub extra_args: Vec<String>,
}

impl CreateSpec {
    /// Render the full argument vector after the subcommand.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec!["run".to_string(), "--detach".to_string()];
        if let Some(name) = &self.name {
            args.push(format!("--name={}", name));
        }
        for (key, value) in &self.labels {
            args.push(format!("--label={}={}", key, value));
        }
        for (key, value) in &self.env {
            args.push(format!("--env={}={}", key, value));
        }
        for mount in &self.mounts {
            args.push(format!("--mount={}", mount.to_mount_arg()));
        }
        for port in &self.ports {
            args.push(format!(
                "--publish={}:{}/{}",
                port.host, port.container, port.protocol
            ));
        }
        if let Some(user) = &self.user {
            args.push(format!("--user={}", user));
        }
        if let Some(workdir) = &self.workdir {
            args.push(format!("--workdir={}", workdir));
        }
        if self.init {
            args.push("--init".to_string());
        }
        if self.privileged {
            args.push("--privileged".to_string());
        }
        for cap in &self.cap_add {
            args.push(format!("--cap-add={}", cap));
        }
        for opt in &self.security_opt {
            args.push(format!("--security-opt={}", opt));
        }
        if let Some(gpu) = &self.gpu {
            if gpu.enabled {
                if gpu.count < 0 {
                    args.push("--gpus=all".to_string());
                } else {
                    args.push(format!("--gpus={}", gpu.count));
                }
            }
        }
        args.extend(self.extra_args.iter().cloned());
        args.push(self.image.clone());
        if self.override_command {
            args.extend(["sleep".to_string(), "infinity".to_string()]);
        }
        args
    }
}

/// Inputs to the runtime build subcommand.
#[derive(Debug, Clone, Default)]
pub struct BuildRequest {
    pub tag: String,
    pub dockerfile: PathBuf,
    pub context: PathBuf,
    pub build_args: IndexMap<String, String>,
    pub target: Option<String>,
    pub cache_from: Vec<String>,
    pub labels: IndexMap<String, String>,
    pub build_contexts: IndexMap<String, String>,
    pub no_cache: bool,
    pub pull: bool,
}

impl BuildRequest {
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "build".to_string(),
            format!("--tag={}", self.tag),
            format!("--file={}", self.dockerfile.display()),
        ];
        for (key, value) in &self.build_args {
            args.push(format!("--build-arg={}={}", key, value));
        }
        if let Some(target) = &self.target {
            args.push(format!("--target={}", target));
        }
        for cache in &self.cache_from {
            args.push(format!("--cache-from={}", cache));
        }
        for (key, value) in &self.labels {
            args.push(format!("--label={}={}", key, value));
        }
        for (name, value) in &self.build_contexts {
            args.push(format!("--build-context={}={}", name, value));
        }
        if self.no_cache {
            args.push("--no-cache".to_string());
        }
        if self.pull {
            args.push("--pull".to_string());
        }
        args.push(self.context.display().to_string());
        args
    }
}

/// Inputs to an in-container exec.
#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    pub container: String,
    pub user: Option<String>,
    pub env: IndexMap<String, String>,
    pub workdir: Option<String>,
    pub command: Vec<String>,
    pub interactive: bool,
    pub tty: bool,
    pub detach: bool,
}

impl ExecRequest {
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec!["exec".to_string()];
        if self.interactive {
            args.push("--interactive".to_string());
        }
        if self.tty {
            args.push("--tty".to_string());
        }
        if self.detach {
            args.push("--detach".to_string());
        }
        if let Some(user) = &self.user {
            args.push(format!("--user={}", user));
        }
        if let Some(workdir) = &self.workdir {
            args.push(format!("--workdir={}", workdir));
        }
        for (key, value) in &self.env {
            args.push(format!("--env={}={}", key, value));
        }
        args.push(self.container.clone());
        args.extend(self.command.iter().cloned());
        args
    }
}

/// Result of a captured exec.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// The subset of driver operations state classification depends on,
/// extracted as a trait so the planner is testable without a runtime.
#[async_trait]
pub trait Runtime: Send + Sync {
    async fn list_containers(
        &self,
        label_filters: &[(String, String)],
        cancel: &CancellationToken,
    ) -> Result<Vec<ContainerSummary>>;

    async fn inspect_container(
        &self,
        reference: &str,
        cancel: &CancellationToken,
    ) -> Result<ContainerDetails>;
}

/// CLI-backed driver.
#[derive(Debug, Clone)]
pub struct RuntimeCli {
    binary: String,
}

impl Default for RuntimeCli {
    fn default() -> Self {
        Self::from_env()
    }
}

impl RuntimeCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Binary name from `DCX_RUNTIME`, defaulting to `docker`.
    pub fn from_env() -> Self {
        Self::new(std::env::var("DCX_RUNTIME").unwrap_or_else(|_| "docker".to_string()))
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Run a subcommand to completion, capturing output. Cancellation kills
    /// the child and surfaces `Cancelled`.
    async fn run(&self, args: &[String], cancel: &CancellationToken) -> Result<std::process::Output> {
        debug!(binary = %self.binary, args = ?args, "runtime invocation");
        let mut child = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| RuntimeError::Unavailable {
                message: format!("failed to spawn {}: {}", self.binary, e),
            })?;

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(DcxError::Cancelled);
            }
            result = child.wait() => result.map_err(|e| RuntimeError::Unavailable {
                message: format!("failed to wait for {}: {}", self.binary, e),
            })?,
        };

        let mut stdout = Vec::new();
        if let Some(mut pipe) = stdout_pipe.take() {
            let _ = pipe.read_to_end(&mut stdout).await;
        }
        let mut stderr = Vec::new();
        if let Some(mut pipe) = stderr_pipe.take() {
            let _ = pipe.read_to_end(&mut stderr).await;
        }

        Ok(std::process::Output {
            status,
            stdout,
            stderr,
        })
    }

    /// Run and require success; returns trimmed stdout.
    async fn run_checked(&self, args: &[String], cancel: &CancellationToken) -> Result<String> {
        let output = self.run(args, cancel).await?;
        if !output.status.success() {
            return Err(RuntimeError::CommandFailed {
                command: format!("{} {}", self.binary, args.join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }
            .into());
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Run with stdout/stderr streamed through the log at info level. Used
    /// for build, pull, and compose, whose progress output matters to the
    /// user.
    pub(crate) async fn run_streaming(
        &self,
        args: &[String],
        cancel: &CancellationToken,
    ) -> Result<()> {
        debug!(binary = %self.binary, args = ?args, "runtime invocation (streaming)");
        let mut child = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| RuntimeError::Unavailable {
                message: format!("failed to spawn {}: {}", self.binary, e),
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let forward_out = tokio::spawn(async move {
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    info!(target: "dcx::progress", "{}", line);
                }
            }
        });
        let forward_err = tokio::spawn(async move {
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    info!(target: "dcx::progress", "{}", line);
                }
            }
        });

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                forward_out.abort();
                forward_err.abort();
                return Err(DcxError::Cancelled);
            }
            status = child.wait() => status.map_err(|e| RuntimeError::Unavailable {
                message: format!("failed to wait for {}: {}", self.binary, e),
            })?,
        };
        let _ = forward_out.await;
        let _ = forward_err.await;

        if !status.success() {
            return Err(RuntimeError::CommandFailed {
                command: format!("{} {}", self.binary, args.join(" ")),
                stderr: format!("exit status {:?}", status.code()),
            }
            .into());
        }
        Ok(())
    }

    /// Daemon reachability probe; failure is `Unavailable`.
    #[instrument(skip(self, cancel))]
    pub async fn ping(&self, cancel: &CancellationToken) -> Result<()> {
        let args = vec!["version".to_string(), "--format".to_string(), "{{json .}}".to_string()];
        let output = self.run(&args, cancel).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(RuntimeError::Unavailable {
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }
            .into())
        }
    }

    /// Host facts from `info`.
    #[instrument(skip(self, cancel))]
    pub async fn info(&self, cancel: &CancellationToken) -> Result<RuntimeInfo> {
        let args = vec!["info".to_string(), "--format".to_string(), "{{json .}}".to_string()];
        let stdout = self.run_checked(&args, cancel).await.map_err(|e| match e {
            DcxError::Runtime(RuntimeError::CommandFailed { stderr, .. }) => {
                DcxError::Runtime(RuntimeError::Unavailable { message: stderr })
            }
            other => other,
        })?;

        let value: Value =
            serde_json::from_str(&stdout).map_err(|e| RuntimeError::ParseOutput {
                message: format!("info output: {}", e),
            })?;
        Ok(RuntimeInfo {
            ncpu: value.get("NCPU").and_then(Value::as_i64).unwrap_or(0),
            mem_total: value.get("MemTotal").and_then(Value::as_i64).unwrap_or(0),
            os_type: value
                .get("OSType")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            architecture: value
                .get("Architecture")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        })
    }

    /// Image label map from `image inspect`; `NotFound` when absent.
    #[instrument(skip(self, cancel))]
    pub async fn inspect_image_labels(
        &self,
        reference: &str,
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, String>> {
        let args = vec![
            "image".to_string(),
            "inspect".to_string(),
            reference.to_string(),
        ];
        let output = self.run(&args, cancel).await?;
        if !output.status.success() {
            return Err(RuntimeError::NotFound {
                reference: reference.to_string(),
            }
            .into());
        }

        let value: Value = serde_json::from_slice(&output.stdout).map_err(|e| {
            RuntimeError::ParseOutput {
                message: format!("image inspect output: {}", e),
            }
        })?;
        let labels = value
            .get(0)
            .and_then(|v| v.get("Config"))
            .and_then(|c| c.get("Labels"))
            .and_then(Value::as_object)
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| Some((k.clone(), v.as_str()?.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        Ok(labels)
    }

    /// Whether an image exists locally; a non-zero exit is `false`, not an
    /// error.
    pub async fn image_exists(&self, reference: &str, cancel: &CancellationToken) -> Result<bool> {
        let args = vec![
            "image".to_string(),
            "inspect".to_string(),
            "--format".to_string(),
            "{{.Id}}".to_string(),
            reference.to_string(),
        ];
        let output = self.run(&args, cancel).await?;
        Ok(output.status.success())
    }

    /// Pull an image, streaming progress.
    #[instrument(skip(self, cancel))]
    pub async fn pull(&self, reference: &str, cancel: &CancellationToken) -> Result<()> {
        let args = vec!["pull".to_string(), reference.to_string()];
        self.run_streaming(&args, cancel).await.map_err(|e| match e {
            DcxError::Runtime(RuntimeError::CommandFailed { stderr, .. }) => {
                DcxError::Runtime(RuntimeError::PullFailed {
                    reference: reference.to_string(),
                    message: stderr,
                })
            }
            other => other,
        })
    }

    /// Build an image, streaming progress.
    #[instrument(skip(self, request, cancel), fields(tag = %request.tag))]
    pub async fn build(&self, request: &BuildRequest, cancel: &CancellationToken) -> Result<()> {
        self.run_streaming(&request.to_args(), cancel)
            .await
            .map_err(|e| match e {
                DcxError::Runtime(RuntimeError::CommandFailed { stderr, .. }) => {
                    DcxError::Build(crate::errors::BuildError::BuildFailed { message: stderr })
                }
                other => other,
            })
    }

    /// Create a detached container; returns the id from trimmed stdout.
    #[instrument(skip(self, spec, cancel), fields(image = %spec.image))]
    pub async fn create(&self, spec: &CreateSpec, cancel: &CancellationToken) -> Result<String> {
        let id = self
            .run_checked(&spec.to_args(), cancel)
            .await
            .map_err(|e| match e {
                DcxError::Runtime(RuntimeError::CommandFailed { stderr, .. }) => {
                    DcxError::Runtime(RuntimeError::CreateFailed { message: stderr })
                }
                other => other,
            })?;
        info!(container = %id, "container created");
        Ok(id)
    }

    pub async fn start(&self, id: &str, cancel: &CancellationToken) -> Result<()> {
        self.run_checked(&["start".to_string(), id.to_string()], cancel)
            .await
            .map(|_| ())
    }

    pub async fn stop(&self, id: &str, cancel: &CancellationToken) -> Result<()> {
        self.run_checked(&["stop".to_string(), id.to_string()], cancel)
            .await
            .map(|_| ())
    }

    pub async fn kill(&self, id: &str, cancel: &CancellationToken) -> Result<()> {
        self.run_checked(&["kill".to_string(), id.to_string()], cancel)
            .await
            .map(|_| ())
    }

    pub async fn remove(&self, id: &str, force: bool, cancel: &CancellationToken) -> Result<()> {
        let mut args = vec!["rm".to_string()];
        if force {
            args.push("--force".to_string());
        }
        args.push(id.to_string());
        self.run_checked(&args, cancel).await.map(|_| ())
    }

    /// Container logs as raw bytes. With `follow` the call runs until the
    /// container stops or the token fires.
    pub async fn logs(
        &self,
        id: &str,
        follow: bool,
        timestamps: bool,
        tail: Option<u32>,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let mut args = vec!["logs".to_string()];
        if follow {
            args.push("--follow".to_string());
        }
        if timestamps {
            args.push("--timestamps".to_string());
        }
        if let Some(tail) = tail {
            args.push(format!("--tail={}", tail));
        }
        args.push(id.to_string());
        let output = self.run(&args, cancel).await?;
        let mut bytes = output.stdout;
        bytes.extend_from_slice(&output.stderr);
        Ok(bytes)
    }

    /// Execute a command and capture its combined output. A non-zero exit
    /// is returned in the output, not as an error; lifecycle callers decide
    /// whether that is fatal.
    #[instrument(skip(self, request, cancel), fields(container = %request.container))]
    pub async fn exec(
        &self,
        request: &ExecRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecOutput> {
        let output = self.run(&request.to_args(), cancel).await?;
        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    /// Copy a host file or directory into the container.
    pub async fn cp_in(
        &self,
        container: &str,
        source: &std::path::Path,
        dest: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let args = vec![
            "cp".to_string(),
            source.display().to_string(),
            format!("{}:{}", container, dest),
        ];
        self.run_checked(&args, cancel).await.map(|_| ())
    }

    /// `chmod` a path inside the container (runs as root).
    pub async fn chmod(
        &self,
        container: &str,
        mode: &str,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.exec_ok(container, &["chmod", mode, path], cancel).await
    }

    /// `mkdir -p` inside the container (runs as root).
    pub async fn mkdir(&self, container: &str, path: &str, cancel: &CancellationToken) -> Result<()> {
        self.exec_ok(container, &["mkdir", "-p", path], cancel).await
    }

    /// `chown` a path inside the container (runs as root).
    pub async fn chown(
        &self,
        container: &str,
        owner: &str,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.exec_ok(container, &["chown", owner, path], cancel).await
    }

    async fn exec_ok(
        &self,
        container: &str,
        command: &[&str],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let request = ExecRequest {
            container: container.to_string(),
            command: command.iter().map(|s| s.to_string()).collect(),
            ..ExecRequest::default()
        };
        let output = self.exec(&request, cancel).await?;
        if output.success() {
            Ok(())
        } else {
            Err(ExecError::NonZeroExit {
                command: command.join(" "),
                code: output.exit_code,
            }
            .into())
        }
    }

    /// Write bytes to a file inside the container by piping them through an
    /// interactive exec.
    pub async fn write_file(
        &self,
        container: &str,
        path: &str,
        data: &[u8],
        mode: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let script = format!("cat > {p} && chmod {m} {p}", p = path, m = mode);
        let args = vec![
            "exec".to_string(),
            "--interactive".to_string(),
            container.to_string(),
            "sh".to_string(),
            "-c".to_string(),
            script.clone(),
        ];

        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ExecError::Spawn {
                command: script.clone(),
                message: e.to_string(),
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(data).await?;
            drop(stdin);
        }

        let mut stderr_pipe = child.stderr.take();

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(DcxError::Cancelled);
            }
            status = child.wait() => status?,
        };

        let mut stderr = Vec::new();
        if let Some(mut pipe) = stderr_pipe.take() {
            let _ = pipe.read_to_end(&mut stderr).await;
        }

        if status.success() {
            Ok(())
        } else {
            let _ = stderr;
            Err(ExecError::NonZeroExit {
                command: script,
                code: status.code().unwrap_or(-1),
            }
            .into())
        }
    }
}

#[async_trait]
impl Runtime for RuntimeCli {
    /// `ps --all` filtered by labels; rows come back as JSON lines.
    async fn list_containers(
        &self,
        label_filters: &[(String, String)],
        cancel: &CancellationToken,
    ) -> Result<Vec<ContainerSummary>> {
        let mut args = vec![
            "ps".to_string(),
            "--all".to_string(),
            "--no-trunc".to_string(),
            "--format".to_string(),
            "{{json .}}".to_string(),
        ];
        for (key, value) in label_filters {
            args.push(format!("--filter=label={}={}", key, value));
        }

        let stdout = self.run_checked(&args, cancel).await?;
        parse_container_list(&stdout)
    }

    async fn inspect_container(
        &self,
        reference: &str,
        cancel: &CancellationToken,
    ) -> Result<ContainerDetails> {
        let args = vec![
            "inspect".to_string(),
            "--type=container".to_string(),
            reference.to_string(),
        ];
        let output = self.run(&args, cancel).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.to_ascii_lowercase().contains("no such") {
                return Err(RuntimeError::NotFound {
                    reference: reference.to_string(),
                }
                .into());
            }
            return Err(RuntimeError::CommandFailed {
                command: format!("{} inspect {}", self.binary, reference),
                stderr: stderr.trim().to_string(),
            }
            .into());
        }

        parse_container_inspect(&output.stdout, reference)
    }
}

fn parse_container_list(stdout: &str) -> Result<Vec<ContainerSummary>> {
    let mut containers = Vec::new();
    for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
        let value: Value = serde_json::from_str(line).map_err(|e| RuntimeError::ParseOutput {
            message: format!("container list line: {}", e),
        })?;
        containers.push(ContainerSummary {
            id: value
                .get("ID")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            names: value
                .get("Names")
                .and_then(Value::as_str)
                .map(|s| s.split(',').map(|n| n.trim().to_string()).collect())
                .unwrap_or_default(),
            state: value
                .get("State")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            labels: value
                .get("Labels")
                .and_then(Value::as_str)
                .map(parse_label_string)
                .unwrap_or_default(),
        });
    }
    Ok(containers)
}

/// Parse the `k=v,k=v` label string from list output. Malformed pairs are
/// skipped, not fatal.
pub fn parse_label_string(labels: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for pair in labels.split(',') {
        match pair.split_once('=') {
            Some((key, value)) if !key.is_empty() => {
                out.insert(key.to_string(), value.to_string());
            }
            _ => {
                if !pair.trim().is_empty() {
                    warn!(pair = %pair, "skipping malformed label pair");
                }
            }
        }
    }
    out
}

fn parse_container_inspect(stdout: &[u8], reference: &str) -> Result<ContainerDetails> {
    let value: Value = serde_json::from_slice(stdout).map_err(|e| RuntimeError::ParseOutput {
        message: format!("inspect output: {}", e),
    })?;
    let first = value.get(0).ok_or_else(|| RuntimeError::NotFound {
        reference: reference.to_string(),
    })?;

    let state = first.get("State");
    let config = first.get("Config");

    Ok(ContainerDetails {
        id: first
            .get("Id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        name: first
            .get("Name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim_start_matches('/')
            .to_string(),
        status: state
            .and_then(|s| s.get("Status"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        running: state
            .and_then(|s| s.get("Running"))
            .and_then(Value::as_bool)
            .unwrap_or(false),
        started_at: state
            .and_then(|s| s.get("StartedAt"))
            .and_then(Value::as_str)
            .map(|s| s.to_string()),
        labels: config
            .and_then(|c| c.get("Labels"))
            .and_then(Value::as_object)
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| Some((k.clone(), v.as_str()?.to_string())))
                    .collect()
            })
            .unwrap_or_default(),
        working_dir: config
            .and_then(|c| c.get("WorkingDir"))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string()),
        mounts: first
            .get("Mounts")
            .and_then(Value::as_array)
            .map(|mounts| {
                mounts
                    .iter()
                    .filter_map(|m| {
                        Some(MountPoint {
                            source: m.get("Source")?.as_str()?.to_string(),
                            destination: m.get("Destination")?.as_str()?.to_string(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Protocol;

    #[test]
    fn create_args_shape() {
        let spec = CreateSpec {
            image: "alpine:3.19".to_string(),
            name: Some("dcx-abc".to_string()),
            labels: [("dcx.workspace.id".to_string(), "abc".to_string())]
                .into_iter()
                .collect(),
            env: [("A".to_string(), "1".to_string())].into_iter().collect(),
            mounts: vec![Mount {
                source: Some("/src".to_string()),
                target: "/workspaces/app".to_string(),
                mount_type: "bind".to_string(),
                readonly: false,
            }],
            ports: vec![PortForward {
                container: 80,
                host: 3000,
                protocol: Protocol::Tcp,
            }],
            user: Some("dev".to_string()),
            workdir: Some("/workspaces/app".to_string()),
            override_command: true,
            init: true,
            privileged: false,
            cap_add: vec!["SYS_PTRACE".to_string()],
            security_opt: vec!["seccomp=unconfined".to_string()],
            gpu: None,
            extra_args: vec!["--hostname=dev".to_string()],
        };

        let args = spec.to_args();
        assert_eq!(args[0], "run");
        assert_eq!(args[1], "--detach");
        assert!(args.contains(&"--name=dcx-abc".to_string()));
        assert!(args.contains(&"--label=dcx.workspace.id=abc".to_string()));
        assert!(args.contains(&"--env=A=1".to_string()));
        assert!(args.contains(&"--mount=type=bind,source=/src,target=/workspaces/app".to_string()));
        assert!(args.contains(&"--publish=3000:80/tcp".to_string()));
        assert!(args.contains(&"--user=dev".to_string()));
        assert!(args.contains(&"--init".to_string()));
        assert!(!args.contains(&"--privileged".to_string()));
        assert!(args.contains(&"--cap-add=SYS_PTRACE".to_string()));
        assert!(args.contains(&"--security-opt=seccomp=unconfined".to_string()));
        // Image comes before the override command tail.
        let image_pos = args.iter().position(|a| a == "alpine:3.19").unwrap();
        assert_eq!(&args[image_pos + 1..], ["sleep", "infinity"]);
    }

    #[test]
    fn gpu_args() {
        let mut spec = CreateSpec {
            image: "x".to_string(),
            gpu: Some(GpuRequest {
                enabled: true,
                count: -1,
                cores: None,
                memory: None,
            }),
            ..CreateSpec::default()
        };
        assert!(spec.to_args().contains(&"--gpus=all".to_string()));

        spec.gpu = Some(GpuRequest {
            enabled: true,
            count: 2,
            cores: None,
            memory: None,
        });
        assert!(spec.to_args().contains(&"--gpus=2".to_string()));

        spec.gpu = Some(GpuRequest {
            enabled: false,
            count: 0,
            cores: None,
            memory: None,
        });
        assert!(!spec.to_args().iter().any(|a| a.starts_with("--gpus")));
    }

    #[test]
    fn build_args_shape() {
        let request = BuildRequest {
            tag: "dcx/ws:abc-features".to_string(),
            dockerfile: PathBuf::from("/tmp/ctx/Dockerfile.dcx"),
            context: PathBuf::from("/tmp/ctx"),
            build_args: [("BASE".to_string(), "alpine".to_string())]
                .into_iter()
                .collect(),
            target: Some("final".to_string()),
            cache_from: vec!["dcx/ws:old-features".to_string()],
            labels: [("devcontainer.metadata".to_string(), "[]".to_string())]
                .into_iter()
                .collect(),
            build_contexts: IndexMap::new(),
            no_cache: true,
            pull: false,
        };
        let args = request.to_args();
        assert_eq!(args[0], "build");
        assert!(args.contains(&"--tag=dcx/ws:abc-features".to_string()));
        assert!(args.contains(&"--file=/tmp/ctx/Dockerfile.dcx".to_string()));
        assert!(args.contains(&"--build-arg=BASE=alpine".to_string()));
        assert!(args.contains(&"--target=final".to_string()));
        assert!(args.contains(&"--cache-from=dcx/ws:old-features".to_string()));
        assert!(args.contains(&"--label=devcontainer.metadata=[]".to_string()));
        assert!(args.contains(&"--no-cache".to_string()));
        assert!(!args.contains(&"--pull".to_string()));
        assert_eq!(args.last().unwrap(), "/tmp/ctx");
    }

    #[test]
    fn exec_args_shape() {
        let request = ExecRequest {
            container: "abc".to_string(),
            user: Some("dev".to_string()),
            env: [("K".to_string(), "v".to_string())].into_iter().collect(),
            workdir: Some("/workspaces/app".to_string()),
            command: vec!["sh".to_string(), "-c".to_string(), "make".to_string()],
            interactive: true,
            tty: false,
            detach: false,
        };
        let args = request.to_args();
        assert_eq!(
            args,
            vec![
                "exec",
                "--interactive",
                "--user=dev",
                "--workdir=/workspaces/app",
                "--env=K=v",
                "abc",
                "sh",
                "-c",
                "make"
            ]
        );
    }

    #[test]
    fn label_string_parsing_is_tolerant() {
        let labels = parse_label_string("a=1,b=2,malformed,c=x=y,=empty");
        assert_eq!(labels["a"], "1");
        assert_eq!(labels["b"], "2");
        assert_eq!(labels["c"], "x=y");
        assert!(!labels.contains_key("malformed"));
        assert_eq!(labels.len(), 3);
    }

    #[test]
    fn container_list_parsing() {
        let stdout = concat!(
            r#"{"ID":"aaa","Names":"dcx-abc","State":"running","Labels":"dcx.workspace.id=abc,dcx.plan.type=image"}"#,
            "\n",
            r#"{"ID":"bbb","Names":"other","State":"exited","Labels":""}"#,
        );
        let list = parse_container_list(stdout).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, "aaa");
        assert_eq!(list[0].labels["dcx.workspace.id"], "abc");
        assert_eq!(list[1].state, "exited");
        assert!(list[1].labels.is_empty());
    }

    #[test]
    fn container_inspect_parsing() {
        let stdout = r#"[{
            "Id": "aaa",
            "Name": "/dcx-abc",
            "State": {"Status": "running", "Running": true, "StartedAt": "2024-01-01T00:00:00Z"},
            "Config": {"Labels": {"dcx.workspace.id": "abc"}, "WorkingDir": "/workspaces/app"},
            "Mounts": [{"Source": "/src", "Destination": "/workspaces/app"}]
        }]"#;
        let details = parse_container_inspect(stdout.as_bytes(), "aaa").unwrap();
        assert_eq!(details.id, "aaa");
        assert_eq!(details.name, "dcx-abc");
        assert!(details.running);
        assert_eq!(details.labels["dcx.workspace.id"], "abc");
        assert_eq!(details.working_dir.as_deref(), Some("/workspaces/app"));
        assert_eq!(details.mounts[0].destination, "/workspaces/app");
    }

    #[test]
    fn empty_inspect_array_is_not_found() {
        assert!(matches!(
            parse_container_inspect(b"[]", "missing").unwrap_err(),
            DcxError::Runtime(RuntimeError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn ping_against_missing_binary_is_unavailable() {
        let driver = RuntimeCli::new("definitely-not-a-container-runtime");
        let err = driver.ping(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(
            err,
            DcxError::Runtime(RuntimeError::Unavailable { .. })
        ));
    }
}
