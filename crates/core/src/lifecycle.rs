//! Lifecycle command execution
//!
//! Lifecycle commands come from the merged configuration (which already
//! aggregates feature contributions). `initializeCommand` runs on the host
//! before any container exists; the rest run inside the container in phase
//! order. Command strings are delivered verbatim to an in-container shell;
//! argv forms run directly. A failing hook is fatal and its exit code
//! becomes the process exit code.

use std::fmt;
use std::path::Path;

use indexmap::IndexMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::config::{CommandForm, DevContainerConfig, LifecycleCommand, LifecycleEntry};
use crate::errors::{DcxError, ExecError, Result};
use crate::runtime::{ExecRequest, RuntimeCli};

/// The lifecycle phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    /// Host-side, before the container exists
    Initialize,
    OnCreate,
    UpdateContent,
    PostCreate,
    PostStart,
    PostAttach,
}

impl LifecyclePhase {
    /// The in-container phases run on a fresh create, in order.
    pub const CREATE_PHASES: [LifecyclePhase; 5] = [
        LifecyclePhase::OnCreate,
        LifecyclePhase::UpdateContent,
        LifecyclePhase::PostCreate,
        LifecyclePhase::PostStart,
        LifecyclePhase::PostAttach,
    ];

    /// The phases run when an existing container is started.
    pub const START_PHASES: [LifecyclePhase; 2] =
        [LifecyclePhase::PostStart, LifecyclePhase::PostAttach];
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecyclePhase::Initialize => "initializeCommand",
            LifecyclePhase::OnCreate => "onCreateCommand",
            LifecyclePhase::UpdateContent => "updateContentCommand",
            LifecyclePhase::PostCreate => "postCreateCommand",
            LifecyclePhase::PostStart => "postStartCommand",
            LifecyclePhase::PostAttach => "postAttachCommand",
        };
        write!(f, "{}", name)
    }
}

/// The configured command for a phase, if any.
pub fn phase_command<'c>(
    config: &'c DevContainerConfig,
    phase: LifecyclePhase,
) -> Option<&'c LifecycleCommand> {
    match phase {
        LifecyclePhase::Initialize => config.initialize_command.as_ref(),
        LifecyclePhase::OnCreate => config.on_create_command.as_ref(),
        LifecyclePhase::UpdateContent => config.update_content_command.as_ref(),
        LifecyclePhase::PostCreate => config.post_create_command.as_ref(),
        LifecyclePhase::PostStart => config.post_start_command.as_ref(),
        LifecyclePhase::PostAttach => config.post_attach_command.as_ref(),
    }
}

/// Runs in-container lifecycle hooks through the runtime driver.
pub struct HookRunner<'r> {
    runtime: &'r RuntimeCli,
    container: String,
    user: Option<String>,
    workdir: Option<String>,
    remote_env: IndexMap<String, String>,
}

impl<'r> HookRunner<'r> {
    pub fn new(
        runtime: &'r RuntimeCli,
        container: impl Into<String>,
        user: Option<String>,
        workdir: Option<String>,
        remote_env: IndexMap<String, String>,
    ) -> Self {
        Self {
            runtime,
            container: container.into(),
            user,
            workdir,
            remote_env,
        }
    }

    /// Run every entry of a phase, in order. The first failure aborts the
    /// phase and surfaces the hook's exit code.
    #[instrument(skip(self, config, cancel), fields(container = %self.container, phase = %phase))]
    pub async fn run_phase(
        &self,
        config: &DevContainerConfig,
        phase: LifecyclePhase,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let Some(command) = phase_command(config, phase) else {
            return Ok(());
        };

        for entry in command.entries() {
            self.run_entry(&entry, phase, cancel).await?;
        }
        Ok(())
    }

    async fn run_entry(
        &self,
        entry: &LifecycleEntry,
        phase: LifecyclePhase,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let label = entry
            .name
            .clone()
            .unwrap_or_else(|| phase.to_string());
        let command = match &entry.command {
            CommandForm::Shell(script) => vec![
                "sh".to_string(),
                "-c".to_string(),
                script.clone(),
            ],
            CommandForm::Args(args) => args.clone(),
        };
        if command.is_empty() {
            return Ok(());
        }

        info!(hook = %label, "running lifecycle hook");
        let request = ExecRequest {
            container: self.container.clone(),
            user: self.user.clone(),
            env: self.remote_env.clone(),
            workdir: self.workdir.clone(),
            command,
            ..ExecRequest::default()
        };
        let output = self.runtime.exec(&request, cancel).await?;
        if !output.stdout.is_empty() {
            debug!(hook = %label, "{}", output.stdout.trim_end());
        }
        if !output.success() {
            return Err(ExecError::NonZeroExit {
                command: describe(&entry.command),
                code: output.exit_code,
            }
            .into());
        }
        Ok(())
    }
}

/// Run a host-side phase (`initializeCommand`) in the workspace root.
#[instrument(skip(config, cancel), fields(phase = %phase))]
pub async fn run_host_phase(
    config: &DevContainerConfig,
    phase: LifecyclePhase,
    workspace_root: &Path,
    cancel: &CancellationToken,
) -> Result<()> {
    let Some(command) = phase_command(config, phase) else {
        return Ok(());
    };

    for entry in command.entries() {
        let (program, args) = match &entry.command {
            CommandForm::Shell(script) => (
                "sh".to_string(),
                vec!["-c".to_string(), script.clone()],
            ),
            CommandForm::Args(argv) => match argv.split_first() {
                Some((program, rest)) => (program.clone(), rest.to_vec()),
                None => continue,
            },
        };

        info!(command = %describe(&entry.command), "running host hook");
        let mut child = tokio::process::Command::new(&program)
            .args(&args)
            .current_dir(workspace_root)
            .spawn()
            .map_err(|e| ExecError::Spawn {
                command: describe(&entry.command),
                message: e.to_string(),
            })?;

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(DcxError::Cancelled);
            }
            status = child.wait() => status?,
        };
        if !status.success() {
            return Err(ExecError::NonZeroExit {
                command: describe(&entry.command),
                code: status.code().unwrap_or(-1),
            }
            .into());
        }
    }
    Ok(())
}

/// Human-readable rendering of a command for error messages.
fn describe(command: &CommandForm) -> String {
    match command {
        CommandForm::Shell(script) => script.clone(),
        CommandForm::Args(args) => shell_words::join(args),
    }
}
