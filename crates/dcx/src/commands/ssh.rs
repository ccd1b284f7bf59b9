//! SSH entry points.
//!
//! `dcx ssh` runs the full interactive path: verify the container is
//! running, bridge the host agent in, patch the SSH config, and hand the
//! terminal to the system `ssh` client. `dcx ssh --stdio <container>` is
//! the ProxyCommand transport that client resolves to.

use std::process::Stdio;

use dcx_core::errors::{DcxError, ExecError, Result, RuntimeError};
use dcx_core::runtime::runtime;
use dcx_core::ssh::agent::{self, AGENT_CONTAINER_PATH};
use dcx_core::ssh::config_patch::SshConfigPatcher;
use dcx_core::ssh::proxy::{host_agent_socket, proxy_bind_address, AgentProxy};
use dcx_core::ssh::stdio::attach_stdio;
use dcx_core::state::{ContainerState, StateManager};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{shared, Scope};

/// Host-side location of the precompiled companion binary; overridable for
/// packaging layouts.
fn companion_binary() -> std::path::PathBuf {
    std::env::var("DCX_AGENT_BINARY")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| std::path::PathBuf::from("/usr/local/lib/dcx/dcx-agent"))
}

pub async fn run(scope: Scope, stdio: Option<String>, cancel: &CancellationToken) -> Result<()> {
    let cli = runtime();

    if let Some(container) = stdio {
        // Transport mode: the SSH client owns the conversation, we own the
        // byte pipe.
        let command = vec![AGENT_CONTAINER_PATH.to_string(), "--stdio-server".to_string()];
        let code = attach_stdio(cli, &container, None, &command, cancel).await?;
        if code != 0 {
            return Err(ExecError::NonZeroExit {
                command: "ssh --stdio transport".to_string(),
                code,
            }
            .into());
        }
        return Ok(());
    }

    cli.ping(cancel).await?;
    let bundle = shared::load(&scope, Some(cli), false, cancel).await?;
    let ws = &bundle.workspace;

    let manager = StateManager::new(cli);
    let classification = manager.classify(&ws.identity(), cancel).await?;
    if classification.state != ContainerState::Running {
        return Err(RuntimeError::NotFound {
            reference: format!(
                "workspace {} is {}, run `dcx up` first",
                ws.id, classification.state
            ),
        }
        .into());
    }
    let container = classification
        .container
        .as_ref()
        .map(|c| c.id.clone())
        .ok_or_else(|| RuntimeError::NotFound {
            reference: ws.container_name(),
        })?;

    // Agent forwarding is best-effort: without a host agent the session
    // still opens, just without key forwarding.
    let forwarding = match setup_agent_forwarding(&container, ws.host_uid, ws.host_gid, cancel)
        .await
    {
        Ok(forwarding) => Some(forwarding),
        Err(DcxError::Cancelled) => return Err(DcxError::Cancelled),
        Err(e) => {
            warn!(error = %e, "agent forwarding unavailable");
            None
        }
    };

    let patcher = SshConfigPatcher::default_location()?;
    let binary = std::env::current_exe()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| "dcx".to_string());
    patcher.upsert(
        &container,
        &ws.id,
        ws.effective_user().unwrap_or("root"),
        &binary,
    )?;

    info!(alias = %ws.id, "opening ssh session");
    let status = run_ssh_client(&ws.id, cancel).await;

    if let Some((proxy, deployment)) = forwarding {
        let _ = agent::teardown(cli, &container, &deployment, cancel).await;
        proxy.shutdown().await;
    }

    let code = status?;
    if code != 0 {
        return Err(ExecError::NonZeroExit {
            command: format!("ssh {}", ws.id),
            code,
        }
        .into());
    }
    Ok(())
}

async fn setup_agent_forwarding(
    container: &str,
    uid: u32,
    gid: u32,
    cancel: &CancellationToken,
) -> Result<(AgentProxy, agent::AgentDeployment)> {
    let cli = runtime();
    let agent_socket = host_agent_socket()?;

    let native_linux = std::env::consts::OS == "linux";
    let proxy = AgentProxy::start(agent_socket, proxy_bind_address(native_linux), cancel).await?;

    let deployment = agent::deploy(
        cli,
        container,
        &companion_binary(),
        uid,
        gid,
        proxy.local_addr(),
        cancel,
    )
    .await?;
    agent::wait_ready(cli, container, &deployment, cancel).await?;
    info!(endpoint = %proxy.local_addr(), "agent forwarding active");
    Ok((proxy, deployment))
}

async fn run_ssh_client(alias: &str, cancel: &CancellationToken) -> Result<i32> {
    let mut child = tokio::process::Command::new("ssh")
        .arg(alias)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|e| ExecError::Spawn {
            command: format!("ssh {alias}"),
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
    Ok(status.code().unwrap_or(-1))
}
