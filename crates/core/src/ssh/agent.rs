//! In-container companion agent deployment
//!
//! The companion is a precompiled Linux binary that listens on a Unix
//! socket inside the container and forwards each client connection to the
//! host TCP endpoint exposed by the proxy. This module copies the binary in
//! at a versioned path, spawns it detached as the target user, polls the
//! readiness sentinel, and tears everything down again.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::errors::{Result, SshError};
use crate::runtime::{ExecRequest, RuntimeCli};

/// Versioned install path of the companion binary inside the container.
pub const AGENT_CONTAINER_PATH: &str = "/usr/local/lib/dcx/dcx-agent-v1";

/// Fixed in-container socket the companion listens on.
pub const AGENT_SOCKET_PATH: &str = "/tmp/dcx-ssh-agent.sock";

/// Sentinel file signalling the companion is accepting.
pub const AGENT_SENTINEL_PATH: &str = "/tmp/dcx-ssh-agent.sock.ready";

/// Readiness polling deadline and granularity.
pub const READY_TIMEOUT: Duration = Duration::from_secs(5);
pub const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A deployed companion agent.
#[derive(Debug, Clone)]
pub struct AgentDeployment {
    pub pid: u32,
    pub socket_path: String,
    pub sentinel_path: String,
}

/// Copy the companion binary into the container, mark it executable, and
/// spawn it detached as `uid:gid`, pointed at the host proxy endpoint.
#[instrument(skip(runtime, cancel), fields(container = %container))]
pub async fn deploy(
    runtime: &RuntimeCli,
    container: &str,
    host_binary: &Path,
    uid: u32,
    gid: u32,
    host_endpoint: SocketAddr,
    cancel: &CancellationToken,
) -> Result<AgentDeployment> {
    let install_dir = Path::new(AGENT_CONTAINER_PATH)
        .parent()
        .expect("agent path has a parent")
        .to_string_lossy()
        .to_string();

    runtime.mkdir(container, &install_dir, cancel).await?;
    runtime
        .cp_in(container, host_binary, AGENT_CONTAINER_PATH, cancel)
        .await?;
    runtime
        .chmod(container, "755", AGENT_CONTAINER_PATH, cancel)
        .await?;
    runtime
        .chown(container, &format!("{}:{}", uid, gid), AGENT_CONTAINER_PATH, cancel)
        .await?;
    debug!(path = AGENT_CONTAINER_PATH, "companion binary installed");

    // Background the agent from a shell and capture its PID from stdout.
    let spawn_script = format!(
        "rm -f {sock} {sentinel}; nohup {bin} --socket {sock} --connect {endpoint} --sentinel {sentinel} >/dev/null 2>&1 & echo $!",
        bin = AGENT_CONTAINER_PATH,
        sock = AGENT_SOCKET_PATH,
        sentinel = AGENT_SENTINEL_PATH,
        endpoint = host_endpoint,
    );
    let request = ExecRequest {
        container: container.to_string(),
        user: Some(format!("{}:{}", uid, gid)),
        command: vec!["sh".to_string(), "-c".to_string(), spawn_script],
        ..ExecRequest::default()
    };
    let output = runtime.exec(&request, cancel).await?;
    if !output.success() {
        return Err(SshError::Proxy {
            message: format!("agent spawn failed: {}", output.stderr.trim()),
        }
        .into());
    }
    let pid: u32 = output
        .stdout
        .trim()
        .parse()
        .map_err(|_| SshError::Proxy {
            message: format!("agent spawn returned no pid: '{}'", output.stdout.trim()),
        })?;
    info!(pid, "companion agent spawned");

    Ok(AgentDeployment {
        pid,
        socket_path: AGENT_SOCKET_PATH.to_string(),
        sentinel_path: AGENT_SENTINEL_PATH.to_string(),
    })
}

/// Poll for the readiness sentinel with the bounded deadline.
#[instrument(skip(runtime, cancel), fields(container = %container))]
pub async fn wait_ready(
    runtime: &RuntimeCli,
    container: &str,
    deployment: &AgentDeployment,
    cancel: &CancellationToken,
) -> Result<()> {
    let deadline = tokio::time::Instant::now() + READY_TIMEOUT;
    loop {
        let request = ExecRequest {
            container: container.to_string(),
            command: vec![
                "test".to_string(),
                "-f".to_string(),
                deployment.sentinel_path.clone(),
            ],
            ..ExecRequest::default()
        };
        if runtime.exec(&request, cancel).await?.success() {
            debug!("companion agent ready");
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(SshError::AgentNotReady {
                timeout_ms: READY_TIMEOUT.as_millis() as u64,
            }
            .into());
        }
        tokio::time::sleep(READY_POLL_INTERVAL).await;
    }
}

/// Kill the companion and remove its socket and sentinel.
#[instrument(skip(runtime, cancel), fields(container = %container, pid = deployment.pid))]
pub async fn teardown(
    runtime: &RuntimeCli,
    container: &str,
    deployment: &AgentDeployment,
    cancel: &CancellationToken,
) -> Result<()> {
    let script = format!(
        "kill {pid} 2>/dev/null; rm -f {sock} {sentinel}",
        pid = deployment.pid,
        sock = deployment.socket_path,
        sentinel = deployment.sentinel_path,
    );
    let request = ExecRequest {
        container: container.to_string(),
        command: vec!["sh".to_string(), "-c".to_string(), script],
        ..ExecRequest::default()
    };
    let output = runtime.exec(&request, cancel).await?;
    if !output.success() {
        warn!(stderr = %output.stderr.trim(), "agent teardown reported errors");
    }
    info!("companion agent torn down");
    Ok(())
}
