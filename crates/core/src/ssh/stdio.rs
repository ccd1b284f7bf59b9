//! SSH-over-stdio transport
//!
//! `dcx ssh --stdio <container>` is installed as the ProxyCommand in the
//! patched SSH config. It runs the runtime's `exec` subcommand with stdio
//! attached and lets the SSH client speak its handshake over the resulting
//! byte stream; the in-container SSH server side is the separately
//! compiled agent started through the same exec channel.

use std::process::Stdio;

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::errors::{DcxError, ExecError, Result};
use crate::runtime::{ExecRequest, RuntimeCli};

/// Run `exec --interactive` against the container with this process's
/// stdin/stdout/stderr attached, and return the child's exit code.
///
/// The byte stream is opaque here; whatever protocol the two ends speak
/// flows through untouched.
#[instrument(skip(runtime, cancel), fields(container = %container))]
pub async fn attach_stdio(
    runtime: &RuntimeCli,
    container: &str,
    user: Option<&str>,
    command: &[String],
    cancel: &CancellationToken,
) -> Result<i32> {
    let request = ExecRequest {
        container: container.to_string(),
        user: user.map(|u| u.to_string()),
        command: command.to_vec(),
        interactive: true,
        ..ExecRequest::default()
    };
    let args = request.to_args();
    debug!(args = ?args, "attaching stdio transport");

    let mut child = tokio::process::Command::new(runtime.binary())
        .args(&args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|e| ExecError::Spawn {
            command: format!("{} {}", runtime.binary(), args.join(" ")),
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
