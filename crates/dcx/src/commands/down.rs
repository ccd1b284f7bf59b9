//! Symmetric teardown: stop (or remove) the workspace's containers and
//! strip the SSH config entry. Compose services stop in reverse start
//! order.

use dcx_core::compose;
use dcx_core::errors::Result;
use dcx_core::runtime::runtime;
use dcx_core::ssh::config_patch::SshConfigPatcher;
use dcx_core::state::StateManager;
use dcx_core::workspace::ExecutionPlan;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{shared, Scope};

pub async fn run(scope: Scope, remove: bool, cancel: &CancellationToken) -> Result<()> {
    let cli = runtime();
    cli.ping(cancel).await?;

    let bundle = shared::load(&scope, Some(cli), false, cancel).await?;
    let ws = &bundle.workspace;

    let manager = StateManager::new(cli);
    let classification = manager.classify(&ws.identity(), cancel).await?;

    let mut stopped = Vec::new();
    match &ws.plan {
        ExecutionPlan::Compose(project) => {
            if remove {
                compose::compose_down(cli, project, cancel).await?;
            } else {
                compose::compose_stop(cli, project, cancel).await?;
            }
            stopped.extend(classification.observed.iter().map(|c| c.id.clone()));
        }
        _ => {
            for container in &classification.observed {
                if remove {
                    cli.remove(&container.id, true, cancel).await?;
                } else {
                    cli.stop(&container.id, cancel).await?;
                }
                stopped.push(container.id.clone());
            }
        }
    }

    // The SSH entry is keyed to the container name.
    let patcher = SshConfigPatcher::default_location()?;
    for container in &classification.observed {
        for name in &container.names {
            if patcher.contains(name)? {
                patcher.remove(name)?;
            }
        }
        if patcher.contains(&container.id)? {
            patcher.remove(&container.id)?;
        }
    }
    info!(count = stopped.len(), removed = remove, "workspace brought down");

    println!(
        "{}",
        json!({
            "workspaceId": ws.id,
            "containers": stopped,
            "removed": remove,
        })
    );
    Ok(())
}
