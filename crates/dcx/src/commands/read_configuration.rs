//! Resolve and print the merged configuration as JSON.
//!
//! Works without a reachable runtime: image-embedded metadata is folded in
//! when the runtime answers and skipped otherwise.

use dcx_core::errors::Result;
use dcx_core::runtime::runtime;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::{shared, Scope};

pub async fn run(scope: Scope, cancel: &CancellationToken) -> Result<()> {
    let cli = runtime();
    let runtime_handle = match cli.ping(cancel).await {
        Ok(()) => Some(cli),
        Err(_) => None,
    };

    let bundle = shared::load(&scope, runtime_handle, false, cancel).await?;
    let ws = &bundle.workspace;

    println!(
        "{}",
        json!({
            "workspaceId": ws.id,
            "name": ws.name,
            "planType": ws.plan.kind().to_string(),
            "configPath": ws.config_path.display().to_string(),
            "workspaceFolder": ws.workspace_folder,
            "remoteUser": ws.remote_user,
            "containerUser": ws.container_user,
            "features": ws.features.iter().map(|f| f.identity()).collect::<Vec<_>>(),
            "hashes": ws.hashes,
            "configuration": ws.merged.to_canonical_json()?,
        })
    );
    Ok(())
}
