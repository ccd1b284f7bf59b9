//! Classify state and print the planner's decision without acting.

use dcx_core::errors::Result;
use dcx_core::runtime::runtime;
use dcx_core::state::{self, StateManager};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::{shared, Scope};

pub async fn run(
    scope: Scope,
    rebuild: bool,
    recreate: bool,
    cancel: &CancellationToken,
) -> Result<()> {
    let cli = runtime();
    cli.ping(cancel).await?;

    let bundle = shared::load(&scope, Some(cli), false, cancel).await?;
    let ws = &bundle.workspace;

    let manager = StateManager::new(cli);
    let classification = manager.classify(&ws.identity(), cancel).await?;
    let mut plan = state::plan(classification.state, rebuild, recreate);
    if let Some(details) = &classification.container {
        plan = plan.with_changes(state::compute_changes(&ws.identity(), details));
    }

    println!(
        "{}",
        json!({
            "workspaceId": ws.id,
            "state": classification.state.to_string(),
            "usable": classification.state.usable(),
            "action": plan.action.to_string(),
            "reason": plan.reason,
            "changes": plan.changes,
            "container": classification.container.as_ref().map(|c| c.id.clone()),
        })
    );
    Ok(())
}
