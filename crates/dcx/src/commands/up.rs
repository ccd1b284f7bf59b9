//! The bring-up path: resolve, classify, plan, act.

use dcx_core::compose;
use dcx_core::errors::{BuildError, Result, RuntimeError};
use dcx_core::lifecycle::{run_host_phase, HookRunner, LifecyclePhase};
use dcx_core::metadata::{render_metadata_label, METADATA_LABEL};
use dcx_core::recipe;
use dcx_core::runtime::{runtime, BuildRequest, RuntimeCli};
use dcx_core::state::{self, PlanAction, StateManager};
use dcx_core::workspace::ExecutionPlan;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::shared::{self, ResolvedBundle};
use super::Scope;

pub async fn run(
    scope: Scope,
    rebuild: bool,
    recreate: bool,
    force_pull: bool,
    cancel: &CancellationToken,
) -> Result<()> {
    let cli = runtime();
    cli.ping(cancel).await?;

    let bundle = shared::load(&scope, Some(cli), force_pull, cancel).await?;
    let ws = &bundle.workspace;

    run_host_phase(&ws.merged, LifecyclePhase::Initialize, &ws.workspace_root, cancel).await?;

    let manager = StateManager::new(cli);
    let classification = manager.classify(&ws.identity(), cancel).await?;
    let mut plan = state::plan(classification.state, rebuild, recreate);
    if let Some(details) = &classification.container {
        plan = plan.with_changes(state::compute_changes(&ws.identity(), details));
    }
    info!(state = %classification.state, action = %plan.action, reason = %plan.reason, "reconciliation planned");
    for change in &plan.changes {
        info!(change = %change, "observed difference");
    }

    let container_id = match &ws.plan {
        ExecutionPlan::Compose(project) => {
            execute_compose(cli, &bundle, project, &plan.action, cancel).await?
        }
        _ => execute_single(cli, &bundle, &plan.action, &classification, cancel).await?,
    };

    // Install the SSH entry so `ssh <id>` reaches the container.
    if let Some(container) = &container_id {
        patch_ssh_config(&bundle, container)?;
    }

    println!(
        "{}",
        json!({
            "workspaceId": ws.id,
            "state": classification.state.to_string(),
            "action": plan.action.to_string(),
            "reason": plan.reason,
            "changes": plan.changes,
            "container": container_id,
            "configHash": ws.hashes.overall,
        })
    );
    Ok(())
}

/// Execute the plan for image and dockerfile plans. Returns the id of the
/// container serving the workspace, when one exists afterwards.
async fn execute_single(
    cli: &RuntimeCli,
    bundle: &ResolvedBundle,
    action: &PlanAction,
    classification: &state::Classification,
    cancel: &CancellationToken,
) -> Result<Option<String>> {
    let ws = &bundle.workspace;
    let existing = classification.container.as_ref().map(|c| c.id.clone());

    match action {
        PlanAction::None => Ok(existing),
        PlanAction::Remove => {
            if let Some(id) = &existing {
                cli.remove(id, true, cancel).await?;
            }
            Ok(None)
        }
        PlanAction::Start | PlanAction::Restart => {
            let id = existing.ok_or_else(|| RuntimeError::NotFound {
                reference: ws.container_name(),
            })?;
            if matches!(action, PlanAction::Restart) {
                cli.stop(&id, cancel).await?;
            }
            cli.start(&id, cancel).await?;
            run_hooks(cli, bundle, &id, &LifecyclePhase::START_PHASES, cancel).await?;
            Ok(Some(id))
        }
        PlanAction::Recreate | PlanAction::Rebuild => {
            let fresh = matches!(action, PlanAction::Rebuild);
            let image = prepare_image(cli, bundle, fresh, cancel).await?;

            if let Some(id) = &existing {
                cli.remove(id, true, cancel).await?;
            }
            let id = cli.create(&ws.create_spec(&image), cancel).await?;
            run_hooks(cli, bundle, &id, &LifecyclePhase::CREATE_PHASES, cancel).await?;
            Ok(Some(id))
        }
    }
}

/// Execute the plan for compose plans; hooks run in the primary service's
/// container.
async fn execute_compose(
    cli: &RuntimeCli,
    bundle: &ResolvedBundle,
    project: &compose::ComposeProject,
    action: &PlanAction,
    cancel: &CancellationToken,
) -> Result<Option<String>> {
    let ws = &bundle.workspace;
    match action {
        PlanAction::None => {}
        PlanAction::Remove => {
            compose::compose_down(cli, project, cancel).await?;
            return Ok(None);
        }
        PlanAction::Recreate | PlanAction::Rebuild => {
            compose::compose_down(cli, project, cancel).await?;
            compose::compose_up(cli, project, cancel).await?;
        }
        PlanAction::Start | PlanAction::Restart => {
            compose::compose_up(cli, project, cancel).await?;
        }
    }

    // Find the primary container for hooks and the SSH entry.
    let manager = StateManager::new(cli);
    let classification = manager.classify(&ws.identity(), cancel).await?;
    let Some(primary) = classification.container else {
        return Ok(None);
    };
    if matches!(action, PlanAction::Recreate | PlanAction::Rebuild) {
        run_hooks(cli, bundle, &primary.id, &LifecyclePhase::CREATE_PHASES, cancel).await?;
    } else if !matches!(action, PlanAction::None) {
        run_hooks(cli, bundle, &primary.id, &LifecyclePhase::START_PHASES, cancel).await?;
    }
    Ok(Some(primary.id))
}

/// Produce the image the container will run: the base (pulled or built),
/// the feature-augmented derivation, and the UID-remap layer on top.
async fn prepare_image(
    cli: &RuntimeCli,
    bundle: &ResolvedBundle,
    fresh: bool,
    cancel: &CancellationToken,
) -> Result<String> {
    let ws = &bundle.workspace;
    let mut image = match &ws.plan {
        ExecutionPlan::Image { reference } => {
            if !cli.image_exists(reference, cancel).await? {
                cli.pull(reference, cancel).await?;
            }
            reference.clone()
        }
        ExecutionPlan::Dockerfile {
            dockerfile,
            context,
            build_args,
            target,
            cache_from,
        } => {
            let tag = format!("{}/{}:{}-base", recipe::PRODUCT, ws.id, ws.hashes.short());
            if fresh || !cli.image_exists(&tag, cancel).await? {
                let request = BuildRequest {
                    tag: tag.clone(),
                    dockerfile: dockerfile.clone(),
                    context: context.clone(),
                    build_args: build_args.clone(),
                    target: target.clone(),
                    cache_from: cache_from.clone(),
                    no_cache: fresh,
                    ..BuildRequest::default()
                };
                cli.build(&request, cancel).await?;
            }
            tag
        }
        ExecutionPlan::Compose(_) => {
            return Err(BuildError::Recipe {
                message: "compose plans do not build single images".to_string(),
            }
            .into())
        }
    };

    if let Some(derived_tag) = &ws.derived_image_tag {
        if fresh || !cli.image_exists(derived_tag, cancel).await? {
            let staging = tempfile::tempdir()?;
            recipe::stage_build_context(staging.path(), &ws.features)?;

            let label_json = render_metadata_label(&bundle.chain)?;
            let recipe_text = recipe::generate_feature_recipe(&image, &ws.features, &label_json)?;
            let dockerfile_path = staging.path().join("Dockerfile.dcx");
            std::fs::write(&dockerfile_path, &recipe_text)?;

            let request = BuildRequest {
                tag: derived_tag.clone(),
                dockerfile: dockerfile_path,
                context: staging.path().to_path_buf(),
                labels: [(METADATA_LABEL.to_string(), label_json)].into_iter().collect(),
                no_cache: fresh,
                ..BuildRequest::default()
            };
            cli.build(&request, cancel).await?;
        }
        image = derived_tag.clone();
    }

    if recipe::should_remap_user(ws.effective_user(), ws.host_uid, ws.update_remote_user_uid) {
        let user = ws.effective_user().expect("gated on effective user");
        let remap_tag = recipe::remap_image_tag(&ws.id, &ws.hashes);
        if fresh || !cli.image_exists(&remap_tag, cancel).await? {
            let staging = tempfile::tempdir()?;
            let recipe_text =
                recipe::generate_remap_recipe(&image, user, ws.host_uid, ws.host_gid)?;
            let dockerfile_path = staging.path().join("Dockerfile.dcx-uid");
            std::fs::write(&dockerfile_path, &recipe_text)?;

            let request = BuildRequest {
                tag: remap_tag.clone(),
                dockerfile: dockerfile_path,
                context: staging.path().to_path_buf(),
                no_cache: fresh,
                ..BuildRequest::default()
            };
            cli.build(&request, cancel).await?;
        }
        image = remap_tag;
    }

    Ok(image)
}

async fn run_hooks(
    cli: &RuntimeCli,
    bundle: &ResolvedBundle,
    container: &str,
    phases: &[LifecyclePhase],
    cancel: &CancellationToken,
) -> Result<()> {
    let ws = &bundle.workspace;
    let runner = HookRunner::new(
        cli,
        container,
        ws.effective_user().map(|u| u.to_string()),
        Some(ws.workspace_folder.clone()),
        ws.remote_env.clone(),
    );
    for phase in phases {
        runner.run_phase(&ws.merged, *phase, cancel).await?;
    }
    Ok(())
}

fn patch_ssh_config(bundle: &ResolvedBundle, container: &str) -> Result<()> {
    let ws = &bundle.workspace;
    let patcher = dcx_core::ssh::config_patch::SshConfigPatcher::default_location()?;
    let binary = std::env::current_exe()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| "dcx".to_string());
    let user = ws.effective_user().unwrap_or("root");
    patcher.upsert(container, &ws.id, user, &binary)?;
    info!(alias = %ws.id, container = %container, "ssh config entry installed");
    Ok(())
}
