//! Shared resolution pipeline
//!
//! Every subcommand that needs a resolved workspace goes through the same
//! sequence: discover and parse the configuration, substitute variables,
//! fold in image metadata and feature contributions, resolve and order
//! features, and freeze the result.

use std::path::PathBuf;

use dcx_core::config::{discover_config, DevContainerConfig, PlanKind};
use dcx_core::errors::{ConfigError, Result};
use dcx_core::metadata;
use dcx_core::oci::FeatureFetcher;
use dcx_core::ordering::order_features;
use dcx_core::runtime::RuntimeCli;
use dcx_core::variable::SubstitutionContext;
use dcx_core::workspace::{resolve_workspace, ResolvedWorkspace};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::Scope;

/// A resolved workspace plus the metadata chain it was merged from; the
/// chain is re-serialized into the derived image's metadata label.
pub struct ResolvedBundle {
    pub workspace: ResolvedWorkspace,
    pub chain: Vec<DevContainerConfig>,
}

/// The workspace root: explicit flag (with `~` and `$VAR` expansion) or the
/// current directory.
pub fn workspace_root(scope: &Scope) -> Result<PathBuf> {
    let root = match &scope.workspace_folder {
        Some(path) => PathBuf::from(dcx_core::io::expand_env(&path.to_string_lossy())),
        None => std::env::current_dir().map_err(|e| ConfigError::WorkspaceNotFound {
            path: format!("current directory: {e}"),
        })?,
    };
    dcx_core::io::realpath(&root)
}

/// Run the full resolution pipeline.
///
/// `runtime` supplies image metadata for image plans; pass `None` when the
/// runtime may be unavailable (read-configuration) and the image-embedded
/// chain is skipped with a warning.
pub async fn load(
    scope: &Scope,
    runtime: Option<&RuntimeCli>,
    force_pull: bool,
    cancel: &CancellationToken,
) -> Result<ResolvedBundle> {
    let root = workspace_root(scope)?;
    let config_path = match &scope.config {
        Some(path) => PathBuf::from(dcx_core::io::expand_env(&path.to_string_lossy())),
        None => discover_config(&root)?,
    };
    let local = DevContainerConfig::load(&config_path)?;
    local.validate()?;

    let is_compose = local.plan_kind() == PlanKind::Compose;
    let context =
        SubstitutionContext::new(&root, local.workspace_folder.as_deref(), is_compose)?;
    let (local, report) = local.apply_variable_substitution(&context);
    if !report.unknown_variables.is_empty() {
        debug!(unknown = ?report.unknown_variables, "unknown substitution variables left verbatim");
    }

    // Image-embedded metadata applies to image plans only; dockerfile and
    // compose plans skip this step.
    let image_chain = match (&local.image, local.plan_kind(), runtime) {
        (Some(image), PlanKind::Image, Some(runtime)) => {
            image_metadata_chain(runtime, image, cancel).await
        }
        _ => Vec::new(),
    };

    // First merge decides the effective feature set (features map is
    // left-biased, so image-embedded declarations keep their options).
    let mut pre_chain = image_chain.clone();
    pre_chain.push(local.clone());
    let pre_merged = metadata::merge_chain(&pre_chain);

    let config_dir = config_path
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| root.clone());
    let fetcher = FeatureFetcher::default_fetcher()?;
    let features = fetcher
        .resolve_features(&pre_merged.features, &config_dir, force_pull, cancel)
        .await?;
    let features = order_features(features, &pre_merged.override_feature_install_order)?;

    // Final chain: image-embedded, then feature contributions in install
    // order, then the local configuration.
    let mut chain = image_chain;
    for feature in &features {
        chain.push(metadata::feature_contribution(feature));
    }
    chain.push(local);
    let merged = metadata::merge_chain(&chain);

    // Second substitution pass resolves `${containerEnv:..}` against the
    // merged environment; it is the identity on everything already done.
    let context = context.with_container_env(
        merged
            .container_env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    );
    let (merged, _) = merged.apply_variable_substitution(&context);

    let workspace = resolve_workspace(&root, merged, features, &context)?;
    Ok(ResolvedBundle { workspace, chain })
}

/// Parse the `devcontainer.metadata` label off an image. Fetch problems
/// degrade to an empty chain; a missing image is pulled first.
async fn image_metadata_chain(
    runtime: &RuntimeCli,
    image: &str,
    cancel: &CancellationToken,
) -> Vec<DevContainerConfig> {
    if let Ok(false) = runtime.image_exists(image, cancel).await {
        if let Err(e) = runtime.pull(image, cancel).await {
            warn!(image = %image, error = %e, "image pull failed, skipping image metadata");
            return Vec::new();
        }
    }
    match runtime.inspect_image_labels(image, cancel).await {
        Ok(labels) => match labels.get(metadata::METADATA_LABEL) {
            Some(value) => match metadata::parse_metadata_label(value) {
                Ok(chain) => chain,
                Err(e) => {
                    warn!(image = %image, error = %e, "unparseable image metadata label");
                    Vec::new()
                }
            },
            None => Vec::new(),
        },
        Err(e) => {
            warn!(image = %image, error = %e, "image inspect failed, skipping image metadata");
            Vec::new()
        }
    }
}
