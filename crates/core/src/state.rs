//! Container state classification and reconciliation planning
//!
//! The state manager queries the runtime for containers labeled with this
//! workspace's identifier, classifies what it sees into a small state set,
//! and the planner turns state plus user intent into the minimum action.
//! Errors during classification are recovered locally (`Unknown`/`Broken`);
//! only errors executing a chosen action propagate.

use std::fmt;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::compose::ComposeProject;
use crate::config::PlanKind;
use crate::errors::{DcxError, Result, RuntimeError};
use crate::runtime::{ContainerDetails, ContainerSummary, Runtime};
use crate::workspace::{LABEL_CONFIG_HASH, LABEL_PLAN_TYPE, LABEL_WORKSPACE_ID};

/// Observable runtime state of a workspace's containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ContainerState {
    Unknown,
    Absent,
    /// Exists but was never started
    Created,
    Running,
    /// Exists, not running; alias of Created used by reporting paths
    Stopped,
    /// Exists but its config hash differs from the current one
    Stale,
    /// Labels incomplete or inconsistent with the plan
    Broken,
}

impl ContainerState {
    /// Whether a container in this state can serve the workspace as-is.
    pub fn usable(&self) -> bool {
        matches!(
            self,
            ContainerState::Created | ContainerState::Running | ContainerState::Stopped
        )
    }

    /// The fixed recovery action for this state.
    pub fn recovery(&self) -> RecoveryAction {
        match self {
            ContainerState::Absent | ContainerState::Running | ContainerState::Unknown => {
                RecoveryAction::None
            }
            ContainerState::Created | ContainerState::Stopped => RecoveryAction::Restart,
            ContainerState::Stale => RecoveryAction::Rebuild,
            ContainerState::Broken => RecoveryAction::Remove,
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContainerState::Unknown => "unknown",
            ContainerState::Absent => "absent",
            ContainerState::Created => "created",
            ContainerState::Running => "running",
            ContainerState::Stopped => "stopped",
            ContainerState::Stale => "stale",
            ContainerState::Broken => "broken",
        };
        write!(f, "{}", name)
    }
}

/// Per-state recovery, from the fixed table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RecoveryAction {
    None,
    Restart,
    Rebuild,
    Remove,
}

/// The planner's decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PlanAction {
    None,
    Start,
    Restart,
    Recreate,
    Rebuild,
    Remove,
}

impl fmt::Display for PlanAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PlanAction::None => "none",
            PlanAction::Start => "start",
            PlanAction::Restart => "restart",
            PlanAction::Recreate => "recreate",
            PlanAction::Rebuild => "rebuild",
            PlanAction::Remove => "remove",
        };
        write!(f, "{}", name)
    }
}

/// A planner decision with its reason and the observable deltas behind it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Plan {
    pub action: PlanAction,
    pub reason: String,
    pub changes: Vec<String>,
}

impl Plan {
    fn new(action: PlanAction, reason: &str) -> Self {
        Self {
            action,
            reason: reason.to_string(),
            changes: Vec::new(),
        }
    }

    pub fn with_changes(mut self, changes: Vec<String>) -> Self {
        self.changes = changes;
        self
    }
}

/// Compute the action for a state and the two user intents.
pub fn plan(state: ContainerState, rebuild: bool, recreate: bool) -> Plan {
    match state {
        ContainerState::Absent => Plan::new(PlanAction::Rebuild, "no container exists"),
        ContainerState::Stale => Plan::new(PlanAction::Rebuild, "configuration changed"),
        ContainerState::Broken => Plan::new(PlanAction::Recreate, "container in bad state"),
        ContainerState::Unknown => Plan::new(PlanAction::None, "state could not be determined"),
        ContainerState::Running => {
            if rebuild {
                Plan::new(PlanAction::Rebuild, "rebuild requested")
            } else if recreate {
                Plan::new(PlanAction::Recreate, "recreate requested")
            } else {
                Plan::new(PlanAction::None, "already running")
            }
        }
        ContainerState::Created | ContainerState::Stopped => {
            if rebuild {
                Plan::new(PlanAction::Rebuild, "rebuild requested")
            } else if recreate {
                Plan::new(PlanAction::Recreate, "recreate requested")
            } else {
                Plan::new(PlanAction::Start, "container stopped")
            }
        }
    }
}

/// What classification needs to know about the workspace.
#[derive(Debug, Clone)]
pub struct WorkspaceIdentity {
    pub id: String,
    pub plan: PlanKind,
    pub config_hash: String,
    /// Compose plans only: the full service set that must be covered
    pub compose: Option<ComposeProject>,
}

/// Result of a classification pass.
#[derive(Debug, Clone)]
pub struct Classification {
    pub state: ContainerState,
    /// The primary container, when one was inspected
    pub container: Option<ContainerDetails>,
    /// Every labeled container observed
    pub observed: Vec<ContainerSummary>,
}

/// Classifies live runtime state for a workspace.
pub struct StateManager<'r, R: Runtime> {
    runtime: &'r R,
}

impl<'r, R: Runtime> StateManager<'r, R> {
    pub fn new(runtime: &'r R) -> Self {
        Self { runtime }
    }

    /// Classify the workspace's containers.
    #[instrument(skip_all, fields(workspace = %identity.id))]
    pub async fn classify(
        &self,
        identity: &WorkspaceIdentity,
        cancel: &CancellationToken,
    ) -> Result<Classification> {
        let filters = vec![
            (LABEL_WORKSPACE_ID.to_string(), identity.id.clone()),
            (LABEL_PLAN_TYPE.to_string(), identity.plan.to_string()),
        ];

        let observed = match self.runtime.list_containers(&filters, cancel).await {
            Ok(list) => list,
            Err(DcxError::Cancelled) => return Err(DcxError::Cancelled),
            Err(e) => {
                warn!(error = %e, "container listing failed, classifying as unknown");
                return Ok(Classification {
                    state: ContainerState::Unknown,
                    container: None,
                    observed: Vec::new(),
                });
            }
        };

        if observed.is_empty() {
            return Ok(Classification {
                state: ContainerState::Absent,
                container: None,
                observed,
            });
        }

        match &identity.compose {
            Some(project) => self.classify_compose(identity, project, observed, cancel).await,
            None => self.classify_single(identity, observed, cancel).await,
        }
    }

    async fn classify_single(
        &self,
        identity: &WorkspaceIdentity,
        observed: Vec<ContainerSummary>,
        cancel: &CancellationToken,
    ) -> Result<Classification> {
        if observed.len() > 1 {
            warn!(count = observed.len(), "multiple containers claim this workspace");
            return Ok(Classification {
                state: ContainerState::Broken,
                container: None,
                observed,
            });
        }

        let summary = &observed[0];
        let details = match self.runtime.inspect_container(&summary.id, cancel).await {
            Ok(details) => details,
            Err(DcxError::Cancelled) => return Err(DcxError::Cancelled),
            Err(DcxError::Runtime(RuntimeError::NotFound { .. })) => {
                // Raced with removal between list and inspect.
                return Ok(Classification {
                    state: ContainerState::Absent,
                    container: None,
                    observed,
                });
            }
            Err(e) => {
                warn!(error = %e, "inspect failed, classifying as unknown");
                return Ok(Classification {
                    state: ContainerState::Unknown,
                    container: None,
                    observed,
                });
            }
        };

        let state = state_for(identity, &details);
        debug!(state = %state, container = %details.id, "classified");
        Ok(Classification {
            state,
            container: Some(details),
            observed,
        })
    }

    async fn classify_compose(
        &self,
        identity: &WorkspaceIdentity,
        project: &ComposeProject,
        observed: Vec<ContainerSummary>,
        cancel: &CancellationToken,
    ) -> Result<Classification> {
        let missing = project.missing_services(&observed);
        if !missing.is_empty() {
            warn!(missing = ?missing, "compose services not covered");
            return Ok(Classification {
                state: ContainerState::Broken,
                container: None,
                observed,
            });
        }

        let Some(primary) = project.primary_container(&observed) else {
            return Ok(Classification {
                state: ContainerState::Broken,
                container: None,
                observed,
            });
        };

        let details = match self.runtime.inspect_container(&primary.id, cancel).await {
            Ok(details) => details,
            Err(DcxError::Cancelled) => return Err(DcxError::Cancelled),
            Err(DcxError::Runtime(RuntimeError::NotFound { .. })) => {
                return Ok(Classification {
                    state: ContainerState::Absent,
                    container: None,
                    observed,
                });
            }
            Err(e) => {
                warn!(error = %e, "inspect failed, classifying as unknown");
                return Ok(Classification {
                    state: ContainerState::Unknown,
                    container: None,
                    observed,
                });
            }
        };

        let state = state_for(identity, &details);
        Ok(Classification {
            state,
            container: Some(details),
            observed,
        })
    }
}

/// Map one inspected container onto a state for this workspace.
fn state_for(identity: &WorkspaceIdentity, details: &ContainerDetails) -> ContainerState {
    let labels = &details.labels;
    let id_ok = labels.get(LABEL_WORKSPACE_ID) == Some(&identity.id);
    let plan_ok = labels
        .get(LABEL_PLAN_TYPE)
        .is_some_and(|p| p == &identity.plan.to_string());
    let hash = labels.get(LABEL_CONFIG_HASH);

    if !id_ok || !plan_ok || hash.is_none() {
        return ContainerState::Broken;
    }
    if hash != Some(&identity.config_hash) {
        return ContainerState::Stale;
    }
    if details.running {
        ContainerState::Running
    } else {
        ContainerState::Stopped
    }
}

/// Observable differences between the current container and the intended
/// workspace, for the plan's `changes` list.
pub fn compute_changes(
    identity: &WorkspaceIdentity,
    details: &ContainerDetails,
) -> Vec<String> {
    let mut changes = Vec::new();
    let labels = &details.labels;

    match labels.get(LABEL_CONFIG_HASH) {
        Some(hash) if hash != &identity.config_hash => changes.push(format!(
            "configuration hash {} -> {}",
            &hash[..hash.len().min(12)],
            &identity.config_hash[..12]
        )),
        None => changes.push("container has no configuration hash label".to_string()),
        _ => {}
    }
    match labels.get(LABEL_PLAN_TYPE) {
        Some(plan) if plan != &identity.plan.to_string() => {
            changes.push(format!("plan type {} -> {}", plan, identity.plan))
        }
        None => changes.push("container has no plan type label".to_string()),
        _ => {}
    }
    if labels.get(LABEL_WORKSPACE_ID) != Some(&identity.id) {
        changes.push("container belongs to a different workspace".to_string());
    }

    changes
}
