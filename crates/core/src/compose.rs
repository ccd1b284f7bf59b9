//! Compose plan support
//!
//! Argument construction for the runtime's compose subcommands and the
//! service-coverage check that feeds state classification. Service start
//! order follows the declared order; shutdown reverses it.

use std::path::PathBuf;

use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::errors::Result;
use crate::runtime::{ContainerSummary, RuntimeCli};

/// Label the compose CLI puts on containers for their project.
pub const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";

/// Label the compose CLI puts on containers for their service.
pub const COMPOSE_SERVICE_LABEL: &str = "com.docker.compose.service";

/// A compose execution plan: ordered files, the primary service, and the
/// additional services to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeProject {
    /// Compose project name; the workspace identifier
    pub project_name: String,
    /// Non-empty ordered list of absolute compose file paths
    pub files: Vec<PathBuf>,
    /// Primary service the developer connects to
    pub service: String,
    /// Additional services, started in order, stopped in reverse
    pub run_services: Vec<String>,
}

impl ComposeProject {
    fn base_args(&self) -> Vec<String> {
        let mut args = vec![
            "compose".to_string(),
            format!("--project-name={}", self.project_name),
        ];
        for file in &self.files {
            args.push(format!("--file={}", file.display()));
        }
        args
    }

    /// All services this plan manages, primary first, declared order kept.
    pub fn all_services(&self) -> Vec<String> {
        let mut services = vec![self.service.clone()];
        for service in &self.run_services {
            if !services.contains(service) {
                services.push(service.clone());
            }
        }
        services
    }

    /// `compose up --detach` with the service list in start order.
    pub fn up_args(&self) -> Vec<String> {
        let mut args = self.base_args();
        args.push("up".to_string());
        args.push("--detach".to_string());
        args.extend(self.all_services());
        args
    }

    /// One `compose stop <service>` invocation per service, in reverse
    /// start order.
    pub fn stop_args_sequence(&self) -> Vec<Vec<String>> {
        self.all_services()
            .into_iter()
            .rev()
            .map(|service| {
                let mut args = self.base_args();
                args.push("stop".to_string());
                args.push(service);
                args
            })
            .collect()
    }

    /// `compose down` for full removal.
    pub fn down_args(&self) -> Vec<String> {
        let mut args = self.base_args();
        args.push("down".to_string());
        args
    }

    /// Services declared by this plan that are not covered by the observed
    /// containers. A non-empty result means the project is broken.
    pub fn missing_services(&self, observed: &[ContainerSummary]) -> Vec<String> {
        self.all_services()
            .into_iter()
            .filter(|service| {
                !observed.iter().any(|c| {
                    c.labels.get(COMPOSE_PROJECT_LABEL) == Some(&self.project_name)
                        && c.labels.get(COMPOSE_SERVICE_LABEL) == Some(service)
                })
            })
            .collect()
    }

    /// The observed container backing the primary service, if any.
    pub fn primary_container<'a>(
        &self,
        observed: &'a [ContainerSummary],
    ) -> Option<&'a ContainerSummary> {
        observed.iter().find(|c| {
            c.labels.get(COMPOSE_PROJECT_LABEL) == Some(&self.project_name)
                && c.labels.get(COMPOSE_SERVICE_LABEL) == Some(&self.service)
        })
    }
}

/// Bring the project up, streaming progress.
#[instrument(skip(cli, cancel), fields(project = %project.project_name))]
pub async fn compose_up(
    cli: &RuntimeCli,
    project: &ComposeProject,
    cancel: &CancellationToken,
) -> Result<()> {
    cli.run_streaming(&project.up_args(), cancel).await
}

/// Stop services in reverse start order.
#[instrument(skip(cli, cancel), fields(project = %project.project_name))]
pub async fn compose_stop(
    cli: &RuntimeCli,
    project: &ComposeProject,
    cancel: &CancellationToken,
) -> Result<()> {
    for args in project.stop_args_sequence() {
        cli.run_streaming(&args, cancel).await?;
    }
    Ok(())
}

/// Tear the project down entirely.
#[instrument(skip(cli, cancel), fields(project = %project.project_name))]
pub async fn compose_down(
    cli: &RuntimeCli,
    project: &ComposeProject,
    cancel: &CancellationToken,
) -> Result<()> {
    cli.run_streaming(&project.down_args(), cancel).await
}
