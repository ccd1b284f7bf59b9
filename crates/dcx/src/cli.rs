use std::path::PathBuf;

use clap::{Parser, Subcommand};
use dcx_core::errors::Result;
use tokio_util::sync::CancellationToken;

use crate::commands;

/// Development container orchestrator.
#[derive(Parser, Debug)]
#[command(
    name = "dcx",
    version,
    about = "Declarative development containers over the container runtime CLI"
)]
pub struct Cli {
    /// Workspace folder (defaults to the current directory)
    #[arg(long, global = true, value_name = "PATH")]
    pub workspace_folder: Option<PathBuf>,

    /// Explicit configuration file, bypassing discovery
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Bring the workspace's container up
    Up {
        /// Rebuild the derived image even when the container is usable
        #[arg(long)]
        rebuild: bool,

        /// Recreate the container without rebuilding images
        #[arg(long)]
        recreate: bool,

        /// Re-fetch features, ignoring the cache
        #[arg(long)]
        force_pull: bool,
    },

    /// Stop the workspace's containers and remove the SSH config entry
    Down {
        /// Remove containers instead of stopping them
        #[arg(long)]
        remove: bool,
    },

    /// Open an SSH session into the container
    Ssh {
        /// Act as a ProxyCommand transport: bridge stdio to the container
        #[arg(long, value_name = "CONTAINER")]
        stdio: Option<String>,
    },

    /// Classify container state and print the planned action
    Plan {
        #[arg(long)]
        rebuild: bool,

        #[arg(long)]
        recreate: bool,
    },

    /// Resolve and print the merged configuration as JSON
    ReadConfiguration,

    /// Feature cache maintenance
    Cache {
        #[command(subcommand)]
        command: CacheCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum CacheCommand {
    /// Remove the feature cache directory
    Clean,
}

impl Cli {
    pub async fn dispatch(self, cancel: &CancellationToken) -> Result<()> {
        let scope = commands::Scope {
            workspace_folder: self.workspace_folder,
            config: self.config,
        };
        match self.command {
            Command::Up {
                rebuild,
                recreate,
                force_pull,
            } => commands::up::run(scope, rebuild, recreate, force_pull, cancel).await,
            Command::Down { remove } => commands::down::run(scope, remove, cancel).await,
            Command::Ssh { stdio } => commands::ssh::run(scope, stdio, cancel).await,
            Command::Plan { rebuild, recreate } => {
                commands::plan::run(scope, rebuild, recreate, cancel).await
            }
            Command::ReadConfiguration => commands::read_configuration::run(scope, cancel).await,
            Command::Cache {
                command: CacheCommand::Clean,
            } => commands::cache::clean(),
        }
    }
}
