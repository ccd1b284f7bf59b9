pub mod cache;
pub mod down;
pub mod plan;
pub mod read_configuration;
pub mod shared;
pub mod ssh;
pub mod up;

use std::path::PathBuf;

/// Global flags shared by every subcommand.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    pub workspace_folder: Option<PathBuf>,
    pub config: Option<PathBuf>,
}
