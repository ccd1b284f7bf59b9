//! Host SSH config patching
//!
//! Manages sentinel-delimited blocks in `~/.ssh/config` so `ssh <alias>`
//! reaches the container through this binary's stdio transport. Upsert is
//! idempotent: an existing block for the same container is removed before
//! the fresh one is appended, so two consecutive upserts leave the file
//! byte-identical. All writes happen under an advisory exclusive lock on a
//! sibling file to serialize concurrent invocations.

use std::fs::{File, OpenOptions};
use std::path::PathBuf;

use tracing::{debug, instrument};

use crate::errors::{Result, SshError};

/// Start sentinel for a managed block.
pub fn begin_marker(name: &str) -> String {
    format!("# DCX managed - {}", name)
}

/// End sentinel for a managed block.
pub fn end_marker(name: &str) -> String {
    format!("# End DCX - {}", name)
}

/// Patches sentinel-delimited entries in an SSH client config file.
pub struct SshConfigPatcher {
    config_path: PathBuf,
    lock_path: PathBuf,
}

/// Holds the advisory lock for the duration of a write; released when the
/// file handle drops.
struct LockGuard {
    _file: File,
}

impl SshConfigPatcher {
    /// Patcher for `~/.ssh/config` with the lock at `~/.ssh/config.dcx.lock`.
    pub fn default_location() -> Result<Self> {
        let home = std::env::var("HOME").map_err(|_| SshError::ConfigPatch {
            message: "HOME is not set".to_string(),
        })?;
        let ssh_dir = PathBuf::from(home).join(".ssh");
        Ok(Self::with_paths(
            ssh_dir.join("config"),
            ssh_dir.join("config.dcx.lock"),
        ))
    }

    /// Patcher over explicit paths; tests use temp directories.
    pub fn with_paths(config_path: PathBuf, lock_path: PathBuf) -> Self {
        Self {
            config_path,
            lock_path,
        }
    }

    /// Insert or replace the block for `container_name`.
    #[instrument(skip(self))]
    pub fn upsert(&self, container_name: &str, alias: &str, user: &str, binary: &str) -> Result<()> {
        let _lock = self.locked()?;
        let current = self.read_config()?;
        let mut stripped = strip_block(&current, container_name);

        if !stripped.is_empty() && !stripped.ends_with('\n') {
            stripped.push('\n');
        }
        if !stripped.is_empty() && !stripped.ends_with("\n\n") {
            stripped.push('\n');
        }
        stripped.push_str(&render_block(container_name, alias, user, binary));

        self.write_config(&stripped)?;
        debug!(container = container_name, alias, "ssh config block upserted");
        Ok(())
    }

    /// Remove the block for `container_name`, collapsing trailing blank
    /// lines to a single terminating newline.
    #[instrument(skip(self))]
    pub fn remove(&self, container_name: &str) -> Result<()> {
        let _lock = self.locked()?;
        let current = self.read_config()?;
        let stripped = strip_block(&current, container_name);

        let mut result = stripped.trim_end_matches('\n').to_string();
        if !result.is_empty() {
            result.push('\n');
        }
        self.write_config(&result)?;
        debug!(container = container_name, "ssh config block removed");
        Ok(())
    }

    /// Line-wise search for the start sentinel.
    pub fn contains(&self, container_name: &str) -> Result<bool> {
        let marker = begin_marker(container_name);
        let content = self.read_config()?;
        Ok(content.lines().any(|line| line.contains(&marker)))
    }

    fn read_config(&self) -> Result<String> {
        match std::fs::read_to_string(&self.config_path) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(SshError::ConfigPatch {
                message: format!("read {}: {}", self.config_path.display(), e),
            }
            .into()),
        }
    }

    fn write_config(&self, content: &str) -> Result<()> {
        std::fs::write(&self.config_path, content).map_err(|e| {
            SshError::ConfigPatch {
                message: format!("write {}: {}", self.config_path.display(), e),
            }
            .into()
        })
    }

    /// Create the `.ssh` directory (0700) and lock file (0600) on demand,
    /// then take the exclusive advisory lock.
    fn locked(&self) -> Result<LockGuard> {
        if let Some(dir) = self.config_path.parent() {
            if !dir.exists() {
                std::fs::create_dir_all(dir)?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
                }
            }
        }

        let mut options = OpenOptions::new();
        options.create(true).write(true).truncate(false);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let file = options
            .open(&self.lock_path)
            .map_err(|e| SshError::ConfigPatch {
                message: format!("open lock {}: {}", self.lock_path.display(), e),
            })?;

        file.lock().map_err(|e| SshError::ConfigPatch {
            message: format!("lock {}: {}", self.lock_path.display(), e),
        })?;
        Ok(LockGuard { _file: file })
    }
}

/// Render a managed block, trailing blank line included.
fn render_block(container_name: &str, alias: &str, user: &str, binary: &str) -> String {
    let mut block = String::new();
    block.push_str(&begin_marker(container_name));
    block.push('\n');
    block.push_str(&format!("Host {}\n", alias));
    block.push_str(&format!(
        "    ProxyCommand {} ssh --stdio {}\n",
        binary, container_name
    ));
    block.push_str(&format!("    User {}\n", user));
    block.push_str("    ForwardAgent yes\n");
    block.push_str("    StrictHostKeyChecking no\n");
    block.push_str("    UserKnownHostsFile /dev/null\n");
    block.push_str("    LogLevel ERROR\n");
    block.push_str(&end_marker(container_name));
    block.push('\n');
    block.push('\n');
    block
}

/// Remove any block delimited by this container's sentinels.
fn strip_block(content: &str, container_name: &str) -> String {
    let begin = begin_marker(container_name);
    let end = end_marker(container_name);

    let mut out = String::with_capacity(content.len());
    let mut inside = false;
    let mut just_closed = false;
    for line in content.lines() {
        if !inside && line.trim() == begin {
            inside = true;
            continue;
        }
        if inside {
            if line.trim() == end {
                inside = false;
                just_closed = true;
            }
            continue;
        }
        // Swallow the single blank separator a removed block leaves behind.
        if just_closed {
            just_closed = false;
            if line.trim().is_empty() {
                continue;
            }
        }
        out.push_str(line);
        out.push('\n');
    }
    if content.is_empty() {
        return String::new();
    }
    out
}
