//! Variable substitution engine
//!
//! Expands the closed set of `${name}`, `${name:arg}` and
//! `${name:arg:default}` tokens inside string fields of a parsed
//! configuration. Unknown variables are left verbatim and reported, never
//! treated as errors.

use std::collections::HashMap;
use std::env;
use std::path::{Path, MAIN_SEPARATOR};

use serde_json::Value;
use tracing::{debug, instrument};

use crate::errors::Result;
use crate::hashing::workspace_id;
use crate::io::realpath;

/// Regular expression for substitution tokens
const VARIABLE_PATTERN: &str = r"\$\{([^}]+)\}";

/// Values available to the substitution pass.
#[derive(Debug, Clone)]
pub struct SubstitutionContext {
    /// Canonical workspace root on the host
    pub local_workspace_folder: String,
    /// Workspace folder inside the container
    pub container_workspace_folder: String,
    /// Deterministic workspace identifier
    pub workspace_id: String,
    /// Host environment snapshot
    pub local_env: HashMap<String, String>,
    /// Merged container environment, when known. Empty before the metadata
    /// merge; `${containerEnv:..}` then expands to nothing.
    pub container_env: HashMap<String, String>,
}

impl SubstitutionContext {
    /// Build a context for a workspace.
    ///
    /// `configured_workspace_folder` is the configuration's own
    /// `workspaceFolder` if set; otherwise the container workspace folder
    /// defaults to `/workspaces/<basename>` for image and dockerfile plans
    /// and `/` for compose plans.
    #[instrument(skip_all, fields(workspace = %workspace_root.display()))]
    pub fn new(
        workspace_root: &Path,
        configured_workspace_folder: Option<&str>,
        is_compose: bool,
    ) -> Result<Self> {
        let canonical = realpath(workspace_root)?;
        let local_workspace_folder = canonical.to_string_lossy().to_string();
        let basename = canonical
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        let container_workspace_folder = match configured_workspace_folder {
            Some(folder) if !folder.is_empty() => folder.to_string(),
            _ if is_compose => "/".to_string(),
            _ => format!("/workspaces/{}", basename),
        };

        let id = workspace_id(&canonical)?;
        debug!(workspace_id = %id, container_folder = %container_workspace_folder, "substitution context ready");

        Ok(Self {
            local_workspace_folder,
            container_workspace_folder,
            workspace_id: id,
            local_env: env::vars().collect(),
            container_env: HashMap::new(),
        })
    }

    /// Replace the container environment used by `${containerEnv:..}`
    /// lookups, after the metadata merge has produced the final map.
    pub fn with_container_env(mut self, env: HashMap<String, String>) -> Self {
        self.container_env = env;
        self
    }
}

/// Record of what a substitution pass did.
#[derive(Debug, Clone, Default)]
pub struct SubstitutionReport {
    /// Variable expression -> resolved value
    pub replacements: HashMap<String, String>,
    /// Expressions left verbatim
    pub unknown_variables: Vec<String>,
}

impl SubstitutionReport {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Expand all tokens in a string.
pub fn substitute_string(
    input: &str,
    context: &SubstitutionContext,
    report: &mut SubstitutionReport,
) -> String {
    let regex =
        regex::Regex::new(VARIABLE_PATTERN).expect("variable substitution regex should be valid");

    regex
        .replace_all(input, |caps: &regex::Captures| {
            let expr = &caps[1];
            match resolve_variable(expr, context) {
                Some(value) => {
                    report.replacements.insert(expr.to_string(), value.clone());
                    value
                }
                None => {
                    report.unknown_variables.push(expr.to_string());
                    format!("${{{}}}", expr)
                }
            }
        })
        .to_string()
}

/// Expand tokens in every string reachable from a JSON value.
pub fn substitute_json_value(
    value: &Value,
    context: &SubstitutionContext,
    report: &mut SubstitutionReport,
) -> Value {
    match value {
        Value::String(s) => Value::String(substitute_string(s, context, report)),
        Value::Array(arr) => Value::Array(
            arr.iter()
                .map(|v| substitute_json_value(v, context, report))
                .collect(),
        ),
        Value::Object(obj) => Value::Object(
            obj.iter()
                .map(|(k, v)| (k.clone(), substitute_json_value(v, context, report)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Resolve one variable expression. Returns `None` for names outside the
/// supported set, which leaves the token untouched.
fn resolve_variable(expr: &str, context: &SubstitutionContext) -> Option<String> {
    // Split `name[:arg[:default]]`; a default may itself contain colons.
    let (name, rest) = match expr.split_once(':') {
        Some((name, rest)) => (name, Some(rest)),
        None => (expr, None),
    };

    match (name, rest) {
        ("localWorkspaceFolder", None) => Some(context.local_workspace_folder.clone()),
        ("localWorkspaceFolderBasename", None) => Some(basename(&context.local_workspace_folder)),
        ("containerWorkspaceFolder", None) => Some(context.container_workspace_folder.clone()),
        ("containerWorkspaceFolderBasename", None) => {
            Some(basename(&context.container_workspace_folder))
        }
        ("devcontainerId", None) => Some(context.workspace_id.clone()),
        ("pathSeparator", None) => Some(MAIN_SEPARATOR.to_string()),
        ("userHome", None) => Some(
            context
                .local_env
                .get("HOME")
                .cloned()
                .unwrap_or_default(),
        ),
        ("localEnv" | "env", Some(rest)) => {
            let (var, default) = match rest.split_once(':') {
                Some((var, default)) => (var, Some(default)),
                None => (rest, None),
            };
            match context.local_env.get(var) {
                Some(value) => Some(value.clone()),
                None => Some(default.unwrap_or("").to_string()),
            }
        }
        ("containerEnv", Some(var)) => {
            Some(context.container_env.get(var).cloned().unwrap_or_default())
        }
        _ => None,
    }
}

fn basename(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn context(dir: &TempDir) -> SubstitutionContext {
        SubstitutionContext::new(dir.path(), None, false).unwrap()
    }

    #[test]
    fn workspace_folder_expansion() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let mut report = SubstitutionReport::new();

        let result = substitute_string("${localWorkspaceFolder}/src", &ctx, &mut report);
        assert!(result.starts_with(&ctx.local_workspace_folder));
        assert!(result.ends_with("/src"));
        assert!(report.replacements.contains_key("localWorkspaceFolder"));
    }

    #[test]
    fn basenames() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let mut report = SubstitutionReport::new();

        let expected = std::path::Path::new(&ctx.local_workspace_folder)
            .file_name()
            .unwrap()
            .to_string_lossy()
            .to_string();
        assert_eq!(
            substitute_string("${localWorkspaceFolderBasename}", &ctx, &mut report),
            expected
        );
        assert_eq!(
            substitute_string("${containerWorkspaceFolderBasename}", &ctx, &mut report),
            expected,
            "default container folder is /workspaces/<basename>"
        );
    }

    #[test]
    fn container_folder_defaults() {
        let dir = TempDir::new().unwrap();
        let image_ctx = SubstitutionContext::new(dir.path(), None, false).unwrap();
        assert!(image_ctx.container_workspace_folder.starts_with("/workspaces/"));

        let compose_ctx = SubstitutionContext::new(dir.path(), None, true).unwrap();
        assert_eq!(compose_ctx.container_workspace_folder, "/");

        let explicit = SubstitutionContext::new(dir.path(), Some("/srv/app"), true).unwrap();
        assert_eq!(explicit.container_workspace_folder, "/srv/app");
    }

    #[test]
    fn local_env_with_default() {
        const VAR: &str = "DCX_TEST_SUBST_VAR";
        std::env::set_var(VAR, "present");
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let mut report = SubstitutionReport::new();

        assert_eq!(
            substitute_string(&format!("${{localEnv:{VAR}}}"), &ctx, &mut report),
            "present"
        );
        // `env:` alias
        assert_eq!(
            substitute_string(&format!("${{env:{VAR}}}"), &ctx, &mut report),
            "present"
        );
        std::env::remove_var(VAR);

        let ctx = context(&dir);
        assert_eq!(
            substitute_string(&format!("${{localEnv:{VAR}:fallback}}"), &ctx, &mut report),
            "fallback"
        );
        assert_eq!(
            substitute_string(&format!("${{localEnv:{VAR}}}"), &ctx, &mut report),
            ""
        );
    }

    #[test]
    fn container_env_lookup() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir).with_container_env(
            [("PATH_EXTRA".to_string(), "/opt/bin".to_string())]
                .into_iter()
                .collect(),
        );
        let mut report = SubstitutionReport::new();
        assert_eq!(
            substitute_string("${containerEnv:PATH_EXTRA}", &ctx, &mut report),
            "/opt/bin"
        );
    }

    #[test]
    fn unknown_left_verbatim() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let mut report = SubstitutionReport::new();

        let input = "keep ${notAVariable} as-is";
        assert_eq!(substitute_string(input, &ctx, &mut report), input);
        assert_eq!(report.unknown_variables, vec!["notAVariable".to_string()]);
    }

    #[test]
    fn substitution_without_tokens_is_identity() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let mut report = SubstitutionReport::new();

        let input = "plain string $HOME {braces} $";
        assert_eq!(substitute_string(input, &ctx, &mut report), input);
        assert!(report.replacements.is_empty());
    }

    #[test]
    fn json_recursion() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let mut report = SubstitutionReport::new();

        let value = serde_json::json!({
            "cmd": ["echo", "${devcontainerId}"],
            "nested": {"id": "${devcontainerId}"},
            "n": 42
        });
        let out = substitute_json_value(&value, &ctx, &mut report);
        assert_eq!(out["cmd"][1], ctx.workspace_id.as_str());
        assert_eq!(out["nested"]["id"], ctx.workspace_id.as_str());
        assert_eq!(out["n"], 42);
    }

    #[test]
    fn path_separator_and_user_home() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let mut report = SubstitutionReport::new();

        assert_eq!(
            substitute_string("${pathSeparator}", &ctx, &mut report),
            std::path::MAIN_SEPARATOR.to_string()
        );
        let home = substitute_string("${userHome}", &ctx, &mut report);
        assert_eq!(home, std::env::var("HOME").unwrap_or_default());
    }

    #[test]
    fn id_matches_hashing_module() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        assert_eq!(
            ctx.workspace_id,
            crate::hashing::workspace_id(dir.path()).unwrap()
        );
    }
}
