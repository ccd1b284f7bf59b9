//! Path and filesystem utilities
//!
//! Small helpers shared across the resolver: path realization (symlink
//! resolution), environment-variable expansion in user-supplied paths, and
//! lexical path normalization used by the archive extraction safety check.

use std::env;
use std::path::{Component, Path, PathBuf};

use crate::errors::{ConfigError, Result};

/// Resolve a path to its canonical form, following symlinks.
///
/// The workspace identifier is derived from this value, so two invocations
/// pointing at the same directory through different symlinks agree on
/// identity. Fails when the path does not exist.
pub fn realpath(path: &Path) -> Result<PathBuf> {
    path.canonicalize().map_err(|e| {
        ConfigError::WorkspaceNotFound {
            path: format!("{} ({})", path.display(), e),
        }
        .into()
    })
}

/// Expand `$VAR`, `${VAR}` and a leading `~` in a path-like string.
///
/// Unset variables expand to the empty string. `~` only expands at the very
/// start of the input.
pub fn expand_env(input: &str) -> String {
    if let Some(stripped) = input.strip_prefix('~') {
        if stripped.is_empty() || stripped.starts_with('/') {
            return env::var("HOME").unwrap_or_default() + &expand_env(stripped);
        }
    }

    let mut out = String::with_capacity(input.len());
    let mut chars = input.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some((_, '{')) => {
                chars.next();
                let mut name = String::new();
                for (_, c) in chars.by_ref() {
                    if c == '}' {
                        break;
                    }
                    name.push(c);
                }
                out.push_str(&env::var(&name).unwrap_or_default());
            }
            Some((_, c)) if c.is_ascii_alphabetic() || *c == '_' => {
                let mut name = String::new();
                while let Some((_, c)) = chars.peek() {
                    if c.is_ascii_alphanumeric() || *c == '_' {
                        name.push(*c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push_str(&env::var(&name).unwrap_or_default());
            }
            _ => out.push('$'),
        }
    }
    out
}

/// Lexically normalize a path: collapse `.` segments and resolve `..`
/// against preceding components without touching the filesystem.
///
/// A `..` that would climb above the start of a relative path is kept, which
/// lets [`is_contained`] detect escape attempts.
pub fn lexical_clean(path: &Path) -> PathBuf {
    let mut out: Vec<Component> = Vec::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => match out.last() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) => {}
                _ => out.push(comp),
            },
            other => out.push(other),
        }
    }
    if out.is_empty() {
        PathBuf::from(".")
    } else {
        out.iter().collect()
    }
}

/// Whether `clean(base)/clean(candidate)` stays a descendant of `clean(base)`.
///
/// Used by the tarball extractor: every archive entry must satisfy this
/// before any byte is written.
pub fn is_contained(base: &Path, candidate: &Path) -> bool {
    if candidate.is_absolute() {
        return false;
    }
    let base = lexical_clean(base);
    let joined = lexical_clean(&base.join(candidate));
    joined.starts_with(&base)
}

/// Whether a configured path counts as absolute: Unix-absolute, or a
/// `C:\`-style Windows drive root.
pub fn is_abs_config_path(value: &str) -> bool {
    if value.starts_with('/') {
        return true;
    }
    let mut chars = value.chars();
    matches!(
        (chars.next(), chars.next(), chars.next()),
        (Some(drive), Some(':'), Some('/' | '\\')) if drive.is_ascii_alphabetic()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn realpath_resolves_symlinks() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let target = dir.path().join("target");
        std::fs::create_dir(&target)?;
        #[cfg(unix)]
        {
            let link = dir.path().join("link");
            std::os::unix::fs::symlink(&target, &link)?;
            assert_eq!(realpath(&link)?, realpath(&target)?);
        }
        Ok(())
    }

    #[test]
    fn realpath_missing_path_fails() {
        assert!(realpath(Path::new("/definitely/not/here")).is_err());
    }

    #[test]
    fn expand_env_forms() {
        std::env::set_var("DCX_IO_TEST_VAR", "value");
        assert_eq!(expand_env("a/$DCX_IO_TEST_VAR/b"), "a/value/b");
        assert_eq!(expand_env("a/${DCX_IO_TEST_VAR}/b"), "a/value/b");
        assert_eq!(expand_env("no vars"), "no vars");
        assert_eq!(expand_env("$DCX_IO_TEST_UNSET_VAR/x"), "/x");
        std::env::remove_var("DCX_IO_TEST_VAR");
    }

    #[test]
    fn lexical_clean_collapses() {
        assert_eq!(lexical_clean(Path::new("a/./b/../c")), PathBuf::from("a/c"));
        assert_eq!(lexical_clean(Path::new("/a/../../b")), PathBuf::from("/b"));
        assert_eq!(lexical_clean(Path::new("../x")), PathBuf::from("../x"));
    }

    #[test]
    fn containment_check() {
        let base = Path::new("/cache/feat");
        assert!(is_contained(base, Path::new("install.sh")));
        assert!(is_contained(base, Path::new("sub/./file")));
        assert!(!is_contained(base, Path::new("../escape")));
        assert!(!is_contained(base, Path::new("sub/../../escape")));
        assert!(!is_contained(base, Path::new("/etc/passwd")));
    }

    #[test]
    fn absolute_config_paths() {
        assert!(is_abs_config_path("/workspaces/app"));
        assert!(is_abs_config_path("C:/Users/dev"));
        assert!(is_abs_config_path("c:\\work"));
        assert!(!is_abs_config_path("relative/path"));
        assert!(!is_abs_config_path("./x"));
    }
}
