//! Feature reference detection and parsing
//!
//! Features can be referenced three ways: OCI registry coordinates, local
//! filesystem paths, or http(s) tarball URLs. Detection rules:
//!
//! 1. Local path if the string begins with `./`, `../`, or `/`
//! 2. Tarball if it begins with `http://` or `https://`
//! 3. OCI otherwise: version after the last `:` not embedded in a path
//!    segment (default `latest`); an explicit registry when the first
//!    segment contains `.` or `:` or equals `localhost`, else `ghcr.io`

use std::path::PathBuf;

use crate::errors::{FetchError, Result};

/// Default registry for bare OCI references.
pub const DEFAULT_REGISTRY: &str = "ghcr.io";

/// A parsed feature reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeatureRef {
    /// OCI registry coordinates
    Oci(OciRef),
    /// Path relative to the configuration directory (or absolute)
    LocalPath(PathBuf),
    /// Absolute http(s) URL of a gzipped tarball
    Tarball(String),
}

impl FeatureRef {
    /// Canonical display form: the OCI canonical id, the path, or the URL.
    pub fn canonical(&self) -> String {
        match self {
            FeatureRef::Oci(oci) => oci.canonical(),
            FeatureRef::LocalPath(path) => path.display().to_string(),
            FeatureRef::Tarball(url) => url.clone(),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, FeatureRef::LocalPath(_))
    }
}

/// OCI coordinates of a feature: `registry/repository/resource:version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OciRef {
    pub registry: String,
    /// Everything between registry and resource; may be empty
    pub repository: String,
    pub resource: String,
    pub version: String,
}

impl OciRef {
    /// Canonical form `registry/repository/resource:version`.
    pub fn canonical(&self) -> String {
        format!("{}/{}:{}", self.registry, self.path(), self.version)
    }

    /// The `repository/resource` path used in registry URLs.
    pub fn path(&self) -> String {
        if self.repository.is_empty() {
            self.resource.clone()
        } else {
            format!("{}/{}", self.repository, self.resource)
        }
    }
}

/// Parse a feature reference string.
pub fn parse_feature_ref(reference: &str) -> Result<FeatureRef> {
    let trimmed = reference.trim();
    if trimmed.is_empty() {
        return Err(FetchError::InvalidReference {
            reference: reference.to_string(),
            message: "reference is empty".to_string(),
        }
        .into());
    }

    if trimmed.starts_with("./") || trimmed.starts_with("../") || trimmed.starts_with('/') {
        return Ok(FeatureRef::LocalPath(PathBuf::from(trimmed)));
    }

    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        return Ok(FeatureRef::Tarball(trimmed.to_string()));
    }

    parse_oci(trimmed).map(FeatureRef::Oci)
}

fn parse_oci(reference: &str) -> Result<OciRef> {
    // The version separator is the last ':' that comes after the last '/',
    // so registry ports ("localhost:5000/f") are not mistaken for versions.
    let (body, version) = match reference.rfind(':') {
        Some(idx) if !reference[idx + 1..].contains('/') => {
            (&reference[..idx], reference[idx + 1..].to_string())
        }
        _ => (reference, "latest".to_string()),
    };

    if version.is_empty() {
        return Err(FetchError::InvalidReference {
            reference: reference.to_string(),
            message: "empty version after ':'".to_string(),
        }
        .into());
    }

    let segments: Vec<&str> = body.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return Err(FetchError::InvalidReference {
            reference: reference.to_string(),
            message: "no path segments".to_string(),
        }
        .into());
    }

    let first = segments[0];
    let has_registry = segments.len() > 1
        && (first.contains('.') || first.contains(':') || first == "localhost");

    let (registry, rest) = if has_registry {
        (first.to_string(), &segments[1..])
    } else {
        (DEFAULT_REGISTRY.to_string(), &segments[..])
    };

    let (resource, repository) = match rest.split_last() {
        Some((resource, repo)) => (resource.to_string(), repo.join("/")),
        None => {
            return Err(FetchError::InvalidReference {
                reference: reference.to_string(),
                message: "missing resource name".to_string(),
            }
            .into())
        }
    };

    Ok(OciRef {
        registry,
        repository,
        resource,
        version,
    })
}
