//! Feature fetching
//!
//! Three fetch strategies: OCI registry (manifest then layer blob, with a
//! Bearer-token handshake on 401), HTTPS tarball, and local path. Remote
//! content lands in a content-addressed cache under
//! `${XDG_CACHE_HOME:-$HOME/.cache}/dcx/features/`; local features are read
//! in place and never cached.
//!
//! Archive extraction refuses any entry whose cleaned path would escape the
//! destination directory, and an archive with zero entries is an error.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::Read;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::config::FeatureOptionValue;
use crate::errors::{DcxError, FetchError, Result};
use crate::feature_ref::{parse_feature_ref, FeatureRef, OciRef};
use crate::features::{FeatureManifest, ResolvedFeature, FEATURE_MANIFEST};
use crate::hashing::sha256_hex;
use crate::io::{is_contained, lexical_clean};

/// Per-request deadline for registry and tarball HTTP operations.
pub const HTTP_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Accept header offered when fetching manifests.
const MANIFEST_ACCEPT: &str =
    "application/vnd.oci.image.manifest.v1+json, application/vnd.docker.distribution.manifest.v2+json";

/// A minimal HTTP response: status, headers, body.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// HTTP client seam; the production implementation wraps reqwest, tests
/// substitute their own.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn get(&self, url: &str, headers: &[(String, String)]) -> Result<HttpResponse>;
}

/// reqwest-backed client with the registry timeout applied per request.
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    inner: reqwest::Client,
}

impl ReqwestClient {
    pub fn new() -> Result<Self> {
        let inner = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| FetchError::FetchFailed {
                reference: "<client>".to_string(),
                message: e.to_string(),
            })?;
        Ok(Self { inner })
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn get(&self, url: &str, headers: &[(String, String)]) -> Result<HttpResponse> {
        let mut request = self.inner.get(url);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        let response = request.send().await.map_err(|e| FetchError::FetchFailed {
            reference: url.to_string(),
            message: e.to_string(),
        })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| Some((k.to_string(), v.to_str().ok()?.to_string())))
            .collect();
        let body = response.bytes().await.map_err(|e| FetchError::FetchFailed {
            reference: url.to_string(),
            message: e.to_string(),
        })?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

/// OCI image manifest, reduced to the fields consumed here.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(default)]
    pub schema_version: u32,
    #[serde(default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub layers: Vec<Layer>,
}

/// One manifest layer.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Layer {
    pub media_type: String,
    pub digest: String,
    #[serde(default)]
    pub size: u64,
}

/// Token endpoint response shape.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

/// Resolve the feature cache directory:
/// `${XDG_CACHE_HOME:-$HOME/.cache}/dcx/features/`.
pub fn features_cache_dir() -> PathBuf {
    let base = std::env::var("XDG_CACHE_HOME")
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string()))
                .join(".cache")
        });
    base.join("dcx").join("features")
}

/// Cache key for a remote feature: `SHA256(canonical)[0:16]`.
pub fn cache_key(canonical: &str) -> String {
    sha256_hex(canonical.as_bytes())[..16].to_string()
}

/// A fetched feature: its on-disk content and parsed manifest.
#[derive(Debug, Clone)]
pub struct FetchedFeature {
    pub content_dir: PathBuf,
    pub manifest: FeatureManifest,
}

/// Fetches features from registries, tarball URLs, and local paths.
pub struct FeatureFetcher<C: HttpClient> {
    client: C,
    cache_dir: PathBuf,
}

impl FeatureFetcher<ReqwestClient> {
    /// Production fetcher with the default cache directory.
    pub fn default_fetcher() -> Result<Self> {
        Ok(Self::with_cache_dir(
            ReqwestClient::new()?,
            features_cache_dir(),
        ))
    }
}

impl<C: HttpClient> FeatureFetcher<C> {
    pub fn with_cache_dir(client: C, cache_dir: PathBuf) -> Self {
        Self { client, cache_dir }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// The underlying HTTP client; tests assert on recorded requests.
    pub fn client(&self) -> &C {
        &self.client
    }

    /// Remove the entire feature cache. Used by the explicit cache-cleanup
    /// command; nothing else ever garbage-collects it.
    pub fn clean_cache(&self) -> Result<()> {
        if self.cache_dir.exists() {
            std::fs::remove_dir_all(&self.cache_dir)?;
        }
        Ok(())
    }

    /// Fetch one feature. `config_dir` anchors relative local paths;
    /// `force` drops any existing cache entry first.
    #[instrument(skip(self, cancel), fields(reference = %reference.canonical()))]
    pub async fn fetch(
        &self,
        reference: &FeatureRef,
        config_dir: &Path,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<FetchedFeature> {
        match reference {
            FeatureRef::LocalPath(path) => self.fetch_local(path, config_dir),
            FeatureRef::Oci(oci) => {
                let canonical = reference.canonical();
                let dir = match self.cache_lookup(&canonical, force)? {
                    Some(dir) => dir,
                    None => {
                        let (data, gzipped) = self.fetch_oci_archive(oci, cancel).await?;
                        self.cache_store(&canonical, &data, gzipped)?
                    }
                };
                let manifest = FeatureManifest::load(&dir)?;
                Ok(FetchedFeature {
                    content_dir: dir,
                    manifest,
                })
            }
            FeatureRef::Tarball(url) => {
                let dir = match self.cache_lookup(url, force)? {
                    Some(dir) => dir,
                    None => {
                        let (data, gzipped) = self.fetch_tarball_archive(url, cancel).await?;
                        self.cache_store(url, &data, gzipped)?
                    }
                };
                let manifest = FeatureManifest::load(&dir)?;
                Ok(FetchedFeature {
                    content_dir: dir,
                    manifest,
                })
            }
        }
    }

    fn fetch_local(&self, path: &Path, config_dir: &Path) -> Result<FetchedFeature> {
        let dir = if path.is_absolute() {
            path.to_path_buf()
        } else {
            lexical_clean(&config_dir.join(path))
        };
        if !dir.is_dir() {
            return Err(FetchError::LocalFeature {
                path: dir.display().to_string(),
                message: "not a directory".to_string(),
            }
            .into());
        }
        let manifest = FeatureManifest::load(&dir)?;
        Ok(FetchedFeature {
            content_dir: dir,
            manifest,
        })
    }

    /// Check the content-addressed cache for an entry. `force` drops any
    /// existing entry; a partial entry (missing manifest) from a crashed
    /// peer is removed and re-fetched, never trusted.
    fn cache_lookup(&self, canonical: &str, force: bool) -> Result<Option<PathBuf>> {
        let key = cache_key(canonical);
        let entry = self.cache_dir.join(&key);

        if force && entry.exists() {
            debug!(cache_key = %key, "force pull, removing cache entry");
            std::fs::remove_dir_all(&entry)?;
            return Ok(None);
        }
        if entry.join(FEATURE_MANIFEST).is_file() {
            debug!(cache_key = %key, "cache hit");
            return Ok(Some(entry));
        }
        if entry.exists() {
            std::fs::remove_dir_all(&entry)?;
        }
        Ok(None)
    }

    /// Extract downloaded archive bytes into a scratch sibling of the cache
    /// entry, then rename into place.
    fn cache_store(&self, canonical: &str, data: &[u8], gzipped: bool) -> Result<PathBuf> {
        let key = cache_key(canonical);
        let entry = self.cache_dir.join(&key);

        std::fs::create_dir_all(&self.cache_dir)?;
        let scratch = self.cache_dir.join(format!("{}.partial", key));
        if scratch.exists() {
            std::fs::remove_dir_all(&scratch)?;
        }
        std::fs::create_dir_all(&scratch)?;

        if let Err(e) = extract_archive(data, &scratch, canonical, gzipped) {
            let _ = std::fs::remove_dir_all(&scratch);
            return Err(e);
        }

        std::fs::rename(&scratch, &entry)?;
        info!(cache_key = %key, "feature cached");
        Ok(entry)
    }

    /// Full OCI fetch: anonymous probe, token handshake on 401, manifest
    /// GET, first tar layer blob GET. Returns the blob and whether its media
    /// type declares gzip.
    async fn fetch_oci_archive(
        &self,
        oci: &OciRef,
        cancel: &CancellationToken,
    ) -> Result<(Bytes, bool)> {
        let token = self.acquire_token(oci, cancel).await?;
        let mut headers = vec![("Accept".to_string(), MANIFEST_ACCEPT.to_string())];
        if let Some(token) = &token {
            headers.push(("Authorization".to_string(), format!("Bearer {}", token)));
        }

        let manifest_url = format!(
            "https://{}/v2/{}/manifests/{}",
            oci.registry,
            oci.path(),
            oci.version
        );
        let response = self.get(&manifest_url, &headers, cancel).await?;
        if response.status != 200 {
            return Err(FetchError::FetchFailed {
                reference: oci.canonical(),
                message: format!("manifest GET returned {}", response.status),
            }
            .into());
        }

        let manifest: Manifest =
            serde_json::from_slice(&response.body).map_err(|e| FetchError::FetchFailed {
                reference: oci.canonical(),
                message: format!("invalid manifest: {}", e),
            })?;

        let layer = manifest
            .layers
            .iter()
            .find(|l| l.media_type.contains("tar"))
            .ok_or_else(|| FetchError::FetchFailed {
                reference: oci.canonical(),
                message: "no tar layer in manifest".to_string(),
            })?;
        debug!(digest = %layer.digest, media_type = %layer.media_type, "selected layer");

        let blob_url = format!(
            "https://{}/v2/{}/blobs/{}",
            oci.registry,
            oci.path(),
            layer.digest
        );
        let blob = self.get(&blob_url, &headers, cancel).await?;
        if blob.status != 200 {
            return Err(FetchError::FetchFailed {
                reference: oci.canonical(),
                message: format!("blob GET returned {}", blob.status),
            }
            .into());
        }

        Ok((blob.body, layer.media_type.contains("gzip")))
    }

    /// Anonymous `/v2/` probe; a 401 with a Bearer challenge triggers the
    /// token exchange. Registries that answer 200 need no token.
    async fn acquire_token(
        &self,
        oci: &OciRef,
        cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        let probe_url = format!("https://{}/v2/", oci.registry);
        let probe = self.get(&probe_url, &[], cancel).await?;
        if probe.status != 401 {
            return Ok(None);
        }

        let challenge = probe
            .header("www-authenticate")
            .ok_or_else(|| FetchError::TokenAcquisition {
                registry: oci.registry.clone(),
                message: "401 without WWW-Authenticate".to_string(),
            })?;
        let params = parse_bearer_challenge(challenge).ok_or_else(|| {
            FetchError::TokenAcquisition {
                registry: oci.registry.clone(),
                message: format!("unsupported challenge '{}'", challenge),
            }
        })?;

        let realm = params
            .get("realm")
            .ok_or_else(|| FetchError::TokenAcquisition {
                registry: oci.registry.clone(),
                message: "challenge missing realm".to_string(),
            })?;
        let mut token_url = format!("{}?scope=repository:{}:pull", realm, oci.path());
        if let Some(service) = params.get("service") {
            token_url.push_str(&format!("&service={}", service));
        }

        // Private registries accept Basic credentials on the token request.
        let mut token_headers = Vec::new();
        if let Some(basic) = env_basic_credentials() {
            token_headers.push(("Authorization".to_string(), basic));
        }

        let response = self.get(&token_url, &token_headers, cancel).await?;
        if response.status != 200 {
            return Err(FetchError::TokenAcquisition {
                registry: oci.registry.clone(),
                message: format!("token endpoint returned {}", response.status),
            }
            .into());
        }

        let token: TokenResponse =
            serde_json::from_slice(&response.body).map_err(|e| FetchError::TokenAcquisition {
                registry: oci.registry.clone(),
                message: format!("invalid token response: {}", e),
            })?;
        token
            .token
            .or(token.access_token)
            .map(Some)
            .ok_or_else(|| {
                FetchError::TokenAcquisition {
                    registry: oci.registry.clone(),
                    message: "token response had neither token nor access_token".to_string(),
                }
                .into()
            })
    }

    async fn fetch_tarball_archive(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<(Bytes, bool)> {
        let response = self.get(url, &[], cancel).await?;
        if response.status != 200 {
            return Err(FetchError::FetchFailed {
                reference: url.to_string(),
                message: format!("GET returned {}", response.status),
            }
            .into());
        }
        // HTTP feature tarballs are assumed gzipped.
        Ok((response.body, true))
    }

    async fn get(
        &self,
        url: &str,
        headers: &[(String, String)],
        cancel: &CancellationToken,
    ) -> Result<HttpResponse> {
        tokio::select! {
            _ = cancel.cancelled() => Err(DcxError::Cancelled),
            response = self.client.get(url, headers) => response,
        }
    }

    /// Resolve every declared feature plus its transitive `dependsOn`
    /// closure, fetching until a fixpoint. Workspace-declared features are
    /// processed first, so an explicit declaration's options always beat
    /// option overrides carried by a dependency edge.
    #[instrument(skip_all, fields(declared = declared.len()))]
    pub async fn resolve_features(
        &self,
        declared: &IndexMap<String, FeatureOptionValue>,
        config_dir: &Path,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<ResolvedFeature>> {
        let mut queue: VecDeque<(String, IndexMap<String, Value>)> = VecDeque::new();
        let mut seen: HashSet<String> = HashSet::new();
        for (reference, value) in declared {
            if value.enabled() {
                queue.push_back((reference.clone(), value.options()));
            } else {
                debug!(reference = %reference, "feature disabled, skipping");
                // A disabled feature stays disabled even when a dependency
                // edge names it; ordering reports the broken edge.
                if let Ok(parsed) = parse_feature_ref(reference) {
                    seen.insert(parsed.canonical());
                }
            }
        }

        let mut resolved: Vec<ResolvedFeature> = Vec::new();

        while let Some((ref_string, options)) = queue.pop_front() {
            let reference = parse_feature_ref(&ref_string)?;
            let canonical = reference.canonical();
            if !seen.insert(canonical.clone()) {
                continue;
            }

            let fetched = self.fetch(&reference, config_dir, force, cancel).await?;
            let feature = ResolvedFeature {
                id: if fetched.manifest.id.is_empty() {
                    ref_string.clone()
                } else {
                    fetched.manifest.id.clone()
                },
                reference,
                options,
                content_dir: fetched.content_dir,
                manifest: fetched.manifest,
            };

            for (dep_ref, dep_options) in feature.depends_on() {
                let dep_options = match dep_options {
                    Value::Object(map) => map.clone().into_iter().collect(),
                    _ => IndexMap::new(),
                };
                queue.push_back((dep_ref.clone(), dep_options));
            }

            resolved.push(feature);
        }

        info!(resolved = resolved.len(), "feature set resolved");
        Ok(resolved)
    }
}

/// Basic credentials from `DCX_REGISTRY_USER` / `DCX_REGISTRY_PASS`, as an
/// `Authorization` header value.
fn env_basic_credentials() -> Option<String> {
    use base64::Engine;
    let user = std::env::var("DCX_REGISTRY_USER").ok().filter(|u| !u.is_empty())?;
    let pass = std::env::var("DCX_REGISTRY_PASS").unwrap_or_default();
    let encoded =
        base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", user, pass));
    Some(format!("Basic {}", encoded))
}

/// Parse a `Bearer realm=..,service=..,scope=..` challenge into its
/// parameters. Returns `None` for non-Bearer schemes.
pub fn parse_bearer_challenge(header: &str) -> Option<HashMap<String, String>> {
    let rest = header.trim().strip_prefix("Bearer ")?;
    let mut params = HashMap::new();
    for part in rest.split(',') {
        if let Some((key, value)) = part.trim().split_once('=') {
            params.insert(
                key.trim().to_ascii_lowercase(),
                value.trim().trim_matches('"').to_string(),
            );
        }
    }
    Some(params)
}

/// Extract a (possibly gzipped) tar archive into `dest`.
///
/// Every entry path must stay inside `dest` after lexical cleaning;
/// offending entries abort the extraction before anything is written for
/// them. Symlinks are recreated as symlinks without target rewriting.
pub fn extract_archive(data: &[u8], dest: &Path, reference: &str, gzipped: bool) -> Result<()> {
    let reader: Box<dyn Read + '_> = if gzipped {
        Box::new(flate2::read::GzDecoder::new(data))
    } else {
        Box::new(data)
    };
    let mut archive = tar::Archive::new(reader);

    let mut entry_count = 0usize;
    for entry in archive.entries().map_err(|e| FetchError::InvalidArchive {
        reference: reference.to_string(),
        message: e.to_string(),
    })? {
        let mut entry = entry.map_err(|e| FetchError::InvalidArchive {
            reference: reference.to_string(),
            message: e.to_string(),
        })?;

        let name = entry
            .path()
            .map_err(|e| FetchError::InvalidArchive {
                reference: reference.to_string(),
                message: e.to_string(),
            })?
            .into_owned();

        if !is_contained(dest, &name) {
            return Err(FetchError::UnsafePath {
                entry: name.display().to_string(),
            }
            .into());
        }
        let target = dest.join(lexical_clean(&name));

        match entry.header().entry_type() {
            tar::EntryType::Directory => {
                std::fs::create_dir_all(&target)?;
            }
            tar::EntryType::Symlink => {
                let link = entry
                    .link_name()
                    .map_err(|e| FetchError::InvalidArchive {
                        reference: reference.to_string(),
                        message: e.to_string(),
                    })?
                    .ok_or_else(|| FetchError::InvalidArchive {
                        reference: reference.to_string(),
                        message: format!("symlink entry '{}' without target", name.display()),
                    })?;
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                #[cfg(unix)]
                std::os::unix::fs::symlink(&link, &target)?;
                #[cfg(not(unix))]
                tracing::warn!(entry = %name.display(), "skipping symlink on non-unix host");
            }
            _ => {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let mut file = std::fs::File::create(&target)?;
                std::io::copy(&mut entry, &mut file)?;
                #[cfg(unix)]
                if let Ok(mode) = entry.header().mode() {
                    use std::os::unix::fs::PermissionsExt;
                    std::fs::set_permissions(&target, std::fs::Permissions::from_mode(mode))?;
                }
            }
        }
        entry_count += 1;
    }

    if entry_count == 0 {
        return Err(FetchError::EmptyArchive {
            reference: reference.to_string(),
        }
        .into());
    }
    Ok(())
}
