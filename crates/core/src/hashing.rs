//! Content-addressed fingerprints
//!
//! Everything that drives a staleness decision flows through this module:
//! the workspace identifier, the per-input SHA-256 digests, and the overall
//! hash written onto containers at create time. Determinism is load-bearing;
//! identical inputs must hash identically across runs and platforms.

use std::collections::BTreeMap;
use std::path::Path;

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::errors::Result;
use crate::features::ResolvedFeature;
use crate::io::realpath;

/// Delimiter between the four component digests in the overall hash.
const HASH_DELIMITER: &[u8] = b"\n";

/// RFC 4648 base32 alphabet, lowercased. No crate in our stack provides
/// base32, and twelve characters of it is not worth a dependency.
const BASE32_ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";

/// SHA-256 of `data` as a lowercase hex string.
pub fn sha256_hex(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// Encode bytes as unpadded lowercase base32.
fn base32_lower(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len().div_ceil(5) * 8);
    let mut buffer: u64 = 0;
    let mut bits: u32 = 0;
    for &byte in data {
        buffer = (buffer << 8) | u64::from(byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(BASE32_ALPHABET[((buffer >> bits) & 0x1f) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(BASE32_ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize] as char);
    }
    out
}

/// Deterministic workspace identifier:
/// `base32(sha256(realpath(workspace_root)))[0:12]`, lowercased.
///
/// Stable across invocations and across symlinked spellings of the same
/// directory. Doubles as the compose project name and the default SSH host
/// prefix.
pub fn workspace_id(workspace_root: &Path) -> Result<String> {
    let canonical = realpath(workspace_root)?;
    let digest = Sha256::digest(canonical.to_string_lossy().as_bytes());
    Ok(base32_lower(&digest)[..12].to_string())
}

/// Serialize a JSON value with object keys sorted at every level, so that
/// semantically equal option maps hash identically.
pub fn canonical_json(value: &Value) -> String {
    fn sort(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let sorted: BTreeMap<&String, Value> =
                    map.iter().map(|(k, v)| (k, sort(v))).collect();
                serde_json::to_value(sorted).unwrap_or(Value::Null)
            }
            Value::Array(items) => Value::Array(items.iter().map(sort).collect()),
            other => other.clone(),
        }
    }
    sort(value).to_string()
}

/// The content hashes attached to a resolved workspace and compared against
/// the `dcx.config.hash` container label.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ContentHashes {
    /// Digest of the raw configuration file bytes
    pub config: String,
    /// Digest of the dockerfile bytes (empty input when no dockerfile plan)
    pub dockerfile: String,
    /// Digest of the concatenated compose file bytes
    pub compose: String,
    /// Digest of the ordered feature identity multiset
    pub features: String,
    /// Digest of the four above joined with a delimiter
    pub overall: String,
}

impl ContentHashes {
    /// Compute the full hash set from raw inputs.
    ///
    /// `features` must already be in installation order; the identity
    /// strings are sorted before digesting so the hash covers the multiset,
    /// not the ordering.
    pub fn compute(
        config_bytes: &[u8],
        dockerfile_bytes: &[u8],
        compose_bytes: &[u8],
        features: &[ResolvedFeature],
    ) -> Self {
        let config = sha256_hex(config_bytes);
        let dockerfile = sha256_hex(dockerfile_bytes);
        let compose = sha256_hex(compose_bytes);

        let mut identities: Vec<String> = features.iter().map(|f| f.identity()).collect();
        identities.sort();
        let features_digest = sha256_hex(identities.join("\n").as_bytes());

        let mut overall_input = Vec::new();
        for part in [&config, &dockerfile, &compose, &features_digest] {
            overall_input.extend_from_slice(part.as_bytes());
            overall_input.extend_from_slice(HASH_DELIMITER);
        }
        let overall = sha256_hex(&overall_input);

        Self {
            config,
            dockerfile,
            compose,
            features: features_digest,
            overall,
        }
    }

    /// First 12 characters of the overall hash, used in the derived image tag.
    pub fn short(&self) -> &str {
        &self.overall[..12]
    }
}
