//! Feature cache maintenance. The cache is never garbage-collected
//! implicitly; this is the one place it gets removed.

use dcx_core::errors::Result;
use dcx_core::oci::FeatureFetcher;
use serde_json::json;
use tracing::info;

pub fn clean() -> Result<()> {
    let fetcher = FeatureFetcher::default_fetcher()?;
    let dir = fetcher.cache_dir().to_path_buf();
    fetcher.clean_cache()?;
    info!(dir = %dir.display(), "feature cache removed");
    println!("{}", json!({ "removed": dir.display().to_string() }));
    Ok(())
}
