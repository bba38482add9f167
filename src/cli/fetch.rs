//! Fetch command: warm the cache ahead of a run

use crate::image::{self, CacheError};
use crate::storage::paths;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Fetch `image_ref` into the cache, refreshing whatever is there.
pub fn fetch_image(image_ref: &str, cache_dir: &str, auth_file: &str) -> Result<(), FetchError> {
    let cache_dir = paths::ensure_dir(cache_dir)?;
    let auth_file = paths::expand_path(auth_file);

    // an explicit fetch always re-checks the registry
    image::fetch(image_ref, &cache_dir, &auth_file, true)?;
    Ok(())
}
