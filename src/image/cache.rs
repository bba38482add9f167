//! Content-addressed image cache
//!
//! Each pulled image lives in a directory named by its config digest,
//! holding the flattened `fs.tar` and the raw `config.json`. A symlink
//! named by the encoded image reference points at the entry currently
//! backing that reference, so a moved tag is refreshed atomically by
//! re-pointing the link and reclaiming the superseded entry.

use crate::image::config::{ConfigFile, ImageConfig};
use crate::registry::{auth, export_flattened, RegistryClient, RegistryError};
use crate::runtime::{mount_tmpfs, MountError};
use crate::storage::{paths, unpack, UnpackError};
use crate::{CONFIG_JSON, FS_TAR};
use base64::{engine::general_purpose::URL_SAFE as BASE64, Engine as _};
use log::{debug, info};
use std::fs;
use std::os::unix::fs::{symlink, DirBuilderExt};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Unpack error: {0}")]
    Unpack(#[from] UnpackError),

    #[error("Mount error: {0}")]
    Mount(#[from] MountError),

    #[error("Image {0} is not in the cache")]
    NotCached(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    ParseError(#[from] serde_json::Error),
}

/// Cache path of the ref symlink for an image reference.
///
/// The url-safe alphabet keeps `/` out of the encoded name.
pub fn ref_link(cache_dir: &Path, image_ref: &str) -> PathBuf {
    cache_dir.join(BASE64.encode(image_ref))
}

/// Make sure `image_ref` is present in the cache.
///
/// With `skip_cache` set the registry is always consulted; otherwise an
/// existing ref link short-circuits the whole operation.
pub fn fetch(
    image_ref: &str,
    cache_dir: &Path,
    auth_file: &Path,
    skip_cache: bool,
) -> Result<(), CacheError> {
    let link = ref_link(cache_dir, image_ref);
    if !skip_cache && paths::path_exists(&link) {
        debug!("{} already cached", image_ref);
        return Ok(());
    }

    let client = RegistryClient::new(auth::default_keychain(auth_file));
    let image = client.resolve(image_ref)?;

    let export_dir = cache_dir.join(image.config_digest());
    fs::DirBuilder::new()
        .recursive(true)
        .mode(0o755)
        .create(&export_dir)?;

    let tar_path = export_dir.join(FS_TAR);
    if !paths::path_exists(&tar_path) {
        info!("exporting {} into {}", image_ref, export_dir.display());
        // a failed export leaves the partial file behind; the next fetch
        // of the same digest overwrites it
        let out = fs::File::create(&tar_path)?;
        export_flattened(&client, &image, out)?;
    }

    let config_path = export_dir.join(CONFIG_JSON);
    if !paths::path_exists(&config_path) {
        fs::write(&config_path, &image.config)?;
    }

    refresh_ref_link(cache_dir, &link, &export_dir)
}

/// Point the ref link at `export_dir`, removing a superseded entry.
///
/// Only one version per reference is retained; the old target directory
/// is reclaimed without checking for other links into it.
fn refresh_ref_link(
    cache_dir: &Path,
    link: &Path,
    export_dir: &Path,
) -> Result<(), CacheError> {
    if paths::path_exists(link) {
        let old = fs::canonicalize(link)?;
        if old == fs::canonicalize(export_dir)? {
            return Ok(());
        }
        debug!("reclaiming stale cache entry {}", old.display());
        fs::remove_file(link)?;
        fs::remove_dir_all(&old)?;
    }

    // prefer a target relative to the cache directory so the cache can be
    // moved wholesale; fall back to an absolute link
    let relative = export_dir
        .strip_prefix(cache_dir)
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| export_dir.to_path_buf());
    if symlink(&relative, link).is_err() {
        symlink(export_dir, link)?;
    }
    Ok(())
}

/// Materialize the cached rootfs for `image_ref` onto a tmpfs at `root_fs`
/// and return the parsed image config.
///
/// The tmpfs is sized at twice the tarball and mounted exec since the
/// container's binaries live on it.
pub fn prep(
    image_ref: &str,
    cache_dir: &Path,
    root_fs: &Path,
) -> Result<ImageConfig, CacheError> {
    let img_dir = ref_link(cache_dir, image_ref);
    let tar_path = img_dir.join(FS_TAR);
    if !paths::path_exists(&tar_path) {
        return Err(CacheError::NotCached(image_ref.to_string()));
    }

    let tar_size = paths::file_size(&tar_path)?;
    fs::create_dir_all(root_fs)?;
    mount_tmpfs(root_fs, (tar_size * 2) as i64, true)?;

    unpack(&tar_path, root_fs)?;

    let data = fs::read(img_dir.join(CONFIG_JSON))?;
    let parsed: ConfigFile = serde_json::from_slice(&data)?;
    Ok(parsed.config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ref_link_name_is_stable_and_slash_free() {
        let dir = Path::new("/cache");
        let link = ref_link(dir, "registry.example.com:5000/team/app:v1");
        let name = link.file_name().unwrap().to_str().unwrap();
        assert!(!name.contains('/'));
        assert_eq!(link, ref_link(dir, "registry.example.com:5000/team/app:v1"));
        assert_ne!(link, ref_link(dir, "registry.example.com:5000/team/app:v2"));
    }

    #[test]
    fn refresh_points_link_at_new_entry_and_reclaims_old() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = tmp.path();
        let old_dir = cache.join("sha256:aaaa");
        let new_dir = cache.join("sha256:bbbb");
        fs::create_dir_all(&old_dir).unwrap();
        fs::create_dir_all(&new_dir).unwrap();
        fs::write(old_dir.join(FS_TAR), b"old").unwrap();

        let link = cache.join("ref");
        symlink(&old_dir, &link).unwrap();

        refresh_ref_link(cache, &link, &new_dir).unwrap();

        assert_eq!(fs::canonicalize(&link).unwrap(), fs::canonicalize(&new_dir).unwrap());
        assert!(!old_dir.exists());
    }

    #[test]
    fn refresh_is_a_noop_when_target_is_current() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = tmp.path();
        let entry = cache.join("sha256:cccc");
        fs::create_dir_all(&entry).unwrap();

        let link = cache.join("ref");
        refresh_ref_link(cache, &link, &entry).unwrap();
        // second refresh must keep both the link and the entry
        refresh_ref_link(cache, &link, &entry).unwrap();

        assert!(entry.exists());
        assert_eq!(fs::canonicalize(&link).unwrap(), fs::canonicalize(&entry).unwrap());
    }

    #[test]
    fn refresh_prefers_a_relative_target() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = tmp.path();
        let entry = cache.join("sha256:dddd");
        fs::create_dir_all(&entry).unwrap();

        let link = cache.join("ref");
        refresh_ref_link(cache, &link, &entry).unwrap();

        let target = fs::read_link(&link).unwrap();
        assert!(target.is_relative());
    }

    #[test]
    fn cached_fetch_skips_the_registry() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = tmp.path();
        let entry = cache.join("sha256:eeee");
        fs::create_dir_all(&entry).unwrap();
        let link = ref_link(cache, "cached.example/app:1");
        symlink(&entry, &link).unwrap();

        // no registry at this name; success proves no network was touched
        fetch(
            "cached.example/app:1",
            cache,
            Path::new("/nonexistent/auth.json"),
            false,
        )
        .unwrap();
    }
}
