//! Rootfs extraction from a flattened image tarball

use log::trace;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tar::EntryType;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum UnpackError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("Cannot make symlink from {} to {}: {source}", .path.display(), .target.display())]
    SymlinkFailed {
        path: PathBuf,
        target: PathBuf,
        source: io::Error,
    },

    #[error("Cannot make link from {} to {}: {source}", .path.display(), .target.display())]
    LinkFailed {
        path: PathBuf,
        target: PathBuf,
        source: io::Error,
    },
}

/// Extract a flattened rootfs tarball into `target`.
///
/// Directories whose recorded mode is not writable or not searchable are
/// created as 0755 first and chmodded to their real mode once the whole
/// archive has been consumed, so entries inside them can still be written.
pub fn unpack(tarball: &Path, target: &Path) -> Result<(), UnpackError> {
    trace!("unpack {} into {}", tarball.display(), target.display());

    let reader = fs::File::open(tarball)?;
    let mut archive = tar::Archive::new(reader);

    // dir path -> real mode, applied after extraction
    let mut delayed_perms: HashMap<PathBuf, u32> = HashMap::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = target.join(entry.path()?);
        let header = entry.header();
        let kind = header.entry_type();

        trace!("extracting {} ({:?})", path.display(), kind);

        match kind {
            EntryType::Directory => {
                let mut dir_mode = header.mode()? & 0o777;
                // delay application if the mode is not writable or searchable
                if dir_mode & 0o222 == 0 || dir_mode & 0o111 == 0 {
                    delayed_perms.insert(path.clone(), dir_mode);
                    dir_mode = 0o755;
                }
                fs::DirBuilder::new()
                    .recursive(true)
                    .mode(dir_mode)
                    .create(&path)?;
            }
            EntryType::Regular => {
                if let Some(parent) = path.parent() {
                    if !parent.exists() {
                        fs::create_dir_all(parent)?;
                    }
                }
                let mut file = fs::OpenOptions::new()
                    .create(true)
                    .truncate(true)
                    .write(true)
                    .mode(header.mode()? & 0o7777)
                    .open(&path)?;
                io::copy(&mut entry, &mut file)?;
            }
            EntryType::Symlink => {
                // target stored verbatim, no rewriting
                let link_target = entry
                    .link_name()?
                    .map(|t| t.into_owned())
                    .unwrap_or_default();
                if let Some(parent) = path.parent() {
                    if !parent.exists() {
                        fs::create_dir_all(parent)?;
                    }
                }
                std::os::unix::fs::symlink(&link_target, &path).map_err(|e| {
                    UnpackError::SymlinkFailed {
                        path: path.clone(),
                        target: link_target,
                        source: e,
                    }
                })?;
            }
            EntryType::Link => {
                // hardlink targets are archive-relative
                let link_target = target.join(
                    entry
                        .link_name()?
                        .map(|t| t.into_owned())
                        .unwrap_or_default(),
                );
                if let Some(parent) = path.parent() {
                    if !parent.exists() {
                        fs::create_dir_all(parent)?;
                    }
                }
                fs::hard_link(&link_target, &path).map_err(|e| UnpackError::LinkFailed {
                    path: path.clone(),
                    target: link_target,
                    source: e,
                })?;
            }
            // device nodes, fifos and friends are skipped
            _ => {}
        }
    }

    for (path, mode) in delayed_perms {
        fs::set_permissions(&path, fs::Permissions::from_mode(mode))?;
    }

    Ok(())
}
