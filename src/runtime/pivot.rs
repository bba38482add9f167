//! The pivot_root dance

use crate::runtime::mount::{mount_bind, MountError};
use log::trace;
use nix::mount::{umount2, MntFlags};
use nix::unistd::{chdir, pivot_root};
use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;

/// Where the old root is parked between pivot and detach
const PUT_OLD: &str = ".pivot_root";

/// Swap the process root for `newroot` and drop the old one.
///
/// pivot_root refuses to operate when newroot shares a filesystem with
/// the current root, so newroot is first bind-mounted onto itself to
/// lift it onto its own mount. Any failure short-circuits; no unwinding
/// is attempted.
pub fn pivot_to_root(newroot: &Path) -> Result<(), MountError> {
    trace!("pivot_root into {}", newroot.display());

    mount_bind(newroot, newroot)?;

    let put_old = newroot.join(PUT_OLD);
    fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(&put_old)?;

    pivot_root(newroot, &put_old)
        .map_err(|e| MountError::PivotFailed(format!("pivot_root: {}", e)))?;

    chdir("/").map_err(|e| MountError::PivotFailed(format!("chdir /: {}", e)))?;

    // the old root now lives at /.pivot_root; detach and remove it
    let put_old = Path::new("/").join(PUT_OLD);
    umount2(&put_old, MntFlags::MNT_DETACH)
        .map_err(|e| MountError::PivotFailed(format!("umount {}: {}", put_old.display(), e)))?;
    fs::remove_dir(&put_old)?;

    Ok(())
}
