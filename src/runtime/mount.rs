//! Mount primitives for container setup

use log::trace;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MountError {
    #[error("Mount failed: {0}")]
    MountFailed(String),

    #[error("Pivot root failed: {0}")]
    PivotFailed(String),

    #[error("Invalid mount spec: {0}")]
    InvalidSpec(String),

    #[error("Tmpfs size must not be negative")]
    NegativeSize,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// One `--mount` request, parsed before any namespace work starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountSpec {
    /// `host:container`
    Bind { source: String, target: String },
    /// `container:tmpfs:bytes`
    Tmpfs { path: String, size: i64 },
}

impl MountSpec {
    pub fn parse(spec: &str) -> Result<Self, MountError> {
        let fields: Vec<&str> = spec.split(':').collect();
        match fields.as_slice() {
            [source, target] => Ok(MountSpec::Bind {
                source: source.to_string(),
                target: target.to_string(),
            }),
            [path, "tmpfs", size] => {
                let size: i64 = size
                    .parse()
                    .map_err(|_| MountError::InvalidSpec(spec.to_string()))?;
                Ok(MountSpec::Tmpfs {
                    path: path.to_string(),
                    size,
                })
            }
            _ => Err(MountError::InvalidSpec(spec.to_string())),
        }
    }
}

/// Mount a fresh procfs at `newroot/proc`
pub fn mount_proc(newroot: &Path) -> Result<(), MountError> {
    trace!("mount /proc in {}", newroot.display());

    let target = newroot.join("proc");
    fs::DirBuilder::new()
        .recursive(true)
        .mode(0o755)
        .create(&target)?;

    mount(
        Some("proc"),
        &target,
        Some("proc"),
        MsFlags::empty(),
        None::<&str>,
    )
    .map_err(|e| MountError::MountFailed(format!("mount proc at {}: {}", target.display(), e)))
}

/// Recursive bind mount from `source` onto `target`.
///
/// Created target directories get mode 0700: bind targets are often
/// secrets and should not widen access.
pub fn mount_bind(source: &Path, target: &Path) -> Result<(), MountError> {
    trace!("bind mount {} => {}", source.display(), target.display());

    if source != target {
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(target)?;
    }

    mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| {
        MountError::MountFailed(format!(
            "bind {} -> {}: {}",
            source.display(),
            target.display(),
            e
        ))
    })
}

/// Mount a size-capped tmpfs at `path`.
///
/// The rootfs tmpfs allows exec; user-requested scratch mounts do not.
pub fn mount_tmpfs(path: &Path, size: i64, allow_exec: bool) -> Result<(), MountError> {
    trace!(
        "tmpfs mount {}, size: {}, no-exec: {}",
        path.display(),
        size,
        !allow_exec
    );

    if size < 0 {
        return Err(MountError::NegativeSize);
    }

    let mut flags =
        MsFlags::MS_NOATIME | MsFlags::MS_SILENT | MsFlags::MS_NODEV | MsFlags::MS_NOSUID;
    if !allow_exec {
        flags |= MsFlags::MS_NOEXEC;
    }

    let options = format!("size={}", size);

    mount(
        Some("tmpfs"),
        path,
        Some("tmpfs"),
        flags,
        Some(options.as_str()),
    )
    .map_err(|e| MountError::MountFailed(format!("tmpfs at {}: {}", path.display(), e)))
}

/// Remount `/` recursively private so the pivot does not propagate back
/// to the host mount table.
pub fn make_root_private() -> Result<(), MountError> {
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_PRIVATE | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| MountError::MountFailed(format!("make root private: {}", e)))
}

/// Plain unmount, used for best-effort cleanup
pub fn unmount(path: &Path) -> Result<(), MountError> {
    umount2(path, MntFlags::empty())
        .map_err(|e| MountError::MountFailed(format!("umount {}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_fields_parse_as_bind() {
        let spec = MountSpec::parse("/etc/resolv.conf:/etc/resolv.conf").unwrap();
        assert_eq!(
            spec,
            MountSpec::Bind {
                source: "/etc/resolv.conf".to_string(),
                target: "/etc/resolv.conf".to_string(),
            }
        );
    }

    #[test]
    fn three_fields_with_tmpfs_parse_as_tmpfs() {
        let spec = MountSpec::parse("/scratch:tmpfs:1048576").unwrap();
        assert_eq!(
            spec,
            MountSpec::Tmpfs {
                path: "/scratch".to_string(),
                size: 1048576,
            }
        );
    }

    #[test]
    fn wrong_arity_is_an_error() {
        assert!(MountSpec::parse("/just-one-field").is_err());
        assert!(MountSpec::parse("a:b:c:d").is_err());
        assert!(MountSpec::parse("").is_err());
    }

    #[test]
    fn middle_field_must_be_tmpfs_literally() {
        assert!(MountSpec::parse("/scratch:ramfs:1024").is_err());
        assert!(MountSpec::parse("/scratch:TMPFS:1024").is_err());
    }

    #[test]
    fn tmpfs_size_must_be_an_integer() {
        assert!(MountSpec::parse("/scratch:tmpfs:lots").is_err());
        assert!(MountSpec::parse("/scratch:tmpfs:").is_err());
    }

    #[test]
    fn negative_tmpfs_size_parses_but_is_refused_at_mount_time() {
        // the parser accepts any integer; the mount primitive rejects it
        let spec = MountSpec::parse("/scratch:tmpfs:-1").unwrap();
        assert_eq!(
            spec,
            MountSpec::Tmpfs {
                path: "/scratch".to_string(),
                size: -1,
            }
        );
        assert!(matches!(
            mount_tmpfs(Path::new("/nonexistent"), -1, false),
            Err(MountError::NegativeSize)
        ));
    }
}
