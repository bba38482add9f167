//! Namespace entry for the two run phases
//!
//! The parent enters every namespace the container needs in one step
//! before re-invoking itself; the child only detaches from the host
//! network later, once its registry traffic is done.

use log::trace;
use nix::sched::{unshare, CloneFlags};
use nix::unistd::{getgid, getuid, Gid, Uid};
use std::fs;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NamespaceError {
    #[error("Cannot unshare {what}: {source}")]
    Unshare {
        what: &'static str,
        source: nix::Error,
    },

    #[error("Cannot write {path}: {source}")]
    IdMap {
        path: &'static str,
        source: io::Error,
    },
}

/// The one ID mapping a run uses: root inside the container is the
/// invoking user outside, nothing else is mapped.
struct IdMapping {
    uid: Uid,
    gid: Gid,
}

impl IdMapping {
    fn of_caller() -> Self {
        Self {
            uid: getuid(),
            gid: getgid(),
        }
    }

    /// Install the mapping through /proc/self. Mapping our own ID is
    /// permitted without privileges, but only after setgroups is
    /// denied, and only while the mapping files are still unwritten.
    fn install(&self) -> Result<(), NamespaceError> {
        write_id_file("/proc/self/uid_map", format!("0 {} 1\n", self.uid))?;
        write_id_file("/proc/self/setgroups", "deny".to_string())?;
        write_id_file("/proc/self/gid_map", format!("0 {} 1\n", self.gid))
    }
}

fn write_id_file(path: &'static str, line: String) -> Result<(), NamespaceError> {
    fs::write(path, line).map_err(|source| NamespaceError::IdMap { path, source })
}

/// Parent-phase namespace entry.
///
/// A fresh user namespace comes first, because the root mapping is what
/// grants CAP_SYS_ADMIN for everything after it. Then mount, UTS, IPC
/// and PID are unshared together; the PID namespace only bites for the
/// next child we spawn, which becomes the container's PID 1.
pub fn enter_container_namespaces() -> Result<(), NamespaceError> {
    let mapping = IdMapping::of_caller();
    trace!("new user namespace, container root maps to uid {}", mapping.uid);

    unshare(CloneFlags::CLONE_NEWUSER).map_err(|source| NamespaceError::Unshare {
        what: "user namespace",
        source,
    })?;
    mapping.install()?;

    trace!("new mount, uts, ipc and pid namespaces");
    unshare(
        CloneFlags::CLONE_NEWNS
            | CloneFlags::CLONE_NEWUTS
            | CloneFlags::CLONE_NEWIPC
            | CloneFlags::CLONE_NEWPID,
    )
    .map_err(|source| NamespaceError::Unshare {
        what: "container namespaces",
        source,
    })?;

    Ok(())
}

/// Child-phase network detach.
///
/// Deliberately not part of the parent-phase entry: the child still has
/// to reach the registry before it gives up the host network.
pub fn detach_network() -> Result<(), NamespaceError> {
    trace!("new network namespace");
    unshare(CloneFlags::CLONE_NEWNET).map_err(|source| NamespaceError::Unshare {
        what: "network namespace",
        source,
    })
}
