//! Container runtime: namespaces, mounts, pivot and exec

mod exec;
mod mount;
mod namespace;
mod pivot;

pub use exec::{
    assemble_command, assemble_env, exec_replace, find_env, find_exec_in_path,
    spawn_container_init, ExecError,
};
pub use mount::{
    make_root_private, mount_bind, mount_proc, mount_tmpfs, unmount, MountError, MountSpec,
};
pub use namespace::{detach_network, enter_container_namespaces, NamespaceError};
pub use pivot::pivot_to_root;
