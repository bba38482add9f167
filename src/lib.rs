//! rcon - a dead simple and somewhat naive container runner
//!
//! The focus is on a single static binary that can run OCI images on older
//! kernels where podman and friends won't work. Isolation is namespaces
//! only: no cgroups, no network setup, no daemon.

pub mod cli;
pub mod image;
pub mod registry;
pub mod runtime;
pub mod storage;

pub use storage::paths;

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "rcon";

/// Default run directory (holds per-instance rootfs tmpfs mounts)
pub const DEFAULT_RUN_DIR: &str = "~/.rcon/run";

/// Default image cache directory
pub const DEFAULT_CACHE_DIR: &str = "~/.rcon/cache";

/// Default registry auth file
pub const DEFAULT_AUTH_FILE: &str = "~/.rcon/auth.json";

/// File name of the flattened rootfs tarball inside a cache entry
pub const FS_TAR: &str = "fs.tar";

/// File name of the raw image config inside a cache entry
pub const CONFIG_JSON: &str = "config.json";

/// Username stored by `login` when none is given (the secret is a token)
pub const TOKEN_USERNAME: &str = "<token>";
