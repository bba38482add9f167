//! Run command: parent phase and container-init child phase
//!
//! `run` validates its inputs, enters fresh namespaces and re-invokes the
//! current binary as a hidden `internal-init` child. The child is PID 1
//! of the container: it fetches and materializes the image, wires up the
//! mounts, pivots and finally execs the requested command. The parent
//! only waits and propagates the exit status.

use crate::image::{fetch, prep, CacheError};
use crate::runtime::{
    assemble_command, assemble_env, detach_network, enter_container_namespaces, exec_replace,
    find_env, find_exec_in_path, make_root_private, mount_bind, mount_proc, mount_tmpfs,
    pivot_to_root, spawn_container_init, unmount, ExecError, MountError, MountSpec,
    NamespaceError,
};
use crate::storage::paths;
use log::debug;
use nix::unistd::sethostname;
use std::fs;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum RunError {
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Namespace error: {0}")]
    Namespace(#[from] NamespaceError),

    #[error("Mount error: {0}")]
    Mount(#[from] MountError),

    #[error("Exec error: {0}")]
    Exec(#[from] ExecError),

    #[error("Failed to set hostname: {0}")]
    Hostname(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Everything `run` needs, parsed from the command line
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub image_ref: String,
    pub cmd_args: Vec<String>,
    pub run_dir: String,
    pub cache_dir: String,
    pub auth_file: String,
    pub skip_cache: bool,
    pub mounts: Vec<String>,
    pub envs: Vec<String>,
    pub verbose: bool,
    pub quiet: bool,
}

/// Parent phase. Returns the child's exit code.
pub fn run(opts: &RunOptions) -> Result<i32, RunError> {
    let run_dir = paths::ensure_dir(&opts.run_dir)?;
    let cache_dir = paths::ensure_dir(&opts.cache_dir)?;
    let auth_file = paths::expand_path(&opts.auth_file);

    // surface mount spec errors before any namespace work
    for spec in &opts.mounts {
        MountSpec::parse(spec)?;
    }

    enter_container_namespaces()?;

    let self_exe = std::env::current_exe()?;
    let argv = internal_init_argv(opts, &run_dir, &cache_dir, &auth_file);
    let status = spawn_container_init(&self_exe, &argv)?;

    Ok(exit_code(status))
}

/// Rebuild the argv for the hidden child subcommand, with directories
/// already expanded so the child does no tilde handling of its own.
fn internal_init_argv(
    opts: &RunOptions,
    run_dir: &Path,
    cache_dir: &Path,
    auth_file: &Path,
) -> Vec<String> {
    let mut argv = vec![
        "internal-init".to_string(),
        "--run-dir".to_string(),
        run_dir.display().to_string(),
        "--cache-dir".to_string(),
        cache_dir.display().to_string(),
        "--auth-file".to_string(),
        auth_file.display().to_string(),
    ];
    if opts.skip_cache {
        argv.push("--skip-cache".to_string());
    }
    if opts.verbose {
        argv.push("--verbose".to_string());
    }
    if opts.quiet {
        argv.push("--quiet".to_string());
    }
    for mount in &opts.mounts {
        argv.push("--mount".to_string());
        argv.push(mount.clone());
    }
    for env in &opts.envs {
        argv.push("--env".to_string());
        argv.push(env.clone());
    }
    argv.push("--".to_string());
    argv.push(opts.image_ref.clone());
    argv.extend(opts.cmd_args.iter().cloned());
    argv
}

fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

/// Child phase. Only ever returns on error; success ends in execve.
pub fn internal_init(opts: &RunOptions) -> Result<(), RunError> {
    let run_dir = PathBuf::from(&opts.run_dir);
    let cache_dir = PathBuf::from(&opts.cache_dir);
    let auth_file = PathBuf::from(&opts.auth_file);

    let mounts = opts
        .mounts
        .iter()
        .map(|s| MountSpec::parse(s))
        .collect::<Result<Vec<_>, _>>()?;

    fetch(&opts.image_ref, &cache_dir, &auth_file, opts.skip_cache)?;

    // registry traffic is done; cut the container off the host network
    detach_network()?;

    // keep the pivot from propagating back into the host mount table
    make_root_private()?;

    let root_fs = run_dir.join(Uuid::new_v4().to_string());
    let result = init_and_exec(opts, &cache_dir, &root_fs, &mounts);

    // only reached on failure; the instance mount dies with the
    // namespace, the directory should not outlive us
    let _ = unmount(&root_fs);
    let _ = fs::remove_dir_all(&root_fs);
    result
}

/// Mount setup, pivot and exec. Bind and tmpfs mounts resolve against
/// the host view of the new root, then proc is mounted, then the pivot
/// happens - in that order.
fn init_and_exec(
    opts: &RunOptions,
    cache_dir: &Path,
    root_fs: &Path,
    mounts: &[MountSpec],
) -> Result<(), RunError> {
    let config = prep(&opts.image_ref, cache_dir, root_fs)?;

    for spec in mounts {
        if let MountSpec::Bind { source, target } = spec {
            let target_in_root = root_fs.join(target.trim_start_matches('/'));
            mount_bind(Path::new(source), &target_in_root)?;
        }
    }
    for spec in mounts {
        if let MountSpec::Tmpfs { path, size } = spec {
            let path_in_root = root_fs.join(path.trim_start_matches('/'));
            fs::create_dir_all(&path_in_root)?;
            mount_tmpfs(&path_in_root, *size, false)?;
        }
    }

    mount_proc(root_fs)?;
    pivot_to_root(root_fs)?;

    if !config.hostname.is_empty() {
        sethostname(&config.hostname).map_err(|e| RunError::Hostname(e.to_string()))?;
    }

    let cmd_args = assemble_command(&opts.cmd_args, &config.entrypoint, &config.cmd)?;
    let env = assemble_env(&config.env, &opts.envs);
    let path_var = find_env(&env, "PATH");
    let resolved = find_exec_in_path(&cmd_args[0], &path_var)?;

    debug!("exec {} {:?}", resolved, cmd_args);
    exec_replace(&resolved, &cmd_args, &env)?;
    Ok(())
}
