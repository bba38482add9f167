//! Command assembly, PATH resolution and exec inside the container

use nix::sys::prctl;
use nix::sys::signal::Signal;
use nix::unistd::execve;
use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("no command to run")]
    NoCommand,

    #[error("{0} not found in PATH")]
    NotFound(String),

    #[error("{0} is not an executable file")]
    NotExecutable(String),

    #[error("Failed to execute: {0}")]
    ExecFailed(String),

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}

/// User args replace `Cmd`; `Entrypoint` is always prepended.
pub fn assemble_command(
    user_args: &[String],
    entrypoint: &[String],
    cmd: &[String],
) -> Result<Vec<String>, ExecError> {
    let mut cmd_args = if user_args.is_empty() {
        cmd.to_vec()
    } else {
        user_args.to_vec()
    };

    if !entrypoint.is_empty() {
        let mut full = entrypoint.to_vec();
        full.append(&mut cmd_args);
        cmd_args = full;
    }

    if cmd_args.is_empty() {
        return Err(ExecError::NoCommand);
    }
    Ok(cmd_args)
}

/// Image environment first, then `--env` requests in order.
///
/// A bare `KEY` inherits the value from the current process environment.
pub fn assemble_env(config_env: &[String], extra: &[String]) -> Vec<String> {
    let mut env = config_env.to_vec();
    for entry in extra {
        if entry.contains('=') {
            env.push(entry.clone());
        } else {
            let value = std::env::var(entry).unwrap_or_default();
            env.push(format!("{}={}", entry, value));
        }
    }
    env
}

/// Last assignment of `key` wins, mirroring how a shell would read it
pub fn find_env(env: &[String], key: &str) -> String {
    let mut value = String::new();
    for kv in env {
        if let Some((k, v)) = kv.split_once('=') {
            if k == key {
                value = v.to_string();
            }
        }
    }
    value
}

fn find_executable(path: &Path) -> Result<(), ExecError> {
    let meta = fs::metadata(path).map_err(ExecError::IoError)?;
    if meta.is_file() && meta.permissions().mode() & 0o111 != 0 {
        Ok(())
    } else {
        Err(ExecError::NotExecutable(path.display().to_string()))
    }
}

/// Resolve `file` the way execvp would, but against an explicit PATH.
///
/// A name containing a slash is probed directly. Empty PATH elements
/// mean the current directory, per shell convention.
pub fn find_exec_in_path(file: &str, path: &str) -> Result<String, ExecError> {
    if file.contains('/') {
        find_executable(Path::new(file))?;
        return Ok(file.to_string());
    }

    let path = if path.is_empty() {
        std::env::var("PATH").unwrap_or_default()
    } else {
        path.to_string()
    };

    for dir in path.split(':') {
        let dir = if dir.is_empty() { "." } else { dir };
        let candidate = PathBuf::from(dir).join(file);
        if find_executable(&candidate).is_ok() {
            return Ok(candidate.to_string_lossy().into_owned());
        }
    }

    Err(ExecError::NotFound(file.to_string()))
}

/// Replace the current process with `path`, using exactly the given
/// argv and environment.
pub fn exec_replace(path: &str, args: &[String], env: &[String]) -> Result<(), ExecError> {
    let c_path = CString::new(path)
        .map_err(|e| ExecError::ExecFailed(format!("invalid path string: {}", e)))?;
    let c_args = args
        .iter()
        .map(|a| CString::new(a.as_str()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ExecError::ExecFailed(format!("invalid argument string: {}", e)))?;
    let c_env = env
        .iter()
        .map(|e| CString::new(e.as_str()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ExecError::ExecFailed(format!("invalid environment string: {}", e)))?;

    execve(&c_path, &c_args, &c_env)
        .map_err(|e| ExecError::ExecFailed(format!("{}: {}", path, e)))?;

    Ok(())
}

/// Spawn the current binary again as the container init child and wait.
///
/// The child gets SIGTERM when this process dies, and that disposition
/// survives the final execve into the container command.
pub fn spawn_container_init(self_exe: &Path, argv: &[String]) -> Result<ExitStatus, ExecError> {
    let mut command = Command::new(self_exe);
    command
        .args(argv)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());

    unsafe {
        command.pre_exec(|| {
            prctl::set_pdeathsig(Signal::SIGTERM).map_err(io::Error::from)?;
            Ok(())
        });
    }

    let mut child = command.spawn()?;
    Ok(child.wait()?)
}
