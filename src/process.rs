use std::path::PathBuf;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("read pid file {path:?} failed, {err}")]
    ReadPidFile {
        path: PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("invalid pid {content:?} in {path:?}")]
    InvalidPid { path: PathBuf, content: String },
    #[error("send SIGHUP to {pid} failed, {err}")]
    Signal {
        pid: i32,
        #[source]
        err: nix::errno::Errno,
    },
}

/// The capability to find the agent process and tell it to reload its config.
pub trait ProcessController: Send + Sync {
    fn current_pid(&self) -> Result<i32, ProcessError>;

    fn reload(&self, pid: i32) -> Result<(), ProcessError>;
}

/// Locates the agent through the pid file it writes, and reloads it with `SIGHUP`.
#[derive(Clone, Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ProcessController for PidFile {
    fn current_pid(&self) -> Result<i32, ProcessError> {
        let content =
            std::fs::read_to_string(&self.path).map_err(|err| ProcessError::ReadPidFile {
                path: self.path.clone(),
                err,
            })?;

        parse_pid(&content).ok_or_else(|| ProcessError::InvalidPid {
            path: self.path.clone(),
            content,
        })
    }

    fn reload(&self, pid: i32) -> Result<(), ProcessError> {
        kill(Pid::from_raw(pid), Signal::SIGHUP).map_err(|err| ProcessError::Signal { pid, err })
    }
}

/// Only one trailing newline is stripped, anything else around the number
/// makes the content invalid. Non-positive values address process groups
/// rather than a process, so they are rejected as well.
fn parse_pid(content: &str) -> Option<i32> {
    let trimmed = content.strip_suffix('\n').unwrap_or(content);

    match trimmed.parse::<i32>() {
        Ok(pid) if pid > 0 => Some(pid),
        _ => None,
    }
}
