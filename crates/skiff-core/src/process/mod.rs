//! External process execution and supervision
//!
//! The engine never talks to `tokio::process` directly. A
//! [`ProcessLauncher`] turns a [`CommandSpec`] into a [`ProcessHandle`]
//! (two byte streams, a kill trigger and a single exit notification), and
//! the [`ProcessSupervisor`] owns at most one such handle at a time.
//!
//! ```text
//!  CommandSpec ──► ProcessLauncher ──► ProcessHandle
//!                                         │  stdout ──► LineSplitter ──► extract_all ─┐
//!                                         │  stderr ──► LineSplitter ──► extract_all ─┼─► SupervisorMessage
//!                                         └─ exit ──────────────────────► Completed ──┘
//! ```

pub mod supervisor;
pub mod tokio_launcher;

use std::fmt;
use std::io;

use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::sync::oneshot;

pub use crate::config::CommandSpec;
pub use supervisor::{
    DEFAULT_GRACE_PERIOD, LaunchId, ProcessSupervisor, SupervisorMessage, SupervisorPhase,
};
pub use tokio_launcher::TokioLauncher;

/// Why a process could not be started
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LaunchError {
    /// Executable does not exist or is not on `PATH`
    #[error("Executable not found: {0}")]
    NotFound(String),

    /// Executable exists but may not be run
    #[error("Permission denied launching {0}")]
    PermissionDenied(String),

    /// Any other spawn failure
    #[error("Failed to spawn process: {0}")]
    Spawn(String),
}

impl LaunchError {
    /// Map a spawn I/O error for `program`
    pub fn from_io(program: &str, err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => LaunchError::NotFound(program.to_string()),
            io::ErrorKind::PermissionDenied => LaunchError::PermissionDenied(program.to_string()),
            _ => LaunchError::Spawn(format!("{program}: {err}")),
        }
    }
}

/// Errors from [`ProcessSupervisor::launch`]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SupervisorError {
    /// A process is already active on this supervisor
    #[error("A process is already running on this supervisor")]
    AlreadyRunning,

    /// The launcher could not start the process
    #[error(transparent)]
    Launch(#[from] LaunchError),
}

/// Exit status reported once per process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    /// Exit code was zero
    pub success: bool,
    /// Exit code, `None` when terminated by a signal
    pub code: Option<i32>,
}

impl ExitOutcome {
    /// Outcome of a process that exited with `code`
    #[must_use]
    pub const fn exited(code: i32) -> Self {
        Self {
            success: code == 0,
            code: Some(code),
        }
    }

    /// Outcome of a process whose exit status is unknown or that was killed
    #[must_use]
    pub const fn killed() -> Self {
        Self {
            success: false,
            code: None,
        }
    }
}

impl From<std::process::ExitStatus> for ExitOutcome {
    fn from(status: std::process::ExitStatus) -> Self {
        Self {
            success: status.success(),
            code: status.code(),
        }
    }
}

/// Byte source for one output stream
pub type OutputReader = Box<dyn AsyncRead + Send + Unpin>;

/// Handle to a running external process
pub struct ProcessHandle {
    /// Standard output
    pub stdout: OutputReader,
    /// Standard error
    pub stderr: OutputReader,
    /// Fire (or drop) to terminate the process
    pub kill: oneshot::Sender<()>,
    /// Resolves once with the exit outcome
    pub exit: oneshot::Receiver<ExitOutcome>,
    /// OS process id, if known
    pub pid: Option<u32>,
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle").field("pid", &self.pid).finish()
    }
}

/// Starts external processes
///
/// Implementations must be callable from within a tokio runtime and must
/// not block.
pub trait ProcessLauncher: Send + Sync {
    /// Spawn `spec` and return its handle
    fn launch(&self, spec: &CommandSpec) -> Result<ProcessHandle, LaunchError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_error_from_io() {
        let err = io::Error::new(io::ErrorKind::NotFound, "nope");
        assert_eq!(
            LaunchError::from_io("rsync", &err),
            LaunchError::NotFound("rsync".to_string())
        );

        let err = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        assert_eq!(
            LaunchError::from_io("rsync", &err),
            LaunchError::PermissionDenied("rsync".to_string())
        );

        let err = io::Error::other("boom");
        assert!(matches!(LaunchError::from_io("rsync", &err), LaunchError::Spawn(_)));
    }

    #[test]
    fn test_exit_outcome() {
        assert!(ExitOutcome::exited(0).success);
        assert!(!ExitOutcome::exited(23).success);
        assert_eq!(ExitOutcome::killed().code, None);
    }

    #[test]
    fn test_supervisor_error_display() {
        let err: SupervisorError = LaunchError::NotFound("sshpass".into()).into();
        assert_eq!(err.to_string(), "Executable not found: sshpass");
    }
}
