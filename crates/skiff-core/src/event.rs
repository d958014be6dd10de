//! Events produced while a transfer runs

use std::fmt;

/// Which pipe of the child process a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// Standard output
    Stdout,
    /// Standard error
    Stderr,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
        }
    }
}

/// One parsed output signal or lifecycle marker of an attempt
///
/// Ephemeral: consumed by the session to update its snapshot and forwarded
/// to subscribers, never persisted.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    /// Raw output lines, in per-stream order
    Log(Vec<String>),

    /// The transfer command announced a file or directory
    FileStarted(String),

    /// Current transfer rate as printed by the command (e.g. `1.5MB/s`)
    SpeedSample(String),

    /// Fraction complete of the current file, 0.0 to 1.0
    ProgressSample(f64),

    /// Cumulative bytes from the final summary line
    BytesTransferred(u64),

    /// The process was spawned
    Started,

    /// The process exited; emitted exactly once per launch
    Completed {
        /// Exit status was zero
        success: bool,
        /// Raw exit code, `None` when killed by a signal
        code: Option<i32>,
    },
}

impl TransferEvent {
    /// Returns true for the terminal event of an attempt
    #[must_use]
    pub fn is_completion(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}
