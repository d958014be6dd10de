//! Error types for the transfer engine
//!
//! Two families live here:
//!
//! - [`SessionError`]: failures of the engine itself (bad configuration,
//!   a start request while a transfer is active, a closed channel).
//! - [`TransferError`]: the classified outcome of a transfer that ran and
//!   failed, derived from the raw output of the external command by
//!   [`classify`].
//!
//! # Example
//!
//! ```
//! use skiff_core::error::{TransferError, classify};
//!
//! let output = "ssh: Could not resolve hostname nas.local: Name or service not known\n\
//!               rsync: connection unexpectedly closed (0 bytes received so far) [sender]";
//! let error = classify(output, Some(255), "fallback");
//! assert_eq!(error, TransferError::NetworkUnreachable("nas.local".to_string()));
//! ```

use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::process::SupervisorError;
use crate::schedule::ScheduleError;

/// Errors raised by the session layer
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// A transfer sequence is already active on this session
    #[error("A transfer is already running")]
    AlreadyRunning,

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    /// Operation not allowed in the current state
    #[error("Invalid state: {0}")]
    InvalidState(Cow<'static, str>),

    /// The session event loop is gone
    #[error("Channel error: {0}")]
    Channel(Cow<'static, str>),

    /// Log sink or history I/O failed
    #[error("I/O error: {0}")]
    Io(String),

    /// Credential source failed
    #[error("Credential lookup failed: {0}")]
    Credential(Cow<'static, str>),

    /// Schedule definition rejected
    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    /// Process supervisor rejected the launch
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

impl SessionError {
    /// Create an invalid configuration error with static context
    #[must_use]
    pub const fn invalid_config(context: &'static str) -> Self {
        SessionError::InvalidConfig(Cow::Borrowed(context))
    }

    /// Create an invalid state error with static context
    #[must_use]
    pub const fn invalid_state(context: &'static str) -> Self {
        SessionError::InvalidState(Cow::Borrowed(context))
    }

    /// Create a channel error with static context
    #[must_use]
    pub const fn channel(context: &'static str) -> Self {
        SessionError::Channel(Cow::Borrowed(context))
    }
}

impl From<std::io::Error> for SessionError {
    fn from(err: std::io::Error) -> Self {
        SessionError::Io(err.to_string())
    }
}

/// Result type for session operations
pub type Result<T> = std::result::Result<T, SessionError>;

// ============================================================================
// Transfer failure classification
// ============================================================================

/// Closed taxonomy of transfer failures
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferError {
    /// Remote rejected the credentials or key
    #[error("Authentication failed")]
    AuthenticationFailed,

    /// Host could not be reached
    #[error("Network unreachable: {0}")]
    NetworkUnreachable(String),

    /// Local or remote permission problem on a path
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Destination ran out of space
    #[error("Disk full")]
    DiskFull,

    /// Source or destination path does not exist
    #[error("Path not found: {0}")]
    PathNotFound(String),

    /// Remote host key does not match known_hosts
    #[error("Host key changed or could not be verified")]
    HostKeyChanged,

    /// Transfer command (or a wrapper) is not installed
    #[error("Executable not found")]
    ExecutableNotFound,

    /// Connection or I/O timeout
    #[error("Timed out")]
    Timeout,

    /// Transfer was interrupted
    #[error("Cancelled")]
    Cancelled,

    /// Anything else, with a truncated message
    #[error("{0}")]
    Unknown(String),
}

impl TransferError {
    /// Returns true if retrying without user intervention cannot help
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            TransferError::AuthenticationFailed
                | TransferError::PermissionDenied(_)
                | TransferError::PathNotFound(_)
                | TransferError::HostKeyChanged
                | TransferError::ExecutableNotFound
        )
    }
}

/// Upper bound on the raw output tail kept with a failure
pub const MAX_TAIL_BYTES: usize = 4096;

/// Upper bound on the message carried by [`TransferError::Unknown`]
pub const MAX_UNKNOWN_CHARS: usize = 200;

/// Terminal failure surfaced to the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferFailure {
    /// Classified error
    pub error: TransferError,
    /// Last lines of raw output, at most [`MAX_TAIL_BYTES`]
    pub tail: String,
}

impl TransferFailure {
    /// Build a failure, bounding the tail to its last [`MAX_TAIL_BYTES`]
    pub fn new(error: TransferError, tail: &str) -> Self {
        Self {
            error,
            tail: bounded_tail(tail, MAX_TAIL_BYTES).to_string(),
        }
    }
}

impl std::fmt::Display for TransferFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.error)
    }
}

const AUTH_PHRASES: &[&str] = &[
    "permission denied (publickey",
    "permission denied (password",
    "permission denied, please try again",
    "authentication failed",
    "auth failed",
    "too many authentication failures",
];

const NETWORK_PHRASES: &[&str] = &[
    "could not resolve hostname",
    "name or service not known",
    "network is unreachable",
    "no route to host",
    "connection refused",
    "connect to host",
];

const PERMISSION_PHRASES: &[&str] = &["permission denied", "operation not permitted"];

const DISK_PHRASES: &[&str] = &["no space left on device", "disk quota exceeded", "disk full"];

const PATH_PHRASES: &[&str] = &["no such file or directory", "does not exist"];

const HOST_KEY_PHRASES: &[&str] = &[
    "remote host identification has changed",
    "host key verification failed",
];

const EXECUTABLE_PHRASES: &[&str] = &["command not found", ": not found"];

const TIMEOUT_PHRASES: &[&str] = &["timed out", "timeout"];

const CANCEL_PHRASES: &[&str] = &[
    "received sigint",
    "received sigterm",
    "killed by signal",
    "rsync error: received",
];

/// Classify raw transfer output into a [`TransferError`]
///
/// Phrases are matched case-insensitively, category by category in a fixed
/// order; the first category with a matching line wins. When no phrase
/// matches, well-known rsync exit codes are consulted before falling back
/// to [`TransferError::Unknown`]. Never panics, whatever the input.
pub fn classify(output: &str, exit_code: Option<i32>, host: &str) -> TransferError {
    if find_line(output, AUTH_PHRASES).is_some() {
        return TransferError::AuthenticationFailed;
    }
    if let Some(line) = find_line(output, NETWORK_PHRASES) {
        let host = extract_host(line).unwrap_or_else(|| host.to_string());
        return TransferError::NetworkUnreachable(host);
    }
    if let Some(line) = find_line(output, PERMISSION_PHRASES) {
        return TransferError::PermissionDenied(extract_path(line, PERMISSION_PHRASES));
    }
    if find_line(output, DISK_PHRASES).is_some() {
        return TransferError::DiskFull;
    }
    if let Some(line) = find_line(output, PATH_PHRASES) {
        return TransferError::PathNotFound(extract_path(line, PATH_PHRASES));
    }
    if find_line(output, HOST_KEY_PHRASES).is_some() {
        return TransferError::HostKeyChanged;
    }
    if find_line(output, EXECUTABLE_PHRASES).is_some() {
        return TransferError::ExecutableNotFound;
    }
    if find_line(output, TIMEOUT_PHRASES).is_some() {
        return TransferError::Timeout;
    }
    if find_line(output, CANCEL_PHRASES).is_some() {
        return TransferError::Cancelled;
    }

    // rsync exit codes: 20 = signal, 30 = I/O timeout, 35 = daemon connect timeout
    match exit_code {
        Some(127) => TransferError::ExecutableNotFound,
        Some(30) | Some(35) => TransferError::Timeout,
        Some(20) => TransferError::Cancelled,
        _ => TransferError::Unknown(unknown_message(output, exit_code)),
    }
}

fn find_line<'a>(output: &'a str, phrases: &[&str]) -> Option<&'a str> {
    output.lines().find(|line| {
        let lower = line.to_ascii_lowercase();
        phrases.iter().any(|phrase| lower.contains(phrase))
    })
}

fn extract_host(line: &str) -> Option<String> {
    let lower = line.to_ascii_lowercase();
    for marker in ["connect to host ", "could not resolve hostname "] {
        if let Some(idx) = lower.find(marker) {
            let rest = &line[idx + marker.len()..];
            let host: String = rest
                .chars()
                .take_while(|c| !c.is_whitespace() && *c != ':')
                .collect();
            if !host.is_empty() {
                return Some(host);
            }
        }
    }
    None
}

fn extract_path(line: &str, phrases: &[&str]) -> String {
    // rsync quotes the path: mkdir "/srv/backup" failed: Permission denied (13)
    if let Some(start) = line.find('"') {
        if let Some(len) = line[start + 1..].find('"') {
            return line[start + 1..start + 1 + len].to_string();
        }
    }

    // Otherwise take the colon-delimited segment before the phrase:
    // /bin/sh: /opt/data: No such file or directory
    let lower = line.to_ascii_lowercase();
    let Some(idx) = phrases.iter().filter_map(|p| lower.find(p)).min() else {
        return String::new();
    };
    let before = line[..idx].trim_end().trim_end_matches(':').trim_end();
    before
        .rsplit(": ")
        .next()
        .unwrap_or(before)
        .trim()
        .to_string()
}

fn unknown_message(output: &str, exit_code: Option<i32>) -> String {
    let lines: Vec<&str> = output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    let line = lines
        .iter()
        .rev()
        .find(|l| l.to_ascii_lowercase().contains("error"))
        .or_else(|| lines.last())
        .copied();

    match (line, exit_code) {
        (Some(line), _) => truncate_chars(line, MAX_UNKNOWN_CHARS),
        (None, Some(code)) => format!("exit code {code}"),
        (None, None) => "terminated without output".to_string(),
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

/// Last `max` bytes of `text`, cut at a char boundary
pub(crate) fn bounded_tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}
