//! Session state, snapshot and outward events

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::TransferFailure;
use crate::event::TransferEvent;

/// Authoritative state of one session
#[derive(Debug, Clone, PartialEq, Default)]
pub enum TransferState {
    /// Nothing has run yet
    #[default]
    Idle,
    /// An attempt is being launched
    Starting,
    /// The process is running
    Running,
    /// Waiting `delay` before attempt number `attempt`
    Retrying {
        /// Upcoming attempt number (1-based)
        attempt: u32,
        /// Backoff before it starts
        delay: Duration,
    },
    /// Cancel requested, waiting for the process to exit
    Cancelling,
    /// Last sequence completed successfully
    Succeeded,
    /// Last sequence was cancelled by the user
    Cancelled,
    /// Last sequence was stopped by a network loss
    Paused,
    /// Last sequence failed
    Failed(TransferFailure),
}

impl TransferState {
    /// No sequence is in progress
    #[must_use]
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            TransferState::Idle
                | TransferState::Succeeded
                | TransferState::Cancelled
                | TransferState::Paused
                | TransferState::Failed(_)
        )
    }

    /// An attempt is launching, running or waiting to be retried
    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            TransferState::Starting | TransferState::Running | TransferState::Retrying { .. }
        )
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferState::Idle => write!(f, "idle"),
            TransferState::Starting => write!(f, "starting"),
            TransferState::Running => write!(f, "running"),
            TransferState::Retrying { attempt, delay } => {
                write!(f, "retrying (attempt {} in {}s)", attempt, delay.as_secs())
            }
            TransferState::Cancelling => write!(f, "cancelling"),
            TransferState::Succeeded => write!(f, "succeeded"),
            TransferState::Cancelled => write!(f, "cancelled"),
            TransferState::Paused => write!(f, "paused"),
            TransferState::Failed(failure) => write!(f, "failed: {failure}"),
        }
    }
}

/// Why a cancel was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// Explicit user request; ends as [`TransferState::Cancelled`]
    User,
    /// Connectivity lost; ends as [`TransferState::Paused`]
    NetworkLost,
}

/// Derived view of the session, updated before each event is broadcast
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SessionSnapshot {
    /// Current state
    pub state: TransferState,
    /// Number of the current or last attempt, 0 before the first
    pub attempt: u32,
    /// Fraction of the current file, 0.0 to 1.0
    pub progress: f64,
    /// Path last announced by the transfer command
    pub current_file: Option<String>,
    /// Rate last printed by the transfer command
    pub current_speed: Option<String>,
    /// Bytes from the final summary line
    pub bytes_transferred: Option<u64>,
    /// Start of the current or last sequence
    pub started_at: Option<DateTime<Utc>>,
}

/// What subscribers receive
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The state changed
    State(TransferState),
    /// The running attempt produced an event
    Transfer(TransferEvent),
}
