//! # Skiff Core
//!
//! Transfer orchestration engine for Skiff: drives `rsync` over `ssh` as an
//! external process and turns its output into a consistent, observable
//! transfer state.
//!
//! This crate provides:
//! - Incremental line splitting and event extraction over raw process output
//! - A process supervisor owning at most one external process at a time
//! - Retry with exponential backoff
//! - Network-aware pause on connectivity loss
//! - Interval, daily and weekly schedules with next-run computation
//! - Classification of failures into a closed error taxonomy
//! - The session coordinator tying it all together
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      TransferSession                            │
//! │   (single event loop, authoritative state, history, schedule)   │
//! ├───────────────────────────┬─────────────────────────────────────┤
//! │     RetryController       │   NetworkGuard    ScheduleRunner    │
//! │  (attempt budget, backoff)│   (pause on loss) (next_run timer)  │
//! ├───────────────────────────┴─────────────────────────────────────┤
//! │                     ProcessSupervisor                           │
//! │   (launch, stream consumption, cancellation, completion)        │
//! ├─────────────────────────────────────────────────────────────────┤
//! │              LineSplitter  →  extract_all                       │
//! │   (bytes → lines → TransferEvent, per stream)                   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod credentials;
pub mod error;
pub mod event;
pub mod fanout;
pub mod history;
pub mod log_sink;
pub mod network;
pub mod output;
pub mod process;
pub mod retry;
pub mod schedule;
pub mod session;

pub use config::{
    CommandSpec, Direction, Endpoint, ToolPaths, TransferConfig, TransferFlags, TransferTarget,
};
pub use credentials::{CredentialSource, EnvCredentials, NoCredentials, StaticCredentials};
pub use error::{Result, SessionError, TransferError, TransferFailure, classify};
pub use event::{StreamKind, TransferEvent};
pub use fanout::{DestinationOutcome, DestinationReport, run_sequential};
pub use history::{
    HistoryOutcome, HistoryRecord, HistoryRecorder, JsonLinesHistory, MemoryHistory, NullHistory,
};
pub use log_sink::{FileLogSink, LogSink, NullLogSink};
pub use network::{ConnectivitySource, NetworkGuard, NetworkOptions, NetworkStatus, TcpProbe};
pub use output::LineSplitter;
pub use process::{
    ExitOutcome, LaunchError, LaunchId, ProcessHandle, ProcessLauncher, ProcessSupervisor,
    SupervisorError, SupervisorMessage, SupervisorPhase, TokioLauncher,
};
pub use retry::{RetryController, RetryDecision, RetryPolicy};
pub use schedule::{
    Schedule, ScheduleDay, ScheduleError, ScheduleKind, ScheduleRunner, SystemClock, TimeOfDay,
    WallClock, next_run,
};
pub use session::{
    CancelReason, SessionEvent, SessionHandle, SessionOptions, SessionSnapshot, TransferSession,
    TransferState,
};
