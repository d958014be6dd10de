//! Transfer session: the coordinator
//!
//! A [`TransferSession`] describes one destination and its collaborators;
//! [`TransferSession::spawn`] starts its event loop and returns a cloneable
//! [`SessionHandle`].
//!
//! ```text
//!                ┌──────────── SessionHandle ────────────┐
//!   start/cancel │  set_retry_policy   set_schedule      │ snapshot/subscribe
//!                ▼                          │            ▲
//!          ┌───────────┐  launch   ┌────────▼────────┐   │
//!          │  Worker   │──────────►│ ScheduleRunner  │   │
//!          │  (loop)   │◄──────────│ (fires start)   │   │
//!          └─────┬─────┘           └─────────────────┘   │
//!                │ launch / cancel                       │
//!          ┌─────▼──────────────┐   SupervisorMessage    │
//!          │ ProcessSupervisor  │───────► Worker ────────┘
//!          └────────────────────┘
//! ```
//!
//! At most one sequence is active per session. A second
//! [`SessionHandle::start`] while one is active is rejected synchronously.

pub mod state;
mod worker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch};

pub use state::{CancelReason, SessionEvent, SessionSnapshot, TransferState};

use crate::config::{ToolPaths, TransferTarget};
use crate::credentials::{CredentialSource, NoCredentials};
use crate::error::{Result, SessionError};
use crate::history::{HistoryRecorder, NullHistory};
use crate::log_sink::{FileLogSink, LogSink, NullLogSink};
use crate::process::{ProcessLauncher, ProcessSupervisor, TokioLauncher};
use crate::retry::RetryPolicy;
use crate::schedule::{Schedule, ScheduleRunner, SystemClock, WallClock};
use worker::{Collaborators, Command, Worker};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Per-session tunables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOptions {
    /// External executables
    #[serde(default)]
    pub tools: ToolPaths,

    /// Retry behaviour
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Seconds a cancelled process gets to exit
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            tools: ToolPaths::default(),
            retry: RetryPolicy::default(),
            grace_period_secs: default_grace_period_secs(),
        }
    }
}

fn default_grace_period_secs() -> u64 {
    5
}

/// Builder for one destination's session
pub struct TransferSession {
    target: TransferTarget,
    options: SessionOptions,
    launcher: Arc<dyn ProcessLauncher>,
    credentials: Arc<dyn CredentialSource>,
    sink: Option<Arc<dyn LogSink>>,
    history: Arc<dyn HistoryRecorder>,
    clock: Arc<dyn WallClock>,
}

impl TransferSession {
    /// Session for `target` with real processes and no password
    pub fn new(target: TransferTarget) -> Self {
        Self {
            target,
            options: SessionOptions::default(),
            launcher: Arc::new(TokioLauncher::new()),
            credentials: Arc::new(NoCredentials),
            sink: None,
            history: Arc::new(NullHistory),
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the options
    #[must_use]
    pub fn with_options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    /// Use another process launcher
    #[must_use]
    pub fn with_launcher(mut self, launcher: Arc<dyn ProcessLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    /// Use another credential source
    #[must_use]
    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialSource>) -> Self {
        self.credentials = credentials;
        self
    }

    /// Override the log sink (default: the target's log file, if any)
    #[must_use]
    pub fn with_log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Record finished sequences
    #[must_use]
    pub fn with_history(mut self, history: Arc<dyn HistoryRecorder>) -> Self {
        self.history = history;
        self
    }

    /// Use another wall clock
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn WallClock>) -> Self {
        self.clock = clock;
        self
    }

    /// Validate and start the event loop
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(self) -> Result<SessionHandle> {
        self.target.validate()?;
        self.options.retry.validate()?;

        let sink: Arc<dyn LogSink> = match (self.sink, &self.target.log_file) {
            (Some(sink), _) => sink,
            (None, Some(path)) => Arc::new(FileLogSink::new(path)),
            (None, None) => Arc::new(NullLogSink),
        };

        let supervisor = ProcessSupervisor::new(self.launcher)
            .with_grace_period(Duration::from_secs(self.options.grace_period_secs));
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::default());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let busy = Arc::new(AtomicBool::new(false));

        let (worker, channels) = Worker::new(
            self.target,
            self.options,
            Collaborators {
                credentials: self.credentials,
                sink,
                history: self.history,
                clock: Arc::clone(&self.clock),
            },
            supervisor,
            snapshot_tx,
            events.clone(),
            Arc::clone(&busy),
            commands_rx,
        );
        tokio::spawn(worker.run(channels));

        Ok(SessionHandle {
            inner: Arc::new(Shared {
                commands: commands_tx,
                busy,
                snapshot: snapshot_rx,
                events,
                clock: self.clock,
                schedule: Mutex::new(None),
            }),
        })
    }
}

struct Shared {
    commands: mpsc::UnboundedSender<Command>,
    busy: Arc<AtomicBool>,
    snapshot: watch::Receiver<SessionSnapshot>,
    events: broadcast::Sender<SessionEvent>,
    clock: Arc<dyn WallClock>,
    schedule: Mutex<Option<ScheduleRunner>>,
}

/// Cloneable handle to a running session
///
/// The session loop stops when the last handle is dropped; a process still
/// running at that point is terminated.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<Shared>,
}

impl SessionHandle {
    /// Start a fresh sequence
    ///
    /// Fails immediately with [`SessionError::AlreadyRunning`] while a
    /// sequence is active (including its backoff waits).
    pub fn start(&self) -> Result<()> {
        if self
            .inner
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SessionError::AlreadyRunning);
        }
        if self.inner.commands.send(Command::Start).is_err() {
            self.inner.busy.store(false, Ordering::SeqCst);
            return Err(SessionError::channel("session loop has stopped"));
        }
        Ok(())
    }

    /// Cancel at user request; ends as [`TransferState::Cancelled`]
    pub fn cancel(&self) -> Result<()> {
        self.cancel_with(CancelReason::User)
    }

    /// Cancel with an explicit reason
    ///
    /// Only guarantees that no new attempt starts; a running process is
    /// signalled and the state settles once it has exited.
    pub fn cancel_with(&self, reason: CancelReason) -> Result<()> {
        self.inner
            .commands
            .send(Command::Cancel(reason))
            .map_err(|_| SessionError::channel("session loop has stopped"))
    }

    /// Current snapshot
    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.snapshot.borrow().clone()
    }

    /// Current state
    pub fn state(&self) -> TransferState {
        self.inner.snapshot.borrow().state.clone()
    }

    /// Whether a sequence is active
    pub fn is_busy(&self) -> bool {
        self.inner.busy.load(Ordering::SeqCst)
    }

    /// Receive state changes and transfer events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Watch the snapshot
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.snapshot.clone()
    }

    /// Wait until no sequence is active and return the settled state
    pub async fn wait_until_settled(&self) -> Result<TransferState> {
        let mut rx = self.inner.snapshot.clone();
        loop {
            {
                let snapshot = rx.borrow_and_update();
                if !self.is_busy() && snapshot.state.is_settled() {
                    return Ok(snapshot.state.clone());
                }
            }
            rx.changed()
                .await
                .map_err(|_| SessionError::channel("session loop has stopped"))?;
        }
    }

    /// Replace the retry policy; a pending retry it forbids is dropped
    pub fn set_retry_policy(&self, policy: RetryPolicy) -> Result<()> {
        policy.validate()?;
        self.inner
            .commands
            .send(Command::SetRetryPolicy(policy))
            .map_err(|_| SessionError::channel("session loop has stopped"))
    }

    /// Arm, replace or (with `None`) disarm the schedule
    ///
    /// Each trigger calls [`SessionHandle::start`]; a trigger that finds a
    /// sequence already active is skipped.
    pub fn set_schedule(&self, schedule: Option<Schedule>) -> Result<()> {
        if let Some(schedule) = &schedule {
            schedule.validate()?;
        }

        let mut runner = self
            .inner
            .schedule
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match runner.as_ref() {
            Some(runner) => runner.update(schedule),
            None => {
                let weak = Arc::downgrade(&self.inner);
                *runner = Some(ScheduleRunner::spawn(
                    schedule,
                    Arc::clone(&self.inner.clock),
                    move || fire_scheduled(&weak),
                ));
            }
        }
        Ok(())
    }

    /// Next scheduled start, if a schedule is armed
    pub fn next_scheduled_run(&self) -> Option<DateTime<Utc>> {
        self.inner
            .schedule
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(ScheduleRunner::next_fire)
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("state", &self.state())
            .field("busy", &self.is_busy())
            .finish()
    }
}

fn fire_scheduled(shared: &Weak<Shared>) {
    let Some(inner) = shared.upgrade() else {
        return;
    };
    let handle = SessionHandle { inner };
    match handle.start() {
        Ok(()) => tracing::info!("Scheduled transfer started"),
        Err(SessionError::AlreadyRunning) => {
            tracing::warn!("Scheduled run skipped, a transfer is already running");
        }
        Err(e) => tracing::warn!("Scheduled run failed to start: {}", e),
    }
}
