//! Supervisor owning at most one external process
//!
//! ```text
//!   Idle ──launch──► Launching ──spawned──► Streaming ──exit──────────► Terminated
//!                        │                      │                          ▲
//!                        └──spawn error──► Idle └──cancel──► Terminating ──┘
//! ```
//!
//! Every successful launch is tagged with a fresh [`LaunchId`] and produces
//! exactly one [`TransferEvent::Completed`], whether the process ran to exit
//! or was cancelled. The supervisor does not know *why* a process ended;
//! telling a cancelled run from a failed one is up to the caller.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::timeout;

use super::{
    CommandSpec, ExitOutcome, OutputReader, ProcessHandle, ProcessLauncher, SupervisorError,
};
use crate::event::{StreamKind, TransferEvent};
use crate::log_sink::LogSink;
use crate::output::{LineSplitter, extract_all};

/// Time a cancelled process gets to exit before it is reported as killed
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Identifier of one launch on one supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LaunchId(u64);

impl LaunchId {
    /// Raw counter value
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LaunchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Event tagged with the launch that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorMessage {
    /// Originating launch
    pub launch: LaunchId,
    /// The event
    pub event: TransferEvent,
}

/// Supervisor lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorPhase {
    /// Never launched
    Idle,
    /// Spawn in progress
    Launching,
    /// Process running, output being consumed
    Streaming,
    /// Cancel requested, waiting for exit
    Terminating,
    /// Last process has exited
    Terminated,
}

impl SupervisorPhase {
    /// Returns true while a process is owned
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(
            self,
            SupervisorPhase::Launching | SupervisorPhase::Streaming | SupervisorPhase::Terminating
        )
    }
}

struct ActiveProcess {
    id: LaunchId,
    kill: Option<oneshot::Sender<()>>,
    readers: Vec<AbortHandle>,
    cancel: Arc<Notify>,
    cancelled: bool,
}

struct SupervisorState {
    phase: SupervisorPhase,
    active: Option<ActiveProcess>,
}

/// Owns the lifetime of one external process at a time
pub struct ProcessSupervisor {
    launcher: Arc<dyn ProcessLauncher>,
    grace_period: Duration,
    state: Arc<Mutex<SupervisorState>>,
    next_id: AtomicU64,
}

impl ProcessSupervisor {
    /// Create a supervisor using `launcher`
    pub fn new(launcher: Arc<dyn ProcessLauncher>) -> Self {
        Self {
            launcher,
            grace_period: DEFAULT_GRACE_PERIOD,
            state: Arc::new(Mutex::new(SupervisorState {
                phase: SupervisorPhase::Idle,
                active: None,
            })),
            next_id: AtomicU64::new(0),
        }
    }

    /// Override the termination grace period
    #[must_use]
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Current phase
    pub fn phase(&self) -> SupervisorPhase {
        self.lock().phase
    }

    /// Launch owning the process, if any
    pub fn current_launch(&self) -> Option<LaunchId> {
        self.lock().active.as_ref().map(|active| active.id)
    }

    /// Spawn `spec` and start streaming its output into `events`
    ///
    /// Every output line is appended to `sink` before its events are sent.
    /// Fails with [`SupervisorError::AlreadyRunning`] while a previous
    /// launch has not completed; that launch is left untouched.
    pub fn launch(
        &self,
        spec: &CommandSpec,
        sink: Arc<dyn LogSink>,
        events: mpsc::UnboundedSender<SupervisorMessage>,
    ) -> Result<LaunchId, SupervisorError> {
        let mut state = self.lock();
        if state.phase.is_active() {
            return Err(SupervisorError::AlreadyRunning);
        }
        state.phase = SupervisorPhase::Launching;

        let handle = match self.launcher.launch(spec) {
            Ok(handle) => handle,
            Err(e) => {
                state.phase = SupervisorPhase::Idle;
                tracing::warn!("Launch of {} failed: {}", spec.program, e);
                return Err(e.into());
            }
        };

        let id = LaunchId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        tracing::info!(launch = %id, pid = ?handle.pid, "Launched: {}", spec.display());

        let _ = events.send(SupervisorMessage {
            launch: id,
            event: TransferEvent::Started,
        });

        let ProcessHandle {
            stdout,
            stderr,
            kill,
            exit,
            ..
        } = handle;

        let stdout_task = tokio::spawn(pump_stream(
            id,
            StreamKind::Stdout,
            stdout,
            Arc::clone(&sink),
            events.clone(),
        ));
        let stderr_task = tokio::spawn(pump_stream(
            id,
            StreamKind::Stderr,
            stderr,
            sink,
            events.clone(),
        ));

        let cancel = Arc::new(Notify::new());
        state.active = Some(ActiveProcess {
            id,
            kill: Some(kill),
            readers: vec![stdout_task.abort_handle(), stderr_task.abort_handle()],
            cancel: Arc::clone(&cancel),
            cancelled: false,
        });
        state.phase = SupervisorPhase::Streaming;
        drop(state);

        tokio::spawn(monitor(
            id,
            exit,
            [stdout_task, stderr_task],
            cancel,
            Arc::clone(&self.state),
            self.grace_period,
            events,
        ));

        Ok(id)
    }

    /// Terminate the running process
    ///
    /// Stream readers are torn down before the kill is sent. Idempotent:
    /// returns false when there is nothing left to cancel.
    pub fn cancel(&self) -> bool {
        let mut state = self.lock();
        let Some(active) = state.active.as_mut() else {
            return false;
        };
        if active.cancelled {
            return false;
        }

        active.cancelled = true;
        for reader in active.readers.drain(..) {
            reader.abort();
        }
        if let Some(kill) = active.kill.take() {
            let _ = kill.send(());
        }
        active.cancel.notify_one();

        tracing::info!(launch = %active.id, "Terminating process");
        state.phase = SupervisorPhase::Terminating;
        true
    }

    fn lock(&self) -> MutexGuard<'_, SupervisorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("phase", &self.phase())
            .field("grace_period", &self.grace_period)
            .finish()
    }
}

async fn monitor(
    id: LaunchId,
    mut exit: oneshot::Receiver<ExitOutcome>,
    readers: [JoinHandle<()>; 2],
    cancel: Arc<Notify>,
    state: Arc<Mutex<SupervisorState>>,
    grace_period: Duration,
    events: mpsc::UnboundedSender<SupervisorMessage>,
) {
    let exited = tokio::select! {
        outcome = &mut exit => Some(outcome.unwrap_or(ExitOutcome::killed())),
        _ = cancel.notified() => None,
    };

    let outcome = match exited {
        Some(outcome) => outcome,
        None => match timeout(grace_period, &mut exit).await {
            Ok(outcome) => outcome.unwrap_or(ExitOutcome::killed()),
            Err(_) => {
                tracing::warn!(launch = %id, "Process did not exit within {:?}", grace_period);
                ExitOutcome::killed()
            }
        },
    };

    // Drain what the readers still hold; a grandchild keeping a pipe open
    // must not hold up completion forever
    for reader in readers {
        let abort = reader.abort_handle();
        match timeout(grace_period, reader).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_cancelled() => {}
            Ok(Err(e)) => tracing::warn!(launch = %id, "Output reader failed: {}", e),
            Err(_) => {
                tracing::warn!(launch = %id, "Output stream still open after exit, abandoning");
                abort.abort();
            }
        }
    }

    {
        let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.active.as_ref().map(|active| active.id) == Some(id) {
            state.active = None;
            state.phase = SupervisorPhase::Terminated;
        }
    }

    tracing::debug!(launch = %id, success = outcome.success, code = ?outcome.code, "Process completed");
    let _ = events.send(SupervisorMessage {
        launch: id,
        event: TransferEvent::Completed {
            success: outcome.success,
            code: outcome.code,
        },
    });
}

async fn pump_stream(
    launch: LaunchId,
    stream: StreamKind,
    mut reader: OutputReader,
    sink: Arc<dyn LogSink>,
    events: mpsc::UnboundedSender<SupervisorMessage>,
) {
    let mut splitter = LineSplitter::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(launch = %launch, %stream, "Read failed: {}", e);
                break;
            }
        };
        let lines = splitter.push(&buf[..n]);
        forward_lines(launch, stream, lines, sink.as_ref(), &events);
    }

    if let Some(rest) = splitter.finish() {
        forward_lines(launch, stream, vec![rest], sink.as_ref(), &events);
    }
}

fn forward_lines(
    launch: LaunchId,
    stream: StreamKind,
    lines: Vec<String>,
    sink: &dyn LogSink,
    events: &mpsc::UnboundedSender<SupervisorMessage>,
) {
    if lines.is_empty() {
        return;
    }

    let mut derived = Vec::new();
    for line in &lines {
        tracing::trace!(launch = %launch, %stream, "{}", line);
        if let Err(e) = sink.append(stream, line) {
            tracing::warn!("Failed to append to transfer log: {}", e);
        }
        derived.extend(extract_all(line));
    }

    let _ = events.send(SupervisorMessage {
        launch,
        event: TransferEvent::Log(lines),
    });
    for event in derived {
        let _ = events.send(SupervisorMessage { launch, event });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_sink::NullLogSink;
    use crate::process::LaunchError;
    use tokio::io::{AsyncWriteExt, DuplexStream, duplex};

    struct TestPipes {
        stdout: DuplexStream,
        stderr: DuplexStream,
        kill: oneshot::Receiver<()>,
        exit: oneshot::Sender<ExitOutcome>,
    }

    #[derive(Default)]
    struct TestLauncher {
        spawned: Mutex<Vec<TestPipes>>,
        fail_with: Option<LaunchError>,
    }

    impl TestLauncher {
        fn take(&self) -> TestPipes {
            self.spawned.lock().unwrap().remove(0)
        }
    }

    impl ProcessLauncher for TestLauncher {
        fn launch(&self, _spec: &CommandSpec) -> Result<ProcessHandle, LaunchError> {
            if let Some(err) = &self.fail_with {
                return Err(err.clone());
            }
            let (stdout_w, stdout_r) = duplex(256);
            let (stderr_w, stderr_r) = duplex(256);
            let (kill_tx, kill_rx) = oneshot::channel();
            let (exit_tx, exit_rx) = oneshot::channel();
            self.spawned.lock().unwrap().push(TestPipes {
                stdout: stdout_w,
                stderr: stderr_w,
                kill: kill_rx,
                exit: exit_tx,
            });
            Ok(ProcessHandle {
                stdout: Box::new(stdout_r),
                stderr: Box::new(stderr_r),
                kill: kill_tx,
                exit: exit_rx,
                pid: None,
            })
        }
    }

    fn spec() -> CommandSpec {
        CommandSpec::new("rsync", ["-a", "src/", "host:dst"])
    }

    async fn collect_until_completed(
        rx: &mut mpsc::UnboundedReceiver<SupervisorMessage>,
    ) -> Vec<SupervisorMessage> {
        let mut messages = Vec::new();
        while let Some(message) = rx.recv().await {
            let done = message.event.is_completion();
            messages.push(message);
            if done {
                break;
            }
        }
        messages
    }

    #[tokio::test]
    async fn test_launch_streams_events_and_completes() {
        let launcher = Arc::new(TestLauncher::default());
        let supervisor = ProcessSupervisor::new(launcher.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let id = supervisor.launch(&spec(), Arc::new(NullLogSink), tx).unwrap();
        assert_eq!(supervisor.phase(), SupervisorPhase::Streaming);
        assert_eq!(supervisor.current_launch(), Some(id));

        let mut pipes = launcher.take();
        pipes.stdout.write_all(b"  10%\rmyfile.txt\n").await.unwrap();
        pipes.stderr.write_all(b"warning: something").await.unwrap();
        drop(pipes.stdout);
        drop(pipes.stderr);
        pipes.exit.send(ExitOutcome::exited(0)).unwrap();

        let messages = collect_until_completed(&mut rx).await;
        assert!(messages.iter().all(|m| m.launch == id));

        let events: Vec<_> = messages.into_iter().map(|m| m.event).collect();
        assert_eq!(events.first(), Some(&TransferEvent::Started));
        assert_eq!(
            events.last(),
            Some(&TransferEvent::Completed {
                success: true,
                code: Some(0)
            })
        );
        assert!(events.contains(&TransferEvent::ProgressSample(0.1)));
        assert!(events.contains(&TransferEvent::FileStarted("myfile.txt".into())));
        assert!(events.contains(&TransferEvent::Log(vec!["warning: something".into()])));
        assert_eq!(events.iter().filter(|e| e.is_completion()).count(), 1);

        assert_eq!(supervisor.phase(), SupervisorPhase::Terminated);
        assert_eq!(supervisor.current_launch(), None);
    }

    #[tokio::test]
    async fn test_second_launch_rejected_while_running() {
        let launcher = Arc::new(TestLauncher::default());
        let supervisor = ProcessSupervisor::new(launcher.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let first = supervisor
            .launch(&spec(), Arc::new(NullLogSink), tx.clone())
            .unwrap();
        let second = supervisor.launch(&spec(), Arc::new(NullLogSink), tx.clone());
        assert_eq!(second, Err(SupervisorError::AlreadyRunning));
        assert_eq!(supervisor.current_launch(), Some(first));
        assert_eq!(launcher.spawned.lock().unwrap().len(), 1);

        let pipes = launcher.take();
        drop(pipes.stdout);
        drop(pipes.stderr);
        pipes.exit.send(ExitOutcome::exited(0)).unwrap();
        let messages = collect_until_completed(&mut rx).await;
        assert_eq!(messages.last().map(|m| m.launch), Some(first));

        // A new launch is accepted once the first has completed
        let third = supervisor.launch(&spec(), Arc::new(NullLogSink), tx).unwrap();
        assert!(third > first);
    }

    #[tokio::test]
    async fn test_launch_error_leaves_supervisor_idle() {
        let launcher = Arc::new(TestLauncher {
            fail_with: Some(LaunchError::NotFound("rsync".into())),
            ..Default::default()
        });
        let supervisor = ProcessSupervisor::new(launcher);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let result = supervisor.launch(&spec(), Arc::new(NullLogSink), tx);
        assert_eq!(
            result,
            Err(SupervisorError::Launch(LaunchError::NotFound("rsync".into())))
        );
        assert_eq!(supervisor.phase(), SupervisorPhase::Idle);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancel_kills_and_completes_once() {
        let launcher = Arc::new(TestLauncher::default());
        let supervisor = ProcessSupervisor::new(launcher.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let id = supervisor.launch(&spec(), Arc::new(NullLogSink), tx).unwrap();
        let pipes = launcher.take();

        assert!(supervisor.cancel());
        assert!(!supervisor.cancel());
        assert_eq!(supervisor.phase(), SupervisorPhase::Terminating);

        // The "process" sees the kill and exits by signal
        pipes.kill.await.unwrap();
        pipes.exit.send(ExitOutcome::killed()).unwrap();

        let messages = collect_until_completed(&mut rx).await;
        let completions: Vec<_> = messages
            .iter()
            .filter(|m| m.event.is_completion())
            .collect();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].launch, id);
        assert_eq!(
            completions[0].event,
            TransferEvent::Completed {
                success: false,
                code: None
            }
        );
        assert_eq!(supervisor.phase(), SupervisorPhase::Terminated);
        assert!(!supervisor.cancel());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresponsive_process_reported_after_grace_period() {
        let launcher = Arc::new(TestLauncher::default());
        let supervisor =
            ProcessSupervisor::new(launcher.clone()).with_grace_period(Duration::from_secs(2));
        let (tx, mut rx) = mpsc::unbounded_channel();

        supervisor.launch(&spec(), Arc::new(NullLogSink), tx).unwrap();
        // Hold the pipes and never report an exit
        let _pipes = launcher.take();

        let started = tokio::time::Instant::now();
        supervisor.cancel();
        let messages = collect_until_completed(&mut rx).await;

        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(
            messages.last().map(|m| m.event.clone()),
            Some(TransferEvent::Completed {
                success: false,
                code: None
            })
        );
    }

    #[test]
    fn test_phase_activity() {
        assert!(!SupervisorPhase::Idle.is_active());
        assert!(SupervisorPhase::Streaming.is_active());
        assert!(SupervisorPhase::Terminating.is_active());
        assert!(!SupervisorPhase::Terminated.is_active());
        assert_eq!(LaunchId(7).to_string(), "#7");
    }
}
