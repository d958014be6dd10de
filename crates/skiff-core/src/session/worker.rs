//! The session event loop
//!
//! All state mutation happens here, on one task. Producers (handles,
//! stream readers, the process monitor, backoff timers) only send
//! messages.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use super::SessionOptions;
use super::state::{CancelReason, SessionEvent, SessionSnapshot, TransferState};
use crate::config::{TransferConfig, TransferTarget};
use crate::credentials::CredentialSource;
use crate::error::{MAX_UNKNOWN_CHARS, TransferError, TransferFailure, classify};
use crate::event::TransferEvent;
use crate::history::{HistoryOutcome, HistoryRecord, HistoryRecorder};
use crate::log_sink::LogSink;
use crate::process::{LaunchError, LaunchId, ProcessSupervisor, SupervisorError, SupervisorMessage};
use crate::retry::{RetryController, RetryDecision, RetryPolicy};
use crate::schedule::WallClock;

/// Raw output lines kept for classification and diagnostics
pub(crate) const TAIL_LINES: usize = 40;

/// Requests from handles
#[derive(Debug)]
pub(crate) enum Command {
    Start,
    Cancel(CancelReason),
    SetRetryPolicy(RetryPolicy),
}

pub(crate) struct Collaborators {
    pub credentials: Arc<dyn CredentialSource>,
    pub sink: Arc<dyn LogSink>,
    pub history: Arc<dyn HistoryRecorder>,
    pub clock: Arc<dyn WallClock>,
}

pub(crate) struct Worker {
    target: TransferTarget,
    options: SessionOptions,
    collaborators: Collaborators,
    supervisor: ProcessSupervisor,
    retry: RetryController,

    snapshot: watch::Sender<SessionSnapshot>,
    events: broadcast::Sender<SessionEvent>,
    busy: Arc<AtomicBool>,

    messages_tx: mpsc::UnboundedSender<SupervisorMessage>,
    retry_due_tx: mpsc::UnboundedSender<u64>,

    current_launch: Option<LaunchId>,
    cancel: Option<CancelReason>,
    retry_token: u64,
    retry_timer: Option<JoinHandle<()>>,
    tail: VecDeque<String>,
    last_exit_code: Option<i32>,
}

pub(crate) struct WorkerChannels {
    pub commands: mpsc::UnboundedReceiver<Command>,
    pub messages: mpsc::UnboundedReceiver<SupervisorMessage>,
    pub retry_due: mpsc::UnboundedReceiver<u64>,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        target: TransferTarget,
        options: SessionOptions,
        collaborators: Collaborators,
        supervisor: ProcessSupervisor,
        snapshot: watch::Sender<SessionSnapshot>,
        events: broadcast::Sender<SessionEvent>,
        busy: Arc<AtomicBool>,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> (Self, WorkerChannels) {
        let (messages_tx, messages) = mpsc::unbounded_channel();
        let (retry_due_tx, retry_due) = mpsc::unbounded_channel();
        let retry = RetryController::new(options.retry);

        let worker = Self {
            target,
            options,
            collaborators,
            supervisor,
            retry,
            snapshot,
            events,
            busy,
            messages_tx,
            retry_due_tx,
            current_launch: None,
            cancel: None,
            retry_token: 0,
            retry_timer: None,
            tail: VecDeque::with_capacity(TAIL_LINES),
            last_exit_code: None,
        };
        let channels = WorkerChannels {
            commands,
            messages,
            retry_due,
        };
        (worker, channels)
    }

    pub(crate) async fn run(mut self, mut channels: WorkerChannels) {
        tracing::debug!(host = %self.target.endpoint.host, "Session loop started");

        loop {
            tokio::select! {
                command = channels.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(message) = channels.messages.recv() => self.handle_message(message),
                Some(token) = channels.retry_due.recv() => self.handle_retry_due(token),
            }
        }

        // Every handle is gone
        self.abort_retry_timer();
        self.supervisor.cancel();
        tracing::debug!("Session loop stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start => self.start_sequence(),
            Command::Cancel(reason) => self.cancel(reason),
            Command::SetRetryPolicy(policy) => self.set_retry_policy(policy),
        }
    }

    fn start_sequence(&mut self) {
        if !self.current_state().is_settled() {
            // The handle's busy flag makes this unreachable in practice
            tracing::warn!("Start ignored, a sequence is already active");
            return;
        }

        self.cancel = None;
        self.retry.begin_sequence();
        if let Err(e) = self.collaborators.sink.truncate() {
            tracing::warn!("Failed to truncate transfer log: {}", e);
        }

        let now = self.collaborators.clock.now();
        self.snapshot.send_modify(|s| {
            *s = SessionSnapshot {
                started_at: Some(now),
                ..SessionSnapshot::default()
            };
        });

        tracing::info!(
            direction = %self.target.direction,
            "Starting sync {} <-> {}",
            self.target.local_path.display(),
            self.target.endpoint.remote_spec(&self.target.remote_path)
        );
        self.launch_attempt();
    }

    fn launch_attempt(&mut self) {
        let attempt = self.retry.begin_attempt();
        self.tail.clear();
        self.last_exit_code = None;
        self.snapshot.send_modify(|s| s.attempt = attempt);
        self.set_state(TransferState::Starting);

        let credential = match self.collaborators.credentials.credential(&self.target.endpoint) {
            Ok(credential) => credential,
            Err(e) => {
                tracing::error!("Credential lookup failed: {}", e);
                let message = e.to_string();
                self.finish(TransferState::Failed(TransferFailure::new(
                    TransferError::Unknown(message.clone()),
                    &message,
                )));
                return;
            }
        };

        // Built fresh for every attempt
        let config = TransferConfig::new(&self.target, credential);
        let spec = config.command(&self.options.tools);
        tracing::debug!(attempt, "Command: {}", spec.display());

        match self.supervisor.launch(
            &spec,
            Arc::clone(&self.collaborators.sink),
            self.messages_tx.clone(),
        ) {
            Ok(id) => {
                tracing::info!(attempt, launch = %id, "Attempt {} started", attempt);
                self.current_launch = Some(id);
            }
            Err(e) => {
                // Never retried: an unlaunchable command stays unlaunchable
                tracing::error!(attempt, "Transfer could not be launched: {}", e);
                let error = launch_failure(&e);
                self.finish(TransferState::Failed(TransferFailure::new(
                    error,
                    &e.to_string(),
                )));
            }
        }
    }

    fn cancel(&mut self, reason: CancelReason) {
        match self.current_state() {
            TransferState::Starting | TransferState::Running => {
                tracing::info!(?reason, "Cancelling transfer");
                self.cancel = Some(reason);
                self.set_state(TransferState::Cancelling);
                self.supervisor.cancel();
            }
            TransferState::Retrying { .. } => {
                tracing::info!(?reason, "Cancelled during backoff, no further attempt");
                self.abort_retry_timer();
                self.finish(cancelled_state(reason));
            }
            TransferState::Cancelling => {
                tracing::debug!("Cancel already in progress");
            }
            _ => {
                tracing::debug!(?reason, "Nothing to cancel");
            }
        }
    }

    fn set_retry_policy(&mut self, policy: RetryPolicy) {
        self.retry.set_policy(policy);
        tracing::info!(
            max_attempts = policy.max_attempts,
            auto_retry = policy.auto_retry,
            "Retry policy updated"
        );

        // A pending retry the new policy no longer allows is dropped
        if matches!(self.current_state(), TransferState::Retrying { .. }) {
            if !policy.auto_retry || self.retry.retries() > policy.max_attempts {
                tracing::info!("Pending retry withdrawn by policy change");
                self.abort_retry_timer();
                let failure = self.classify_tail();
                self.finish(TransferState::Failed(failure));
            }
        }
    }

    fn handle_message(&mut self, message: SupervisorMessage) {
        if self.current_launch != Some(message.launch) {
            tracing::trace!(launch = %message.launch, "Ignoring event from stale launch");
            return;
        }

        match &message.event {
            TransferEvent::Started => {
                if self.current_state() == TransferState::Starting {
                    self.set_state(TransferState::Running);
                }
            }
            TransferEvent::Log(lines) => {
                for line in lines {
                    if self.tail.len() == TAIL_LINES {
                        self.tail.pop_front();
                    }
                    self.tail.push_back(line.clone());
                }
            }
            TransferEvent::FileStarted(path) => {
                let path = path.clone();
                self.snapshot.send_modify(|s| s.current_file = Some(path));
            }
            TransferEvent::SpeedSample(rate) => {
                let rate = rate.clone();
                self.snapshot.send_modify(|s| s.current_speed = Some(rate));
            }
            TransferEvent::ProgressSample(fraction) => {
                let fraction = *fraction;
                self.snapshot.send_modify(|s| s.progress = fraction);
            }
            TransferEvent::BytesTransferred(total) => {
                let total = *total;
                self.snapshot.send_modify(|s| s.bytes_transferred = Some(total));
            }
            TransferEvent::Completed { .. } => {}
        }

        let _ = self.events.send(SessionEvent::Transfer(message.event.clone()));

        if let TransferEvent::Completed { success, code } = message.event {
            self.on_completed(success, code);
        }
    }

    fn on_completed(&mut self, success: bool, code: Option<i32>) {
        self.current_launch = None;
        self.last_exit_code = code;

        match self.retry.on_completion(success, self.cancel.is_some()) {
            RetryDecision::Succeed => {
                tracing::info!("Transfer succeeded");
                self.finish(TransferState::Succeeded);
            }
            RetryDecision::Cancel => {
                let reason = self.cancel.unwrap_or(CancelReason::User);
                self.finish(cancelled_state(reason));
            }
            RetryDecision::Retry { attempt, delay } => {
                let failure = self.classify_tail();
                let notice = format!(
                    "Attempt {} failed ({}); retry {} of {} in {}s",
                    attempt - 1,
                    failure.error,
                    self.retry.retries(),
                    self.retry.policy().max_attempts,
                    delay.as_secs()
                );
                tracing::warn!(attempt, ?delay, "{}", notice);
                let _ = self
                    .events
                    .send(SessionEvent::Transfer(TransferEvent::Log(vec![notice])));
                self.set_state(TransferState::Retrying { attempt, delay });
                self.arm_retry_timer(delay);
            }
            RetryDecision::Fail => {
                let failure = self.classify_tail();
                tracing::error!(attempts = self.retry.attempt(), "Transfer failed: {}", failure.error);
                self.finish(TransferState::Failed(failure));
            }
        }
    }

    fn handle_retry_due(&mut self, token: u64) {
        if token != self.retry_token {
            tracing::trace!(token, "Ignoring stale retry timer");
            return;
        }
        if !matches!(self.current_state(), TransferState::Retrying { .. }) {
            return;
        }
        self.retry_timer = None;
        self.launch_attempt();
    }

    fn arm_retry_timer(&mut self, delay: std::time::Duration) {
        self.abort_retry_timer();
        let token = self.retry_token;
        let tx = self.retry_due_tx.clone();
        self.retry_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(token);
        }));
    }

    fn abort_retry_timer(&mut self) {
        // Bumping the token also invalidates a firing already queued
        self.retry_token = self.retry_token.wrapping_add(1);
        if let Some(timer) = self.retry_timer.take() {
            timer.abort();
        }
    }

    fn finish(&mut self, state: TransferState) {
        self.abort_retry_timer();
        self.current_launch = None;
        self.cancel = None;

        let snapshot = self.snapshot.borrow().clone();
        let finished_at = self.collaborators.clock.now();
        let started_at = snapshot.started_at.unwrap_or(finished_at);
        let outcome = match &state {
            TransferState::Succeeded => HistoryOutcome::Succeeded,
            TransferState::Paused => HistoryOutcome::Paused,
            TransferState::Failed(failure) => HistoryOutcome::Failed {
                error: failure.error.clone(),
            },
            _ => HistoryOutcome::Cancelled,
        };
        let record = HistoryRecord::new(
            &self.target,
            started_at,
            finished_at,
            outcome,
            snapshot.bytes_transferred.unwrap_or(0),
            snapshot.attempt,
        );
        if let Err(e) = self.collaborators.history.record(record) {
            tracing::warn!("Failed to record history: {}", e);
        }

        // Cleared before the terminal state is published, so a caller that
        // observes it can start again right away
        self.busy.store(false, Ordering::SeqCst);
        self.set_state(state);
    }

    fn classify_tail(&self) -> TransferFailure {
        let tail = self.tail.iter().map(String::as_str).collect::<Vec<_>>().join("\n");
        let error = classify(&tail, self.last_exit_code, &self.target.endpoint.host);
        TransferFailure::new(error, &tail)
    }

    fn current_state(&self) -> TransferState {
        self.snapshot.borrow().state.clone()
    }

    fn set_state(&mut self, state: TransferState) {
        tracing::debug!("State -> {}", state);
        let published = state.clone();
        self.snapshot.send_modify(|s| s.state = published);
        let _ = self.events.send(SessionEvent::State(state));
    }
}

fn cancelled_state(reason: CancelReason) -> TransferState {
    match reason {
        CancelReason::User => TransferState::Cancelled,
        CancelReason::NetworkLost => TransferState::Paused,
    }
}

fn launch_failure(error: &SupervisorError) -> TransferError {
    match error {
        SupervisorError::Launch(LaunchError::NotFound(_)) => TransferError::ExecutableNotFound,
        SupervisorError::Launch(LaunchError::PermissionDenied(program)) => {
            TransferError::PermissionDenied(program.clone())
        }
        other => {
            let message: String = other.to_string().chars().take(MAX_UNKNOWN_CHARS).collect();
            TransferError::Unknown(message)
        }
    }
}
