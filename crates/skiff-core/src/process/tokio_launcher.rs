//! [`ProcessLauncher`] over `tokio::process`

use std::process::Stdio;

use tokio::process::Command;
use tokio::sync::oneshot;

use super::{CommandSpec, ExitOutcome, LaunchError, ProcessHandle, ProcessLauncher};

/// Launches real processes with piped stdout/stderr and a null stdin
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioLauncher;

impl TokioLauncher {
    /// Create a launcher
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl ProcessLauncher for TokioLauncher {
    fn launch(&self, spec: &CommandSpec) -> Result<ProcessHandle, LaunchError> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(spec.env.iter().map(|(key, value)| (key, value.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| LaunchError::from_io(&spec.program, &e))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LaunchError::Spawn("stdout was not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| LaunchError::Spawn("stderr was not captured".to_string()))?;

        let pid = child.id();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (exit_tx, exit_rx) = oneshot::channel();

        tracing::debug!(pid = ?pid, program = %spec.program, "Process spawned");

        // The waiter owns the child; a dropped kill sender counts as a kill
        tokio::spawn(async move {
            let finished = tokio::select! {
                status = child.wait() => Some(status),
                _ = kill_rx => None,
            };

            let status = match finished {
                Some(status) => status,
                None => {
                    if let Err(e) = child.start_kill() {
                        tracing::debug!("Kill failed, process already gone: {}", e);
                    }
                    child.wait().await
                }
            };

            let outcome = match status {
                Ok(status) => ExitOutcome::from(status),
                Err(e) => {
                    tracing::warn!("Failed to collect exit status: {}", e);
                    ExitOutcome::killed()
                }
            };
            tracing::debug!(pid = ?pid, code = ?outcome.code, "Process exited");
            let _ = exit_tx.send(outcome);
        });

        Ok(ProcessHandle {
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            kill: kill_tx,
            exit: exit_rx,
            pid,
        })
    }
}
