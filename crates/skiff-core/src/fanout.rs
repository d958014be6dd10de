//! Sequential, best-effort transfer to several destinations
//!
//! Each destination gets its own session (and so its own supervisor);
//! they run strictly one after another. A failed destination does not
//! stop the rest, but a cancelled or paused one does: the user or the
//! network asked the whole run to stop.

use crate::config::TransferTarget;
use crate::error::{Result, SessionError};
use crate::session::{SessionHandle, TransferState};

/// What happened to one destination
#[derive(Debug, Clone, PartialEq)]
pub enum DestinationOutcome {
    /// The session ran and settled in this state
    Settled(TransferState),
    /// The session could not be created or started
    Rejected(SessionError),
    /// Not attempted because an earlier destination was cancelled or paused
    Skipped,
}

impl DestinationOutcome {
    /// Returns true if the destination succeeded
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, DestinationOutcome::Settled(TransferState::Succeeded))
    }
}

/// Result for one destination, in input order
#[derive(Debug, Clone)]
pub struct DestinationReport {
    /// The destination
    pub target: TransferTarget,
    /// Its outcome
    pub outcome: DestinationOutcome,
}

/// Run one session per target, in order
///
/// `factory` builds and spawns the session for a target; it is also the
/// place to attach progress displays or keep the handle for cancellation.
pub async fn run_sequential<F>(targets: &[TransferTarget], mut factory: F) -> Vec<DestinationReport>
where
    F: FnMut(&TransferTarget) -> Result<SessionHandle>,
{
    let mut reports = Vec::with_capacity(targets.len());
    let mut stopped = false;

    for (index, target) in targets.iter().enumerate() {
        if stopped {
            reports.push(DestinationReport {
                target: target.clone(),
                outcome: DestinationOutcome::Skipped,
            });
            continue;
        }

        tracing::info!(
            "Destination {}/{}: {}",
            index + 1,
            targets.len(),
            target.endpoint.remote_spec(&target.remote_path)
        );

        let outcome = match run_one(target, &mut factory).await {
            Ok(state) => {
                if matches!(state, TransferState::Cancelled | TransferState::Paused) {
                    tracing::info!("Destination {} {}, skipping the rest", index + 1, state);
                    stopped = true;
                }
                DestinationOutcome::Settled(state)
            }
            Err(e) => {
                tracing::warn!("Destination {} rejected: {}", index + 1, e);
                DestinationOutcome::Rejected(e)
            }
        };

        reports.push(DestinationReport {
            target: target.clone(),
            outcome,
        });
    }

    reports
}

async fn run_one<F>(target: &TransferTarget, factory: &mut F) -> Result<TransferState>
where
    F: FnMut(&TransferTarget) -> Result<SessionHandle>,
{
    let session = factory(target)?;
    session.start()?;
    session.wait_until_settled().await
}
