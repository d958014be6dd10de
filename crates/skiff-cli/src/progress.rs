//! Live transfer display driven by session events.

use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use skiff_core::output::parse_total_size;
use skiff_core::{SessionEvent, SessionHandle, TransferEvent, TransferState};
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

/// Resolution of the per-file percentage bar
const BAR_LENGTH: u64 = 1000;

/// Transfer progress bar for one destination
pub struct TransferProgress {
    bar: ProgressBar,
}

impl TransferProgress {
    /// Create a new progress bar labelled with the destination
    #[must_use]
    pub fn new(destination: &str) -> Self {
        let bar = ProgressBar::new(BAR_LENGTH);

        let style = ProgressStyle::default_bar()
            .template("{prefix:.bold} {msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {percent:>3}%")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-");
        bar.set_style(style);
        bar.set_prefix(destination.to_string());
        bar.enable_steady_tick(Duration::from_millis(120));

        Self { bar }
    }

    /// Show the file currently being transferred
    pub fn set_file(&self, file: &str, speed: Option<&str>) {
        match speed {
            Some(speed) => self.bar.set_message(format!("{file} ({speed})")),
            None => self.bar.set_message(file.to_string()),
        }
    }

    /// Update the per-file fraction (0.0 to 1.0)
    pub fn set_fraction(&self, fraction: f64) {
        let position = (fraction.clamp(0.0, 1.0) * BAR_LENGTH as f64).round() as u64;
        self.bar.set_position(position);
    }

    /// Print a line above the bar
    pub fn println(&self, line: String) {
        self.bar.println(line);
    }

    /// Finish with custom message
    pub fn finish_with_message(&self, msg: String) {
        self.bar.finish_with_message(msg);
    }
}

/// Totals gathered while watching one session
#[derive(Debug, Clone, Default)]
pub struct ProgressSummary {
    /// Terminal state of the sequence
    pub state: TransferState,
    /// Bytes from the `sent ... received ...` line
    pub bytes_transferred: Option<u64>,
    /// Size of the source tree from the `total size is` line
    pub total_size: Option<u64>,
    /// Wall time of the sequence
    pub elapsed: Duration,
}

/// Drive a progress bar from `session` until it settles
///
/// Must be called before the session is started so no event is missed.
pub fn watch_session(session: &SessionHandle, destination: String) -> JoinHandle<ProgressSummary> {
    let mut events = session.subscribe();

    tokio::spawn(async move {
        let progress = TransferProgress::new(&destination);
        let started = Instant::now();
        let mut summary = ProgressSummary::default();
        let mut file: Option<String> = None;
        let mut speed: Option<String> = None;

        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!("Progress display skipped {} events", skipped);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            match event {
                SessionEvent::Transfer(TransferEvent::FileStarted(name)) => {
                    progress.set_fraction(0.0);
                    progress.set_file(&name, speed.as_deref());
                    file = Some(name);
                }
                SessionEvent::Transfer(TransferEvent::SpeedSample(rate)) => {
                    if let Some(name) = &file {
                        progress.set_file(name, Some(&rate));
                    }
                    speed = Some(rate);
                }
                SessionEvent::Transfer(TransferEvent::ProgressSample(fraction)) => {
                    progress.set_fraction(fraction);
                }
                SessionEvent::Transfer(TransferEvent::BytesTransferred(bytes)) => {
                    summary.bytes_transferred = Some(bytes);
                }
                SessionEvent::Transfer(TransferEvent::Log(lines)) => {
                    for line in &lines {
                        tracing::trace!("{}", line);
                        if let Some(total) = parse_total_size(line) {
                            summary.total_size = Some(total);
                        }
                    }
                }
                SessionEvent::Transfer(_) => {}
                SessionEvent::State(TransferState::Retrying { attempt, delay }) => {
                    progress.println(format!(
                        "{} retrying in {} (attempt {})",
                        style("!").yellow(),
                        format_duration(delay),
                        attempt
                    ));
                    progress.set_fraction(0.0);
                }
                SessionEvent::State(state) if state.is_settled() && state != TransferState::Idle => {
                    summary.state = state;
                    break;
                }
                SessionEvent::State(state) => {
                    tracing::debug!("{}: {}", destination, state);
                }
            }
        }

        summary.elapsed = started.elapsed();
        progress.finish_with_message(describe(&summary));
        summary
    })
}

/// One-line result for a settled session
#[must_use]
pub fn describe(summary: &ProgressSummary) -> String {
    let elapsed = format_duration(summary.elapsed);
    match &summary.state {
        TransferState::Succeeded => {
            let mut line = format!("{} done in {elapsed}", style("✓").green());
            if let Some(bytes) = summary.bytes_transferred {
                line.push_str(&format!(", {} on the wire", format_bytes(bytes)));
            }
            if let Some(total) = summary.total_size {
                line.push_str(&format!(", {} in tree", format_bytes(total)));
            }
            line
        }
        TransferState::Cancelled => format!("{} cancelled after {elapsed}", style("✗").yellow()),
        TransferState::Paused => {
            format!("{} paused (network lost) after {elapsed}", style("⏸").yellow())
        }
        TransferState::Failed(failure) => format!("{} {}", style("✗").red(), failure.error),
        other => other.to_string(),
    }
}

/// Format bytes in human-readable format
///
/// # Example
///
/// ```ignore
/// assert_eq!(format_bytes(1024), "1.00 KB");
/// assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
/// ```
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{size:.2} {}", UNITS[unit_idx])
}

/// Format duration in human-readable format
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();

    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}
