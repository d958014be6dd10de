//! Skiff CLI
//!
//! Scheduled, network-aware rsync transfers driven from named profiles.

mod config;
mod progress;

use clap::{Parser, Subcommand};
use console::style;
use skiff_core::error::TransferError;
use skiff_core::log_sink::strip_stream_marker;
use skiff_core::schedule::upcoming;
use skiff_core::{
    DestinationOutcome, EnvCredentials, HistoryRecorder, JsonLinesHistory, NetworkGuard,
    NullHistory, SessionEvent, SessionHandle, TcpProbe, TransferSession, TransferState,
    TransferTarget, classify, run_sequential,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing_subscriber::EnvFilter;

use config::{Config, Profile};
use progress::{format_bytes, watch_session};

/// Exit code for runs stopped by the user or by a network loss
const EXIT_INTERRUPTED: u8 = 130;

/// Skiff - rsync over ssh, with retries, schedules and pause on network loss
#[derive(Parser)]
#[command(name = "skiff")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path (default: the platform config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a profile once, to every destination in order
    Run {
        /// Profile name
        profile: String,

        /// Report what would change without changing it
        #[arg(long)]
        dry_run: bool,
    },

    /// Run a profile on its schedule until interrupted
    Daemon {
        /// Profile name
        profile: String,
    },

    /// Show the next scheduled runs of a profile
    Next {
        /// Profile name
        profile: String,

        /// How many runs to list
        #[arg(short = 'n', long, default_value_t = 5)]
        count: usize,
    },

    /// Classify the output of a failed transfer
    Classify {
        /// Saved transfer log
        log: PathBuf,

        /// Host to report for network failures
        #[arg(long, default_value = "remote host")]
        host: String,

        /// Exit code of the transfer command
        #[arg(long)]
        exit_code: Option<i32>,
    },

    /// Show recorded transfers
    History {
        /// Number of most recent records to show
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },

    /// Write an example configuration
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);

    if let Commands::Init { force } = cli.command {
        init_logging(cli.verbose, "info");
        init_config(&config_path, force)?;
        return Ok(ExitCode::SUCCESS);
    }

    let config = if cli.config.is_some() {
        Config::load(&config_path)?
    } else {
        Config::load_or_default()?
    };

    init_logging(cli.verbose, &config.logging.level);
    config.validate()?;

    match cli.command {
        Commands::Run { profile, dry_run } => {
            run_profile(&config, config.profile(&profile)?, dry_run).await
        }
        Commands::Daemon { profile } => {
            run_daemon(&config, config.profile(&profile)?).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Next { profile, count } => {
            show_next(config.profile(&profile)?, count)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Classify {
            log,
            host,
            exit_code,
        } => classify_log(&log, &host, exit_code),
        Commands::History { limit } => {
            show_history(&config, limit)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Init { .. } => Ok(ExitCode::SUCCESS),
    }
}

fn init_logging(verbose: bool, level: &str) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn history_recorder(config: &Config) -> Arc<dyn HistoryRecorder> {
    if config.history.enabled {
        Arc::new(JsonLinesHistory::new(&config.history.path))
    } else {
        Arc::new(NullHistory)
    }
}

fn build_session(
    config: &Config,
    target: &TransferTarget,
    history: &Arc<dyn HistoryRecorder>,
) -> skiff_core::Result<SessionHandle> {
    TransferSession::new(target.clone())
        .with_options(config.session_options())
        .with_credentials(Arc::new(EnvCredentials::default()))
        .with_history(Arc::clone(history))
        .spawn()
}

/// Run a profile once
async fn run_profile(config: &Config, profile: &Profile, dry_run: bool) -> anyhow::Result<ExitCode> {
    let mut targets = profile.targets();
    if dry_run {
        for target in &mut targets {
            target.flags.dry_run = true;
        }
    }

    tracing::info!(
        "Running profile '{}' to {} destination(s){}",
        profile.name,
        targets.len(),
        if dry_run { " (dry run)" } else { "" }
    );

    let history = history_recorder(config);
    let current: Arc<Mutex<Option<SessionHandle>>> = Arc::new(Mutex::new(None));

    let interrupt = {
        let current = Arc::clone(&current);
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                let session = current.lock().unwrap_or_else(PoisonError::into_inner).clone();
                if let Some(session) = session {
                    eprintln!("\nCancelling...");
                    if let Err(e) = session.cancel() {
                        tracing::warn!("Cancel failed: {}", e);
                    }
                }
            }
        })
    };

    let mut watchers = Vec::new();
    let reports = run_sequential(&targets, |target| {
        let session = build_session(config, target, &history)?;
        let destination = target.endpoint.remote_spec(&target.remote_path);
        watchers.push(watch_session(&session, destination));
        *current.lock().unwrap_or_else(PoisonError::into_inner) = Some(session.clone());
        Ok(session)
    })
    .await;

    interrupt.abort();
    for watcher in watchers {
        if let Err(e) = watcher.await {
            tracing::debug!("Progress display ended abnormally: {}", e);
        }
    }

    println!();
    let mut failed = false;
    let mut interrupted = false;
    for report in &reports {
        let destination = report.target.endpoint.remote_spec(&report.target.remote_path);
        match &report.outcome {
            DestinationOutcome::Settled(TransferState::Succeeded) => {
                println!("{} {}", style("✓").green(), destination);
            }
            DestinationOutcome::Settled(TransferState::Failed(failure)) => {
                failed = true;
                println!("{} {}: {}", style("✗").red(), destination, failure.error);
                if failure.error.is_permanent() {
                    println!("  retrying will not help until this is fixed");
                }
                for line in failure.tail.lines().rev().take(5).collect::<Vec<_>>().into_iter().rev() {
                    println!("  {}", style(strip_stream_marker(line)).dim());
                }
            }
            DestinationOutcome::Settled(state) => {
                interrupted = true;
                println!("{} {}: {}", style("-").yellow(), destination, state);
            }
            DestinationOutcome::Rejected(e) => {
                failed = true;
                println!("{} {}: {}", style("✗").red(), destination, e);
            }
            DestinationOutcome::Skipped => {
                println!("{} {}: skipped", style("-").dim(), destination);
            }
        }
    }

    Ok(if failed {
        ExitCode::FAILURE
    } else if interrupted {
        ExitCode::from(EXIT_INTERRUPTED)
    } else {
        ExitCode::SUCCESS
    })
}

/// Run a profile on its schedule, pausing on network loss
async fn run_daemon(config: &Config, profile: &Profile) -> anyhow::Result<()> {
    let Some(schedule) = profile.schedule.clone() else {
        anyhow::bail!("Profile '{}' has no schedule", profile.name);
    };

    println!("Skiff daemon");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("Profile: {}", profile.name);
    println!("Schedule: {}", schedule);
    println!("Pause on network loss: {}", config.network.pause_on_loss);

    let history = history_recorder(config);
    let mut running = Vec::new();

    for target in profile.targets() {
        let session = build_session(config, &target, &history)?;
        let destination = target.endpoint.remote_spec(&target.remote_path);

        let guard = NetworkGuard::spawn(
            TcpProbe::for_endpoint(&target.endpoint, &config.network),
            session.clone(),
            config.network.pause_on_loss,
        );

        let logger = tokio::spawn(log_events(destination.clone(), session.subscribe()));

        session.set_schedule(Some(schedule.clone()))?;
        match session.next_scheduled_run() {
            Some(at) => println!(
                "{}: next run {}",
                destination,
                at.with_timezone(&chrono::Local).format("%a %Y-%m-%d %H:%M")
            ),
            None => println!("{}: no upcoming run", destination),
        }

        running.push((session, guard, logger));
    }

    println!("\nPress Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    println!("\nShutting down...");

    for (session, _guard, logger) in &running {
        session.set_schedule(None)?;
        if session.is_busy() {
            session.cancel()?;
            let state = session.wait_until_settled().await?;
            tracing::info!("Stopped: {}", state);
        }
        logger.abort();
    }

    Ok(())
}

/// Log session events until the session goes away, returning how many were seen
async fn log_events(label: String, mut events: broadcast::Receiver<SessionEvent>) -> usize {
    let mut seen = 0;
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!("{}: {} events dropped from the log", label, skipped);
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        seen += 1;
        match event {
            SessionEvent::State(TransferState::Failed(failure)) => {
                tracing::warn!("{}: failed: {}", label, failure.error);
            }
            SessionEvent::State(state) => tracing::info!("{}: {}", label, state),
            SessionEvent::Transfer(event) => tracing::trace!("{}: {:?}", label, event),
        }
    }
    seen
}

/// Print upcoming runs in local time
fn show_next(profile: &Profile, count: usize) -> anyhow::Result<()> {
    let Some(schedule) = &profile.schedule else {
        anyhow::bail!("Profile '{}' has no schedule", profile.name);
    };

    println!("{}: {}", profile.name, schedule);
    let runs = upcoming(schedule, &chrono::Local::now(), count);
    if runs.is_empty() {
        println!("  no upcoming runs");
    }
    for run in runs {
        println!("  {}", run.format("%a %Y-%m-%d %H:%M %:z"));
    }
    Ok(())
}

/// Classify a saved transfer log
fn classify_log(log: &Path, host: &str, exit_code: Option<i32>) -> anyhow::Result<ExitCode> {
    let contents = std::fs::read_to_string(log)?;
    let output: String = contents
        .lines()
        .map(strip_stream_marker)
        .collect::<Vec<_>>()
        .join("\n");

    let error = classify(&output, exit_code, host);
    println!("{}", error);
    println!(
        "{}",
        if error.is_permanent() {
            "permanent: fix the cause before retrying"
        } else {
            "transient: a retry may succeed"
        }
    );

    Ok(match error {
        TransferError::Unknown(_) => ExitCode::FAILURE,
        _ => ExitCode::SUCCESS,
    })
}

/// Print the most recent history records
fn show_history(config: &Config, limit: usize) -> anyhow::Result<()> {
    let history = JsonLinesHistory::new(&config.history.path);
    let records = history.load()?;
    if records.is_empty() {
        println!("No transfers recorded in {}", history.path().display());
        return Ok(());
    }

    let skip = records.len().saturating_sub(limit);
    for record in records.iter().skip(skip) {
        let marker = if record.success {
            style("✓").green()
        } else {
            style("✗").red()
        };
        println!(
            "{} {} {} {} {} ({}, {} attempt(s))",
            marker,
            record
                .started_at
                .with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M"),
            record.direction,
            record.local_path.display(),
            record.remote_path,
            format_bytes(record.total_bytes),
            record.attempts
        );
    }
    Ok(())
}

/// Write the example configuration
fn init_config(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    Config::example().save(path)?;
    println!("Configuration written to {}", path.display());
    Ok(())
}
