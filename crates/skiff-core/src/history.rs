//! Terminal records of finished sync sequences
//!
//! The session hands exactly one [`HistoryRecord`] to its
//! [`HistoryRecorder`] whenever a sequence settles, whatever the outcome.
//! Formatting rates and sizes for display is left to the consumer.

use std::fs::OpenOptions;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{Direction, TransferTarget};
use crate::error::TransferError;

/// How a sequence ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum HistoryOutcome {
    /// Transfer completed
    Succeeded,
    /// Stopped by the user
    Cancelled,
    /// Stopped because the network went away
    Paused,
    /// Gave up with a classified error
    Failed {
        /// The classified error
        error: TransferError,
    },
}

impl HistoryOutcome {
    /// Returns true for [`HistoryOutcome::Succeeded`]
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, HistoryOutcome::Succeeded)
    }
}

/// One finished sequence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// Sequence start
    pub started_at: DateTime<Utc>,
    /// Sequence end
    pub finished_at: DateTime<Utc>,
    /// Push or pull
    pub direction: Direction,
    /// Local path
    pub local_path: PathBuf,
    /// Remote `user@host:path`
    pub remote_path: String,
    /// Filter tokens joined with spaces
    pub filters: String,
    /// Mirrors `outcome.is_success()`
    pub success: bool,
    /// Detailed outcome
    pub outcome: HistoryOutcome,
    /// Bytes sent plus received, from the final summary line
    pub total_bytes: u64,
    /// Bytes per second over the whole sequence
    pub average_rate: f64,
    /// Attempts made
    pub attempts: u32,
}

impl HistoryRecord {
    /// Build the record for `target`
    pub fn new(
        target: &TransferTarget,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        outcome: HistoryOutcome,
        total_bytes: u64,
        attempts: u32,
    ) -> Self {
        let elapsed = (finished_at - started_at).num_milliseconds() as f64 / 1000.0;
        Self {
            started_at,
            finished_at,
            direction: target.direction,
            local_path: target.local_path.clone(),
            remote_path: target.endpoint.remote_spec(&target.remote_path),
            filters: target.filter_descriptor(),
            success: outcome.is_success(),
            outcome,
            total_bytes,
            average_rate: average_rate(total_bytes, elapsed),
            attempts,
        }
    }
}

/// `total_bytes / elapsed_seconds`, 0 when no time has elapsed
#[must_use]
pub fn average_rate(total_bytes: u64, elapsed_seconds: f64) -> f64 {
    if elapsed_seconds > 0.0 {
        total_bytes as f64 / elapsed_seconds
    } else {
        0.0
    }
}

/// Consumer of finished sequences
pub trait HistoryRecorder: Send + Sync {
    /// Store one record
    fn record(&self, record: HistoryRecord) -> io::Result<()>;
}

/// Drops every record
#[derive(Debug, Clone, Copy, Default)]
pub struct NullHistory;

impl HistoryRecorder for NullHistory {
    fn record(&self, _record: HistoryRecord) -> io::Result<()> {
        Ok(())
    }
}

/// Keeps records in memory
#[derive(Debug, Default)]
pub struct MemoryHistory {
    records: Mutex<Vec<HistoryRecord>>,
}

impl MemoryHistory {
    /// Create an empty history
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every record so far
    pub fn records(&self) -> Vec<HistoryRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl HistoryRecorder for MemoryHistory {
    fn record(&self, record: HistoryRecord) -> io::Result<()> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
        Ok(())
    }
}

/// Appends one JSON object per line to a file
#[derive(Debug)]
pub struct JsonLinesHistory {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonLinesHistory {
    /// History stored at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// File location
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read back every parseable record; malformed lines are skipped
    pub fn load(&self) -> io::Result<Vec<HistoryRecord>> {
        let file = match std::fs::File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!("Skipping malformed history line: {}", e),
            }
        }
        Ok(records)
    }
}

impl HistoryRecorder for JsonLinesHistory {
    fn record(&self, record: HistoryRecord) -> io::Result<()> {
        let line = serde_json::to_string(&record).map_err(io::Error::other)?;

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")
    }
}
