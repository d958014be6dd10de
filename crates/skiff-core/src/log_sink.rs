//! Append-only sink for raw transfer output

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use crate::event::StreamKind;

/// Destination for every raw line a transfer prints
///
/// Truncated once at the start of a sync sequence, then appended to across
/// all of its attempts. Durability is best effort.
pub trait LogSink: Send + Sync {
    /// Discard previous content
    fn truncate(&self) -> io::Result<()>;

    /// Append one line from `stream`
    fn append(&self, stream: StreamKind, line: &str) -> io::Result<()>;
}

/// Discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NullLogSink;

impl LogSink for NullLogSink {
    fn truncate(&self) -> io::Result<()> {
        Ok(())
    }

    fn append(&self, _stream: StreamKind, _line: &str) -> io::Result<()> {
        Ok(())
    }
}

/// Plain-text log file, one line per output line
///
/// stderr lines are prefixed with `! ` so a saved log can still be told
/// apart when it is classified later.
#[derive(Debug)]
pub struct FileLogSink {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl FileLogSink {
    /// Create a sink writing to `path`; the file is opened lazily
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    /// Log file location
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self, truncate: bool) -> io::Result<File> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut options = OpenOptions::new();
        options.create(true);
        if truncate {
            options.write(true).truncate(true);
        } else {
            options.append(true);
        }
        options.open(&self.path)
    }
}

impl LogSink for FileLogSink {
    fn truncate(&self) -> io::Result<()> {
        let mut guard = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        *guard = Some(self.open(true)?);
        Ok(())
    }

    fn append(&self, stream: StreamKind, line: &str) -> io::Result<()> {
        let mut guard = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_none() {
            *guard = Some(self.open(false)?);
        }
        let Some(file) = guard.as_mut() else {
            return Ok(());
        };
        match stream {
            StreamKind::Stdout => writeln!(file, "{line}"),
            StreamKind::Stderr => writeln!(file, "! {line}"),
        }
    }
}

/// Strip the stderr marker written by [`FileLogSink`]
#[must_use]
pub fn strip_stream_marker(line: &str) -> &str {
    line.strip_prefix("! ").unwrap_or(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_file_sink_truncate_and_append() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("logs").join("transfer.log");
        let sink = FileLogSink::new(&path);

        sink.append(StreamKind::Stdout, "stale").unwrap();
        sink.truncate().unwrap();
        sink.append(StreamKind::Stdout, "photos/a.jpg").unwrap();
        sink.append(StreamKind::Stderr, "rsync: link_stat failed").unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "photos/a.jpg\n! rsync: link_stat failed\n");
    }

    #[test]
    fn test_append_across_instances() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("transfer.log");

        FileLogSink::new(&path).append(StreamKind::Stdout, "one").unwrap();
        FileLogSink::new(&path).append(StreamKind::Stdout, "two").unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "one\ntwo\n");
    }

    #[test]
    fn test_strip_stream_marker() {
        assert_eq!(strip_stream_marker("! ssh: timeout"), "ssh: timeout");
        assert_eq!(strip_stream_marker("file.txt"), "file.txt");
    }

    #[test]
    fn test_null_sink() {
        let sink = NullLogSink;
        assert!(sink.truncate().is_ok());
        assert!(sink.append(StreamKind::Stderr, "x").is_ok());
    }
}
