//! Line-local extractors for rsync progress output
//!
//! rsync's human-readable output is not a stable protocol. Every extractor
//! here looks at one complete line in isolation, and answers "no match"
//! rather than failing when the line is not what it expects. A single line
//! may satisfy several extractors; callers get all of them.
//!
//! Typical `-v --progress` output:
//!
//! ```text
//! sending incremental file list
//! photos/
//! photos/beach.jpg
//!       1,048,576  42%    1.23MB/s    0:00:02
//!
//! sent 2,621,655 bytes  received 35 bytes  1,747,793.33 bytes/sec
//! total size is 2,621,440  speedup is 1.00
//! ```

use crate::event::TransferEvent;

/// Line prefixes that are never file names
const NON_FILE_PREAMBLES: &[&str] = &["sending", "receiving", "sent ", "total size"];

/// Fraction from the first 1-3 digit run immediately followed by `%`
///
/// ```
/// use skiff_core::output::parse_progress;
///
/// assert_eq!(parse_progress("  42%"), Some(0.42));
/// assert_eq!(parse_progress("no percent here"), None);
/// ```
pub fn parse_progress(line: &str) -> Option<f64> {
    let bytes = line.as_bytes();

    for (idx, byte) in bytes.iter().enumerate() {
        if *byte != b'%' {
            continue;
        }
        let run = bytes[..idx]
            .iter()
            .rev()
            .take(3)
            .take_while(|b| b.is_ascii_digit())
            .count();
        if run == 0 {
            continue;
        }
        let digits = &line[idx - run..idx];
        let value: f64 = digits.parse().ok()?;
        return Some((value / 100.0).clamp(0.0, 1.0));
    }

    None
}

/// Path announced on a line, by heuristic
///
/// Rejects empty lines, progress lines and the known preambles, then keeps
/// anything that ends in `/` or contains `/` or `.`. Log lines that happen
/// to contain those characters are misread as paths; that approximation is
/// accepted.
pub fn extract_file(line: &str) -> Option<String> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.contains('%') {
        return None;
    }
    if NON_FILE_PREAMBLES
        .iter()
        .any(|prefix| trimmed.starts_with(prefix))
    {
        return None;
    }
    if trimmed.ends_with('/') || trimmed.contains('/') || trimmed.contains('.') {
        return Some(trimmed.to_string());
    }
    None
}

/// First whitespace-delimited token containing `/s`
pub fn parse_speed(line: &str) -> Option<String> {
    line.split_whitespace()
        .find(|token| token.contains("/s"))
        .map(str::to_string)
}

/// Sum of sent and received bytes from the closing summary line
///
/// ```
/// use skiff_core::output::parse_bytes_transferred;
///
/// let line = "sent 1,234 bytes  received 5,678 bytes  2,304.00 bytes/sec";
/// assert_eq!(parse_bytes_transferred(line), Some(6_912));
/// ```
pub fn parse_bytes_transferred(line: &str) -> Option<u64> {
    if !(line.contains("sent") && line.contains("received") && line.contains("bytes")) {
        return None;
    }
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let sent = number_after(&tokens, "sent")?;
    let received = number_after(&tokens, "received")?;
    sent.checked_add(received)
}

/// Total size from rsync's `total size is N  speedup is X` line
pub fn parse_total_size(line: &str) -> Option<u64> {
    let rest = line.trim_start().strip_prefix("total size is")?;
    parse_count(rest.split_whitespace().next()?)
}

/// Every event a line yields, in the order progress, file, speed, bytes
pub fn extract_all(line: &str) -> Vec<TransferEvent> {
    let mut events = Vec::new();
    if let Some(fraction) = parse_progress(line) {
        events.push(TransferEvent::ProgressSample(fraction));
    }
    if let Some(path) = extract_file(line) {
        events.push(TransferEvent::FileStarted(path));
    }
    if let Some(rate) = parse_speed(line) {
        events.push(TransferEvent::SpeedSample(rate));
    }
    if let Some(total) = parse_bytes_transferred(line) {
        events.push(TransferEvent::BytesTransferred(total));
    }
    events
}

fn number_after(tokens: &[&str], keyword: &str) -> Option<u64> {
    let idx = tokens.iter().position(|t| *t == keyword)?;
    parse_count(tokens.get(idx + 1)?)
}

fn parse_count(token: &str) -> Option<u64> {
    let digits: String = token.chars().filter(|c| *c != ',').collect();
    digits.parse().ok()
}
