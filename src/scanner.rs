//! Log scanning for known error signatures.
//!
//! Only the tail of each log is examined. Files are read backwards in fixed
//! blocks until enough lines are buffered, so memory stays proportional to
//! the lines kept rather than the file size. Uses synchronous `std::fs`
//! reads since these are quick local operations.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info};

use crate::rules::{RuleSet, Severity};

/// Lines examined at the end of each log file.
pub const TAIL_LINES: usize = 1000;

/// Bytes read per backwards step.
const BLOCK_SIZE: u64 = 8192;

/// A pattern match found during one scan. Lives for one cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DetectedError {
    /// Id of the matching pattern.
    pub pattern_id: String,
    /// Name of the matching pattern.
    pub pattern_name: String,
    /// Severity of the matching pattern.
    pub severity: Severity,
    /// Log file the line came from.
    pub log_file: PathBuf,
    /// The first matching line, trimmed.
    pub matched_line: String,
    /// When the match was found.
    pub detected_at: DateTime<Utc>,
}

/// Read at most the last `max_lines` lines of a file.
///
/// Invalid UTF-8 is replaced rather than rejected. Lines are returned in file
/// order without their terminators.
///
/// # Errors
///
/// Returns the I/O error if the file cannot be opened, sized, or read.
pub fn tail_lines(path: &Path, max_lines: usize) -> std::io::Result<Vec<String>> {
    if max_lines == 0 {
        return Ok(Vec::new());
    }

    let mut file = File::open(path)?;
    let len = file.metadata()?.len();

    let mut pos = len;
    let mut buf: Vec<u8> = Vec::new();
    let mut newlines: usize = 0;

    // One extra newline marks where the oldest kept line starts.
    while pos > 0 && newlines <= max_lines {
        let step = BLOCK_SIZE.min(pos);
        pos = pos.saturating_sub(step);

        let mut chunk = vec![0u8; usize::try_from(step).unwrap_or(0)];
        file.seek(SeekFrom::Start(pos))?;
        file.read_exact(&mut chunk)?;

        newlines = newlines.saturating_add(chunk.iter().filter(|&&b| b == b'\n').count());
        chunk.extend_from_slice(&buf);
        buf = chunk;
    }

    let text = String::from_utf8_lossy(&buf);
    let mut lines: Vec<&str> = text.lines().collect();

    // The first buffered line is partial unless we reached the file start.
    if pos > 0 && !lines.is_empty() {
        lines.remove(0);
    }

    let skip = lines.len().saturating_sub(max_lines);
    Ok(lines
        .into_iter()
        .skip(skip)
        .map(|l| l.trim_end_matches('\r').to_owned())
        .collect())
}

/// Match every pattern against already-read lines of one file.
///
/// Produces at most one detection per pattern: the first matching line.
pub fn match_lines(
    lines: &[String],
    log_file: &Path,
    rules: &RuleSet,
    now: DateTime<Utc>,
) -> Vec<DetectedError> {
    rules
        .patterns
        .iter()
        .filter_map(|pattern| {
            lines
                .iter()
                .find(|line| pattern.is_match(line))
                .map(|line| DetectedError {
                    pattern_id: pattern.def.id.clone(),
                    pattern_name: pattern.def.name.clone(),
                    severity: pattern.def.severity,
                    log_file: log_file.to_path_buf(),
                    matched_line: line.trim().to_owned(),
                    detected_at: now,
                })
        })
        .collect()
}

/// Scan every log source against the rule set.
///
/// Missing files are skipped quietly; unreadable files are logged and
/// skipped. Detections come back in source order, then pattern order.
pub fn scan_logs(sources: &[PathBuf], rules: &RuleSet) -> Vec<DetectedError> {
    let mut detected = Vec::new();

    for path in sources {
        if !path.exists() {
            debug!(path = %path.display(), "log file not found, skipping");
            continue;
        }

        let lines = match tail_lines(path, TAIL_LINES) {
            Ok(lines) => lines,
            Err(e) => {
                error!(path = %path.display(), error = %e, "failed to read log file");
                continue;
            }
        };

        for found in match_lines(&lines, path, rules, Utc::now()) {
            info!(
                pattern = %found.pattern_id,
                name = %found.pattern_name,
                severity = ?found.severity,
                path = %path.display(),
                "error detected"
            );
            detected.push(found);
        }
    }

    detected
}
