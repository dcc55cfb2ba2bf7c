//! Per-job run history logs.
//!
//! Each job appends newline-delimited JSON entries to `runs/<id>.jsonl`.
//! When a file outgrows the byte budget its tail is rewritten keeping
//! only the newest entries, via temp file + rename.

use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::warn;

use super::types::RunLogEntry;
use crate::error::Result;

/// Prune when a history file exceeds this many bytes
pub const MAX_HISTORY_BYTES: u64 = 2 * 1024 * 1024;

/// Entries kept after a prune
pub const MAX_HISTORY_LINES: usize = 2_000;

/// Summaries are truncated to this many characters before logging
pub const MAX_SUMMARY_CHARS: usize = 2_000;

/// Append-only run histories under a `runs/` directory
pub struct RunHistory {
    dir: PathBuf,
}

impl RunHistory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Append one entry to a job's history, pruning if the file has
    /// outgrown its budget.
    pub fn append(&self, job_id: &str, entry: &RunLogEntry) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.file_path(job_id);

        let mut entry = entry.clone();
        if let Some(summary) = entry.summary.take() {
            entry.summary = Some(summary.chars().take(MAX_SUMMARY_CHARS).collect());
        }

        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        file.write_all(line.as_bytes())?;
        drop(file);

        if std::fs::metadata(&path)?.len() > MAX_HISTORY_BYTES {
            self.prune(&path)?;
        }
        Ok(())
    }

    /// The newest `limit` entries, oldest first
    pub fn read(&self, job_id: &str, limit: usize) -> Result<Vec<RunLogEntry>> {
        let path = self.file_path(job_id);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let entries: Vec<RunLogEntry> = content
            .lines()
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!("skipping malformed run log line: {e}");
                    None
                }
            })
            .collect();

        let skip = entries.len().saturating_sub(limit);
        Ok(entries.into_iter().skip(skip).collect())
    }

    /// Rewrite the file keeping the newest entries, within both the line
    /// and byte budgets
    fn prune(&self, path: &Path) -> Result<()> {
        let content = std::fs::read_to_string(path)?;
        let lines: Vec<&str> = content.lines().filter(|l| !l.is_empty()).collect();

        let mut start = lines.len().saturating_sub(MAX_HISTORY_LINES);
        let mut bytes: u64 = lines[start..].iter().map(|l| l.len() as u64 + 1).sum();
        while bytes > MAX_HISTORY_BYTES && start < lines.len() {
            bytes -= lines[start].len() as u64 + 1;
            start += 1;
        }

        let mut kept = lines[start..].join("\n");
        kept.push('\n');

        let tmp = path.with_extension("jsonl.tmp");
        std::fs::write(&tmp, kept)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    fn file_path(&self, job_id: &str) -> PathBuf {
        // Job ids are UUIDs; strip anything path-like just in case
        let safe: String = job_id
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
            .collect();
        self.dir.join(format!("{safe}.jsonl"))
    }
}
