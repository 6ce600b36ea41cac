//! Append-only ordered command log for analysis sandboxes.
//!
//! Every sandbox command invoked via the recorder decorator (C9) is
//! persisted here in execution order, satisfying §8's invariant that
//! command-log entries are "appended and retrievable in execution order."
//!
//! # Example
//!
//! ```
//! use inspectd_events::{CommandLog, commands_path};
//! use inspectd_types::CommandLogEntry;
//! use chrono::Utc;
//! use std::time::Duration;
//!
//! let mut log = CommandLog::new();
//! log.record(CommandLogEntry {
//!     argv: vec!["git".into(), "diff".into()],
//!     duration: Duration::from_millis(120),
//!     output: "<42 bytes suppressed>".into(),
//!     recorded_at: Utc::now(),
//! });
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use inspectd_types::CommandLogEntry;

/// Default command-log file name, one per analysis.
pub const COMMANDS_FILE: &str = "commands.jsonl";

/// Get the command-log file path for an analysis's state directory.
pub fn commands_path(state_dir: &Path) -> PathBuf {
    state_dir.join(COMMANDS_FILE)
}

/// Append-only, in-execution-order log of sandbox commands for one analysis.
#[derive(Debug, Default)]
pub struct CommandLog {
    entries: Vec<CommandLogEntry>,
}

impl CommandLog {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Appends an entry, preserving execution order.
    pub fn record(&mut self, entry: CommandLogEntry) {
        self.entries.push(entry);
    }

    /// Writes all recorded entries to `path` in JSONL format, appending if
    /// the file already exists.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create commands dir {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open commands file {}", path.display()))?;

        let mut writer = std::io::BufWriter::new(file);

        for entry in &self.entries {
            let line =
                serde_json::to_string(entry).context("failed to serialize command log entry")?;
            writeln!(writer, "{line}").context("failed to write command log line")?;
        }

        writer.flush().context("failed to flush commands file")?;

        Ok(())
    }

    /// Reads all entries from a JSONL file, preserving on-disk order.
    pub fn read_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }

        let file = File::open(path)
            .with_context(|| format!("failed to open commands file {}", path.display()))?;

        let reader = BufReader::new(file);
        let mut entries = Vec::new();

        for line in reader.lines() {
            let line = line.with_context(|| {
                format!("failed to read line from commands file {}", path.display())
            })?;
            let entry: CommandLogEntry = serde_json::from_str(&line)
                .with_context(|| format!("failed to parse command log JSON from line: {line}"))?;
            entries.push(entry);
        }

        Ok(Self { entries })
    }

    pub fn all_entries(&self) -> &[CommandLogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration;
    use tempfile::tempdir;

    fn sample_entry(argv: &[&str]) -> CommandLogEntry {
        CommandLogEntry {
            argv: argv.iter().map(|s| s.to_string()).collect(),
            duration: Duration::from_millis(50),
            output: "ok".to_string(),
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn new_log_is_empty() {
        let log = CommandLog::new();
        assert!(log.is_empty());
        assert_eq!(log.len(), 0);
    }

    #[test]
    fn record_preserves_execution_order() {
        let mut log = CommandLog::new();
        log.record(sample_entry(&["git", "clone"]));
        log.record(sample_entry(&["git", "diff"]));
        log.record(sample_entry(&["golint", "."]));

        let argvs: Vec<_> = log.all_entries().iter().map(|e| e.argv[0].clone()).collect();
        assert_eq!(argvs, vec!["git", "git", "golint"]);
    }

    #[test]
    fn write_to_file_creates_jsonl_format() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("commands.jsonl");

        let mut log = CommandLog::new();
        log.record(sample_entry(&["git", "clone"]));
        log.write_to_file(&path).expect("write");

        let content = fs::read_to_string(&path).expect("read");
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 1);
        let _: CommandLogEntry = serde_json::from_str(lines[0]).expect("parse");
    }

    #[test]
    fn write_to_file_appends_to_existing_file() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("commands.jsonl");

        let mut log1 = CommandLog::new();
        log1.record(sample_entry(&["git", "clone"]));
        log1.write_to_file(&path).expect("write first");

        let mut log2 = CommandLog::new();
        log2.record(sample_entry(&["git", "diff"]));
        log2.write_to_file(&path).expect("write second");

        let content = fs::read_to_string(&path).expect("read");
        assert_eq!(content.lines().count(), 2);
    }

    #[test]
    fn read_from_file_preserves_order() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("commands.jsonl");

        let mut log = CommandLog::new();
        log.record(sample_entry(&["git", "clone"]));
        log.record(sample_entry(&["git", "diff"]));
        log.write_to_file(&path).expect("write");

        let loaded = CommandLog::read_from_file(&path).expect("read");
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.all_entries()[0].argv[1], "clone");
        assert_eq!(loaded.all_entries()[1].argv[1], "diff");
    }

    #[test]
    fn read_from_file_returns_empty_log_when_missing() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("nonexistent.jsonl");

        let loaded = CommandLog::read_from_file(&path).expect("read");
        assert!(loaded.is_empty());
    }

    #[test]
    fn path_helper_returns_expected_path() {
        let base = PathBuf::from("x");
        assert_eq!(commands_path(&base), PathBuf::from("x").join(COMMANDS_FILE));
    }
}
