//! AnalysisRecord (C9): in-memory analysis bookkeeping, the recorder
//! decorator that transparently persists every sandboxed command to an
//! append-only command log, and the background janitor that reclaims old
//! command logs.
//!
//! # Example
//!
//! ```
//! use inspectd_store::AnalysisStore;
//! use inspectd_types::Job;
//!
//! let store = AnalysisStore::new();
//! let job = Job {
//!     event: inspectd_types::EventKind::Push,
//!     repository: inspectd_types::RepositoryRef { id: 1, url: "https://example.com/repo.git".into() },
//!     head: inspectd_types::Revision::new("https://example.com/repo.git", "abc"),
//!     base: inspectd_types::Revision::new("https://example.com/repo.git", "def"),
//!     request_number: 0,
//!     installation_id: 1,
//! };
//! let analysis = store.start(&job);
//! assert_eq!(analysis.status, inspectd_types::AnalysisStatus::Pending);
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use chrono::Utc;
use inspectd_events::CommandLog;
use inspectd_process::{CommandOutput, Sandbox, SandboxError};
use inspectd_types::{Analysis, AnalysisStatus, CommandLogEntry, Job, ToolRecord};
use thiserror::Error;

/// Above this size, captured output is truncated to a head and tail window
/// with a suppression marker in between.
pub const TRUNCATE_THRESHOLD_BYTES: usize = 10 * 1024;
const TRUNCATE_WINDOW_BYTES: usize = 2 * 1024;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no analysis with id {0}")]
    NotFound(i64),
}

/// In-memory registry of analyses, keyed by id. A real deployment backs this
/// with the `analysis`/`analysis_tool`/`issues` tables named in the wire
/// contract; this registry holds the same shape in memory so the rest of the
/// pipeline can be built and tested without a database.
#[derive(Debug, Default)]
pub struct AnalysisStore {
    next_id: AtomicI64,
    analyses: Mutex<HashMap<i64, Analysis>>,
}

impl AnalysisStore {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            analyses: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a pending analysis record for `job` and returns it. The
    /// record is also retained for later lookup via [`AnalysisStore::get`].
    pub fn start(&self, job: &Job) -> Analysis {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let analysis = Analysis::pending(
            id,
            job.installation_id,
            job.repository.id,
            job.base.reference.clone(),
            job.head.reference.clone(),
            job.request_number,
        );
        self.analyses
            .lock()
            .expect("analyses mutex poisoned")
            .insert(id, analysis.clone());
        analysis
    }

    /// Appends a completed tool's record to the analysis.
    pub fn record_tool(&self, id: i64, record: ToolRecord) -> Result<(), StoreError> {
        let mut guard = self.analyses.lock().expect("analyses mutex poisoned");
        let analysis = guard.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        analysis.tools.push(record);
        Ok(())
    }

    /// Marks the analysis complete, recording status and phase durations.
    pub fn finish(
        &self,
        id: i64,
        status: AnalysisStatus,
        clone_duration: StdDuration,
        deps_duration: StdDuration,
        total_duration: StdDuration,
    ) -> Result<(), StoreError> {
        let mut guard = self.analyses.lock().expect("analyses mutex poisoned");
        let analysis = guard.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        analysis.status = status;
        analysis.clone_duration = clone_duration;
        analysis.deps_duration = deps_duration;
        analysis.total_duration = total_duration;
        Ok(())
    }

    /// Attaches the recorder's command log to the analysis, in execution
    /// order, once the job has finished running commands.
    pub fn record_commands(&self, id: i64, commands: Vec<CommandLogEntry>) -> Result<(), StoreError> {
        let mut guard = self.analyses.lock().expect("analyses mutex poisoned");
        let analysis = guard.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        analysis.commands = commands;
        Ok(())
    }

    pub fn get(&self, id: i64) -> Option<Analysis> {
        self.analyses
            .lock()
            .expect("analyses mutex poisoned")
            .get(&id)
            .cloned()
    }
}

/// Truncates captured command output per the retention policy: `git diff`
/// invocations are suppressed wholesale (the patch itself is retained
/// separately, not duplicated into the command log); anything else is kept
/// whole under [`TRUNCATE_THRESHOLD_BYTES`], otherwise head/tail-trimmed
/// around a suppression marker. Trailing whitespace is stripped and NUL
/// bytes are dropped.
pub fn truncate_output(argv: &[String], output: &str) -> String {
    let cleaned: String = output.chars().filter(|&c| c != '\0').collect();
    let trimmed = cleaned.trim_end();

    let is_diff = argv.first().map(|s| s.as_str()) == Some("git")
        && argv.get(1).map(|s| s.as_str()) == Some("diff");

    if is_diff {
        return format!("<{} bytes suppressed>", trimmed.len());
    }

    if trimmed.len() <= TRUNCATE_THRESHOLD_BYTES {
        return trimmed.to_string();
    }

    let head = &trimmed[..TRUNCATE_WINDOW_BYTES.min(trimmed.len())];
    let tail_start = trimmed.len().saturating_sub(TRUNCATE_WINDOW_BYTES);
    let tail = &trimmed[tail_start..];
    let suppressed = trimmed.len() - head.len() - tail.len();
    format!("{head}\n...{suppressed} bytes suppressed...\n{tail}")
}

/// Decorates any [`Sandbox`] so that every `run` call is transparently
/// appended to an in-memory, execution-ordered command log and optionally
/// flushed to disk. Constructing this is what the Orchestrator calls the
/// "recorder" when it wraps the acquired sandbox before handing it to
/// ToolRunner.
pub struct RecordingSandbox<'a> {
    inner: &'a dyn Sandbox,
    log: Mutex<CommandLog>,
}

impl<'a> RecordingSandbox<'a> {
    pub fn wrap(inner: &'a dyn Sandbox) -> Self {
        Self {
            inner,
            log: Mutex::new(CommandLog::new()),
        }
    }

    /// Persists every recorded entry to `path` in execution order.
    pub fn flush(&self, path: &Path) -> Result<()> {
        self.log
            .lock()
            .expect("command log mutex poisoned")
            .write_to_file(path)
            .context("failed to flush command log")
    }

    pub fn entries(&self) -> Vec<CommandLogEntry> {
        self.log
            .lock()
            .expect("command log mutex poisoned")
            .all_entries()
            .to_vec()
    }
}

impl Sandbox for RecordingSandbox<'_> {
    fn root(&self) -> &Path {
        self.inner.root()
    }

    fn run(
        &self,
        argv: &[&str],
        deadline: StdDuration,
    ) -> Result<CommandOutput, SandboxError> {
        let result = self.inner.run(argv, deadline);
        if let Ok(out) = &result {
            let argv_owned: Vec<String> = argv.iter().map(|s| s.to_string()).collect();
            let entry = CommandLogEntry {
                output: truncate_output(&argv_owned, &out.output),
                argv: argv_owned,
                duration: out.duration,
                recorded_at: Utc::now(),
            };
            self.log.lock().expect("command log mutex poisoned").record(entry);
        }
        result
    }

    fn release(&self) {
        self.inner.release();
    }
}

/// Purges command-log files under `root` whose modification time is older
/// than `max_age`, once per `interval`. Runs until `shutdown` reports it is
/// shutting down.
pub async fn run_janitor(
    root: PathBuf,
    interval: StdDuration,
    max_age: StdDuration,
    shutdown: inspectd_types::ShutdownState,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        if shutdown.is_shutting_down() {
            return;
        }
        if let Err(err) = sweep_once(&root, max_age) {
            tracing::warn!(error = %err, "janitor sweep failed");
        }
    }
}

fn sweep_once(root: &Path, max_age: StdDuration) -> Result<()> {
    if !root.exists() {
        return Ok(());
    }
    let now = std::time::SystemTime::now();
    for entry in std::fs::read_dir(root).context("failed to read janitor root")? {
        let entry = entry.context("failed to read janitor entry")?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
            continue;
        }
        let metadata = entry.metadata().context("failed to stat janitor entry")?;
        let modified = metadata.modified().context("failed to read mtime")?;
        if let Ok(age) = now.duration_since(modified) {
            if age > max_age {
                std::fs::remove_file(&path)
                    .with_context(|| format!("failed to remove stale log {}", path.display()))?;
            }
        }
    }
    Ok(())
}

/// Default janitor sweep cadence (§4.9: every 30 minutes).
pub const JANITOR_INTERVAL: StdDuration = StdDuration::from_secs(30 * 60);
/// Default command-log retention window (§4.9: 30 days).
pub const JANITOR_MAX_AGE: StdDuration = StdDuration::from_secs(30 * 24 * 60 * 60);
