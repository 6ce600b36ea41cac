//! # Types
//!
//! Core domain types for inspectd, the hosted continuous-inspection pipeline.
//!
//! This module defines the fundamental data structures passed between the
//! pipeline's components:
//! - [`Job`] - the unit of work delivered by the queue
//! - [`Tool`] - a pre-registered static-analysis executable
//! - [`RepoConfig`] - the merged tool list effective for one job
//! - [`Issue`] - one surviving finding
//! - [`Analysis`] - the per-job persistent record
//! - [`Installation`] - a credential triple authorizing the service on a repo's behalf
//!
//! ## Serialization
//!
//! Most types implement `Serialize`/`Deserialize` from `serde` for queue
//! transport and persistence. Durations are serialized as milliseconds for
//! cross-platform compatibility, accepting either a millisecond integer or a
//! humantime string (`"1m30s"`) on the way in.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Deserialize a Duration from either a humantime string or a raw millisecond count.
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DurationHelper {
        String(String),
        U64(u64),
    }

    match DurationHelper::deserialize(deserializer)? {
        DurationHelper::String(s) => humantime::parse_duration(&s)
            .map_err(|e| serde::de::Error::custom(format!("invalid duration: {e}"))),
        DurationHelper::U64(ms) => Ok(Duration::from_millis(ms)),
    }
}

/// Serialize a Duration as milliseconds (u64) so it roundtrips with [`deserialize_duration`].
pub fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// The triggering event kind for a [`Job`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Push,
    Request,
}

/// A repository identified both numerically (stable across renames) and by
/// a fetchable clone URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryRef {
    pub id: i64,
    pub url: String,
}

/// A revision: a fetchable URL paired with a ref or SHA.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    pub url: String,
    pub reference: String,
}

impl Revision {
    pub fn new(url: impl Into<String>, reference: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reference: reference.into(),
        }
    }
}

/// The all-zero SHA used by code hosts to signal "no prior commit" on push events.
pub const ZERO_SHA: &str = "0000000000000000000000000000000000000000";

/// The unit of work delivered by the queue. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub event: EventKind,
    pub repository: RepositoryRef,
    pub head: Revision,
    pub base: Revision,
    /// 0 for push events.
    pub request_number: u64,
    /// Opaque credential selector for the reporter collaborator.
    pub installation_id: i64,
}

impl Job {
    pub fn is_push(&self) -> bool {
        matches!(self.event, EventKind::Push)
    }
}

/// A pre-registered static-analysis program invocation.
///
/// Tool ids are stable across runs so results can be correlated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tool {
    pub id: String,
    pub name: String,
    pub path: String,
    /// Argument template tokens; `%BASE_BRANCH%` is substituted with the
    /// resolved base reference at run time.
    pub args: Vec<String>,
    /// Optional regex used to parse non-standard output into
    /// `file:line:col: message` triples.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
}

impl Tool {
    /// Expands `%BASE_BRANCH%` tokens in this tool's argument template.
    pub fn expand_args(&self, base_branch: &str) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.replace("%BASE_BRANCH%", base_branch))
            .collect()
    }
}

/// The merged configuration for a single analysis: constructed once per job,
/// read-only thereafter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoConfig {
    pub tools: Vec<Tool>,
    #[serde(default)]
    pub apt_packages: Vec<String>,
}

/// One surviving finding. Every Issue references a line that exists as an
/// added-or-changed line in the patch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub path: String,
    /// 1-based, in the head revision.
    pub line: u32,
    /// 1-based position within the file's first hunk of the patch.
    pub hunk_pos: u32,
    /// Human-readable message, prefixed with the tool's display name.
    pub message: String,
}

/// Per-tool sub-record: independent duration plus the issue list (or error).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRecord {
    pub tool_id: String,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub duration: Duration,
    pub issues: Vec<Issue>,
    /// Execution failure (binary missing, deadline exceeded). `None` on a
    /// normal run regardless of exit code or issue count.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One row of the ordered command log persisted by the recorder decorator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandLogEntry {
    pub argv: Vec<String>,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub duration: Duration,
    /// Truncated, trailing-whitespace-stripped, `NULL`-normalized output.
    pub output: String,
    pub recorded_at: DateTime<Utc>,
}

/// Terminal status of an [`Analysis`]. `Pending` is the only initial state;
/// the three others are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    Pending,
    Success,
    Failure,
    Error,
}

impl fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AnalysisStatus::Pending => "pending",
            AnalysisStatus::Success => "success",
            AnalysisStatus::Failure => "failure",
            AnalysisStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// The per-job persistent record. Created at Orchestrator start (`Pending`),
/// finalized exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analysis {
    pub id: i64,
    pub installation_id: i64,
    pub repository_id: i64,
    pub commit_from: String,
    pub commit_to: String,
    pub request_number: u64,
    pub status: AnalysisStatus,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub clone_duration: Duration,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub deps_duration: Duration,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub total_duration: Duration,
    pub created_at: DateTime<Utc>,
    pub tools: Vec<ToolRecord>,
    pub commands: Vec<CommandLogEntry>,
}

impl Analysis {
    pub fn pending(
        id: i64,
        installation_id: i64,
        repository_id: i64,
        commit_from: impl Into<String>,
        commit_to: impl Into<String>,
        request_number: u64,
    ) -> Self {
        Self {
            id,
            installation_id,
            repository_id,
            commit_from: commit_from.into(),
            commit_to: commit_to.into(),
            request_number,
            status: AnalysisStatus::Pending,
            clone_duration: Duration::ZERO,
            deps_duration: Duration::ZERO,
            total_duration: Duration::ZERO,
            created_at: Utc::now(),
            tools: Vec::new(),
            commands: Vec::new(),
        }
    }

    /// Total surviving issue count across all tool sub-records.
    pub fn issue_count(&self) -> usize {
        self.tools.iter().map(|t| t.issues.len()).sum()
    }
}

/// A credential record authorizing the service to act on a repository's
/// behalf, registered/deregistered via the `installation` webhook event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Installation {
    pub installation_id: i64,
    pub account_id: i64,
    pub sender_id: i64,
    pub enabled_at: DateTime<Utc>,
}

/// Process-wide, single-writer/many-reader shutdown flag. The writer is the
/// signal handler; the readers are the health endpoint and the queue
/// consumer loop.
#[derive(Debug, Clone, Default)]
pub struct ShutdownState(Arc<AtomicBool>);

impl ShutdownState {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn begin_shutdown(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_expands_base_branch_token() {
        let tool = Tool {
            id: "golint".into(),
            name: "golint".into(),
            path: "/usr/bin/golint".into(),
            args: vec!["diff".into(), "%BASE_BRANCH%".into(), "HEAD".into()],
            regex: None,
        };
        assert_eq!(tool.expand_args("main"), vec!["diff", "main", "HEAD"]);
    }

    #[test]
    fn analysis_starts_pending_with_zero_durations() {
        let a = Analysis::pending(1, 2, 3, "base-sha", "head-sha", 0);
        assert_eq!(a.status, AnalysisStatus::Pending);
        assert_eq!(a.total_duration, Duration::ZERO);
        assert_eq!(a.issue_count(), 0);
    }

    #[test]
    fn duration_roundtrips_through_millis_and_humantime() {
        #[derive(Serialize, Deserialize)]
        struct Wrapper {
            #[serde(
                deserialize_with = "deserialize_duration",
                serialize_with = "serialize_duration"
            )]
            d: Duration,
        }

        let w: Wrapper = serde_json::from_str(r#"{"d":"1s"}"#).unwrap();
        assert_eq!(w.d, Duration::from_secs(1));

        let w: Wrapper = serde_json::from_str(r#"{"d":1500}"#).unwrap();
        assert_eq!(w.d, Duration::from_millis(1500));

        let out = serde_json::to_string(&w).unwrap();
        assert_eq!(out, r#"{"d":1500}"#);
    }

    #[test]
    fn shutdown_state_is_visible_across_clones() {
        let state = ShutdownState::new();
        let reader = state.clone();
        assert!(!reader.is_shutting_down());
        state.begin_shutdown();
        assert!(reader.is_shutting_down());
    }
}
