//! Orchestrator (C10): the top-level driver that sequences Sandbox,
//! Cloner, BaseResolver, ConfigReader, PatchExtractor, ToolRunner,
//! DiffFilter, GeneratedFilter, AnalysisRecord and the Reporter collaborator
//! for one job.
//!
//! Step order here follows §2's control-flow text (clone → base → config →
//! patch → deps → tools) rather than the distilled spec's own §4.10
//! numbering, which lists "install apt_packages from config" before
//! "clone" — a dependency that cannot hold, since ConfigReader reads
//! `.inspector.toml` out of the cloned repository. The control-flow
//! summary is the one order that is actually executable; every step it
//! names still runs, just in the order the data dependencies require.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;

use inspectd_config::ConfigReader;
use inspectd_git::{
    BaseResolver, CloneError, Cloner, FixedRef, MergeBase, PatchExtractor, PushCloner,
    RequestCloner,
};
use inspectd_process::{FilesystemSandbox, Sandbox, SandboxError};
use inspectd_store::{AnalysisStore, RecordingSandbox};
use inspectd_types::{Analysis, AnalysisStatus, EventKind, Issue, Job, Tool, ToolRecord};

use crate::diff;
use crate::generated::{self, GeneratedFilterError};
use crate::reporter::{self, Comment, Reporter, StatusCheck, StatusState};
use crate::tool_runner;

const APT_DEADLINE: Duration = Duration::from_secs(300);
const DEPS_DEADLINE: Duration = Duration::from_secs(600);
const PWD_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("failed to acquire sandbox: {0}")]
    Sandbox(#[from] SandboxError),
    #[error(transparent)]
    Git(#[from] CloneError),
    #[error("config read failed: {0}")]
    Config(#[from] anyhow::Error),
    #[error("install-deps.sh exited {exit_code}: {output}")]
    DepsInstall { exit_code: i32, output: String },
    #[error("could not determine repo root (exit {exit_code}): {output}")]
    RepoRoot { exit_code: i32, output: String },
    #[error("generated-file predicate failed: {0}")]
    GeneratedFilter(#[from] GeneratedFilterError),
}

#[derive(Debug, Default)]
struct PipelineTimings {
    clone: Duration,
    deps: Duration,
    issue_count: usize,
}

/// Owns the sandbox base directory and the preset tool list; one instance
/// serves every job the consumer loop hands it.
pub struct Orchestrator {
    store: Arc<AnalysisStore>,
    config: ConfigReader,
    sandbox_base: PathBuf,
    memory_limit_mib: u64,
    reporter: Arc<Mutex<dyn Reporter + Send>>,
    command_log_dir: PathBuf,
}

impl Orchestrator {
    pub fn new(
        store: Arc<AnalysisStore>,
        preset_tools: Vec<Tool>,
        sandbox_base: PathBuf,
        memory_limit_mib: u64,
        reporter: Arc<Mutex<dyn Reporter + Send>>,
        command_log_dir: PathBuf,
    ) -> Self {
        Self {
            store,
            config: ConfigReader::new(preset_tools),
            sandbox_base,
            memory_limit_mib,
            reporter,
            command_log_dir,
        }
    }

    /// Drives `job` through every pipeline step and returns the finalized
    /// [`Analysis`]. The sandbox is released on every exit path regardless
    /// of where the pipeline stopped.
    pub fn run(&self, job: &Job) -> Analysis {
        let analysis = self.store.start(job);
        let id = analysis.id;
        let total_start = Instant::now();

        let span = tracing::info_span!("analysis", analysis_id = id, event = ?job.event);
        let _enter = span.enter();
        tracing::info!(repository_id = job.repository.id, "starting analysis");

        let sandbox = match FilesystemSandbox::acquire_with_limit(
            &self.sandbox_base,
            &format!("job-{id}"),
            self.memory_limit_mib,
        ) {
            Ok(s) => s,
            Err(err) => {
                tracing::warn!(error = %err, "failed to acquire sandbox");
                let _ = self.store.finish(
                    id,
                    AnalysisStatus::Error,
                    Duration::ZERO,
                    Duration::ZERO,
                    total_start.elapsed(),
                );
                let analysis = self.store.get(id).expect("analysis was just started");
                self.report(job, &analysis);
                return analysis;
            }
        };

        let recorder = RecordingSandbox::wrap(&sandbox);
        let outcome = self.run_pipeline(job, id, &recorder);

        let _ = self.store.record_commands(id, recorder.entries());
        self.flush_command_log(id, &recorder);
        sandbox.release();

        let (status, timings) = match outcome {
            Ok(timings) => {
                let status = if matches!(job.event, EventKind::Request) && timings.issue_count > 0
                {
                    AnalysisStatus::Failure
                } else {
                    AnalysisStatus::Success
                };
                (status, timings)
            }
            Err((err, timings)) => {
                tracing::warn!(error = %err, "analysis failed");
                (AnalysisStatus::Error, timings)
            }
        };

        let _ = self.store.finish(
            id,
            status,
            timings.clone,
            timings.deps,
            total_start.elapsed(),
        );
        let analysis = self.store.get(id).expect("analysis was just finished");
        self.report(job, &analysis);
        analysis
    }

    /// Persists the recorder's command log to its own file under
    /// `command_log_dir`, so the on-disk janitor (§4.9) has something to
    /// sweep. Failure to flush is logged and otherwise ignored; the
    /// in-memory copy already attached via `record_commands` is what the
    /// rest of the service reads.
    fn flush_command_log(&self, id: i64, recorder: &RecordingSandbox<'_>) {
        if let Err(err) = std::fs::create_dir_all(&self.command_log_dir) {
            tracing::warn!(error = %err, "failed to create command log directory");
            return;
        }
        let path = self.command_log_dir.join(format!("analysis-{id}.jsonl"));
        if let Err(err) = recorder.flush(&path) {
            tracing::warn!(error = %err, "failed to flush command log to disk");
        }
    }

    /// Hands the finished analysis to the reporter collaborator (§2's final
    /// pipeline step): a status check always runs, plus either a pull
    /// request review or per-issue inline comments on the pushed commit.
    fn report(&self, job: &Job, analysis: &Analysis) {
        let issues: Vec<Issue> = analysis
            .tools
            .iter()
            .flat_map(|t| t.issues.clone())
            .collect();
        let (kept, suppressed) = reporter::cap_issues(&issues);

        let state = match analysis.status {
            AnalysisStatus::Success => StatusState::Success,
            AnalysisStatus::Failure => StatusState::Failure,
            AnalysisStatus::Error => StatusState::Error,
            AnalysisStatus::Pending => StatusState::Pending,
        };
        let description = reporter::status_description(issues.len(), suppressed);

        let mut rep = self.reporter.lock().expect("reporter mutex poisoned");
        rep.status_check(
            &analysis.commit_to,
            StatusCheck {
                state,
                target_url: format!("/analysis/{}", analysis.id),
                description,
            },
        );

        if job.is_push() {
            for issue in kept {
                rep.inline_comment(
                    &analysis.commit_to,
                    Comment {
                        path: issue.path.clone(),
                        position: issue.hunk_pos,
                        body: issue.message.clone(),
                    },
                );
            }
        } else {
            rep.request_review(job.request_number, reporter::build_review(&issues, &[]));
        }
    }

    fn run_pipeline(
        &self,
        job: &Job,
        id: i64,
        sandbox: &dyn Sandbox,
    ) -> Result<PipelineTimings, (OrchestratorError, PipelineTimings)> {
        let mut timings = PipelineTimings::default();

        let probe = inspectd_environment::probe(sandbox, None);
        tracing::debug!(?probe, "environment probed");

        let (cloner, base_resolver): (Box<dyn Cloner>, Box<dyn BaseResolver>) = match job.event {
            EventKind::Push => (
                Box::new(PushCloner),
                Box::new(FixedRef {
                    before_sha: job.base.reference.clone(),
                }),
            ),
            EventKind::Request => (Box::new(RequestCloner), Box::new(MergeBase)),
        };

        let clone_start = Instant::now();
        if let Err(err) = cloner.clone_into(sandbox, &job.head, &job.base) {
            return Err((err.into(), timings));
        }
        timings.clone = clone_start.elapsed();

        let base_ref = match base_resolver.resolve(sandbox) {
            Ok(r) => r,
            Err(err) => return Err((err.into(), timings)),
        };

        let repo_config = match self.config.read(sandbox) {
            Ok(c) => c,
            Err(err) => return Err((OrchestratorError::Config(err), timings)),
        };

        if !repo_config.apt_packages.is_empty() {
            let pkg_list = repo_config.apt_packages.join(" ");
            let cmd = format!("apt-get install -y {pkg_list}");
            match sandbox.run(&["sh", "-c", &cmd], APT_DEADLINE) {
                Ok(out) if out.exit_code != 0 => {
                    tracing::warn!(exit_code = out.exit_code, "apt_packages install failed, continuing");
                }
                Err(err) => {
                    tracing::warn!(error = %err, "apt_packages install could not run, continuing");
                }
                _ => {}
            }
        }

        let patch = match PatchExtractor.extract(sandbox, &base_ref) {
            Ok(p) => p,
            Err(err) => return Err((err.into(), timings)),
        };

        let deps_start = Instant::now();
        match sandbox.run(&["./install-deps.sh"], DEPS_DEADLINE) {
            Ok(out) if out.exit_code != 0 => {
                return Err((
                    OrchestratorError::DepsInstall {
                        exit_code: out.exit_code,
                        output: out.output,
                    },
                    timings,
                ));
            }
            Err(err) => return Err((err.into(), timings)),
            _ => {}
        }
        timings.deps = deps_start.elapsed();

        let repo_root = match sandbox.run(&["pwd"], PWD_DEADLINE) {
            Ok(out) if out.exit_code == 0 => out.output.trim().to_string(),
            Ok(out) => {
                return Err((
                    OrchestratorError::RepoRoot {
                        exit_code: out.exit_code,
                        output: out.output,
                    },
                    timings,
                ));
            }
            Err(err) => return Err((err.into(), timings)),
        };

        for tool in &repo_config.tools {
            let record = tool_runner::run(sandbox, tool, &base_ref, &repo_root);
            let on_diff = diff::filter(&patch, record.issues);
            let surviving = match generated::filter(sandbox, &repo_root, on_diff) {
                Ok(issues) => issues,
                Err(err) => return Err((err.into(), timings)),
            };
            timings.issue_count += surviving.len();

            let final_record = ToolRecord {
                tool_id: record.tool_id,
                duration: record.duration,
                issues: surviving,
                error: record.error,
            };
            let _ = self.store.record_tool(id, final_record);
        }

        Ok(timings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::{RecordingReporter, ReviewEvent};
    use inspectd_types::{RepositoryRef, Revision};
    use serial_test::serial;
    use std::env;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use tempfile::tempdir;

    fn recording_reporter() -> Arc<Mutex<RecordingReporter>> {
        Arc::new(Mutex::new(RecordingReporter::new()))
    }

    struct EnvGuard {
        key: String,
        old: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &str, value: &str) -> Self {
            let old = env::var(key).ok();
            unsafe { env::set_var(key, value) };
            Self {
                key: key.to_string(),
                old,
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            if let Some(v) = &self.old {
                unsafe { env::set_var(&self.key, v) };
            } else {
                unsafe { env::remove_var(&self.key) };
            }
        }
    }

    fn write_fake_git(bin_dir: &Path, script: &str) -> PathBuf {
        let path = bin_dir.join("fake-git");
        fs::write(&path, format!("#!/bin/sh\n{script}\n")).expect("write fake git");
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
        path
    }

    const SAMPLE_PATCH: &str = "diff --git a/foo.go b/foo.go\n\
         index 0000000..1111111 100644\n\
         --- a/foo.go\n\
         +++ b/foo.go\n\
         @@ -1,3 +1,4 @@\n\
         package main\n\
         \n\
         +func Foo() {}\n\
         func main() {}\n";

    /// A fake git whose `clone` step drops `install-deps.sh` and
    /// `isFileGenerated` into the sandbox root (its cwd, since
    /// `FilesystemSandbox` runs every command there) and whose `diff` step
    /// emits `patch` verbatim.
    fn fake_git_script(deps_exit: u32, patch: &str) -> String {
        format!(
            "case \"$1\" in\n\
             clone) printf '#!/bin/sh\\nexit {deps_exit}\\n' > install-deps.sh; chmod +x install-deps.sh; \
             printf '#!/bin/sh\\nif [ \"$2\" = \"generated.go\" ]; then exit 0; else exit 1; fi\\n' > isFileGenerated; \
             chmod +x isFileGenerated; exit 0 ;;\n\
             checkout) exit 0 ;;\n\
             fetch) exit 0 ;;\n\
             merge-base) echo mergebasehash; exit 0 ;;\n\
             diff) cat <<'EOF'\n{patch}\nEOF\n    exit 0 ;;\n\
             *) exit 0 ;;\n\
             esac"
        )
    }

    fn push_job() -> Job {
        Job {
            event: EventKind::Push,
            repository: RepositoryRef {
                id: 1,
                url: "https://example.com/repo.git".into(),
            },
            head: Revision::new("https://example.com/repo.git", "deadbeef"),
            base: Revision::new("https://example.com/repo.git", "c0ffee"),
            request_number: 0,
            installation_id: 1,
        }
    }

    fn request_job() -> Job {
        Job {
            event: EventKind::Request,
            request_number: 7,
            ..push_job()
        }
    }

    fn lint_tool() -> Tool {
        Tool {
            id: "golint".into(),
            name: "golint".into(),
            path: "sh".into(),
            args: vec![
                "-c".into(),
                "echo foo.go:3:1: exported function Foo should have comment".into(),
            ],
            regex: None,
        }
    }

    #[test]
    #[serial]
    fn push_job_with_one_finding_finalizes_success() {
        let bin_dir = tempdir().unwrap();
        let fake = write_fake_git(bin_dir.path(), &fake_git_script(0, SAMPLE_PATCH));
        let _guard = EnvGuard::set("INSPECTD_GIT_BIN", fake.to_str().unwrap());

        let sandbox_base = tempdir().unwrap();
        let reporter = recording_reporter();
        let orchestrator = Orchestrator::new(
            Arc::new(AnalysisStore::new()),
            vec![lint_tool()],
            sandbox_base.path().to_path_buf(),
            inspectd_process::DEFAULT_MEMORY_LIMIT_MIB,
            reporter.clone(),
            sandbox_base.path().join("command-logs"),
        );

        let analysis = orchestrator.run(&push_job());

        assert_eq!(analysis.status, AnalysisStatus::Success);
        assert_eq!(analysis.tools.len(), 1);
        assert_eq!(analysis.issue_count(), 1);
        assert_eq!(analysis.tools[0].issues[0].hunk_pos, 4);
        assert!(!analysis.commands.is_empty());

        let captured = reporter.lock().unwrap();
        assert_eq!(captured.status_checks.len(), 1);
        assert_eq!(captured.status_checks[0].1.description, "Found 1 issue");
        assert_eq!(captured.inline_comments.len(), 1);
        assert!(captured.reviews.is_empty());
    }

    #[test]
    #[serial]
    fn request_job_with_findings_finalizes_failure() {
        let bin_dir = tempdir().unwrap();
        let fake = write_fake_git(bin_dir.path(), &fake_git_script(0, SAMPLE_PATCH));
        let _guard = EnvGuard::set("INSPECTD_GIT_BIN", fake.to_str().unwrap());

        let sandbox_base = tempdir().unwrap();
        let reporter = recording_reporter();
        let orchestrator = Orchestrator::new(
            Arc::new(AnalysisStore::new()),
            vec![lint_tool()],
            sandbox_base.path().to_path_buf(),
            inspectd_process::DEFAULT_MEMORY_LIMIT_MIB,
            reporter.clone(),
            sandbox_base.path().join("command-logs"),
        );

        let analysis = orchestrator.run(&request_job());

        assert_eq!(analysis.status, AnalysisStatus::Failure);
        assert_eq!(analysis.issue_count(), 1);

        let captured = reporter.lock().unwrap();
        assert!(captured.status_checks.iter().any(|(_, c)| c.state == StatusState::Failure));
        assert_eq!(captured.reviews.len(), 1);
        match &captured.reviews[0].1 {
            ReviewEvent::Comment(drafts) => assert_eq!(drafts.len(), 1),
            ReviewEvent::Approve => panic!("expected review comments, got approve"),
        }
    }

    #[test]
    #[serial]
    fn deps_install_failure_finalizes_error() {
        let bin_dir = tempdir().unwrap();
        let fake = write_fake_git(bin_dir.path(), &fake_git_script(1, SAMPLE_PATCH));
        let _guard = EnvGuard::set("INSPECTD_GIT_BIN", fake.to_str().unwrap());

        let sandbox_base = tempdir().unwrap();
        let orchestrator = Orchestrator::new(
            Arc::new(AnalysisStore::new()),
            vec![lint_tool()],
            sandbox_base.path().to_path_buf(),
            inspectd_process::DEFAULT_MEMORY_LIMIT_MIB,
            recording_reporter(),
            sandbox_base.path().join("command-logs"),
        );

        let analysis = orchestrator.run(&push_job());

        assert_eq!(analysis.status, AnalysisStatus::Error);
        assert!(analysis.tools.is_empty());
    }

    #[test]
    #[serial]
    fn generated_file_finding_is_dropped_and_status_succeeds() {
        let generated_patch = "diff --git a/generated.go b/generated.go\n\
             --- a/generated.go\n\
             +++ b/generated.go\n\
             @@ -1,1 +1,2 @@\n\
             package main\n\
             +func Bar() {}\n";
        let generated_tool = Tool {
            id: "genlint".into(),
            name: "genlint".into(),
            path: "sh".into(),
            args: vec!["-c".into(), "echo generated.go:2:1: bad".into()],
            regex: None,
        };

        let bin_dir = tempdir().unwrap();
        let fake = write_fake_git(bin_dir.path(), &fake_git_script(0, generated_patch));
        let _guard = EnvGuard::set("INSPECTD_GIT_BIN", fake.to_str().unwrap());

        let sandbox_base = tempdir().unwrap();
        let orchestrator = Orchestrator::new(
            Arc::new(AnalysisStore::new()),
            vec![generated_tool],
            sandbox_base.path().to_path_buf(),
            inspectd_process::DEFAULT_MEMORY_LIMIT_MIB,
            recording_reporter(),
            sandbox_base.path().join("command-logs"),
        );

        let analysis = orchestrator.run(&push_job());

        assert_eq!(analysis.status, AnalysisStatus::Success);
        assert_eq!(analysis.issue_count(), 0);
    }

    #[test]
    #[serial]
    fn one_tool_crashing_does_not_abort_the_others() {
        let bin_dir = tempdir().unwrap();
        let fake = write_fake_git(bin_dir.path(), &fake_git_script(0, SAMPLE_PATCH));
        let _guard = EnvGuard::set("INSPECTD_GIT_BIN", fake.to_str().unwrap());

        let ghost_tool = Tool {
            id: "ghost".into(),
            name: "ghost".into(),
            path: "/nonexistent/ghost-tool".into(),
            args: vec![],
            regex: None,
        };

        let sandbox_base = tempdir().unwrap();
        let orchestrator = Orchestrator::new(
            Arc::new(AnalysisStore::new()),
            vec![lint_tool(), ghost_tool],
            sandbox_base.path().to_path_buf(),
            inspectd_process::DEFAULT_MEMORY_LIMIT_MIB,
            recording_reporter(),
            sandbox_base.path().join("command-logs"),
        );

        let analysis = orchestrator.run(&push_job());

        assert_eq!(analysis.status, AnalysisStatus::Success);
        assert_eq!(analysis.tools.len(), 2);
        assert!(analysis.tools.iter().any(|t| t.error.is_some()));
        assert_eq!(analysis.issue_count(), 1);
    }
}
