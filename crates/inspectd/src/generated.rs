//! GeneratedFilter (C8): suppresses issues in auto-generated files.
//!
//! Runs after [`crate::diff`], deliberately — the predicate executes at
//! most once per surviving issue rather than per candidate.

use std::time::Duration;

use inspectd_process::Sandbox;
use inspectd_types::Issue;
use thiserror::Error;

const PREDICATE_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum GeneratedFilterError {
    #[error("isFileGenerated predicate failed for {path}: {0}", path = .path)]
    PredicateFailed { path: String, exit_code: i32 },
    #[error("sandbox error while running isFileGenerated: {0}")]
    Sandbox(#[from] inspectd_process::SandboxError),
}

/// Repo-local hook script invoked relative to the sandbox's working
/// directory, since the sandbox does not add the repo root to `PATH`.
const PREDICATE_PROGRAM: &str = "./isFileGenerated";

/// Drops issues whose file the repo-local `isFileGenerated` predicate
/// reports as generated (exit 0). Exit 1 keeps the issue. Any other exit
/// or execution failure is a job error, per §4.8.
pub fn filter(sandbox: &dyn Sandbox, repo_root: &str, issues: Vec<Issue>) -> Result<Vec<Issue>, GeneratedFilterError> {
    let mut kept = Vec::with_capacity(issues.len());
    for issue in issues {
        let out = sandbox.run(
            &[PREDICATE_PROGRAM, repo_root, &issue.path],
            PREDICATE_DEADLINE,
        )?;
        match out.exit_code {
            0 => continue,
            1 => kept.push(issue),
            other => {
                return Err(GeneratedFilterError::PredicateFailed {
                    path: issue.path,
                    exit_code: other,
                });
            }
        }
    }
    Ok(kept)
}
