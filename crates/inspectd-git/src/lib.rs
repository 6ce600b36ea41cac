//! Cloner (C2), BaseResolver (C3) and PatchExtractor (C5) for the analysis
//! pipeline. All three drive the sandboxed `git` binary via
//! [`inspectd_process::Sandbox::run`] rather than spawning processes
//! directly, so they inherit the sandbox's deadline and output-capture
//! behavior uniformly.

use std::env;
use std::time::Duration;

use inspectd_process::Sandbox;
use thiserror::Error;

/// Clone/fetch failure: both Cloner variants fail fast on any non-zero exit
/// from the underlying VCS command and surface the captured output.
#[derive(Debug, Error)]
pub enum CloneError {
    #[error("clone failed (exit {exit_code}): {output}")]
    NonZeroExit { exit_code: i32, output: String },
    #[error("sandbox error during clone: {0}")]
    Sandbox(#[from] inspectd_process::SandboxError),
}

/// The binary name used for all git invocations. Overridable via
/// `INSPECTD_GIT_BIN` so tests can substitute a fake executable.
pub fn git_program() -> String {
    env::var("INSPECTD_GIT_BIN").unwrap_or_else(|_| "git".to_string())
}

const CLONE_DEADLINE: Duration = Duration::from_secs(300);
/// RequestCloner's tunable shallow-clone depth. Smaller risks missing the
/// merge-base; much larger needlessly expands transfer.
pub const REQUEST_CLONE_DEPTH: u32 = 1000;

fn run_git(sandbox: &dyn Sandbox, args: &[&str]) -> Result<String, CloneError> {
    let program = git_program();
    let mut argv = vec![program.as_str()];
    argv.extend_from_slice(args);
    let out = sandbox.run(&argv, CLONE_DEADLINE)?;
    if out.exit_code != 0 {
        return Err(CloneError::NonZeroExit {
            exit_code: out.exit_code,
            output: out.output,
        });
    }
    Ok(out.output)
}

/// Two variants behind one contract. The trait does not expose the `ctx`
/// argument named in the distilled spec directly — callers pass the head
/// and base [`inspectd_types::Revision`]s explicitly, which is the same
/// information under a narrower, more testable signature.
pub trait Cloner {
    fn clone_into(
        &self,
        sandbox: &dyn Sandbox,
        head: &inspectd_types::Revision,
        base: &inspectd_types::Revision,
    ) -> Result<(), CloneError>;
}

/// Request events: shallow clone of head at depth [`REQUEST_CLONE_DEPTH`]
/// with `--single-branch`, then fetch base at the same depth.
pub struct RequestCloner;

impl Cloner for RequestCloner {
    fn clone_into(
        &self,
        sandbox: &dyn Sandbox,
        head: &inspectd_types::Revision,
        base: &inspectd_types::Revision,
    ) -> Result<(), CloneError> {
        let depth = REQUEST_CLONE_DEPTH.to_string();
        run_git(
            sandbox,
            &[
                "clone",
                "--single-branch",
                "--depth",
                &depth,
                "--branch",
                &head.reference,
                &head.url,
                ".",
            ],
        )?;
        run_git(
            sandbox,
            &["fetch", "--depth", &depth, &base.url, &base.reference],
        )?;
        Ok(())
    }
}

/// Push events: full clone of head (history is needed to resolve the base
/// SHA), then checkout of the head ref.
pub struct PushCloner;

impl Cloner for PushCloner {
    fn clone_into(
        &self,
        sandbox: &dyn Sandbox,
        head: &inspectd_types::Revision,
        _base: &inspectd_types::Revision,
    ) -> Result<(), CloneError> {
        run_git(sandbox, &["clone", &head.url, "."])?;
        run_git(sandbox, &["checkout", &head.reference])?;
        Ok(())
    }
}

/// One contract `base(ctx, sandbox) -> ref_string`; two variants.
pub trait BaseResolver {
    fn resolve(&self, sandbox: &dyn Sandbox) -> Result<String, CloneError>;
}

/// Push events: the "before" SHA is authoritative, unless it is the zero
/// SHA (no prior commit), in which case `HEAD~1` is used.
pub struct FixedRef {
    pub before_sha: String,
}

impl BaseResolver for FixedRef {
    fn resolve(&self, _sandbox: &dyn Sandbox) -> Result<String, CloneError> {
        if self.before_sha == inspectd_types::ZERO_SHA {
            Ok("HEAD~1".to_string())
        } else {
            Ok(self.before_sha.clone())
        }
    }
}

/// Request events: the common ancestor of `FETCH_HEAD` and `HEAD`.
pub struct MergeBase;

impl BaseResolver for MergeBase {
    fn resolve(&self, sandbox: &dyn Sandbox) -> Result<String, CloneError> {
        let out = run_git(sandbox, &["merge-base", "FETCH_HEAD", "HEAD"])?;
        Ok(out.trim().to_string())
    }
}

/// Exit code git uses for "no common history" when a three-dot diff can't
/// find a merge base — the trigger for PatchExtractor's fallback.
const NO_COMMON_HISTORY_EXIT: i32 = 128;

/// Produces the unified diff between the resolved base and head. Retained
/// in memory by the caller for reuse across all tools in one job.
pub struct PatchExtractor;

impl PatchExtractor {
    pub fn extract(&self, sandbox: &dyn Sandbox, base: &str) -> Result<String, CloneError> {
        let program = git_program();
        let three_dot = format!("{base}...HEAD");
        let argv = [program.as_str(), "diff", &three_dot];
        let out = sandbox.run(&argv, CLONE_DEADLINE)?;
        if out.exit_code == 0 {
            return Ok(out.output);
        }
        if out.exit_code == NO_COMMON_HISTORY_EXIT {
            return run_git(sandbox, &["show", "HEAD"]);
        }
        Err(CloneError::NonZeroExit {
            exit_code: out.exit_code,
            output: out.output,
        })
    }
}
