//! Environment fingerprinting (Orchestrator step 3): a purely informational
//! probe of the sandbox's OS release, resource limits, and the repository's
//! language runtime version. Every sub-probe is independent; a failure in
//! one never aborts the others, and none of this aborts the analysis.

use std::time::Duration;

use inspectd_process::Sandbox;

const PROBE_DEADLINE: Duration = Duration::from_secs(10);

/// Result of probing one sandbox. Each field is `None` if its underlying
/// command failed or exited non-zero — the probe never escalates a failure
/// into an error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentProbe {
    pub os_release: Option<String>,
    pub resource_limits: Option<String>,
    pub runtime_version: Option<String>,
}

/// Runs the three sub-probes against `sandbox`. `runtime_version_cmd` is the
/// tool-specific version invocation (e.g. `["go", "version"]`), supplied by
/// the caller because the runtime varies by repository; `None` skips it.
pub fn probe(sandbox: &dyn Sandbox, runtime_version_cmd: Option<&[&str]>) -> EnvironmentProbe {
    EnvironmentProbe {
        os_release: probe_one(sandbox, &["uname", "-srm"]),
        resource_limits: probe_one(sandbox, &["sh", "-c", "ulimit -a"]),
        runtime_version: runtime_version_cmd.and_then(|cmd| probe_one(sandbox, cmd)),
    }
}

fn probe_one(sandbox: &dyn Sandbox, argv: &[&str]) -> Option<String> {
    let out = sandbox.run(argv, PROBE_DEADLINE).ok()?;
    if out.exit_code != 0 {
        return None;
    }
    let trimmed = out.output.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
