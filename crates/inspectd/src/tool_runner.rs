//! ToolRunner (C6): executes one configured tool against the sandboxed repo
//! and parses its output into candidate issues.
//!
//! Output format: conventional `path:line:col: message` unless the tool
//! carries its own regex, in which case that regex's `path`/`line`/`message`
//! named captures take over (falling back to captures 1/2/3 positionally
//! for tools configured without names, matching the distilled config
//! shape). A tool's non-zero exit is not a failure; only execution failure
//! (binary missing, deadline exceeded) produces a sub-record error.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use inspectd_process::Sandbox;
use inspectd_types::{Issue, Tool, ToolRecord};
use regex::Regex;

const DEFAULT_TOOL_DEADLINE: Duration = Duration::from_secs(120);

fn default_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?m)^(?P<path>[^\s:]+):(?P<line>\d+):(?:\d+:)?\s*(?P<message>.+)$")
            .expect("default tool output pattern is valid")
    })
}

/// Runs `tool` in `sandbox`, expanding `%BASE_BRANCH%` to `base_branch` and
/// rewriting any absolute paths in parsed issues to be relative to
/// `repo_root`.
pub fn run(sandbox: &dyn Sandbox, tool: &Tool, base_branch: &str, repo_root: &str) -> ToolRecord {
    let expanded = tool.expand_args(base_branch);
    let mut argv: Vec<&str> = vec![tool.path.as_str()];
    argv.extend(expanded.iter().map(|s| s.as_str()));

    let start = Instant::now();
    match sandbox.run(&argv, DEFAULT_TOOL_DEADLINE) {
        Ok(out) => ToolRecord {
            tool_id: tool.id.clone(),
            duration: out.duration,
            issues: parse_output(tool, &out.output, repo_root),
            error: None,
        },
        Err(err) => ToolRecord {
            tool_id: tool.id.clone(),
            duration: start.elapsed(),
            issues: Vec::new(),
            error: Some(err.to_string()),
        },
    }
}

fn parse_output(tool: &Tool, output: &str, repo_root: &str) -> Vec<Issue> {
    let custom;
    let pattern = match &tool.regex {
        Some(p) => match Regex::new(p) {
            Ok(re) => {
                custom = re;
                &custom
            }
            Err(_) => default_pattern(),
        },
        None => default_pattern(),
    };

    pattern
        .captures_iter(output)
        .filter_map(|caps| {
            let path = capture(&caps, "path", 1)?;
            let line: u32 = capture(&caps, "line", 2)?.parse().ok()?;
            let message = capture(&caps, "message", 3)?;
            Some(Issue {
                path: relativize(path, repo_root),
                line,
                hunk_pos: 0,
                message: format!("{}: {}", tool.name, message.trim()),
            })
        })
        .collect()
}

fn capture<'a>(caps: &regex::Captures<'a>, name: &str, index: usize) -> Option<&'a str> {
    caps.name(name)
        .or_else(|| caps.get(index))
        .map(|m| m.as_str())
}

fn relativize(path: &str, repo_root: &str) -> String {
    let trimmed = path.strip_prefix(repo_root).unwrap_or(path);
    trimmed.trim_start_matches('/').to_string()
}
