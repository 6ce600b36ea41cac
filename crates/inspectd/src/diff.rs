//! DiffFilter (C7): restricts candidate issues to lines touched by the
//! patch and computes each surviving issue's hunk position.
//!
//! Hunk position follows the code-host review-comment convention: a
//! 1-based counter over every line in a file's diff body (hunk headers,
//! context, additions, and removals alike), reset at the start of each
//! file's section and never across files. Only added-or-context lines
//! carry a valid head-revision line number; removed lines still advance
//! the position counter but not the line counter.

use std::collections::HashMap;

use inspectd_types::Issue;

/// Maps `(relative path, head-revision line number)` to hunk position for
/// every added-or-context line across all files in `patch`.
fn build_position_index(patch: &str) -> HashMap<(String, u32), u32> {
    let mut index = HashMap::new();
    let mut current_file: Option<String> = None;
    let mut position: u32 = 0;
    let mut new_line: u32 = 0;
    let mut in_hunk = false;

    for line in patch.lines() {
        if let Some(path) = parse_new_file_header(line) {
            current_file = Some(path);
            position = 0;
            in_hunk = false;
            continue;
        }

        if line.starts_with("diff --git ") {
            current_file = None;
            position = 0;
            in_hunk = false;
            continue;
        }

        if let Some(start) = parse_hunk_header(line) {
            new_line = start;
            in_hunk = true;
            if current_file.is_some() {
                position += 1;
            }
            continue;
        }

        if !in_hunk || current_file.is_none() {
            continue;
        }

        position += 1;

        if let Some(path) = &current_file {
            if line.starts_with('-') {
                // removed line: consumes a position slot, not a line number
                continue;
            }
            // added ('+') or context (' ') line
            index.insert((path.clone(), new_line), position);
            new_line += 1;
        }
    }

    index
}

/// Parses a `+++ b/path/to/file` line, returning the relative path. Returns
/// `None` for `/dev/null` (file deletion) and for non-matching lines.
fn parse_new_file_header(line: &str) -> Option<String> {
    let rest = line.strip_prefix("+++ ")?;
    if rest == "/dev/null" {
        return None;
    }
    let path = rest.strip_prefix("b/").unwrap_or(rest);
    Some(path.to_string())
}

/// Parses `@@ -old_start,old_count +new_start,new_count @@...`, returning
/// the new-side starting line number.
fn parse_hunk_header(line: &str) -> Option<u32> {
    let rest = line.strip_prefix("@@ ")?;
    let plus_idx = rest.find('+')?;
    let after_plus = &rest[plus_idx + 1..];
    let end = after_plus.find(|c: char| c == ',' || c == ' ')?;
    after_plus[..end].parse().ok()
}

/// Filters `issues` to those whose `(path, line)` appears as an
/// added-or-context line in `patch`, setting each survivor's `hunk_pos`.
pub fn filter(patch: &str, issues: Vec<Issue>) -> Vec<Issue> {
    let index = build_position_index(patch);
    issues
        .into_iter()
        .filter_map(|mut issue| {
            let pos = *index.get(&(issue.path.clone(), issue.line))?;
            issue.hunk_pos = pos;
            Some(issue)
        })
        .collect()
}
