//! Reporter contract (§6): the collaborator that publishes results back to
//! the code host. Out of the hard-engineering center by design — this
//! module is the interface the core hands its terminal [`Analysis`] to,
//! plus the message-formatting and idempotence rules that are specified
//! precisely enough to test regardless of which code host is wired up.

use std::collections::HashSet;

use inspectd_types::Issue;

/// §6/§8: no reporter may post more than this many comments per analysis;
/// the suppressed remainder is folded into the StatusCheck description.
pub const MAX_ISSUE_COMMENTS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusState {
    Pending,
    Success,
    Error,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusCheck {
    pub state: StatusState,
    pub target_url: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comment {
    pub path: String,
    pub position: u32,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewEvent {
    Approve,
    Comment(Vec<Comment>),
}

/// The four reporter shapes from §6. A caller drives at most one of
/// `inline_comment`/`summary_comment` per push (single- vs multi-commit),
/// and `request_review` for pull requests; `status_check` always runs.
pub trait Reporter {
    fn status_check(&mut self, commit: &str, check: StatusCheck);
    fn inline_comment(&mut self, commit: &str, comment: Comment);
    fn summary_comment(&mut self, commit: &str, body: String);
    fn request_review(&mut self, request_number: u64, review: ReviewEvent);
}

/// Splits `issues` at [`MAX_ISSUE_COMMENTS`], returning the posted slice and
/// the count suppressed.
pub fn cap_issues(issues: &[Issue]) -> (&[Issue], usize) {
    if issues.len() > MAX_ISSUE_COMMENTS {
        (&issues[..MAX_ISSUE_COMMENTS], issues.len() - MAX_ISSUE_COMMENTS)
    } else {
        (issues, 0)
    }
}

/// §6's exact StatusCheck description templates, singular/plural-correct.
pub fn status_description(issue_count: usize, suppressed: usize) -> String {
    if issue_count == 0 {
        return "Found no issues \\ʕ◔ϖ◔ʔ/".to_string();
    }
    let issues_word = if issue_count == 1 { "issue" } else { "issues" };
    if suppressed == 0 {
        format!("Found {issue_count} {issues_word}")
    } else {
        let suppressed_word = if suppressed == 1 { "comment" } else { "comments" };
        format!("Found {issue_count} {issues_word} ({suppressed} {suppressed_word} suppressed)")
    }
}

/// §6's SummaryCommitComment body, for multi-commit pushes.
pub fn summary_comment_body(issue_count: usize, commit_count: usize, analysis_url: &str) -> String {
    let word = if issue_count == 1 { "issue" } else { "issues" };
    format!(
        "GopherCI found **{issue_count}** {word} in the last **{commit_count}** commits, see: {analysis_url}"
    )
}

/// Builds the RequestReview submission for a pull request: `Approve` with no
/// issues, otherwise one `Comment` draft per surviving issue (capped), with
/// any candidate already present verbatim at the same `(path, position,
/// body)` dropped — the idempotence defense against `synchronize` replays.
pub fn build_review(issues: &[Issue], existing: &[Comment]) -> ReviewEvent {
    if issues.is_empty() {
        return ReviewEvent::Approve;
    }

    let seen: HashSet<(&str, u32, &str)> = existing
        .iter()
        .map(|c| (c.path.as_str(), c.position, c.body.as_str()))
        .collect();

    let (capped, _suppressed) = cap_issues(issues);
    let drafts: Vec<Comment> = capped
        .iter()
        .filter(|i| !seen.contains(&(i.path.as_str(), i.hunk_pos, i.message.as_str())))
        .map(|i| Comment {
            path: i.path.clone(),
            position: i.hunk_pos,
            body: i.message.clone(),
        })
        .collect();

    ReviewEvent::Comment(drafts)
}

/// A [`Reporter`] that records every call for inspection instead of
/// publishing to a real code host, standing in for the GitHub/GitLab client
/// the Non-goals exclude wiring end-to-end.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    pub status_checks: Vec<(String, StatusCheck)>,
    pub inline_comments: Vec<(String, Comment)>,
    pub summary_comments: Vec<(String, String)>,
    pub reviews: Vec<(u64, ReviewEvent)>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Reporter for RecordingReporter {
    fn status_check(&mut self, commit: &str, check: StatusCheck) {
        self.status_checks.push((commit.to_string(), check));
    }

    fn inline_comment(&mut self, commit: &str, comment: Comment) {
        self.inline_comments.push((commit.to_string(), comment));
    }

    fn summary_comment(&mut self, commit: &str, body: String) {
        self.summary_comments.push((commit.to_string(), body));
    }

    fn request_review(&mut self, request_number: u64, review: ReviewEvent) {
        self.reviews.push((request_number, review));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue(path: &str, pos: u32, message: &str) -> Issue {
        Issue {
            path: path.to_string(),
            line: pos,
            hunk_pos: pos,
            message: message.to_string(),
        }
    }

    #[test]
    fn status_description_for_zero_issues_uses_kaomoji() {
        assert_eq!(status_description(0, 0), "Found no issues \\ʕ◔ϖ◔ʔ/");
    }

    #[test]
    fn status_description_singular_issue_no_suppression() {
        assert_eq!(status_description(1, 0), "Found 1 issue");
    }

    #[test]
    fn status_description_plural_with_suppression() {
        assert_eq!(
            status_description(3, 1),
            "Found 3 issues (1 comment suppressed)"
        );
    }

    #[test]
    fn status_description_plural_suppressed_comments() {
        assert_eq!(
            status_description(12, 2),
            "Found 12 issues (2 comments suppressed)"
        );
    }

    #[test]
    fn summary_comment_matches_template_for_plural_issues() {
        let body = summary_comment_body(2, 2, "https://example.com/analysis/1");
        assert_eq!(
            body,
            "GopherCI found **2** issues in the last **2** commits, see: https://example.com/analysis/1"
        );
    }

    #[test]
    fn summary_comment_singular_issue() {
        let body = summary_comment_body(1, 3, "https://example.com/analysis/1");
        assert!(body.starts_with("GopherCI found **1** issue in the last"));
    }

    #[test]
    fn cap_issues_caps_at_ten_and_reports_suppressed_count() {
        let issues: Vec<Issue> = (0..15).map(|i| issue("a.go", i, "msg")).collect();
        let (kept, suppressed) = cap_issues(&issues);
        assert_eq!(kept.len(), MAX_ISSUE_COMMENTS);
        assert_eq!(suppressed, 5);
    }

    #[test]
    fn cap_issues_is_a_no_op_under_the_limit() {
        let issues: Vec<Issue> = (0..3).map(|i| issue("a.go", i, "msg")).collect();
        let (kept, suppressed) = cap_issues(&issues);
        assert_eq!(kept.len(), 3);
        assert_eq!(suppressed, 0);
    }

    #[test]
    fn build_review_approves_when_no_issues() {
        let review = build_review(&[], &[]);
        assert_eq!(review, ReviewEvent::Approve);
    }

    #[test]
    fn build_review_drafts_one_comment_per_issue() {
        let issues = vec![issue("a.go", 1, "golint: missing doc")];
        let review = build_review(&issues, &[]);
        match review {
            ReviewEvent::Comment(drafts) => assert_eq!(drafts.len(), 1),
            ReviewEvent::Approve => panic!("expected comments"),
        }
    }

    #[test]
    fn build_review_drops_candidates_already_posted_verbatim() {
        let issues = vec![issue("a.go", 1, "golint: missing doc")];
        let existing = vec![Comment {
            path: "a.go".to_string(),
            position: 1,
            body: "golint: missing doc".to_string(),
        }];
        let review = build_review(&issues, &existing);
        match review {
            ReviewEvent::Comment(drafts) => assert!(drafts.is_empty()),
            ReviewEvent::Approve => panic!("expected an empty comment batch, not approve"),
        }
    }

    #[test]
    fn build_review_second_run_on_same_candidates_adds_nothing() {
        let issues = vec![
            issue("a.go", 1, "golint: missing doc"),
            issue("b.go", 2, "golint: unused import"),
        ];
        let first = match build_review(&issues, &[]) {
            ReviewEvent::Comment(drafts) => drafts,
            ReviewEvent::Approve => panic!("expected comments"),
        };
        assert_eq!(first.len(), 2);

        let second = build_review(&issues, &first);
        match second {
            ReviewEvent::Comment(drafts) => assert!(drafts.is_empty()),
            ReviewEvent::Approve => panic!("expected an empty comment batch"),
        }
    }

    #[test]
    fn recording_reporter_captures_every_call() {
        let mut reporter = RecordingReporter::new();
        reporter.status_check(
            "abc123",
            StatusCheck {
                state: StatusState::Success,
                target_url: "https://example.com".to_string(),
                description: "Found no issues \\ʕ◔ϖ◔ʔ/".to_string(),
            },
        );
        reporter.inline_comment(
            "abc123",
            Comment {
                path: "a.go".to_string(),
                position: 1,
                body: "golint: missing doc".to_string(),
            },
        );
        reporter.summary_comment("abc123", "GopherCI found **2** issues".to_string());
        reporter.request_review(7, ReviewEvent::Approve);

        assert_eq!(reporter.status_checks.len(), 1);
        assert_eq!(reporter.inline_comments.len(), 1);
        assert_eq!(reporter.summary_comments.len(), 1);
        assert_eq!(reporter.reviews.len(), 1);
    }
}
