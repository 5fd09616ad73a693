//! Markdown bodies for review comments and summaries.

use mergeloop_core::{Severity, ValidatedIssue};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

const MAX_EVIDENCE: usize = 3;
const SUMMARY_DESCRIPTION_CHARS: usize = 100;

/// Counts from one review pass.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReviewStats {
    pub potential: usize,
    pub valid: usize,
    pub false_positives: usize,
    pub reported: usize,
}

/// Body of the comment posted for one issue.
pub fn issue_comment(issue: &ValidatedIssue) -> String {
    let mut out = format!(
        "**{}**: {}\n\n{}\n",
        issue.severity().as_str().to_uppercase(),
        issue.issue.category,
        issue.issue.description
    );
    if !issue.evidence.is_empty() {
        out.push_str("\n**Evidence:**\n");
        for e in issue.evidence.iter().take(MAX_EVIDENCE) {
            let _ = writeln!(out, "- {e}");
        }
    }
    if let Some(fix) = &issue.mitigation {
        let _ = write!(out, "\n**Suggested fix:**\n{fix}\n");
    }
    if let Some(reference) = &issue.reference {
        let _ = write!(out, "\n**Reference:** {reference}\n");
    }
    let _ = write!(out, "\n_Confidence: {}%_", confidence_percent(issue.confidence));
    out
}

/// Comment body for an issue whose line could not take an inline comment.
pub fn located_issue_comment(issue: &ValidatedIssue) -> String {
    format!(
        "`{}:{}`\n\n{}",
        issue.issue.file,
        issue.issue.lines,
        issue_comment(issue)
    )
}

fn confidence_percent(confidence: f64) -> u32 {
    (confidence.clamp(0.0, 1.0) * 100.0).floor() as u32
}

/// Summary comment: reported issues grouped most severe first, then the stats.
pub fn review_summary(reported: &[ValidatedIssue], stats: &ReviewStats) -> String {
    let mut out = String::from("## Review summary\n\n");
    if reported.is_empty() {
        out.push_str("No significant issues found.\n");
    } else {
        let _ = writeln!(out, "Found **{}** issue(s):", reported.len());
        for severity in Severity::DESCENDING {
            let group: Vec<&ValidatedIssue> =
                reported.iter().filter(|i| i.severity() == severity).collect();
            if group.is_empty() {
                continue;
            }
            let _ = writeln!(
                out,
                "\n### {} ({})\n",
                severity.as_str().to_uppercase(),
                group.len()
            );
            for issue in group {
                let _ = writeln!(
                    out,
                    "- **{}:{}** - {}",
                    issue.issue.file,
                    issue.issue.lines.normalized().start,
                    clip(&issue.issue.description, SUMMARY_DESCRIPTION_CHARS)
                );
            }
        }
    }
    out.push_str("\n---\n### Stats\n");
    let _ = writeln!(out, "- Potential issues found: {}", stats.potential);
    let _ = writeln!(out, "- Validated as real: {}", stats.valid);
    let _ = writeln!(out, "- False positives filtered: {}", stats.false_positives);
    let _ = writeln!(out, "- Reported: {}", stats.reported);
    out
}

fn clip(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{}...", cut.trim_end())
}
