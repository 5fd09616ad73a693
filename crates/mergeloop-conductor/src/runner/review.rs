//! Single-pass review: identify, validate, and comment. Never modifies code.

use crate::config::ReviewSettings;
use crate::host::{Comment, HostingApi};
use crate::oracle::Oracles;
use crate::runner::event_log::{Event, EventLogger};
use crate::runner::report::{issue_comment, located_issue_comment, review_summary, ReviewStats};
use crate::runner::validate::validate_issues;
use anyhow::{Context, Result};
use mergeloop_core::diff::{changed_files, extract};
use mergeloop_core::fingerprint::normalize_path;
use mergeloop_core::{PotentialIssue, ProposalId, ValidatedIssue};
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct ReviewOutcome {
    pub proposal: ProposalId,
    pub stats: ReviewStats,
    /// Issues that passed the reporting filter, most severe first.
    pub reported: Vec<ValidatedIssue>,
    pub comments_posted: usize,
    pub summary_posted: bool,
}

/// Valid issues at or above `min_confidence` whose severity is reported,
/// sorted by severity (most severe first), then file and line.
pub fn filter_reportable(
    validated: &[ValidatedIssue],
    settings: &ReviewSettings,
) -> Vec<ValidatedIssue> {
    let mut out: Vec<ValidatedIssue> = validated
        .iter()
        .filter(|v| {
            v.is_valid && v.confidence >= settings.min_confidence && settings.reports(v.severity())
        })
        .cloned()
        .collect();
    out.sort_by(|a, b| {
        b.severity()
            .cmp(&a.severity())
            .then_with(|| a.issue.file.cmp(&b.issue.file))
            .then_with(|| a.issue.lines.normalized().start.cmp(&b.issue.lines.normalized().start))
    });
    out
}

/// Keep issues whose file is among `changed` (compared after path normalization).
pub(crate) fn in_changed_files(
    issues: Vec<PotentialIssue>,
    changed: &BTreeSet<String>,
) -> (Vec<PotentialIssue>, usize) {
    let changed: BTreeSet<String> = changed.iter().map(|f| normalize_path(f)).collect();
    let before = issues.len();
    let kept: Vec<PotentialIssue> = issues
        .into_iter()
        .filter(|i| changed.contains(&normalize_path(&i.file)))
        .collect();
    let dropped = before - kept.len();
    (kept, dropped)
}

/// Review one proposal and post the results.
///
/// Fetching or parsing the diff is fatal; an identify failure counts as no
/// issues and a failed validation as a rejected issue.
pub async fn run_review(
    host: &dyn HostingApi,
    oracles: Oracles<'_>,
    proposal: ProposalId,
    settings: &ReviewSettings,
    events: &EventLogger,
) -> Result<ReviewOutcome> {
    let mut outcome = ReviewOutcome {
        proposal,
        stats: ReviewStats::default(),
        reported: Vec::new(),
        comments_posted: 0,
        summary_posted: false,
    };

    let diff = host
        .get_diff(proposal)
        .await
        .with_context(|| format!("fetching diff for #{proposal}"))?;
    let units = extract(&diff).with_context(|| format!("parsing diff for #{proposal}"))?;
    if units.is_empty() {
        info!(proposal, "no changes to review");
        return Ok(outcome);
    }
    info!(proposal, files = changed_files(&units).len(), "reviewing");

    let identified = match oracles.identify.identify(&units).await {
        Ok(issues) => issues,
        Err(e) => {
            warn!(proposal, error = %e, "identify failed, treating as no issues");
            Vec::new()
        }
    };
    let (in_scope, out_of_scope) = in_changed_files(identified, &changed_files(&units));
    let before = in_scope.len();
    let candidates: Vec<PotentialIssue> = in_scope
        .into_iter()
        .filter(|i| i.severity >= settings.min_severity)
        .collect();
    if candidates.len() < before {
        info!(
            skipped = before - candidates.len(),
            min_severity = %settings.min_severity,
            "skipping issues below minimum severity"
        );
    }
    events.record(Event::IssuesIdentified {
        proposal,
        iteration: 1,
        count: candidates.len(),
        out_of_scope,
    });

    let limit = if settings.parallel_validation {
        settings.max_parallel_validations
    } else {
        1
    };
    let validated = validate_issues(&candidates, oracles, limit, |v| v).await;
    let reported = filter_reportable(&validated, settings);

    let valid = validated.iter().filter(|v| v.is_valid).count();
    outcome.stats = ReviewStats {
        potential: candidates.len(),
        valid,
        false_positives: candidates.len() - valid,
        reported: reported.len(),
    };
    info!(
        potential = outcome.stats.potential,
        valid = outcome.stats.valid,
        reported = outcome.stats.reported,
        "validation complete"
    );

    if settings.post_comments {
        for issue in &reported {
            if post_issue_comment(host, proposal, issue).await {
                outcome.comments_posted += 1;
            }
        }
    }
    if settings.post_summary {
        host.post_comment(proposal, &Comment::general(review_summary(&reported, &outcome.stats)))
            .await
            .with_context(|| format!("posting review summary on #{proposal}"))?;
        outcome.summary_posted = true;
    }

    events.record(Event::ReviewPosted {
        proposal,
        potential: outcome.stats.potential,
        valid: outcome.stats.valid,
        reported: outcome.stats.reported,
    });
    outcome.reported = reported;
    Ok(outcome)
}

/// Inline on the first line of the issue, falling back to a general comment.
async fn post_issue_comment(host: &dyn HostingApi, proposal: ProposalId, issue: &ValidatedIssue) -> bool {
    let line = issue.issue.lines.normalized().start;
    let inline = Comment::inline(issue_comment(issue), issue.issue.file.clone(), line);
    match host.post_comment(proposal, &inline).await {
        Ok(()) => return true,
        Err(e) => {
            warn!(file = %issue.issue.file, line, error = %e, "inline comment failed, posting general comment");
        }
    }
    match host
        .post_comment(proposal, &Comment::general(located_issue_comment(issue)))
        .await
    {
        Ok(()) => true,
        Err(e) => {
            warn!(file = %issue.issue.file, line, error = %e, "failed to post comment");
            false
        }
    }
}
