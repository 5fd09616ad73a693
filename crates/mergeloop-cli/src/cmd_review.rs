use crate::setup::{self, Adapters, Global};
use anyhow::Result;
use mergeloop_conductor::runner::event_log::{run_name, EventLogger};
use mergeloop_conductor::runner::review::run_review;
use mergeloop_core::{ProposalId, Severity};
use std::process::ExitCode;

pub struct Args {
    pub repo: Option<String>,
    pub pr: Option<ProposalId>,
    pub min_confidence: Option<f64>,
    pub min_severity: Option<Severity>,
    pub report_low: bool,
    pub no_comments: bool,
    pub no_summary: bool,
    pub no_parallel: bool,
    pub json: bool,
}

/// Execute `mergeloop review`
pub fn execute(global: &Global, args: Args) -> Result<ExitCode> {
    let mut settings = global.settings()?;
    let repo = setup::require_repo(&settings, args.repo)?;
    let pr = setup::require_pr(&settings, args.pr)?;

    let review = &mut settings.review;
    if let Some(c) = args.min_confidence {
        review.min_confidence = c;
    }
    if let Some(s) = args.min_severity {
        review.min_severity = s;
    }
    review.report_low |= args.report_low;
    review.post_comments &= !args.no_comments;
    review.post_summary &= !args.no_summary;
    review.parallel_validation &= !args.no_parallel;
    let settings = setup::finish_settings(settings)?;

    let adapters = Adapters::new(&settings, &repo, &global.workdir)?;
    let events = EventLogger::new(&global.workdir, &run_name("review", &format!("pr{pr}")));

    let rt = tokio::runtime::Runtime::new()?;
    let outcome = rt.block_on(run_review(
        &adapters.host,
        adapters.oracles(),
        pr,
        &settings.review,
        &events,
    ))?;

    if args.json {
        setup::print_json(&outcome)?;
    } else {
        let s = outcome.stats;
        println!("Review of {repo}#{pr}");
        println!("  Potential issues: {}", s.potential);
        println!("  Validated:        {}", s.valid);
        println!("  False positives:  {}", s.false_positives);
        println!("  Reported:         {}", s.reported);
        for issue in &outcome.reported {
            println!(
                "  [{}] {}:{} {}",
                issue.severity(),
                issue.issue.file,
                issue.issue.lines,
                issue.issue.description
            );
        }
        if outcome.comments_posted > 0 || outcome.summary_posted {
            println!(
                "  Posted {} comment(s){}",
                outcome.comments_posted,
                if outcome.summary_posted { " and a summary" } else { "" }
            );
        }
    }
    Ok(ExitCode::SUCCESS)
}
