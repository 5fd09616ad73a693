use crate::setup::{self, Adapters, Global};
use anyhow::Result;
use mergeloop_conductor::runner::event_log::{run_name, EventLogger};
use mergeloop_conductor::runner::testgen::{run_testgen, TestgenConfig};
use mergeloop_core::ProposalId;
use std::process::ExitCode;

pub struct Args {
    pub repo: Option<String>,
    pub pr: Option<ProposalId>,
    pub dry_run: bool,
    pub min_coverage: Option<f64>,
    pub min_new_coverage: Option<f64>,
    pub test_command: Option<String>,
    pub json: bool,
}

/// Execute `mergeloop testgen`
pub fn execute(global: &Global, args: Args) -> Result<ExitCode> {
    let mut settings = global.settings()?;
    let repo = setup::require_repo(&settings, args.repo)?;
    let pr = setup::require_pr(&settings, args.pr)?;

    if let Some(c) = args.min_coverage {
        settings.merge_rules.min_total_coverage = c;
    }
    if let Some(c) = args.min_new_coverage {
        settings.merge_rules.min_new_code_coverage = c;
    }
    if let Some(cmd) = args.test_command {
        settings.tests.command = cmd;
    }
    let settings = setup::finish_settings(settings)?;

    let config = TestgenConfig {
        rules: settings.merge_rules.clone(),
        dry_run: args.dry_run,
        max_parallel_validations: if settings.review.parallel_validation {
            settings.review.max_parallel_validations
        } else {
            1
        },
    };
    let adapters = Adapters::new(&settings, &repo, &global.workdir)?;
    let events = EventLogger::new(&global.workdir, &run_name("testgen", &format!("pr{pr}")));

    let rt = tokio::runtime::Runtime::new()?;
    let outcome = rt.block_on(run_testgen(
        &adapters.host,
        adapters.oracles(),
        pr,
        &config,
        &events,
    ))?;

    if args.json {
        setup::print_json(&outcome)?;
    } else {
        println!("{}", outcome.summary());
    }
    Ok(ExitCode::SUCCESS)
}
