use crate::setup::{self, Adapters, Global};
use anyhow::Result;
use mergeloop_conductor::host::MergeStrategy;
use mergeloop_conductor::runner::event_log::{format_elapsed, run_name, EventLogger};
use mergeloop_conductor::runner::feedback::{LoopConfig, LoopContext};
use mergeloop_conductor::runner::orchestrate::{run_orchestration, OrchestrateOptions};
use mergeloop_conductor::state::machine::LoopResult;
use std::process::ExitCode;
use std::time::Duration;

pub struct Args {
    pub repo: Option<String>,
    pub base: Option<String>,
    pub dry_run: bool,
    pub auto_merge: bool,
    pub merge_method: Option<MergeStrategy>,
    pub no_review: bool,
    pub no_parallel: bool,
    pub max_parallel: Option<usize>,
    pub json: bool,
}

/// Execute `mergeloop orchestrate`
pub fn execute(global: &Global, args: Args) -> Result<ExitCode> {
    let mut settings = global.settings()?;
    let repo = setup::require_repo(&settings, args.repo)?;

    let orch = &mut settings.orchestrator;
    if let Some(base) = args.base {
        orch.base = base;
    }
    if let Some(method) = args.merge_method {
        orch.merge_strategy = method;
    }
    if let Some(n) = args.max_parallel {
        orch.max_parallel_reviews = n;
    }
    orch.auto_merge |= args.auto_merge;
    orch.review_before_merge &= !args.no_review;
    orch.parallel_reviews &= !args.no_parallel;
    let settings = setup::finish_settings(settings)?;

    let mut options = OrchestrateOptions::from_settings(&settings.orchestrator);
    options.dry_run = args.dry_run;
    let loop_config = LoopConfig::from_settings(&settings);

    let adapters = Adapters::new(&settings, &repo, &global.workdir)?;
    let name = run_name("orchestrate", &options.base);
    let events = EventLogger::new(&global.workdir, &name);
    let notifier = setup::notifier(args.json);
    let cancel = setup::ctrlc_cancel();
    let ctx = LoopContext {
        host: &adapters.host,
        oracles: adapters.oracles(),
        notifier: notifier.as_ref(),
        events: &events,
        cancel: &cancel,
    };

    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(run_orchestration(
        &global.workdir,
        &name,
        ctx,
        &loop_config,
        &options,
    ))?;

    if args.json {
        setup::print_json(&report)?;
    } else {
        print!("{}", report.render());
        let elapsed = format_elapsed(Duration::from_millis(report.duration_ms));
        println!("Finished in {elapsed} (run {name})");
    }

    let errored = report
        .reviews
        .values()
        .any(|r| r.result == LoopResult::Error);
    Ok(if errored {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}
