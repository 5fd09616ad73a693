use crate::setup::{self, Adapters, Global};
use anyhow::Result;
use mergeloop_conductor::runner::event_log::{run_name, EventLogger};
use mergeloop_conductor::runner::feedback::{run_feedback_loop, LoopConfig, LoopContext};
use mergeloop_conductor::state::machine::LoopResult;
use mergeloop_core::{ProposalId, Severity};
use std::process::ExitCode;

pub struct Args {
    pub repo: Option<String>,
    pub pr: Option<ProposalId>,
    pub max_iterations: Option<u32>,
    pub min_severity: Option<Severity>,
    pub auto_merge: bool,
    pub run_tests: bool,
    pub test_command: Option<String>,
    pub gate: bool,
    pub json: bool,
}

/// Execute `mergeloop autofix`
pub fn execute(global: &Global, args: Args) -> Result<ExitCode> {
    let mut settings = global.settings()?;
    let repo = setup::require_repo(&settings, args.repo)?;
    let pr = setup::require_pr(&settings, args.pr)?;

    if let Some(n) = args.max_iterations {
        settings.merge_rules.max_iterations = n;
    }
    if let Some(s) = args.min_severity {
        settings.loop_.min_severity_to_fix = s;
    }
    if let Some(cmd) = args.test_command {
        settings.tests.command = cmd;
    }
    settings.merge_rules.auto_merge_on_pass |= args.auto_merge;
    settings.loop_.run_tests |= args.run_tests;
    settings.loop_.run_gate |= args.gate;
    let settings = setup::finish_settings(settings)?;

    let adapters = Adapters::new(&settings, &repo, &global.workdir)?;
    let config = LoopConfig::from_settings(&settings);
    let name = run_name("autofix", &format!("pr{pr}"));
    let events = EventLogger::new(&global.workdir, &name);
    let notifier = setup::notifier(args.json);
    let cancel = setup::ctrlc_cancel();

    if !args.json {
        println!(
            "Starting feedback loop for {repo}#{pr} (max {} iterations, run {name})",
            config.max_iterations
        );
    }
    let ctx = LoopContext {
        host: &adapters.host,
        oracles: adapters.oracles(),
        notifier: notifier.as_ref(),
        events: &events,
        cancel: &cancel,
    };
    let rt = tokio::runtime::Runtime::new()?;
    let outcome = rt.block_on(run_feedback_loop(ctx, &config, pr));

    if args.json {
        setup::print_json(&outcome)?;
    } else {
        println!("\n{}", outcome.summary());
    }
    Ok(exit_code(outcome.result))
}

/// Every terminal result except ERROR is a normal exit.
fn exit_code(result: LoopResult) -> ExitCode {
    if result == LoopResult::Error {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
