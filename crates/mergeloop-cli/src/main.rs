mod cmd_autofix;
mod cmd_orchestrate;
mod cmd_review;
mod cmd_testgen;
mod setup;

use clap::{Parser, Subcommand};
use mergeloop_conductor::host::MergeStrategy;
use mergeloop_core::{ProposalId, Severity};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "mergeloop",
    version,
    about = "Review, fix and merge pull requests with external analysis oracles"
)]
struct Cli {
    /// Settings file (default: <workdir>/.mergeloop.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Local checkout of the repository (default: current directory)
    #[arg(long, global = true)]
    workdir: Option<PathBuf>,
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Review a pull request once and post the findings
    Review {
        /// Repository as owner/name (or GITHUB_REPOSITORY)
        #[arg(long)]
        repo: Option<String>,
        /// Pull request number (or PR_NUMBER)
        #[arg(long)]
        pr: Option<ProposalId>,
        /// Minimum validator confidence to report an issue (0.0-1.0)
        #[arg(long)]
        min_confidence: Option<f64>,
        /// Drop identified issues below this severity before validation
        #[arg(long)]
        min_severity: Option<Severity>,
        /// Also report low severity issues
        #[arg(long)]
        report_low: bool,
        /// Do not post per-issue comments
        #[arg(long)]
        no_comments: bool,
        /// Do not post the summary comment
        #[arg(long)]
        no_summary: bool,
        /// Validate issues one at a time
        #[arg(long)]
        no_parallel: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Review, fix and re-review a pull request until it is ready to merge
    Autofix {
        /// Repository as owner/name (or GITHUB_REPOSITORY)
        #[arg(long)]
        repo: Option<String>,
        /// Pull request number (or PR_NUMBER)
        #[arg(long)]
        pr: Option<ProposalId>,
        /// Iteration cap
        #[arg(long)]
        max_iterations: Option<u32>,
        /// Fix issues at or above this severity
        #[arg(long)]
        min_severity: Option<Severity>,
        /// Merge when the loop ends ready to merge
        #[arg(long)]
        auto_merge: bool,
        /// Run the test suite after every fix commit
        #[arg(long)]
        run_tests: bool,
        /// Shell command that runs the test suite
        #[arg(long)]
        test_command: Option<String>,
        /// Generate tests and evaluate the merge gate before declaring readiness
        #[arg(long)]
        gate: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Plan, review and merge every open pull request against a base branch
    Orchestrate {
        /// Repository as owner/name (or GITHUB_REPOSITORY)
        #[arg(long)]
        repo: Option<String>,
        /// Base branch (default from settings, else "main")
        #[arg(long)]
        base: Option<String>,
        /// Print the plan and merge readiness without reviewing or merging
        #[arg(long)]
        dry_run: bool,
        /// Merge approved pull requests in plan order
        #[arg(long)]
        auto_merge: bool,
        /// Merge method: squash, merge or rebase
        #[arg(long)]
        merge_method: Option<MergeStrategy>,
        /// Approve every scheduled pull request without running review loops
        #[arg(long)]
        no_review: bool,
        /// Review one pull request at a time
        #[arg(long)]
        no_parallel: bool,
        /// Review loops in flight at once
        #[arg(long)]
        max_parallel: Option<usize>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Generate tests for a pull request and evaluate the coverage gate
    Testgen {
        /// Repository as owner/name (or GITHUB_REPOSITORY)
        #[arg(long)]
        repo: Option<String>,
        /// Pull request number (or PR_NUMBER)
        #[arg(long)]
        pr: Option<ProposalId>,
        /// Show the generated tests without running them
        #[arg(long)]
        dry_run: bool,
        /// Minimum total coverage (percent, advisory)
        #[arg(long)]
        min_coverage: Option<f64>,
        /// Minimum coverage of changed lines (percent)
        #[arg(long)]
        min_new_coverage: Option<f64>,
        /// Shell command that runs the test suite
        #[arg(long)]
        test_command: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.debug);
    let workdir = match cli.workdir {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    let global = setup::Global {
        config: cli.config,
        workdir,
    };

    match cli.cmd {
        Command::Review {
            repo,
            pr,
            min_confidence,
            min_severity,
            report_low,
            no_comments,
            no_summary,
            no_parallel,
            json,
        } => cmd_review::execute(
            &global,
            cmd_review::Args {
                repo,
                pr,
                min_confidence,
                min_severity,
                report_low,
                no_comments,
                no_summary,
                no_parallel,
                json,
            },
        ),
        Command::Autofix {
            repo,
            pr,
            max_iterations,
            min_severity,
            auto_merge,
            run_tests,
            test_command,
            gate,
            json,
        } => cmd_autofix::execute(
            &global,
            cmd_autofix::Args {
                repo,
                pr,
                max_iterations,
                min_severity,
                auto_merge,
                run_tests,
                test_command,
                gate,
                json,
            },
        ),
        Command::Orchestrate {
            repo,
            base,
            dry_run,
            auto_merge,
            merge_method,
            no_review,
            no_parallel,
            max_parallel,
            json,
        } => cmd_orchestrate::execute(
            &global,
            cmd_orchestrate::Args {
                repo,
                base,
                dry_run,
                auto_merge,
                merge_method,
                no_review,
                no_parallel,
                max_parallel,
                json,
            },
        ),
        Command::Testgen {
            repo,
            pr,
            dry_run,
            min_coverage,
            min_new_coverage,
            test_command,
            json,
        } => cmd_testgen::execute(
            &global,
            cmd_testgen::Args {
                repo,
                pr,
                dry_run,
                min_coverage,
                min_new_coverage,
                test_command,
                json,
            },
        ),
    }
}
