//! Orchestration run: plan every open proposal against a base branch, review
//! them batch by batch, then merge in plan order.

use crate::config::OrchestratorSettings;
use crate::host::CiStatus;
use crate::plan::graph::{build_graph, ProposalNode};
use crate::plan::topo::{plan_merges, MergePlan};
use crate::runner::event_log::{Event, EventLogger};
use crate::runner::feedback::{run_feedback_loop, LoopConfig, LoopContext};
use crate::runner::merge::{MergeExecutor, MergeOptions, MergeOutcome};
use crate::runner::notify::Notice;
use crate::state::machine::{transition, LoopResult, OrchestrationState, ProposalStatus};
use crate::store::{run_dir, save_json, OrchestrateLock};
use anyhow::{Context, Result};
use futures::future::join_all;
use mergeloop_core::ProposalId;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct OrchestrateOptions {
    pub base: String,
    /// Print the plan and per-proposal readiness without reviewing or merging.
    pub dry_run: bool,
    /// Run the merge executor after review. Approved proposals otherwise stay APPROVED.
    pub execute_merges: bool,
    pub review_before_merge: bool,
    /// Review loops in flight at once within a batch; 1 reviews sequentially.
    pub max_parallel_reviews: usize,
    pub dependencies: BTreeMap<ProposalId, Vec<ProposalId>>,
    pub merge: MergeOptions,
}

impl OrchestrateOptions {
    pub fn from_settings(settings: &OrchestratorSettings) -> Self {
        Self {
            base: settings.base.clone(),
            dry_run: false,
            execute_merges: settings.auto_merge,
            review_before_merge: settings.review_before_merge,
            max_parallel_reviews: if settings.parallel_reviews {
                settings.max_parallel_reviews
            } else {
                1
            },
            dependencies: settings.dependencies.clone(),
            merge: MergeOptions::from_settings(settings),
        }
    }
}

/// Whether a proposal could merge right now, as seen by a dry run.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Readiness {
    pub id: ProposalId,
    pub mergeable: Option<bool>,
    pub ci: Option<CiStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        self.mergeable == Some(true) && self.ci == Some(CiStatus::Pass)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewSummary {
    pub result: LoopResult,
    pub reason: String,
    pub iterations: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrchestrationReport {
    pub base: String,
    pub dry_run: bool,
    pub plan: MergePlan,
    pub nodes: Vec<ProposalNode>,
    pub reviews: BTreeMap<ProposalId, ReviewSummary>,
    pub merges: Vec<MergeOutcome>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub readiness: Vec<Readiness>,
    pub duration_ms: u64,
}

impl OrchestrationReport {
    pub fn count(&self, status: ProposalStatus) -> usize {
        self.nodes.iter().filter(|n| n.status == status).count()
    }

    /// Plain-text report for the terminal.
    pub fn render(&self) -> String {
        let mut out = format!("Merge plan for {}:\n", self.base);
        out.push_str(&self.plan.render());
        if self.dry_run {
            out.push_str("\nReadiness:\n");
            for r in &self.readiness {
                let mergeable = match r.mergeable {
                    Some(true) => "mergeable",
                    Some(false) => "conflicting",
                    None => "mergeability unknown",
                };
                let ci = match r.ci {
                    Some(CiStatus::Pass) => "CI pass",
                    Some(CiStatus::Fail) => "CI failing",
                    Some(CiStatus::Pending) => "CI pending",
                    None => "CI unknown",
                };
                let verdict = if r.is_ready() { "ready" } else { "not ready" };
                let _ = write!(out, "  #{} {verdict} ({mergeable}, {ci})", r.id);
                if let Some(e) = &r.error {
                    let _ = write!(out, ": {e}");
                }
                out.push('\n');
            }
            return out;
        }
        out.push_str("\nResults:\n");
        for node in &self.nodes {
            let _ = write!(out, "  #{} {}", node.id, node.status);
            if let Some(reason) = &node.reason {
                let _ = write!(out, ": {reason}");
            }
            out.push('\n');
        }
        let _ = writeln!(
            out,
            "\nApproved: {}, Merged: {}, Failed: {}, Conflict: {}",
            self.count(ProposalStatus::Approved),
            self.count(ProposalStatus::Merged),
            self.count(ProposalStatus::Failed),
            self.count(ProposalStatus::Conflict)
        );
        out
    }
}

fn set_status(
    state: &mut OrchestrationState,
    events: &EventLogger,
    id: ProposalId,
    from: ProposalStatus,
    to: ProposalStatus,
    reason: Option<String>,
) -> Result<()> {
    if transition(state, id, from, to, reason.clone())? {
        events.record(Event::ProposalStatus {
            proposal: id,
            from: from.as_str().into(),
            to: to.as_str().into(),
            reason,
        });
    } else {
        warn!(proposal = id, from = %from, to = %to, "status transition skipped");
    }
    Ok(())
}

/// Plan, review and merge every open proposal that targets `options.base`.
pub async fn orchestrate(
    ctx: LoopContext<'_>,
    loop_config: &LoopConfig,
    options: &OrchestrateOptions,
) -> Result<OrchestrationReport> {
    let started = Instant::now();
    let open = ctx
        .host
        .list_open(&options.base)
        .await
        .with_context(|| format!("listing open proposals for {}", options.base))?;
    info!(base = %options.base, proposals = open.len(), "planning merges");

    let graph = build_graph(&open, &options.dependencies);
    let plan = plan_merges(&graph);
    ctx.events.record(Event::PlanComputed {
        proposals: graph.nodes.len(),
        batches: plan.batches.clone(),
        excluded: plan
            .excluded
            .iter()
            .flat_map(|c| c.members.iter().copied())
            .collect(),
    });
    let mut state = OrchestrationState::new(options.base.clone(), graph.nodes.clone());

    for component in &plan.excluded {
        for &id in &component.members {
            set_status(
                &mut state,
                ctx.events,
                id,
                ProposalStatus::Pending,
                ProposalStatus::Failed,
                Some(component.reason.clone()),
            )?;
        }
    }

    let mut report = OrchestrationReport {
        base: options.base.clone(),
        dry_run: options.dry_run,
        plan: plan.clone(),
        nodes: Vec::new(),
        reviews: BTreeMap::new(),
        merges: Vec::new(),
        readiness: Vec::new(),
        duration_ms: 0,
    };

    if options.dry_run {
        for &id in &plan.order {
            report.readiness.push(readiness(ctx, id).await);
        }
        report.nodes = state.nodes;
        report.duration_ms = started.elapsed().as_millis() as u64;
        return Ok(report);
    }

    if options.review_before_merge {
        report.reviews = review_batches(ctx, loop_config, options, &plan, &mut state).await?;
    } else {
        for &id in &plan.order {
            set_status(
                &mut state,
                ctx.events,
                id,
                ProposalStatus::Pending,
                ProposalStatus::Approved,
                None,
            )?;
        }
    }

    if options.execute_merges {
        let executor = MergeExecutor::new(ctx.host, options.merge);
        report.merges = executor
            .execute(&plan, &mut state, ctx.events, ctx.notifier, ctx.cancel)
            .await?;
    } else {
        info!(
            approved = state.count(ProposalStatus::Approved),
            "merging disabled, leaving approved proposals open"
        );
    }

    report.nodes = state.nodes;
    report.duration_ms = started.elapsed().as_millis() as u64;
    let (merged, failed, conflict) = (
        report.count(ProposalStatus::Merged),
        report.count(ProposalStatus::Failed),
        report.count(ProposalStatus::Conflict),
    );
    ctx.events.record(Event::OrchestrationFinished {
        merged,
        failed,
        conflict,
        duration_ms: report.duration_ms,
    });
    ctx.notifier
        .notify(&Notice::OrchestrationFinished {
            base: options.base.clone(),
            merged,
            failed,
            conflict,
        })
        .await;
    Ok(report)
}

/// Run review loops batch by batch; loops inside a batch run concurrently.
/// Review never merges: the executor does that in plan order.
async fn review_batches(
    ctx: LoopContext<'_>,
    loop_config: &LoopConfig,
    options: &OrchestrateOptions,
    plan: &MergePlan,
    state: &mut OrchestrationState,
) -> Result<BTreeMap<ProposalId, ReviewSummary>> {
    let review_config = LoopConfig {
        auto_merge: false,
        ..loop_config.clone()
    };
    let permits = Semaphore::new(options.max_parallel_reviews.max(1));
    let mut reviews = BTreeMap::new();

    for (index, batch) in plan.batches.iter().enumerate() {
        let ids: Vec<ProposalId> = batch
            .iter()
            .copied()
            .filter(|id| state.status(*id) == Some(ProposalStatus::Pending))
            .collect();
        if ctx.cancel.is_cancelled() {
            for id in ids {
                set_status(
                    state,
                    ctx.events,
                    id,
                    ProposalStatus::Pending,
                    ProposalStatus::Failed,
                    Some("cancelled before review".into()),
                )?;
            }
            continue;
        }
        info!(batch = index + 1, proposals = ?ids, "reviewing batch");
        for &id in &ids {
            set_status(
                state,
                ctx.events,
                id,
                ProposalStatus::Pending,
                ProposalStatus::Reviewing,
                None,
            )?;
        }

        let permits = &permits;
        let review_config = &review_config;
        let outcomes = join_all(ids.iter().map(|&id| async move {
            let _permit = permits.acquire().await.ok();
            run_feedback_loop(ctx, review_config, id).await
        }))
        .await;

        for outcome in outcomes {
            let id = outcome.proposal;
            let (to, reason) = if outcome.result.is_mergeable() {
                (ProposalStatus::Approved, None)
            } else {
                (
                    ProposalStatus::Failed,
                    Some(format!("review ended {}: {}", outcome.result, outcome.reason)),
                )
            };
            set_status(state, ctx.events, id, ProposalStatus::Reviewing, to, reason)?;
            reviews.insert(
                id,
                ReviewSummary {
                    result: outcome.result,
                    reason: outcome.reason,
                    iterations: outcome.iterations,
                },
            );
        }
    }
    Ok(reviews)
}

async fn readiness(ctx: LoopContext<'_>, id: ProposalId) -> Readiness {
    let mut r = Readiness {
        id,
        mergeable: None,
        ci: None,
        error: None,
    };
    match ctx.host.check_mergeable(id).await {
        Ok(m) => r.mergeable = Some(m),
        Err(e) => r.error = Some(e.to_string()),
    }
    match ctx.host.ci_status(id).await {
        Ok(ci) => r.ci = Some(ci),
        Err(e) => {
            r.error.get_or_insert_with(|| e.to_string());
        }
    }
    r
}

/// [`orchestrate`] under the working directory's orchestration lock, with the
/// report saved to `.mergeloop/runs/<run>/report.json`. Dry runs take no lock.
pub async fn run_orchestration(
    workdir: &Path,
    run_name: &str,
    ctx: LoopContext<'_>,
    loop_config: &LoopConfig,
    options: &OrchestrateOptions,
) -> Result<OrchestrationReport> {
    let _lock = if options.dry_run {
        None
    } else {
        Some(OrchestrateLock::acquire(workdir)?)
    };
    let report = orchestrate(ctx, loop_config, options).await?;
    save_json(&run_dir(workdir, run_name).join("report.json"), &report)?;
    Ok(report)
}
