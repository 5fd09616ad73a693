//! Per-proposal feedback loop: identify, validate, fix, commit, repeat.
//!
//! Each run owns its [`LoopState`]; nothing is shared between runs except the
//! event logger. Cancellation is observed at iteration boundaries and before
//! oracle calls, never in the middle of a commit.

use crate::config::Settings;
use crate::host::{FileChange, HostingApi, MergeStrategy};
use crate::oracle::{FixOutcome, Oracles};
use crate::runner::event_log::{format_elapsed, Event, EventLogger};
use crate::runner::notify::{Notice, Notifier};
use crate::runner::review::in_changed_files;
use crate::runner::validate::validate_issues;
use crate::state::machine::{IterationStatus, LoopPhase, LoopResult, LoopState};
use anyhow::Result;
use mergeloop_core::diff::{changed_files, extract};
use mergeloop_core::fingerprint::{fingerprint, normalize_path, IssueFingerprint};
use mergeloop_core::gate::decide;
use mergeloop_core::{
    ChangeUnit, CoverageResult, MergeDecision, MergeRules, ProposalId, Severity, ValidatedIssue,
};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::sync::Mutex;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// ── Configuration ──

#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub max_iterations: u32,
    pub min_severity_to_fix: Severity,
    /// An unresolved issue at or above this severity ends the run UNFIXABLE.
    pub block_severity: Severity,
    pub min_confidence: f64,
    /// Validations in flight at once; 1 validates sequentially.
    pub max_parallel_validations: usize,
    pub run_tests: bool,
    pub run_gate: bool,
    pub auto_merge: bool,
    pub merge_strategy: MergeStrategy,
    pub delete_branch: bool,
    pub commit_message_prefix: String,
    pub merge_rules: MergeRules,
}

impl LoopConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_iterations: settings.merge_rules.max_iterations,
            min_severity_to_fix: settings.loop_.min_severity_to_fix,
            block_severity: settings.loop_.block_severity,
            min_confidence: settings.review.min_confidence,
            max_parallel_validations: if settings.review.parallel_validation {
                settings.review.max_parallel_validations
            } else {
                1
            },
            run_tests: settings.loop_.run_tests,
            run_gate: settings.loop_.run_gate,
            auto_merge: settings.merge_rules.auto_merge_on_pass,
            merge_strategy: settings.loop_.merge_strategy,
            delete_branch: settings.orchestrator.delete_branch_after_merge,
            commit_message_prefix: settings.loop_.commit_message_prefix.clone(),
            merge_rules: settings.merge_rules.clone(),
        }
    }
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

/// Collaborators borrowed by one loop run.
#[derive(Clone, Copy)]
pub struct LoopContext<'a> {
    pub host: &'a dyn HostingApi,
    pub oracles: Oracles<'a>,
    pub notifier: &'a dyn Notifier,
    pub events: &'a EventLogger,
    pub cancel: &'a CancellationToken,
}

// ── Outcome ──

#[derive(Debug, Clone, Serialize)]
pub struct FixRecord {
    pub iteration: u32,
    pub fingerprint: String,
    pub issue: ValidatedIssue,
}

/// An issue given up on without blocking the run.
#[derive(Debug, Clone, Serialize)]
pub struct DroppedIssue {
    pub iteration: u32,
    pub fingerprint: String,
    pub issue: ValidatedIssue,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoopOutcome {
    pub proposal: ProposalId,
    pub result: LoopResult,
    pub reason: String,
    /// Completed iterations.
    pub iterations: u32,
    pub fixed: Vec<FixRecord>,
    /// Issues reported again after their fix was committed.
    pub reappeared: Vec<ValidatedIssue>,
    /// Valid issues from the last validation that were not fixed.
    pub unresolved: Vec<ValidatedIssue>,
    pub dropped: Vec<DroppedIssue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<MergeDecision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coverage: Option<CoverageResult>,
    pub history: Vec<IterationStatus>,
    pub duration_ms: u64,
}

fn describe(issue: &ValidatedIssue) -> String {
    format!(
        "[{}] {}:{} {}",
        issue.severity(),
        issue.issue.file,
        issue.issue.lines,
        issue.issue.description
    )
}

impl LoopOutcome {
    /// Markdown report of the run.
    pub fn summary(&self) -> String {
        let mut out = format!(
            "## Feedback loop #{}: {}\n\n{}\n\n",
            self.proposal, self.result, self.reason
        );
        let _ = writeln!(
            out,
            "Iterations: {} | Fixed: {} | Reappeared: {} | Unresolved: {} | Dropped: {}",
            self.iterations,
            self.fixed.len(),
            self.reappeared.len(),
            self.unresolved.len(),
            self.dropped.len()
        );
        if !self.fixed.is_empty() {
            out.push_str("\n### Fixed\n");
            for f in &self.fixed {
                let _ = writeln!(out, "- {} (iteration {})", describe(&f.issue), f.iteration);
            }
        }
        if !self.reappeared.is_empty() {
            out.push_str("\n### Reappeared after fix\n");
            for i in &self.reappeared {
                let _ = writeln!(out, "- {}", describe(i));
            }
        }
        if !self.unresolved.is_empty() {
            out.push_str("\n### Unresolved\n");
            for i in &self.unresolved {
                let _ = writeln!(out, "- {}", describe(i));
            }
        }
        if !self.dropped.is_empty() {
            out.push_str("\n### Dropped\n");
            for d in &self.dropped {
                let _ = writeln!(out, "- {}: {}", describe(&d.issue), d.reason);
            }
        }
        if let Some(decision) = &self.decision {
            out.push('\n');
            out.push_str(&decision.summary());
        }
        out
    }
}

// ── Run ──

/// Drive one proposal to a terminal result. Never panics on collaborator
/// failures; every outcome carries a reason.
pub async fn run_feedback_loop(
    ctx: LoopContext<'_>,
    config: &LoopConfig,
    proposal: ProposalId,
) -> LoopOutcome {
    ctx.events.record(Event::LoopStart {
        proposal,
        max_iterations: config.max_iterations,
    });
    info!(proposal, max_iterations = config.max_iterations, "starting feedback loop");

    let mut run = LoopRun::new(ctx, config, proposal);
    let (result, reason) = match run.drive().await {
        Ok(end) => end,
        Err(e) => (LoopResult::Error, format!("{e:#}")),
    };
    run.finish(result, reason).await
}

enum Verdict {
    Rejected,
    Duplicate,
    Reappeared(ValidatedIssue, IssueFingerprint),
    KnownUnfixable(ValidatedIssue),
    Actionable(ValidatedIssue, IssueFingerprint),
}

enum FixStep {
    Applied {
        changes: BTreeMap<String, String>,
        fixed: Vec<(ValidatedIssue, IssueFingerprint)>,
    },
    Stop(LoopResult, String),
}

type End = (LoopResult, String);

struct LoopRun<'a, 'c> {
    ctx: LoopContext<'a>,
    config: &'c LoopConfig,
    proposal: ProposalId,
    state: LoopState,
    fixed: Vec<FixRecord>,
    reappeared: BTreeMap<IssueFingerprint, ValidatedIssue>,
    unresolved: Vec<ValidatedIssue>,
    dropped: Vec<DroppedIssue>,
    decision: Option<MergeDecision>,
    coverage: Option<CoverageResult>,
    started: Instant,
}

impl<'a, 'c> LoopRun<'a, 'c> {
    fn new(ctx: LoopContext<'a>, config: &'c LoopConfig, proposal: ProposalId) -> Self {
        Self {
            ctx,
            config,
            proposal,
            state: LoopState::new(proposal),
            fixed: Vec::new(),
            reappeared: BTreeMap::new(),
            unresolved: Vec::new(),
            dropped: Vec::new(),
            decision: None,
            coverage: None,
            started: Instant::now(),
        }
    }

    fn cancelled(&self, before: &str) -> Option<End> {
        self.ctx.cancel.is_cancelled().then(|| {
            (
                LoopResult::Error,
                format!(
                    "cancelled before {before} after {} completed iteration(s)",
                    self.state.iteration
                ),
            )
        })
    }

    async fn drive(&mut self) -> Result<End> {
        let p = self.proposal;
        loop {
            if let Some(end) = self.cancelled("identify") {
                return Ok(end);
            }
            let iteration = self.state.iteration + 1;
            let iteration_started = Instant::now();
            self.state.registry.begin_iteration(iteration);
            self.ctx.events.record(Event::IterationStart {
                proposal: p,
                iteration,
            });
            let mut status = IterationStatus {
                iteration,
                ..IterationStatus::default()
            };

            // ── IDENTIFY ──
            let diff = match self.ctx.host.get_diff(p).await {
                Ok(d) => d,
                Err(e) => return Ok((LoopResult::Error, format!("fetching diff failed: {e}"))),
            };
            let units = match extract(&diff) {
                Ok(u) => u,
                Err(e) => return Ok((LoopResult::Error, e.to_string())),
            };
            if units.is_empty() {
                return Ok((LoopResult::ReadyToMerge, "no changes".into()));
            }
            let changed = changed_files(&units);
            let identified = match self.ctx.oracles.identify.identify(&units).await {
                Ok(issues) => issues,
                Err(e) => {
                    warn!(proposal = p, iteration, error = %e, "identify failed, treating as no issues");
                    self.ctx.events.record(Event::IdentifyFailed {
                        proposal: p,
                        iteration,
                        error: e.to_string(),
                    });
                    Vec::new()
                }
            };
            let (issues, out_of_scope) = in_changed_files(identified, &changed);
            self.ctx.events.record(Event::IssuesIdentified {
                proposal: p,
                iteration,
                count: issues.len(),
                out_of_scope,
            });
            self.state.advance(LoopPhase::Validate)?;

            // ── VALIDATE ──
            if let Some(end) = self.cancelled("validation") {
                return Ok(end);
            }
            let verdicts = self.validate(&issues).await;
            self.state.advance(LoopPhase::DecideFix)?;

            // ── DECIDE_FIX ──
            let mut rejected = 0;
            let mut duplicates = 0;
            let mut unresolved = Vec::new();
            let mut to_fix = Vec::new();
            for verdict in verdicts {
                match verdict {
                    Verdict::Rejected => rejected += 1,
                    Verdict::Duplicate => duplicates += 1,
                    Verdict::Reappeared(issue, fp) => {
                        status.reappeared += 1;
                        self.ctx.events.record(Event::IssueReappeared {
                            proposal: p,
                            iteration,
                            fingerprint: fp.to_string(),
                            severity: issue.severity(),
                            file: issue.issue.file.clone(),
                        });
                        warn!(proposal = p, issue = %describe(&issue), "issue reappeared after its fix");
                        self.reappeared.entry(fp).or_insert_with(|| issue.clone());
                        unresolved.push(issue);
                    }
                    Verdict::KnownUnfixable(issue) => unresolved.push(issue),
                    Verdict::Actionable(issue, fp) => {
                        if issue.severity() >= self.config.min_severity_to_fix {
                            to_fix.push((issue, fp));
                        } else {
                            unresolved.push(issue);
                        }
                    }
                }
            }
            self.ctx.events.record(Event::IssuesValidated {
                proposal: p,
                iteration,
                valid: unresolved.len() + to_fix.len(),
                rejected,
                duplicates,
            });
            status.issues_found = unresolved.len() + to_fix.len();
            status.issues_skipped = unresolved.len();
            self.unresolved = unresolved;

            if to_fix.is_empty() {
                status.duration_ms = iteration_started.elapsed().as_millis() as u64;
                self.state.complete_iteration(status);
                if let Some(end) = self.blocking_unresolved() {
                    return Ok(end);
                }
                return Ok(self.ready(&units, &changed).await);
            }
            self.state.advance(LoopPhase::Fix)?;

            // ── FIX ──
            let (changes, fixed_now) = match self.fix_all(to_fix, iteration).await {
                FixStep::Applied { changes, fixed } => (changes, fixed),
                FixStep::Stop(result, reason) => return Ok((result, reason)),
            };
            status.issues_fixed = fixed_now.len();
            status.issues_skipped = status.issues_found - fixed_now.len();

            if changes.is_empty() {
                status.duration_ms = iteration_started.elapsed().as_millis() as u64;
                self.state.complete_iteration(status);
                if let Some(end) = self.iteration_cap() {
                    return Ok(end);
                }
                self.state.advance(LoopPhase::Identify)?;
                continue;
            }

            // ── COMMIT ──
            self.state.advance(LoopPhase::Commit)?;
            let files: Vec<FileChange> = changes
                .into_iter()
                .map(|(path, contents)| FileChange { path, contents })
                .collect();
            let message = self.commit_message(iteration, &fixed_now);
            let sha = match self.ctx.host.commit_and_push(p, &files, &message).await {
                Ok(sha) => sha,
                Err(e) => return Ok((LoopResult::Error, format!("pushing fixes failed: {e}"))),
            };
            info!(proposal = p, iteration, sha = %sha, files = files.len(), "pushed fixes");
            self.ctx.events.record(Event::CommitPushed {
                proposal: p,
                iteration,
                sha: sha.clone(),
                files: files.len(),
            });
            status.commit_sha = Some(sha);
            for (issue, fp) in fixed_now {
                self.fixed.push(FixRecord {
                    iteration,
                    fingerprint: fp.to_string(),
                    issue,
                });
            }

            // ── RUN_TESTS ──
            if self.config.run_tests {
                self.state.advance(LoopPhase::RunTests)?;
                if let Some(end) = self.cancelled("running tests") {
                    return Ok(end);
                }
                let coverage = match self.ctx.oracles.test_runner.run_tests(&[], &changed).await {
                    Ok(c) => c,
                    Err(e) => {
                        return Ok((LoopResult::TestFailed, format!("running tests failed: {e}")))
                    }
                };
                self.ctx.events.record(Event::TestsRun {
                    proposal: p,
                    iteration,
                    passed: coverage.tests_passed,
                    failed: coverage.tests_failed,
                    new_code_coverage: coverage.new_code_coverage,
                });
                let passed = coverage.all_passed();
                let failed = coverage.tests_failed;
                status.tests_passed = Some(passed);
                self.coverage = Some(coverage);
                if !passed {
                    status.duration_ms = iteration_started.elapsed().as_millis() as u64;
                    self.state.complete_iteration(status);
                    return Ok((
                        LoopResult::TestFailed,
                        format!("{failed} test(s) failing after the fixes of iteration {iteration}"),
                    ));
                }
            }

            status.duration_ms = iteration_started.elapsed().as_millis() as u64;
            self.state.complete_iteration(status);
            if let Some(end) = self.iteration_cap() {
                return Ok(end);
            }
            self.state.advance(LoopPhase::Identify)?;
        }
    }

    /// Validate concurrently; the registry is locked only to classify a verdict.
    async fn validate(&mut self, issues: &[mergeloop_core::PotentialIssue]) -> Vec<Verdict> {
        let registry = Mutex::new(std::mem::take(&mut self.state.registry));
        let min_confidence = self.config.min_confidence;
        let verdicts = validate_issues(
            issues,
            self.ctx.oracles,
            self.config.max_parallel_validations,
            |v| {
                if !v.is_valid || v.confidence < min_confidence {
                    return Verdict::Rejected;
                }
                let fp = fingerprint(&v.issue);
                let mut reg = registry.lock().unwrap_or_else(|e| e.into_inner());
                if reg.seen_this_iteration(&fp) {
                    return Verdict::Duplicate;
                }
                reg.register(&fp);
                if reg.reappeared(&fp) {
                    Verdict::Reappeared(v, fp)
                } else if reg.unfixable_reason(&fp).is_some() {
                    Verdict::KnownUnfixable(v)
                } else {
                    Verdict::Actionable(v, fp)
                }
            },
        )
        .await;
        self.state.registry = registry.into_inner().unwrap_or_else(|e| e.into_inner());
        verdicts
    }

    /// Apply fixes most severe first; fixes to one file build on each other.
    async fn fix_all(
        &mut self,
        mut to_fix: Vec<(ValidatedIssue, IssueFingerprint)>,
        iteration: u32,
    ) -> FixStep {
        let p = self.proposal;
        to_fix.sort_by(|(a, _), (b, _)| {
            b.severity()
                .cmp(&a.severity())
                .then_with(|| a.issue.file.cmp(&b.issue.file))
                .then_with(|| a.issue.lines.normalized().start.cmp(&b.issue.lines.normalized().start))
        });

        let mut originals: BTreeMap<String, String> = BTreeMap::new();
        let mut current: BTreeMap<String, String> = BTreeMap::new();
        let mut fixed = Vec::new();

        for (issue, fp) in to_fix {
            if let Some((result, reason)) = self.cancelled("fix") {
                return FixStep::Stop(result, reason);
            }
            let path = normalize_path(&issue.issue.file);
            let cached = current.get(&path).cloned();
            let contents = match cached {
                Some(c) => Ok(c),
                None => self
                    .ctx
                    .host
                    .read_file(p, &path)
                    .await
                    .map(|c| {
                        originals.insert(path.clone(), c.clone());
                        current.insert(path.clone(), c.clone());
                        c
                    })
                    .map_err(|e| format!("cannot read {path}: {e}")),
            };

            let failure = match contents {
                Err(reason) => Some(reason),
                Ok(before) => match self.ctx.oracles.fix.fix(&issue, &before).await {
                    Ok(FixOutcome::Applied { contents }) if contents != before => {
                        debug!(proposal = p, file = %path, "fix applied");
                        current.insert(path.clone(), contents);
                        self.state.registry.mark_fixed(&fp);
                        self.ctx.events.record(Event::FixApplied {
                            proposal: p,
                            iteration,
                            fingerprint: fp.to_string(),
                            file: path.clone(),
                        });
                        fixed.push((issue.clone(), fp.clone()));
                        None
                    }
                    Ok(FixOutcome::Applied { .. }) => Some("fix produced no change".to_string()),
                    Ok(FixOutcome::Unfixable { reason }) => Some(reason),
                    Err(e) => Some(e.to_string()),
                },
            };

            if let Some(reason) = failure {
                let blocking = issue.severity() >= self.config.block_severity;
                self.ctx.events.record(Event::FixUnfixable {
                    proposal: p,
                    iteration,
                    fingerprint: fp.to_string(),
                    severity: issue.severity(),
                    reason: reason.clone(),
                    blocking,
                });
                if blocking {
                    return FixStep::Stop(
                        LoopResult::Unfixable,
                        format!("could not fix {}: {reason}", describe(&issue)),
                    );
                }
                warn!(proposal = p, issue = %describe(&issue), %reason, "dropping unfixable issue");
                self.state.registry.mark_unfixable(&fp, reason.clone());
                self.unresolved.push(issue.clone());
                self.dropped.push(DroppedIssue {
                    iteration,
                    fingerprint: fp.to_string(),
                    issue,
                    reason,
                });
            }
        }

        let changes = current
            .into_iter()
            .filter(|(path, contents)| originals.get(path) != Some(contents))
            .collect();
        FixStep::Applied { changes, fixed }
    }

    fn commit_message(&self, iteration: u32, fixed: &[(ValidatedIssue, IssueFingerprint)]) -> String {
        let mut message = format!(
            "{}address {} review issue(s) (iteration {iteration})\n\n",
            self.config.commit_message_prefix,
            fixed.len()
        );
        for (issue, _) in fixed {
            let _ = writeln!(message, "- {}", describe(issue));
        }
        message
    }

    /// The most severe unresolved issue at or above the block threshold.
    fn blocking_unresolved(&self) -> Option<End> {
        let worst = self
            .unresolved
            .iter()
            .filter(|i| i.severity() >= self.config.block_severity)
            .max_by_key(|i| i.severity())?;
        let fp = fingerprint(&worst.issue);
        let why = if self.state.registry.reappeared(&fp) {
            "reappeared after its fix".to_string()
        } else if let Some(reason) = self.state.registry.unfixable_reason(&fp) {
            format!("could not be fixed: {reason}")
        } else {
            "remains unresolved".to_string()
        };
        Some((LoopResult::Unfixable, format!("{} {why}", describe(worst))))
    }

    fn iteration_cap(&self) -> Option<End> {
        (self.state.iteration >= self.config.max_iterations).then(|| {
            (
                LoopResult::MaxIterations,
                format!(
                    "reached max_iterations ({}) with {} fix(es) applied",
                    self.config.max_iterations,
                    self.fixed.len()
                ),
            )
        })
    }

    /// Nothing left to fix: optionally gate, then optionally merge.
    async fn ready(&mut self, units: &[ChangeUnit], changed: &BTreeSet<String>) -> End {
        let p = self.proposal;
        let mut reason = if self.unresolved.is_empty() {
            "no actionable issues remain".to_string()
        } else {
            format!(
                "no actionable issues remain ({} unresolved below the fix threshold)",
                self.unresolved.len()
            )
        };

        let mut approved = true;
        if self.config.run_gate {
            if let Some(end) = self.cancelled("the merge gate") {
                return end;
            }
            let tests = match self
                .ctx
                .oracles
                .test_gen
                .generate_tests(units, &self.unresolved)
                .await
            {
                Ok(t) => t,
                Err(e) => {
                    warn!(proposal = p, error = %e, "test generation failed");
                    Vec::new()
                }
            };
            let coverage = match self.ctx.oracles.test_runner.run_tests(&tests, changed).await {
                Ok(c) => c,
                Err(e) => {
                    warn!(proposal = p, error = %e, "test run failed");
                    CoverageResult {
                        tests_failed: 1,
                        ..CoverageResult::default()
                    }
                }
            };
            let decision = decide(&self.unresolved, &coverage, &self.config.merge_rules)
                .with_generated_tests(tests.len());
            self.ctx.events.record(Event::GateDecided {
                proposal: p,
                approved: decision.approved,
                reason: decision.reason.clone(),
            });
            approved = decision.approved;
            reason = format!("{reason}; gate: {}", decision.reason);
            self.coverage = Some(coverage);
            self.decision = Some(decision);
        }

        if !self.config.auto_merge || !approved {
            return (LoopResult::ReadyToMerge, reason);
        }
        if let Some(end) = self.cancelled("merge") {
            return end;
        }
        match self
            .ctx
            .host
            .merge(p, self.config.merge_strategy, self.config.delete_branch)
            .await
        {
            Ok(()) => (
                LoopResult::Merged,
                format!("merged via {}", self.config.merge_strategy),
            ),
            Err(e) => (LoopResult::Error, format!("merge failed: {e}")),
        }
    }

    async fn finish(mut self, result: LoopResult, reason: String) -> LoopOutcome {
        if let Err(e) = self.state.advance(LoopPhase::Finished) {
            warn!(error = %e, "loop already finished");
        }
        let elapsed = self.started.elapsed();
        self.ctx.events.record(Event::LoopFinished {
            proposal: self.proposal,
            result: result.as_str().to_string(),
            reason: reason.clone(),
            iterations: self.state.iteration,
            duration_ms: elapsed.as_millis() as u64,
        });
        info!(
            proposal = self.proposal,
            result = %result,
            iterations = self.state.iteration,
            elapsed = %format_elapsed(elapsed),
            "feedback loop finished"
        );
        self.ctx
            .notifier
            .notify(&Notice::LoopFinished {
                proposal: self.proposal,
                result,
                reason: reason.clone(),
            })
            .await;

        LoopOutcome {
            proposal: self.proposal,
            result,
            reason,
            iterations: self.state.iteration,
            fixed: self.fixed,
            reappeared: self.reappeared.into_values().collect(),
            unresolved: self.unresolved,
            dropped: self.dropped,
            decision: self.decision,
            coverage: self.coverage,
            history: self.state.history,
            duration_ms: elapsed.as_millis() as u64,
        }
    }
}
