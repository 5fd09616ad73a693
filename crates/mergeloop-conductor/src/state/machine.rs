use anyhow::{bail, Result};
use mergeloop_core::fingerprint::FingerprintRegistry;
use mergeloop_core::ProposalId;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::plan::graph::ProposalNode;

// ── Loop phases ──

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LoopPhase {
    Identify,
    Validate,
    DecideFix,
    Fix,
    Commit,
    RunTests,
    Finished,
}

/// Terminal outcome of one loop run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoopResult {
    Merged,
    ReadyToMerge,
    Unfixable,
    TestFailed,
    MaxIterations,
    Error,
}

impl LoopResult {
    pub fn as_str(self) -> &'static str {
        match self {
            LoopResult::Merged => "MERGED",
            LoopResult::ReadyToMerge => "READY_TO_MERGE",
            LoopResult::Unfixable => "UNFIXABLE",
            LoopResult::TestFailed => "TEST_FAILED",
            LoopResult::MaxIterations => "MAX_ITERATIONS",
            LoopResult::Error => "ERROR",
        }
    }

    /// Outcomes after which the proposal may go on to merge.
    pub fn is_mergeable(self) -> bool {
        matches!(self, LoopResult::Merged | LoopResult::ReadyToMerge)
    }
}

impl fmt::Display for LoopResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const LOOP_TRANSITIONS: &[(LoopPhase, &[LoopPhase])] = &[
    (
        LoopPhase::Identify,
        &[LoopPhase::Validate, LoopPhase::Finished],
    ),
    (
        LoopPhase::Validate,
        &[LoopPhase::DecideFix, LoopPhase::Finished],
    ),
    (LoopPhase::DecideFix, &[LoopPhase::Fix, LoopPhase::Finished]),
    // Nothing applied: skip the commit and start the next iteration.
    (
        LoopPhase::Fix,
        &[LoopPhase::Commit, LoopPhase::Identify, LoopPhase::Finished],
    ),
    (
        LoopPhase::Commit,
        &[LoopPhase::RunTests, LoopPhase::Identify, LoopPhase::Finished],
    ),
    (
        LoopPhase::RunTests,
        &[LoopPhase::Identify, LoopPhase::Finished],
    ),
    // Finished is terminal
];

fn is_valid_loop_transition(from: LoopPhase, to: LoopPhase) -> bool {
    LOOP_TRANSITIONS
        .iter()
        .any(|(f, targets)| *f == from && targets.contains(&to))
}

/// What happened in one iteration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IterationStatus {
    pub iteration: u32,
    pub issues_found: usize,
    pub issues_fixed: usize,
    pub issues_skipped: usize,
    pub reappeared: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tests_passed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    pub duration_ms: u64,
}

/// State of one loop run. Owned by that run and dropped when it ends.
#[derive(Debug, Clone)]
pub struct LoopState {
    pub proposal: ProposalId,
    /// Completed iterations.
    pub iteration: u32,
    pub phase: LoopPhase,
    pub registry: FingerprintRegistry,
    pub history: Vec<IterationStatus>,
    pub version: u32,
}

impl LoopState {
    pub fn new(proposal: ProposalId) -> Self {
        Self {
            proposal,
            iteration: 0,
            phase: LoopPhase::Identify,
            registry: FingerprintRegistry::new(),
            history: Vec::new(),
            version: 0,
        }
    }

    /// Move to `to`. Errors on a transition the loop never makes.
    pub fn advance(&mut self, to: LoopPhase) -> Result<()> {
        if !is_valid_loop_transition(self.phase, to) {
            bail!(
                "invalid loop transition for #{}: {:?} → {to:?}",
                self.proposal,
                self.phase
            );
        }
        self.phase = to;
        self.version += 1;
        Ok(())
    }

    /// Record the finished iteration and bump the counter.
    pub fn complete_iteration(&mut self, status: IterationStatus) {
        self.history.push(status);
        self.iteration += 1;
    }
}

// ── Proposal status ──

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProposalStatus {
    Pending,
    Reviewing,
    Approved,
    Merged,
    Failed,
    Conflict,
}

impl ProposalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ProposalStatus::Pending => "PENDING",
            ProposalStatus::Reviewing => "REVIEWING",
            ProposalStatus::Approved => "APPROVED",
            ProposalStatus::Merged => "MERGED",
            ProposalStatus::Failed => "FAILED",
            ProposalStatus::Conflict => "CONFLICT",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProposalStatus::Merged | ProposalStatus::Failed | ProposalStatus::Conflict
        )
    }
}

impl fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const VALID_TRANSITIONS: &[(ProposalStatus, &[ProposalStatus])] = &[
    (
        ProposalStatus::Pending,
        &[
            ProposalStatus::Reviewing,
            ProposalStatus::Approved, // review skipped
            ProposalStatus::Failed,   // cycle or unmerged dependency
        ],
    ),
    (
        ProposalStatus::Reviewing,
        &[ProposalStatus::Approved, ProposalStatus::Failed],
    ),
    (
        ProposalStatus::Approved,
        &[
            ProposalStatus::Merged,
            ProposalStatus::Failed,
            ProposalStatus::Conflict,
        ],
    ),
    // Merged, Failed and Conflict are terminal
];

fn is_valid_transition(from: ProposalStatus, to: ProposalStatus) -> bool {
    VALID_TRANSITIONS
        .iter()
        .any(|(f, targets)| *f == from && targets.contains(&to))
}

/// Proposal statuses for one orchestration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationState {
    pub base: String,
    pub nodes: Vec<ProposalNode>,
    #[serde(default)]
    pub version: u32,
}

impl OrchestrationState {
    pub fn new(base: impl Into<String>, nodes: Vec<ProposalNode>) -> Self {
        Self {
            base: base.into(),
            nodes,
            version: 0,
        }
    }

    pub fn get(&self, id: ProposalId) -> Result<&ProposalNode> {
        self.nodes
            .iter()
            .find(|n| n.id == id)
            .ok_or_else(|| anyhow::anyhow!("proposal not found: #{id}"))
    }

    pub fn get_mut(&mut self, id: ProposalId) -> Result<&mut ProposalNode> {
        self.nodes
            .iter_mut()
            .find(|n| n.id == id)
            .ok_or_else(|| anyhow::anyhow!("proposal not found: #{id}"))
    }

    pub fn status(&self, id: ProposalId) -> Option<ProposalStatus> {
        self.nodes.iter().find(|n| n.id == id).map(|n| n.status)
    }

    pub fn count(&self, status: ProposalStatus) -> usize {
        self.nodes.iter().filter(|n| n.status == status).count()
    }
}

// ── CAS-guarded transition ──

/// Transition a proposal from `from` to `to`, recording `reason` if given.
/// Returns Ok(true) on success, Ok(false) on CAS miss (current != from).
pub fn transition(
    state: &mut OrchestrationState,
    id: ProposalId,
    from: ProposalStatus,
    to: ProposalStatus,
    reason: Option<String>,
) -> Result<bool> {
    let node = state.get_mut(id)?;
    if node.status != from {
        return Ok(false); // CAS miss
    }
    if !is_valid_transition(from, to) {
        bail!("invalid transition: #{id} {from:?} → {to:?}");
    }
    node.status = to;
    if reason.is_some() {
        node.reason = reason;
    }
    state.version += 1;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn node(id: ProposalId) -> ProposalNode {
        ProposalNode {
            id,
            title: String::new(),
            source_branch: format!("b{id}"),
            target_branch: "main".into(),
            status: ProposalStatus::Pending,
            depends_on: BTreeSet::new(),
            conflicts_with: BTreeSet::new(),
            changed_files: BTreeSet::new(),
            reason: None,
        }
    }

    fn state() -> OrchestrationState {
        OrchestrationState::new("main", vec![node(1), node(2)])
    }

    #[test]
    fn loop_walks_a_full_iteration() {
        let mut s = LoopState::new(7);
        for to in [
            LoopPhase::Validate,
            LoopPhase::DecideFix,
            LoopPhase::Fix,
            LoopPhase::Commit,
            LoopPhase::RunTests,
            LoopPhase::Identify,
        ] {
            s.advance(to).unwrap();
        }
        assert_eq!(s.phase, LoopPhase::Identify);
        assert_eq!(s.version, 6);
    }

    #[test]
    fn loop_rejects_skipping_validation() {
        let mut s = LoopState::new(7);
        let err = s.advance(LoopPhase::Fix).unwrap_err();
        assert!(err.to_string().contains("#7"));
        assert_eq!(s.phase, LoopPhase::Identify);
    }

    #[test]
    fn finished_is_terminal() {
        let mut s = LoopState::new(1);
        s.advance(LoopPhase::Finished).unwrap();
        assert!(s.advance(LoopPhase::Identify).is_err());
    }

    #[test]
    fn complete_iteration_counts() {
        let mut s = LoopState::new(1);
        s.complete_iteration(IterationStatus {
            iteration: 1,
            ..Default::default()
        });
        assert_eq!(s.iteration, 1);
        assert_eq!(s.history.len(), 1);
    }

    #[test]
    fn loop_result_strings() {
        assert_eq!(LoopResult::ReadyToMerge.to_string(), "READY_TO_MERGE");
        let json = serde_json::to_string(&LoopResult::MaxIterations).unwrap();
        assert_eq!(json, r#""MAX_ITERATIONS""#);
        assert!(LoopResult::Merged.is_mergeable());
        assert!(!LoopResult::Unfixable.is_mergeable());
    }

    #[test]
    fn valid_transition_pending_to_reviewing() {
        let mut s = state();
        let ok = transition(
            &mut s,
            1,
            ProposalStatus::Pending,
            ProposalStatus::Reviewing,
            None,
        )
        .unwrap();
        assert!(ok);
        assert_eq!(s.status(1), Some(ProposalStatus::Reviewing));
        assert_eq!(s.version, 1);
    }

    #[test]
    fn cas_miss_returns_false() {
        let mut s = state();
        let ok = transition(
            &mut s,
            1,
            ProposalStatus::Approved,
            ProposalStatus::Merged,
            None,
        )
        .unwrap();
        assert!(!ok);
        assert_eq!(s.status(1), Some(ProposalStatus::Pending));
        assert_eq!(s.version, 0);
    }

    #[test]
    fn invalid_transition_errors() {
        let mut s = state();
        assert!(transition(
            &mut s,
            1,
            ProposalStatus::Pending,
            ProposalStatus::Merged,
            None
        )
        .is_err());
    }

    #[test]
    fn terminal_statuses_have_no_transitions() {
        let mut s = state();
        transition(&mut s, 2, ProposalStatus::Pending, ProposalStatus::Approved, None).unwrap();
        transition(
            &mut s,
            2,
            ProposalStatus::Approved,
            ProposalStatus::Conflict,
            Some("rebase failed".into()),
        )
        .unwrap();
        assert_eq!(s.get(2).unwrap().reason.as_deref(), Some("rebase failed"));
        assert!(transition(
            &mut s,
            2,
            ProposalStatus::Conflict,
            ProposalStatus::Approved,
            None
        )
        .is_err());
        assert!(ProposalStatus::Conflict.is_terminal());
        assert_eq!(s.count(ProposalStatus::Conflict), 1);
    }

    #[test]
    fn unknown_proposal_errors() {
        let mut s = state();
        assert!(transition(
            &mut s,
            99,
            ProposalStatus::Pending,
            ProposalStatus::Reviewing,
            None
        )
        .is_err());
    }
}
