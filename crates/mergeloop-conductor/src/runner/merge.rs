//! Merge executor: walks the plan in order, one merge in flight at a time.

use crate::config::OrchestratorSettings;
use crate::host::{CiStatus, HostingApi, MergeStrategy};
use crate::plan::topo::MergePlan;
use crate::runner::event_log::{Event, EventLogger};
use crate::runner::notify::{Notice, Notifier};
use crate::state::machine::{transition, OrchestrationState, ProposalStatus};
use anyhow::Result;
use mergeloop_core::ProposalId;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy)]
pub struct MergeOptions {
    pub strategy: MergeStrategy,
    pub delete_branch: bool,
    /// Rebase once when a proposal no longer merges cleanly.
    pub auto_rebase: bool,
}

impl MergeOptions {
    pub fn from_settings(settings: &OrchestratorSettings) -> Self {
        Self {
            strategy: settings.merge_strategy,
            delete_branch: settings.delete_branch_after_merge,
            auto_rebase: settings.auto_rebase_on_conflict,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MergeOutcome {
    pub id: ProposalId,
    pub status: ProposalStatus,
    pub reason: String,
    pub rebased: bool,
}

pub struct MergeExecutor<'a> {
    host: &'a dyn HostingApi,
    options: MergeOptions,
    /// Held across re-check, CI and merge for one proposal.
    lock: Mutex<()>,
}

impl<'a> MergeExecutor<'a> {
    pub fn new(host: &'a dyn HostingApi, options: MergeOptions) -> Self {
        Self {
            host,
            options,
            lock: Mutex::new(()),
        }
    }

    /// Re-check mergeability (rebasing once if allowed), check CI, merge.
    /// Host failures become FAILED or CONFLICT; nothing is retried.
    pub async fn merge_one(&self, id: ProposalId) -> MergeOutcome {
        let _guard = self.lock.lock().await;
        let outcome = |status, reason: String, rebased| MergeOutcome {
            id,
            status,
            reason,
            rebased,
        };

        let mut rebased = false;
        match self.host.check_mergeable(id).await {
            Ok(true) => {}
            Ok(false) => {
                if !self.options.auto_rebase {
                    return outcome(
                        ProposalStatus::Conflict,
                        "conflicts with the base branch".into(),
                        false,
                    );
                }
                info!(proposal = id, "not mergeable, rebasing");
                rebased = true;
                if let Err(e) = self.host.rebase(id).await {
                    return outcome(ProposalStatus::Conflict, format!("rebase failed: {e}"), true);
                }
                match self.host.check_mergeable(id).await {
                    Ok(true) => {}
                    Ok(false) => {
                        return outcome(
                            ProposalStatus::Conflict,
                            "still conflicts after rebase".into(),
                            true,
                        )
                    }
                    Err(e) => {
                        return outcome(
                            ProposalStatus::Failed,
                            format!("mergeability check failed: {e}"),
                            true,
                        )
                    }
                }
            }
            Err(e) => {
                return outcome(
                    ProposalStatus::Failed,
                    format!("mergeability check failed: {e}"),
                    false,
                )
            }
        }

        match self.host.ci_status(id).await {
            Ok(CiStatus::Pass) => {}
            Ok(CiStatus::Fail) => {
                return outcome(ProposalStatus::Failed, "CI checks failing".into(), rebased)
            }
            Ok(CiStatus::Pending) => {
                return outcome(ProposalStatus::Failed, "CI checks pending".into(), rebased)
            }
            Err(e) => {
                return outcome(
                    ProposalStatus::Failed,
                    format!("CI status unavailable: {e}"),
                    rebased,
                )
            }
        }

        match self
            .host
            .merge(id, self.options.strategy, self.options.delete_branch)
            .await
        {
            Ok(()) => outcome(
                ProposalStatus::Merged,
                format!("merged via {}", self.options.strategy),
                rebased,
            ),
            Err(e) => outcome(ProposalStatus::Failed, format!("merge failed: {e}"), rebased),
        }
    }

    /// Merge every APPROVED node in plan order. A node whose dependency did
    /// not merge is failed without contacting the host. Earlier merges are
    /// never rolled back.
    pub async fn execute(
        &self,
        plan: &MergePlan,
        state: &mut OrchestrationState,
        events: &EventLogger,
        notifier: &dyn Notifier,
        cancel: &CancellationToken,
    ) -> Result<Vec<MergeOutcome>> {
        let mut outcomes = Vec::new();
        for &id in &plan.order {
            if state.status(id) != Some(ProposalStatus::Approved) {
                continue;
            }

            let outcome = if cancel.is_cancelled() {
                MergeOutcome {
                    id,
                    status: ProposalStatus::Failed,
                    reason: "cancelled before merge".into(),
                    rebased: false,
                }
            } else if let Some(dep) = self.unmerged_dependency(state, id)? {
                MergeOutcome {
                    id,
                    status: ProposalStatus::Failed,
                    reason: format!("blocked by unmerged dependency #{dep}"),
                    rebased: false,
                }
            } else {
                self.merge_one(id).await
            };

            if !transition(
                state,
                id,
                ProposalStatus::Approved,
                outcome.status,
                Some(outcome.reason.clone()),
            )? {
                warn!(proposal = id, "status changed during merge");
            }
            events.record(Event::ProposalStatus {
                proposal: id,
                from: ProposalStatus::Approved.as_str().into(),
                to: outcome.status.as_str().into(),
                reason: Some(outcome.reason.clone()),
            });
            events.record(Event::MergeResult {
                proposal: id,
                status: outcome.status.as_str().into(),
                reason: outcome.reason.clone(),
                rebased: outcome.rebased,
            });
            if outcome.status == ProposalStatus::Merged {
                info!(proposal = id, "merged");
            } else {
                warn!(proposal = id, status = %outcome.status, reason = %outcome.reason, "not merged");
                notifier
                    .notify(&Notice::NotMerged {
                        proposal: id,
                        status: outcome.status,
                        reason: outcome.reason.clone(),
                    })
                    .await;
            }
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    fn unmerged_dependency(
        &self,
        state: &OrchestrationState,
        id: ProposalId,
    ) -> Result<Option<ProposalId>> {
        let node = state.get(id)?;
        Ok(node
            .depends_on
            .iter()
            .copied()
            .find(|dep| state.status(*dep) != Some(ProposalStatus::Merged)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::mock::MockHost;
    use crate::plan::graph::ProposalNode;
    use crate::runner::notify::CollectNotifier;
    use std::collections::BTreeSet;

    fn options() -> MergeOptions {
        MergeOptions {
            strategy: MergeStrategy::Squash,
            delete_branch: true,
            auto_rebase: true,
        }
    }

    fn approved(id: ProposalId, deps: &[ProposalId]) -> ProposalNode {
        ProposalNode {
            id,
            title: String::new(),
            source_branch: format!("b{id}"),
            target_branch: "main".into(),
            status: ProposalStatus::Approved,
            depends_on: deps.iter().copied().collect(),
            conflicts_with: BTreeSet::new(),
            changed_files: BTreeSet::new(),
            reason: None,
        }
    }

    fn plan(order: &[ProposalId]) -> MergePlan {
        MergePlan {
            order: order.to_vec(),
            batches: order.iter().map(|id| vec![*id]).collect(),
            ..MergePlan::default()
        }
    }

    #[tokio::test]
    async fn clean_merge() {
        let host = MockHost::new();
        let exec = MergeExecutor::new(&host, options());
        let out = exec.merge_one(1).await;
        assert_eq!(out.status, ProposalStatus::Merged);
        assert_eq!(out.reason, "merged via squash");
        assert!(!out.rebased);
        assert_eq!(host.merged_with(), vec![(1, MergeStrategy::Squash)]);
    }

    #[tokio::test]
    async fn conflict_rebases_once_then_merges() {
        let host = MockHost::new();
        host.push_mergeable(1, false);
        host.push_mergeable(1, true);
        let out = MergeExecutor::new(&host, options()).merge_one(1).await;
        assert_eq!(out.status, ProposalStatus::Merged);
        assert!(out.rebased);
        assert_eq!(host.rebased(), vec![1]);
    }

    #[tokio::test]
    async fn failed_rebase_is_a_conflict() {
        let host = MockHost::new();
        host.push_mergeable(1, false);
        host.fail_rebase(1);
        let out = MergeExecutor::new(&host, options()).merge_one(1).await;
        assert_eq!(out.status, ProposalStatus::Conflict);
        assert!(out.reason.starts_with("rebase failed"));
        assert!(host.merged().is_empty());
    }

    #[tokio::test]
    async fn still_conflicting_after_rebase() {
        let host = MockHost::new();
        host.push_mergeable(1, false);
        host.push_mergeable(1, false);
        let out = MergeExecutor::new(&host, options()).merge_one(1).await;
        assert_eq!(out.status, ProposalStatus::Conflict);
        assert_eq!(host.rebased(), vec![1]);
    }

    #[tokio::test]
    async fn no_rebase_when_disabled() {
        let host = MockHost::new();
        host.push_mergeable(1, false);
        let opts = MergeOptions {
            auto_rebase: false,
            ..options()
        };
        let out = MergeExecutor::new(&host, opts).merge_one(1).await;
        assert_eq!(out.status, ProposalStatus::Conflict);
        assert!(host.rebased().is_empty());
    }

    #[tokio::test]
    async fn ci_failure_and_pending_fail_the_node() {
        let host = MockHost::new();
        host.set_ci(1, CiStatus::Fail);
        host.set_ci(2, CiStatus::Pending);
        let exec = MergeExecutor::new(&host, options());
        assert_eq!(exec.merge_one(1).await.status, ProposalStatus::Failed);
        let pending = exec.merge_one(2).await;
        assert_eq!(pending.status, ProposalStatus::Failed);
        assert_eq!(pending.reason, "CI checks pending");
        assert!(host.merged().is_empty());
    }

    #[tokio::test]
    async fn execute_continues_past_failures_and_blocks_dependents() {
        let host = MockHost::new();
        host.set_ci(2, CiStatus::Fail);
        let mut state = OrchestrationState::new(
            "main",
            vec![approved(1, &[]), approved(2, &[]), approved(3, &[2]), approved(4, &[1])],
        );
        let notifier = CollectNotifier::new();
        let exec = MergeExecutor::new(&host, options());
        let outcomes = exec
            .execute(
                &plan(&[1, 2, 3, 4]),
                &mut state,
                &EventLogger::disabled(),
                &notifier,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcomes.len(), 4);
        assert_eq!(host.merged(), vec![1, 4]);
        assert_eq!(state.status(1), Some(ProposalStatus::Merged));
        assert_eq!(state.status(2), Some(ProposalStatus::Failed));
        assert_eq!(state.status(3), Some(ProposalStatus::Failed));
        assert_eq!(
            state.get(3).unwrap().reason.as_deref(),
            Some("blocked by unmerged dependency #2")
        );
        // The blocked node never reached the host.
        assert!(!host.merge_path_calls().contains(&3));
        assert_eq!(notifier.messages().len(), 2);
    }

    #[tokio::test]
    async fn only_approved_nodes_are_merged() {
        let host = MockHost::new();
        let mut pending = approved(2, &[]);
        pending.status = ProposalStatus::Failed;
        let mut state = OrchestrationState::new("main", vec![approved(1, &[]), pending]);
        let outcomes = MergeExecutor::new(&host, options())
            .execute(
                &plan(&[1, 2]),
                &mut state,
                &EventLogger::disabled(),
                &CollectNotifier::new(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(host.merged(), vec![1]);
    }

    #[tokio::test]
    async fn cancelled_execution_merges_nothing() {
        let host = MockHost::new();
        let mut state = OrchestrationState::new("main", vec![approved(1, &[])]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcomes = MergeExecutor::new(&host, options())
            .execute(
                &plan(&[1]),
                &mut state,
                &EventLogger::disabled(),
                &CollectNotifier::new(),
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(outcomes[0].status, ProposalStatus::Failed);
        assert!(host.merge_path_calls().is_empty());
    }
}
