//! Progress notices for people watching a loop or an orchestration.

use crate::state::machine::{LoopResult, ProposalStatus};
use mergeloop_core::ProposalId;
use std::fmt;
use tracing::{info, warn};

/// Something worth telling the operator about.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    LoopFinished {
        proposal: ProposalId,
        result: LoopResult,
        reason: String,
    },
    /// An approved proposal the executor could not merge.
    NotMerged {
        proposal: ProposalId,
        status: ProposalStatus,
        reason: String,
    },
    OrchestrationFinished {
        base: String,
        merged: usize,
        failed: usize,
        conflict: usize,
    },
}

impl Notice {
    pub fn proposal(&self) -> Option<ProposalId> {
        match self {
            Notice::LoopFinished { proposal, .. } | Notice::NotMerged { proposal, .. } => {
                Some(*proposal)
            }
            Notice::OrchestrationFinished { .. } => None,
        }
    }

    /// True when the notice reports work that did not go through.
    pub fn needs_attention(&self) -> bool {
        match self {
            Notice::LoopFinished { result, .. } => !result.is_mergeable(),
            Notice::NotMerged { .. } => true,
            Notice::OrchestrationFinished {
                failed, conflict, ..
            } => failed + conflict > 0,
        }
    }
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::LoopFinished {
                proposal,
                result,
                reason,
            } => write!(f, "#{proposal} {result}: {reason}"),
            Notice::NotMerged {
                proposal,
                status,
                reason,
            } => write!(f, "#{proposal} {status}: {reason}"),
            Notice::OrchestrationFinished {
                base,
                merged,
                failed,
                conflict,
            } => write!(
                f,
                "Orchestration of {base} finished: {merged} merged, {failed} failed, {conflict} conflict"
            ),
        }
    }
}

#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notice: &Notice);
}

/// Prints one line per notice to stdout.
pub struct StdoutNotifier;

#[async_trait::async_trait]
impl Notifier for StdoutNotifier {
    async fn notify(&self, notice: &Notice) {
        let marker = if notice.needs_attention() { "!" } else { "-" };
        println!("[mergeloop] {marker} {notice}");
    }
}

/// Sends notices to the log with their fields attached, keeping stdout free
/// for machine output.
pub struct LogNotifier;

#[async_trait::async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notice: &Notice) {
        match notice {
            Notice::LoopFinished {
                proposal,
                result,
                reason,
            } if notice.needs_attention() => {
                warn!(target: "mergeloop", proposal, result = %result, reason = %reason, "loop stopped")
            }
            Notice::LoopFinished {
                proposal, result, ..
            } => info!(target: "mergeloop", proposal, result = %result, "loop finished"),
            Notice::NotMerged {
                proposal,
                status,
                reason,
            } => warn!(target: "mergeloop", proposal, status = %status, reason = %reason, "not merged"),
            Notice::OrchestrationFinished {
                base,
                merged,
                failed,
                conflict,
            } => info!(
                target: "mergeloop",
                base = %base,
                merged,
                failed,
                conflict,
                "orchestration finished"
            ),
        }
    }
}

/// Keeps every notice in memory.
#[derive(Default)]
pub struct CollectNotifier {
    notices: std::sync::Mutex<Vec<Notice>>,
}

impl CollectNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notices(&self) -> Vec<Notice> {
        self.notices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Notices rendered as the lines a person would read.
    pub fn messages(&self) -> Vec<String> {
        self.notices().iter().map(Notice::to_string).collect()
    }
}

#[async_trait::async_trait]
impl Notifier for CollectNotifier {
    async fn notify(&self, notice: &Notice) {
        self.notices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(notice.clone());
    }
}
