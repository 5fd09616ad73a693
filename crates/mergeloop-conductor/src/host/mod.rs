//! Hosting-service and version-control contract.
//!
//! Every operation either succeeds or returns [`VcsError`]; no partial effects
//! are assumed by callers beyond what each method documents.

pub mod gh;
pub mod mock;

use mergeloop_core::ProposalId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VcsError {
    #[error("{operation} failed: {message}")]
    OperationFailed {
        operation: &'static str,
        message: String,
    },
    #[error("{0} not found")]
    NotFound(String),
}

impl VcsError {
    pub fn failed(operation: &'static str, message: impl Into<String>) -> Self {
        Self::OperationFailed {
            operation,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MergeStrategy {
    #[default]
    Squash,
    Merge,
    Rebase,
}

impl MergeStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            MergeStrategy::Squash => "squash",
            MergeStrategy::Merge => "merge",
            MergeStrategy::Rebase => "rebase",
        }
    }
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MergeStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "squash" => Ok(MergeStrategy::Squash),
            "merge" => Ok(MergeStrategy::Merge),
            "rebase" => Ok(MergeStrategy::Rebase),
            other => Err(format!(
                "unknown merge strategy \"{other}\" (expected squash, merge, or rebase)"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CiStatus {
    Pass,
    Fail,
    Pending,
}

/// A review comment. `path` and `line` are set for inline comments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Comment {
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

impl Comment {
    pub fn general(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            path: None,
            line: None,
        }
    }

    pub fn inline(body: impl Into<String>, path: impl Into<String>, line: u32) -> Self {
        Self {
            body: body.into(),
            path: Some(path.into()),
            line: Some(line),
        }
    }
}

/// New full contents for one file in a commit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileChange {
    pub path: String,
    pub contents: String,
}

/// An open proposal as listed by the host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProposalInfo {
    pub id: ProposalId,
    pub title: String,
    pub source_branch: String,
    pub target_branch: String,
    pub changed_files: Vec<String>,
}

/// Proposals that eventually merge into `base`: those targeting it directly,
/// plus stacked proposals targeting the source branch of one already in scope.
/// Sorted by id.
pub fn scoped_to_base(open: &[ProposalInfo], base: &str) -> Vec<ProposalInfo> {
    let mut branches: BTreeSet<&str> = BTreeSet::from([base]);
    let mut picked: BTreeSet<ProposalId> = BTreeSet::new();
    loop {
        let before = picked.len();
        for info in open {
            if branches.contains(info.target_branch.as_str()) && picked.insert(info.id) {
                branches.insert(info.source_branch.as_str());
            }
        }
        if picked.len() == before {
            break;
        }
    }
    let mut scoped: Vec<ProposalInfo> = open
        .iter()
        .filter(|p| picked.contains(&p.id))
        .cloned()
        .collect();
    scoped.sort_by_key(|p| p.id);
    scoped.dedup_by_key(|p| p.id);
    scoped
}

#[async_trait::async_trait]
pub trait HostingApi: Send + Sync {
    /// Unified diff of the proposal against its target.
    async fn get_diff(&self, id: ProposalId) -> Result<String, VcsError>;

    /// File contents at the head of the proposal's source branch.
    async fn read_file(&self, id: ProposalId, path: &str) -> Result<String, VcsError>;

    async fn post_comment(&self, id: ProposalId, comment: &Comment) -> Result<(), VcsError>;

    /// Commit `changes` to the source branch and push. Returns the new commit id.
    async fn commit_and_push(
        &self,
        id: ProposalId,
        changes: &[FileChange],
        message: &str,
    ) -> Result<String, VcsError>;

    async fn merge(
        &self,
        id: ProposalId,
        strategy: MergeStrategy,
        delete_branch: bool,
    ) -> Result<(), VcsError>;

    async fn ci_status(&self, id: ProposalId) -> Result<CiStatus, VcsError>;

    /// Bring the source branch up to date with its target.
    async fn rebase(&self, id: ProposalId) -> Result<(), VcsError>;

    async fn check_mergeable(&self, id: ProposalId) -> Result<bool, VcsError>;

    /// Open proposals that merge into `base`, directly or through a stack.
    async fn list_open(&self, base: &str) -> Result<Vec<ProposalInfo>, VcsError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_strategy_parse_and_serde() {
        assert_eq!("SQUASH".parse::<MergeStrategy>().unwrap(), MergeStrategy::Squash);
        assert!("ff".parse::<MergeStrategy>().is_err());
        let json = serde_json::to_string(&MergeStrategy::Rebase).unwrap();
        assert_eq!(json, r#""rebase""#);
    }

    #[test]
    fn comment_constructors() {
        let c = Comment::inline("body", "a.rs", 3);
        assert_eq!(c.path.as_deref(), Some("a.rs"));
        assert_eq!(Comment::general("x").line, None);
    }

    fn info(id: ProposalId, source: &str, target: &str) -> ProposalInfo {
        ProposalInfo {
            id,
            title: String::new(),
            source_branch: source.into(),
            target_branch: target.into(),
            changed_files: Vec::new(),
        }
    }

    #[test]
    fn scope_follows_stacks() {
        let open = vec![
            info(12, "feat-b", "feat-a"),
            info(10, "feat-a", "main"),
            info(13, "feat-c", "feat-b"),
            info(20, "other", "release"),
        ];
        let ids: Vec<_> = scoped_to_base(&open, "main").iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![10, 12, 13]);
        assert!(scoped_to_base(&open, "develop").is_empty());
    }

    #[test]
    fn vcs_error_message() {
        let e = VcsError::failed("merge", "not allowed");
        assert_eq!(e.to_string(), "merge failed: not allowed");
    }
}
