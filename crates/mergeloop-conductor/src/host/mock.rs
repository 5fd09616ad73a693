use crate::host::{
    scoped_to_base, CiStatus, Comment, FileChange, HostingApi, MergeStrategy, ProposalInfo,
    VcsError,
};
use mergeloop_core::ProposalId;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

/// A recorded commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    pub id: ProposalId,
    pub sha: String,
    pub message: String,
    pub changes: Vec<FileChange>,
}

/// In-memory host for tests, scripted per proposal.
///
/// Diffs and mergeability answers are queued; the last queued diff keeps being
/// returned, and mergeability defaults to `true` once its queue is empty.
/// Commits update the stored files so later reads see the fixed contents.
#[derive(Default)]
pub struct MockHost {
    diffs: Mutex<HashMap<ProposalId, Vec<String>>>,
    files: Mutex<HashMap<(ProposalId, String), String>>,
    commits: Mutex<Vec<CommitRecord>>,
    comments: Mutex<Vec<(ProposalId, Comment)>>,
    ci: Mutex<HashMap<ProposalId, CiStatus>>,
    mergeable: Mutex<HashMap<ProposalId, Vec<bool>>>,
    rebase_fails: Mutex<HashSet<ProposalId>>,
    merge_fails: Mutex<HashSet<ProposalId>>,
    push_fails: Mutex<HashSet<ProposalId>>,
    merged: Mutex<Vec<(ProposalId, MergeStrategy)>>,
    rebased: Mutex<Vec<ProposalId>>,
    host_calls: Mutex<Vec<ProposalId>>,
    open: Mutex<BTreeMap<ProposalId, ProposalInfo>>,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_diff(&self, id: ProposalId, diff: impl Into<String>) {
        self.diffs
            .lock()
            .unwrap()
            .entry(id)
            .or_default()
            .push(diff.into());
    }

    pub fn set_file(&self, id: ProposalId, path: &str, contents: impl Into<String>) {
        self.files
            .lock()
            .unwrap()
            .insert((id, path.to_string()), contents.into());
    }

    pub fn file(&self, id: ProposalId, path: &str) -> Option<String> {
        self.files
            .lock()
            .unwrap()
            .get(&(id, path.to_string()))
            .cloned()
    }

    pub fn set_ci(&self, id: ProposalId, status: CiStatus) {
        self.ci.lock().unwrap().insert(id, status);
    }

    pub fn push_mergeable(&self, id: ProposalId, mergeable: bool) {
        self.mergeable
            .lock()
            .unwrap()
            .entry(id)
            .or_default()
            .push(mergeable);
    }

    pub fn fail_rebase(&self, id: ProposalId) {
        self.rebase_fails.lock().unwrap().insert(id);
    }

    pub fn fail_merge(&self, id: ProposalId) {
        self.merge_fails.lock().unwrap().insert(id);
    }

    pub fn fail_push(&self, id: ProposalId) {
        self.push_fails.lock().unwrap().insert(id);
    }

    pub fn add_open(&self, info: ProposalInfo) {
        self.open.lock().unwrap().insert(info.id, info);
    }

    pub fn commits(&self) -> Vec<CommitRecord> {
        self.commits.lock().unwrap().clone()
    }

    pub fn comments(&self) -> Vec<(ProposalId, Comment)> {
        self.comments.lock().unwrap().clone()
    }

    /// Merged proposal ids in merge order.
    pub fn merged(&self) -> Vec<ProposalId> {
        self.merged.lock().unwrap().iter().map(|(id, _)| *id).collect()
    }

    pub fn merged_with(&self) -> Vec<(ProposalId, MergeStrategy)> {
        self.merged.lock().unwrap().clone()
    }

    pub fn rebased(&self) -> Vec<ProposalId> {
        self.rebased.lock().unwrap().clone()
    }

    /// Proposals touched by mergeability, CI, rebase or merge calls.
    pub fn merge_path_calls(&self) -> Vec<ProposalId> {
        self.host_calls.lock().unwrap().clone()
    }

    fn touch(&self, id: ProposalId) {
        self.host_calls.lock().unwrap().push(id);
    }
}

#[async_trait::async_trait]
impl HostingApi for MockHost {
    async fn get_diff(&self, id: ProposalId) -> Result<String, VcsError> {
        let mut diffs = self.diffs.lock().unwrap();
        let queue = diffs
            .get_mut(&id)
            .ok_or_else(|| VcsError::NotFound(format!("proposal {id}")))?;
        match queue.len() {
            0 => Ok(String::new()),
            1 => Ok(queue[0].clone()),
            _ => Ok(queue.remove(0)),
        }
    }

    async fn read_file(&self, id: ProposalId, path: &str) -> Result<String, VcsError> {
        self.file(id, path)
            .ok_or_else(|| VcsError::NotFound(path.to_string()))
    }

    async fn post_comment(&self, id: ProposalId, comment: &Comment) -> Result<(), VcsError> {
        self.comments.lock().unwrap().push((id, comment.clone()));
        Ok(())
    }

    async fn commit_and_push(
        &self,
        id: ProposalId,
        changes: &[FileChange],
        message: &str,
    ) -> Result<String, VcsError> {
        if self.push_fails.lock().unwrap().contains(&id) {
            return Err(VcsError::failed("commit_and_push", "remote rejected push"));
        }
        let mut commits = self.commits.lock().unwrap();
        let sha = format!("{:07x}", 0xc0ffee + commits.len());
        for change in changes {
            self.set_file(id, &change.path, change.contents.clone());
        }
        commits.push(CommitRecord {
            id,
            sha: sha.clone(),
            message: message.to_string(),
            changes: changes.to_vec(),
        });
        Ok(sha)
    }

    async fn merge(
        &self,
        id: ProposalId,
        strategy: MergeStrategy,
        _delete_branch: bool,
    ) -> Result<(), VcsError> {
        self.touch(id);
        if self.merge_fails.lock().unwrap().contains(&id) {
            return Err(VcsError::failed("merge", "merge rejected by host"));
        }
        self.merged.lock().unwrap().push((id, strategy));
        Ok(())
    }

    async fn ci_status(&self, id: ProposalId) -> Result<CiStatus, VcsError> {
        self.touch(id);
        Ok(self
            .ci
            .lock()
            .unwrap()
            .get(&id)
            .copied()
            .unwrap_or(CiStatus::Pass))
    }

    async fn rebase(&self, id: ProposalId) -> Result<(), VcsError> {
        self.touch(id);
        self.rebased.lock().unwrap().push(id);
        if self.rebase_fails.lock().unwrap().contains(&id) {
            return Err(VcsError::failed("rebase", "conflicts with base"));
        }
        Ok(())
    }

    async fn check_mergeable(&self, id: ProposalId) -> Result<bool, VcsError> {
        self.touch(id);
        let mut all = self.mergeable.lock().unwrap();
        Ok(match all.get_mut(&id) {
            Some(q) if !q.is_empty() => q.remove(0),
            _ => true,
        })
    }

    async fn list_open(&self, base: &str) -> Result<Vec<ProposalInfo>, VcsError> {
        let open: Vec<ProposalInfo> = self.open.lock().unwrap().values().cloned().collect();
        Ok(scoped_to_base(&open, base))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: ProposalId, source: &str, target: &str) -> ProposalInfo {
        ProposalInfo {
            id,
            title: format!("pr {id}"),
            source_branch: source.into(),
            target_branch: target.into(),
            changed_files: Vec::new(),
        }
    }

    #[tokio::test]
    async fn diff_queue_keeps_last() {
        let host = MockHost::new();
        host.push_diff(1, "first");
        host.push_diff(1, "second");
        assert_eq!(host.get_diff(1).await.unwrap(), "first");
        assert_eq!(host.get_diff(1).await.unwrap(), "second");
        assert_eq!(host.get_diff(1).await.unwrap(), "second");
        assert!(matches!(host.get_diff(2).await, Err(VcsError::NotFound(_))));
    }

    #[tokio::test]
    async fn commit_updates_files() {
        let host = MockHost::new();
        host.set_file(1, "a.rs", "old");
        let sha = host
            .commit_and_push(
                1,
                &[FileChange {
                    path: "a.rs".into(),
                    contents: "new".into(),
                }],
                "fix: a",
            )
            .await
            .unwrap();
        assert_eq!(host.read_file(1, "a.rs").await.unwrap(), "new");
        assert_eq!(host.commits()[0].sha, sha);

        host.fail_push(1);
        assert!(host.commit_and_push(1, &[], "x").await.is_err());
    }

    #[tokio::test]
    async fn mergeable_queue_then_default() {
        let host = MockHost::new();
        host.push_mergeable(3, false);
        assert!(!host.check_mergeable(3).await.unwrap());
        assert!(host.check_mergeable(3).await.unwrap());
        assert_eq!(host.merge_path_calls(), vec![3, 3]);
    }

    #[tokio::test]
    async fn list_open_follows_stacks() {
        let host = MockHost::new();
        host.add_open(info(12, "feat-b", "feat-a"));
        host.add_open(info(10, "feat-a", "main"));
        host.add_open(info(20, "other", "release"));
        let ids: Vec<_> = host
            .list_open("main")
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(ids, vec![10, 12]);
    }
}
