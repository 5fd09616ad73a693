//! Hosting adapter over the `gh` and `git` command-line tools.

use crate::exec::{run_program, CommandOutput, ExecError};
use crate::host::{
    scoped_to_base, CiStatus, Comment, FileChange, HostingApi, MergeStrategy, ProposalInfo,
    VcsError,
};
use mergeloop_core::ProposalId;
use serde::Deserialize;
use std::path::{Component, Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

/// `gh pr checks` exit code while checks are still running.
const CHECKS_PENDING_EXIT: i32 = 8;
const LIST_LIMIT: &str = "200";

pub struct GhCliHost {
    repo: String,
    workdir: PathBuf,
    timeout_sec: u64,
    gh: String,
    git: String,
    /// Held from `gh pr checkout` through `git push`: concurrent loops share
    /// one working tree.
    checkout: Mutex<()>,
}

impl GhCliHost {
    /// `repo` is `owner/name`. Commits are made in the checkout at `workdir`.
    pub fn new(repo: impl Into<String>, workdir: impl Into<PathBuf>, timeout_sec: u64) -> Self {
        Self {
            repo: repo.into(),
            workdir: workdir.into(),
            timeout_sec,
            gh: "gh".into(),
            git: "git".into(),
            checkout: Mutex::new(()),
        }
    }

    /// Use other `gh` and `git` executables than the ones on `PATH`.
    pub fn with_programs(mut self, gh: impl Into<String>, git: impl Into<String>) -> Self {
        self.gh = gh.into();
        self.git = git.into();
        self
    }

    async fn exec(
        &self,
        operation: &'static str,
        program: &str,
        args: &[String],
        stdin: Option<&[u8]>,
    ) -> Result<CommandOutput, VcsError> {
        debug!(operation, program, ?args, "host command");
        run_program(program, args, &self.workdir, self.timeout_sec, stdin)
            .await
            .map_err(|e| match e {
                e @ ExecError::Spawn { .. } if e.is_not_found() => {
                    VcsError::failed(operation, format!("{program} is not installed"))
                }
                other => VcsError::failed(operation, other.to_string()),
            })
    }

    /// Run and require success, returning stdout.
    async fn run(
        &self,
        operation: &'static str,
        program: &str,
        args: Vec<String>,
        stdin: Option<&[u8]>,
    ) -> Result<String, VcsError> {
        let out = self.exec(operation, program, &args, stdin).await?;
        if out.success {
            Ok(out.stdout)
        } else if is_not_found(&out.stderr) {
            Err(VcsError::NotFound(format!("{operation} target")))
        } else {
            Err(VcsError::failed(operation, out.failure_detail()))
        }
    }

    fn pr_args(&self, sub: &str, id: ProposalId) -> Vec<String> {
        vec![
            "pr".into(),
            sub.into(),
            id.to_string(),
            "--repo".into(),
            self.repo.clone(),
        ]
    }

    async fn view_field(
        &self,
        operation: &'static str,
        id: ProposalId,
        field: &str,
    ) -> Result<String, VcsError> {
        let mut args = self.pr_args("view", id);
        args.extend(["--json".into(), field.into(), "-q".into(), format!(".{field}")]);
        Ok(self.run(operation, &self.gh, args, None).await?.trim().to_string())
    }
}

fn is_not_found(stderr: &str) -> bool {
    stderr.contains("HTTP 404") || stderr.contains("Not Found") || stderr.contains("no pull requests found")
}

fn is_contained(path: &str) -> bool {
    let p = Path::new(path);
    !path.is_empty()
        && !p.is_absolute()
        && p.components().all(|c| matches!(c, Component::Normal(_)))
}

fn strategy_flag(strategy: MergeStrategy) -> String {
    format!("--{}", strategy.as_str())
}

/// Map `gh pr checks` results onto a CI status.
fn ci_from_checks(out: &CommandOutput) -> CiStatus {
    if out.success || out.stderr.contains("no checks reported") {
        CiStatus::Pass
    } else if out.exit_code == Some(CHECKS_PENDING_EXIT) {
        CiStatus::Pending
    } else {
        CiStatus::Fail
    }
}

#[derive(Deserialize)]
struct GhMergeable {
    mergeable: String,
}

fn parse_mergeable(json: &str) -> Result<bool, VcsError> {
    let v: GhMergeable = serde_json::from_str(json.trim())
        .map_err(|e| VcsError::failed("check_mergeable", format!("unexpected gh output: {e}")))?;
    // UNKNOWN (still computing) counts as not mergeable.
    Ok(v.mergeable.eq_ignore_ascii_case("MERGEABLE"))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GhPr {
    number: ProposalId,
    #[serde(default)]
    title: String,
    head_ref_name: String,
    base_ref_name: String,
    #[serde(default)]
    files: Vec<GhFile>,
}

#[derive(Deserialize)]
struct GhFile {
    path: String,
}

fn parse_pr_list(json: &str) -> Result<Vec<ProposalInfo>, VcsError> {
    let prs: Vec<GhPr> = serde_json::from_str(json.trim())
        .map_err(|e| VcsError::failed("list_open", format!("unexpected gh output: {e}")))?;
    let mut out: Vec<ProposalInfo> = prs
        .into_iter()
        .map(|p| ProposalInfo {
            id: p.number,
            title: p.title,
            source_branch: p.head_ref_name,
            target_branch: p.base_ref_name,
            changed_files: p.files.into_iter().map(|f| f.path).collect(),
        })
        .collect();
    out.sort_by_key(|p| p.id);
    Ok(out)
}

#[async_trait::async_trait]
impl HostingApi for GhCliHost {
    async fn get_diff(&self, id: ProposalId) -> Result<String, VcsError> {
        self.run("get_diff", &self.gh, self.pr_args("diff", id), None)
            .await
    }

    async fn read_file(&self, id: ProposalId, path: &str) -> Result<String, VcsError> {
        if !is_contained(path) {
            return Err(VcsError::failed("read_file", format!("refusing path {path:?}")));
        }
        let head = self.view_field("read_file", id, "headRefName").await?;
        let args = vec![
            "api".into(),
            "-H".into(),
            "Accept: application/vnd.github.raw".into(),
            format!("repos/{}/contents/{path}?ref={head}", self.repo),
        ];
        self.run("read_file", &self.gh, args, None)
            .await
            .map_err(|e| match e {
                VcsError::NotFound(_) => VcsError::NotFound(path.to_string()),
                other => other,
            })
    }

    async fn post_comment(&self, id: ProposalId, comment: &Comment) -> Result<(), VcsError> {
        match (&comment.path, comment.line) {
            (Some(path), Some(line)) => {
                let commit = self.view_field("post_comment", id, "headRefOid").await?;
                let args = vec![
                    "api".into(),
                    format!("repos/{}/pulls/{id}/comments", self.repo),
                    "-f".into(),
                    format!("body={}", comment.body),
                    "-f".into(),
                    format!("path={path}"),
                    "-F".into(),
                    format!("line={line}"),
                    "-f".into(),
                    "side=RIGHT".into(),
                    "-f".into(),
                    format!("commit_id={commit}"),
                ];
                self.run("post_comment", &self.gh, args, None).await?;
            }
            _ => {
                let mut args = self.pr_args("comment", id);
                args.extend(["--body-file".into(), "-".into()]);
                self.run("post_comment", &self.gh, args, Some(comment.body.as_bytes()))
                    .await?;
            }
        }
        Ok(())
    }

    async fn commit_and_push(
        &self,
        id: ProposalId,
        changes: &[FileChange],
        message: &str,
    ) -> Result<String, VcsError> {
        if changes.is_empty() {
            return Err(VcsError::failed("commit_and_push", "nothing to commit"));
        }
        if let Some(bad) = changes.iter().find(|c| !is_contained(&c.path)) {
            return Err(VcsError::failed(
                "commit_and_push",
                format!("refusing path {:?}", bad.path),
            ));
        }

        let _tree = self.checkout.lock().await;
        self.run("commit_and_push", &self.gh, self.pr_args("checkout", id), None)
            .await?;
        for change in changes {
            let target = self.workdir.join(&change.path);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    VcsError::failed("commit_and_push", format!("{}: {e}", parent.display()))
                })?;
            }
            tokio::fs::write(&target, &change.contents)
                .await
                .map_err(|e| {
                    VcsError::failed("commit_and_push", format!("{}: {e}", target.display()))
                })?;
        }

        let mut add = vec!["add".to_string(), "--".to_string()];
        add.extend(changes.iter().map(|c| c.path.clone()));
        self.run("commit_and_push", &self.git, add, None).await?;
        self.run(
            "commit_and_push",
            &self.git,
            vec!["commit".into(), "-m".into(), message.into()],
            None,
        )
        .await?;
        let sha = self
            .run(
                "commit_and_push",
                &self.git,
                vec!["rev-parse".into(), "HEAD".into()],
                None,
            )
            .await?
            .trim()
            .to_string();
        self.run("commit_and_push", &self.git, vec!["push".into()], None)
            .await?;
        Ok(sha)
    }

    async fn merge(
        &self,
        id: ProposalId,
        strategy: MergeStrategy,
        delete_branch: bool,
    ) -> Result<(), VcsError> {
        let mut args = self.pr_args("merge", id);
        args.push(strategy_flag(strategy));
        if delete_branch {
            args.push("--delete-branch".into());
        }
        self.run("merge", &self.gh, args, None).await?;
        Ok(())
    }

    async fn ci_status(&self, id: ProposalId) -> Result<CiStatus, VcsError> {
        let out = self
            .exec("ci_status", &self.gh, &self.pr_args("checks", id), None)
            .await?;
        Ok(ci_from_checks(&out))
    }

    async fn rebase(&self, id: ProposalId) -> Result<(), VcsError> {
        let mut args = self.pr_args("update-branch", id);
        args.push("--rebase".into());
        self.run("rebase", &self.gh, args, None).await?;
        Ok(())
    }

    async fn check_mergeable(&self, id: ProposalId) -> Result<bool, VcsError> {
        let mut args = self.pr_args("view", id);
        args.extend(["--json".into(), "mergeable".into()]);
        let out = self.run("check_mergeable", &self.gh, args, None).await?;
        parse_mergeable(&out)
    }

    async fn list_open(&self, base: &str) -> Result<Vec<ProposalInfo>, VcsError> {
        let args = vec![
            "pr".into(),
            "list".into(),
            "--repo".into(),
            self.repo.clone(),
            "--state".into(),
            "open".into(),
            "--limit".into(),
            LIST_LIMIT.into(),
            "--json".into(),
            "number,title,headRefName,baseRefName,files".into(),
        ];
        let out = self.run("list_open", &self.gh, args, None).await?;
        Ok(scoped_to_base(&parse_pr_list(&out)?, base))
    }
}

/// Scripted `gh` and `git` stand-ins sharing one working tree, for tests.
#[cfg(all(test, unix))]
pub(crate) mod fake {
    use super::GhCliHost;
    use mergeloop_core::ProposalId;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    const GH: &str = r#"#!/bin/sh
state="__STATE__"
case "$1 $2" in
  "pr list") cat "$state/prs.json" ;;
  "pr diff") cat "$state/pr.diff" ;;
  "pr checkout") echo "$3" > "$state/head"; sleep 0.3 ;;
  "pr view") echo "p$3" ;;
  "api -H")
    path="${4#*/contents/}"
    cat "$state/remote/${path%%\?ref=*}" ;;
  *) cat > /dev/null ;;
esac
"#;

    const GIT: &str = r#"#!/bin/sh
state="__STATE__"
case "$1" in
  commit) echo "commit $(cat "$state/head")" >> "$state/commits.log" ;;
  rev-parse) echo "sha$(cat "$state/head")" ;;
  push) echo "push $(cat "$state/head")" >> "$state/commits.log" ;;
esac
"#;

    fn script(path: &Path, template: &str, state: &Path) {
        std::fs::write(path, template.replace("__STATE__", &state.display().to_string())).unwrap();
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    /// `gh pr checkout N` records N as the checked-out branch and then
    /// lingers, so unserialized callers overlap. `git commit` and `git push`
    /// log the branch they ran on.
    pub struct FakeCli {
        pub state: PathBuf,
        pub workdir: PathBuf,
    }

    impl FakeCli {
        pub fn new(root: &Path) -> Self {
            let state = root.join("state");
            let workdir = root.join("work");
            std::fs::create_dir_all(state.join("remote")).unwrap();
            std::fs::create_dir_all(&workdir).unwrap();
            std::fs::write(state.join("head"), "none\n").unwrap();
            script(&state.join("gh"), GH, &state);
            script(&state.join("git"), GIT, &state);
            Self { state, workdir }
        }

        pub fn host(&self) -> GhCliHost {
            GhCliHost::new("acme/shop", &self.workdir, 30).with_programs(
                self.state.join("gh").display().to_string(),
                self.state.join("git").display().to_string(),
            )
        }

        /// Open pull requests as `(id, changed file)`, all against `main`.
        pub fn set_open(&self, prs: &[(ProposalId, &str)]) {
            let entries: Vec<serde_json::Value> = prs
                .iter()
                .map(|(id, file)| {
                    serde_json::json!({
                        "number": id,
                        "title": format!("pr {id}"),
                        "headRefName": format!("p{id}"),
                        "baseRefName": "main",
                        "files": [{"path": file}],
                    })
                })
                .collect();
            std::fs::write(
                self.state.join("prs.json"),
                serde_json::to_string(&entries).unwrap(),
            )
            .unwrap();
        }

        pub fn set_diff(&self, diff: &str) {
            std::fs::write(self.state.join("pr.diff"), diff).unwrap();
        }

        pub fn set_file(&self, path: &str, contents: &str) {
            let target = self.state.join("remote").join(path);
            std::fs::create_dir_all(target.parent().unwrap()).unwrap();
            std::fs::write(target, contents).unwrap();
        }

        pub fn commit_log(&self) -> Vec<String> {
            std::fs::read_to_string(self.state.join("commits.log"))
                .unwrap_or_default()
                .lines()
                .map(str::to_string)
                .collect()
        }
    }
}
