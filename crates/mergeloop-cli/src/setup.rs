use anyhow::{bail, Context, Result};
use mergeloop_conductor::config::{load_settings, validate_settings, Settings};
use mergeloop_conductor::host::gh::GhCliHost;
use mergeloop_conductor::oracle::command::CommandOracle;
use mergeloop_conductor::oracle::search::LocalRepoSearch;
use mergeloop_conductor::oracle::{NoDocSearch, Oracles};
use mergeloop_conductor::runner::notify::{LogNotifier, Notifier, StdoutNotifier};
use mergeloop_conductor::testrun::ShellTestRunner;
use mergeloop_core::ProposalId;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Timeout for each `gh`/`git` call made by the hosting adapter.
const HOST_TIMEOUT_SEC: u64 = 300;

/// Options shared by every subcommand.
pub struct Global {
    pub config: Option<PathBuf>,
    pub workdir: PathBuf,
}

impl Global {
    pub fn settings(&self) -> Result<Settings> {
        let settings = load_settings(self.config.as_deref(), &self.workdir)?;
        debug!(workdir = %self.workdir.display(), "settings loaded");
        Ok(settings)
    }
}

/// Re-check settings after CLI flags were applied on top of them.
pub fn finish_settings(settings: Settings) -> Result<Settings> {
    validate_settings(&settings)?;
    Ok(settings)
}

pub fn require_repo(settings: &Settings, flag: Option<String>) -> Result<String> {
    match flag.or_else(|| settings.repo.clone()) {
        Some(repo) if !repo.trim().is_empty() => Ok(repo),
        _ => bail!("repository required: use --repo or set GITHUB_REPOSITORY"),
    }
}

pub fn require_pr(settings: &Settings, flag: Option<ProposalId>) -> Result<ProposalId> {
    flag.or(settings.pr)
        .context("pull request required: use --pr or set PR_NUMBER")
}

/// The production collaborators: `gh` for hosting, shell commands for the
/// oracles and the test suite, the local checkout for repository search.
pub struct Adapters {
    pub host: GhCliHost,
    oracle: CommandOracle,
    runner: ShellTestRunner,
    search: LocalRepoSearch,
}

impl Adapters {
    pub fn new(settings: &Settings, repo: &str, workdir: &Path) -> Result<Self> {
        let search = LocalRepoSearch::new(workdir, &settings.review.exclude_paths)
            .context("invalid review.exclude_paths")?;
        Ok(Self {
            host: GhCliHost::new(repo, workdir, HOST_TIMEOUT_SEC),
            oracle: CommandOracle::new(settings.oracles.clone(), workdir),
            runner: ShellTestRunner::new(settings.tests.clone(), workdir),
            search,
        })
    }

    pub fn oracles(&self) -> Oracles<'_> {
        Oracles {
            identify: &self.oracle,
            validate: &self.oracle,
            fix: &self.oracle,
            test_gen: &self.oracle,
            test_runner: &self.runner,
            repo_search: &self.search,
            doc_search: &NoDocSearch,
        }
    }
}

/// Progress messages go to stdout unless stdout carries JSON output.
pub fn notifier(json: bool) -> Box<dyn Notifier> {
    if json {
        Box::new(LogNotifier)
    } else {
        Box::new(StdoutNotifier)
    }
}

/// Cancel the token on Ctrl+C.
pub fn ctrlc_cancel() -> CancellationToken {
    let cancel = CancellationToken::new();
    let handle = cancel.clone();
    let _ = ctrlc::set_handler(move || {
        handle.cancel();
    });
    cancel
}

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_take_precedence_over_settings() {
        let settings = Settings {
            repo: Some("from/settings".into()),
            pr: Some(3),
            ..Settings::default()
        };
        assert_eq!(
            require_repo(&settings, Some("from/flag".into())).unwrap(),
            "from/flag"
        );
        assert_eq!(require_repo(&settings, None).unwrap(), "from/settings");
        assert_eq!(require_pr(&settings, Some(9)).unwrap(), 9);
        assert_eq!(require_pr(&settings, None).unwrap(), 3);
    }

    #[test]
    fn missing_identifiers_are_errors() {
        let settings = Settings::default();
        let err = require_repo(&settings, Some("  ".into())).unwrap_err();
        assert!(err.to_string().contains("--repo"));
        let err = require_pr(&settings, None).unwrap_err();
        assert!(err.to_string().contains("--pr"));
    }

    #[test]
    fn settings_load_from_workdir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(".mergeloop.yaml"),
            "orchestrator:\n  base: develop\n",
        )
        .unwrap();
        let global = Global {
            config: None,
            workdir: dir.path().to_path_buf(),
        };
        let settings = global.settings().unwrap();
        assert_eq!(settings.orchestrator.base, "develop");
    }

    #[test]
    fn flag_overrides_are_revalidated() {
        let mut settings = Settings::default();
        settings.merge_rules.max_iterations = 0;
        assert!(finish_settings(settings).is_err());
    }
}
