//! Oracles backed by external commands.
//!
//! Each capability is a shell command that reads one JSON request on stdin
//! and writes one JSON response on stdout. Responses are checked here, at the
//! boundary, so the loop only ever sees well-formed issues and verdicts.

use crate::config::OracleSettings;
use crate::exec::{run_shell, truncate, ExecError};
use crate::oracle::{
    DocSearch, FixOracle, FixOutcome, IdentifyOracle, OracleError, RepoSearch, SearchHit,
    TestGenOracle, ValidateOracle,
};
use mergeloop_core::diff::format_units;
use mergeloop_core::{ChangeUnit, GeneratedTest, LineRange, PotentialIssue, Severity, ValidatedIssue};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, warn};

/// Repository hits attached to each validate request.
const CONTEXT_HITS: usize = 8;
/// Lines of the flagged file around the issue sent as an excerpt.
const EXCERPT_RADIUS: u32 = 15;

pub struct CommandOracle {
    settings: OracleSettings,
    cwd: PathBuf,
}

impl CommandOracle {
    pub fn new(settings: OracleSettings, cwd: impl Into<PathBuf>) -> Self {
        Self {
            settings,
            cwd: cwd.into(),
        }
    }

    async fn call<Req, Resp>(
        &self,
        oracle: &'static str,
        command: Option<&str>,
        request: &Req,
    ) -> Result<Resp, OracleError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let command = command
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| OracleError::failure(oracle, "no command configured"))?;
        let body = serde_json::to_vec(request)
            .map_err(|e| OracleError::failure(oracle, format!("encoding request: {e}")))?;

        debug!(oracle, bytes = body.len(), "calling oracle command");
        let output = run_shell(command, &self.cwd, self.settings.timeout_sec, Some(&body))
            .await
            .map_err(|e| match e {
                ExecError::Timeout { secs, .. } => OracleError::Timeout { oracle, secs },
                other => OracleError::failure(oracle, other.to_string()),
            })?;
        if !output.success {
            return Err(OracleError::failure(oracle, output.failure_detail()));
        }
        serde_json::from_str(output.stdout.trim()).map_err(|e| {
            OracleError::malformed(
                oracle,
                format!("{e}: {}", truncate(output.stdout.trim(), 200)),
            )
        })
    }
}

// ── Wire shapes ──

#[derive(Serialize)]
struct IdentifyRequest<'a> {
    units: &'a [ChangeUnit],
    rendered: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IdentifyResponse {
    Wrapped { issues: Vec<RawIssue> },
    Bare(Vec<RawIssue>),
}

#[derive(Deserialize)]
struct RawIssue {
    file: String,
    #[serde(alias = "line")]
    line_start: u32,
    #[serde(default)]
    line_end: Option<u32>,
    #[serde(default)]
    category: String,
    severity: String,
    description: String,
    #[serde(default, alias = "code_snippet")]
    snippet: String,
}

impl RawIssue {
    fn into_issue(self) -> Result<PotentialIssue, String> {
        if self.file.trim().is_empty() {
            return Err("issue without a file".into());
        }
        if self.description.trim().is_empty() {
            return Err(format!("issue in {} without a description", self.file));
        }
        let severity: Severity = self.severity.parse().map_err(|e| format!("{e}"))?;
        let category = if self.category.trim().is_empty() {
            "general".to_string()
        } else {
            self.category
        };
        Ok(PotentialIssue {
            file: self.file,
            lines: LineRange::new(self.line_start, self.line_end.unwrap_or(0)).normalized(),
            category,
            severity,
            description: self.description,
            snippet: self.snippet,
        })
    }
}

#[derive(Serialize)]
struct ValidateRequest<'a> {
    issue: &'a PotentialIssue,
    repo_hits: Vec<SearchHit>,
    file_excerpt: Option<String>,
    docs: Vec<String>,
}

#[derive(Deserialize)]
struct ValidateResponse {
    is_valid: bool,
    #[serde(default)]
    evidence: Vec<String>,
    #[serde(default, alias = "cve_reference")]
    reference: Option<String>,
    #[serde(default)]
    mitigation: Option<String>,
    #[serde(default)]
    confidence: f64,
}

#[derive(Serialize)]
struct FixRequest<'a> {
    issue: &'a ValidatedIssue,
    contents: &'a str,
}

#[derive(Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum FixResponse {
    Fixed { contents: String },
    Unfixable { reason: String },
}

#[derive(Serialize)]
struct TestGenRequest<'a> {
    units: &'a [ChangeUnit],
    issues: &'a [ValidatedIssue],
}

#[derive(Deserialize)]
struct TestGenResponse {
    tests: Vec<GeneratedTest>,
}

/// Clamp to [0, 1]; NaN counts as no confidence.
fn clamp_confidence(c: f64) -> f64 {
    if c.is_nan() {
        0.0
    } else {
        c.clamp(0.0, 1.0)
    }
}

fn excerpt(contents: &str, lines: LineRange) -> String {
    let r = lines.normalized();
    let from = r.start.saturating_sub(EXCERPT_RADIUS).max(1);
    let to = r.end.saturating_add(EXCERPT_RADIUS);
    contents
        .lines()
        .enumerate()
        .map(|(i, l)| (i as u32 + 1, l))
        .filter(|(n, _)| *n >= from && *n <= to)
        .map(|(n, l)| format!("{n:>5} | {l}"))
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Oracle impls ──

#[async_trait::async_trait]
impl IdentifyOracle for CommandOracle {
    async fn identify(&self, units: &[ChangeUnit]) -> Result<Vec<PotentialIssue>, OracleError> {
        let request = IdentifyRequest {
            units,
            rendered: format_units(units),
        };
        let response: IdentifyResponse = self
            .call("identify", self.settings.identify.as_deref(), &request)
            .await?;
        let raw = match response {
            IdentifyResponse::Wrapped { issues } => issues,
            IdentifyResponse::Bare(issues) => issues,
        };
        let mut issues = Vec::with_capacity(raw.len());
        for item in raw {
            match item.into_issue() {
                Ok(issue) => issues.push(issue),
                Err(reason) => warn!(%reason, "dropping malformed issue from identify oracle"),
            }
        }
        Ok(issues)
    }
}

#[async_trait::async_trait]
impl ValidateOracle for CommandOracle {
    async fn validate(
        &self,
        issue: &PotentialIssue,
        repo: &dyn RepoSearch,
        docs: &dyn DocSearch,
    ) -> Result<ValidatedIssue, OracleError> {
        let probe = issue
            .snippet
            .lines()
            .map(str::trim)
            .find(|l| l.len() >= 4)
            .unwrap_or("");
        let repo_hits = if probe.is_empty() {
            Vec::new()
        } else {
            repo.search(probe, CONTEXT_HITS).await
        };
        let file_excerpt = repo
            .read_file(&issue.file)
            .await
            .map(|c| excerpt(&c, issue.lines));
        let docs = docs.lookup(&issue.category, 3).await;

        let request = ValidateRequest {
            issue,
            repo_hits,
            file_excerpt,
            docs,
        };
        let resp: ValidateResponse = self
            .call("validate", self.settings.validate.as_deref(), &request)
            .await?;
        Ok(ValidatedIssue {
            issue: issue.clone(),
            is_valid: resp.is_valid,
            evidence: resp.evidence,
            reference: resp.reference.filter(|r| !r.trim().is_empty()),
            mitigation: resp.mitigation.filter(|m| !m.trim().is_empty()),
            confidence: clamp_confidence(resp.confidence),
        })
    }
}

#[async_trait::async_trait]
impl FixOracle for CommandOracle {
    async fn fix(&self, issue: &ValidatedIssue, contents: &str) -> Result<FixOutcome, OracleError> {
        let request = FixRequest { issue, contents };
        let resp: FixResponse = self
            .call("fix", self.settings.fix.as_deref(), &request)
            .await?;
        Ok(match resp {
            FixResponse::Fixed { contents } => FixOutcome::Applied { contents },
            FixResponse::Unfixable { reason } => FixOutcome::Unfixable { reason },
        })
    }
}

#[async_trait::async_trait]
impl TestGenOracle for CommandOracle {
    async fn generate_tests(
        &self,
        units: &[ChangeUnit],
        issues: &[ValidatedIssue],
    ) -> Result<Vec<GeneratedTest>, OracleError> {
        let request = TestGenRequest { units, issues };
        let resp: TestGenResponse = self
            .call(
                "generate_tests",
                self.settings.generate_tests.as_deref(),
                &request,
            )
            .await?;
        Ok(resp
            .tests
            .into_iter()
            .filter(|t| !t.path.trim().is_empty() && !t.content.trim().is_empty())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::NoDocSearch;
    use crate::oracle::search::LocalRepoSearch;

    fn settings(identify: &str, validate: &str, fix: &str) -> OracleSettings {
        OracleSettings {
            identify: Some(identify.into()),
            validate: Some(validate.into()),
            fix: Some(fix.into()),
            generate_tests: None,
            timeout_sec: 10,
        }
    }

    fn sample_issue() -> PotentialIssue {
        PotentialIssue {
            file: "src/db.rs".into(),
            lines: LineRange::new(2, 2),
            category: "security".into(),
            severity: Severity::Critical,
            description: "sql injection".into(),
            snippet: "let sql = format!(\"SELECT {id}\");".into(),
        }
    }

    #[cfg(not(windows))]
    #[tokio::test]
    async fn identify_parses_and_drops_malformed_items() {
        let dir = tempfile::tempdir().unwrap();
        let script = r#"cat >/dev/null; echo '{"issues":[{"file":"a.rs","line_start":9,"line_end":3,"severity":"HIGH","description":"race"},{"file":"b.rs","line":1,"severity":"urgent","description":"x"}]}'"#;
        let oracle = CommandOracle::new(settings(script, "true", "true"), dir.path());
        let issues = oracle.identify(&[]).await.unwrap();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, Severity::High);
        assert_eq!(issues[0].lines, LineRange::new(3, 9));
        assert_eq!(issues[0].category, "general");
    }

    #[cfg(not(windows))]
    #[tokio::test]
    async fn identify_accepts_bare_array() {
        let dir = tempfile::tempdir().unwrap();
        let script = r#"cat >/dev/null; echo '[{"file":"a.rs","line":4,"severity":"low","description":"nit","category":"style"}]'"#;
        let oracle = CommandOracle::new(settings(script, "true", "true"), dir.path());
        let issues = oracle.identify(&[]).await.unwrap();
        assert_eq!(issues[0].lines, LineRange::new(4, 4));
    }

    #[cfg(not(windows))]
    #[tokio::test]
    async fn nonzero_exit_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let oracle = CommandOracle::new(settings("echo boom >&2; exit 2", "true", "true"), dir.path());
        let err = oracle.identify(&[]).await.unwrap_err();
        assert!(matches!(err, OracleError::Failure { oracle: "identify", .. }));
        assert!(err.to_string().contains("boom"));
    }

    #[cfg(not(windows))]
    #[tokio::test]
    async fn garbage_output_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let oracle = CommandOracle::new(settings("echo not-json", "true", "true"), dir.path());
        let err = oracle.identify(&[]).await.unwrap_err();
        assert!(matches!(err, OracleError::Malformed { .. }));
    }

    #[tokio::test]
    async fn missing_command_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let oracle = CommandOracle::new(OracleSettings::default(), dir.path());
        let err = oracle.identify(&[]).await.unwrap_err();
        assert!(err.to_string().contains("no command configured"));
    }

    #[cfg(not(windows))]
    #[tokio::test]
    async fn validate_clamps_confidence_and_sends_context() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(
            dir.path().join("src/db.rs"),
            "fn q(id: &str) {\n    let sql = format!(\"SELECT {id}\");\n}\n",
        )
        .unwrap();
        // Valid only if the request carried the numbered file excerpt.
        let script = r#"if grep -q '2 |     let sql' ; then echo '{"is_valid":true,"evidence":["seen"],"confidence":1.7,"reference":""}'; else echo '{"is_valid":false,"confidence":0.2}'; fi"#;
        let oracle = CommandOracle::new(settings("true", script, "true"), dir.path());
        let repo = LocalRepoSearch::new(dir.path(), &[]).unwrap();
        let v = oracle
            .validate(&sample_issue(), &repo, &NoDocSearch)
            .await
            .unwrap();
        assert!(v.is_valid);
        assert_eq!(v.confidence, 1.0);
        assert_eq!(v.reference, None);
        assert_eq!(v.evidence, vec!["seen"]);
    }

    #[cfg(not(windows))]
    #[tokio::test]
    async fn fix_maps_status() {
        let dir = tempfile::tempdir().unwrap();
        let fixed = r#"cat >/dev/null; echo '{"status":"fixed","contents":"new body"}'"#;
        let unfixable = r#"cat >/dev/null; echo '{"status":"unfixable","reason":"needs design change"}'"#;
        let issue = ValidatedIssue::rejected(sample_issue(), "n/a");

        let oracle = CommandOracle::new(settings("true", "true", fixed), dir.path());
        assert_eq!(
            oracle.fix(&issue, "old").await.unwrap(),
            FixOutcome::Applied {
                contents: "new body".into()
            }
        );

        let oracle = CommandOracle::new(settings("true", "true", unfixable), dir.path());
        assert!(matches!(
            oracle.fix(&issue, "old").await.unwrap(),
            FixOutcome::Unfixable { .. }
        ));
    }

    #[test]
    fn excerpt_window_and_numbering() {
        let text: String = (1..=40).map(|i| format!("line{i}\n")).collect();
        let ex = excerpt(&text, LineRange::new(20, 20));
        assert!(ex.starts_with("    5 | line5"));
        assert!(ex.ends_with("   35 | line35"));
    }

    #[test]
    fn clamp_handles_nan() {
        assert_eq!(clamp_confidence(f64::NAN), 0.0);
        assert_eq!(clamp_confidence(-1.0), 0.0);
        assert_eq!(clamp_confidence(0.4), 0.4);
    }
}
