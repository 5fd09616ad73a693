//! Standalone test generation: review a proposal's changes, write tests for
//! them, run the suite and evaluate the merge gate on the result.

use crate::host::HostingApi;
use crate::oracle::Oracles;
use crate::runner::event_log::{Event, EventLogger};
use crate::runner::review::in_changed_files;
use crate::runner::validate::validate_issues;
use anyhow::{Context, Result};
use mergeloop_core::diff::{changed_files, extract};
use mergeloop_core::gate::decide;
use mergeloop_core::{GeneratedTest, MergeDecision, MergeRules, ProposalId, ValidatedIssue};
use serde::Serialize;
use std::fmt::Write as _;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct TestgenConfig {
    pub rules: MergeRules,
    /// Generate tests without running them.
    pub dry_run: bool,
    pub max_parallel_validations: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TestgenOutcome {
    pub proposal: ProposalId,
    /// Valid issues the generated tests are meant to pin down.
    pub issues: Vec<ValidatedIssue>,
    pub tests: Vec<GeneratedTest>,
    /// None on a dry run or when the diff had no changes.
    pub decision: Option<MergeDecision>,
}

impl TestgenOutcome {
    pub fn summary(&self) -> String {
        let mut out = format!(
            "## Test generation #{}\n\n{} valid issue(s), generated {} test(s):\n",
            self.proposal,
            self.issues.len(),
            self.tests.len()
        );
        for t in &self.tests {
            let _ = write!(out, "- `{}`", t.path);
            if !t.description.is_empty() {
                let _ = write!(out, " - {}", t.description);
            }
            out.push('\n');
        }
        match &self.decision {
            Some(d) => {
                out.push('\n');
                out.push_str(&d.summary());
            }
            None => out.push_str("\nTests were not run.\n"),
        }
        out
    }
}

/// Identify and validate issues in the proposal's changes, then generate
/// tests for them. Unless `dry_run`, run the tests with the suite and decide
/// the gate with the valid issues still open.
pub async fn run_testgen(
    host: &dyn HostingApi,
    oracles: Oracles<'_>,
    proposal: ProposalId,
    config: &TestgenConfig,
    events: &EventLogger,
) -> Result<TestgenOutcome> {
    let diff = host
        .get_diff(proposal)
        .await
        .with_context(|| format!("fetching diff for #{proposal}"))?;
    let units = extract(&diff).with_context(|| format!("parsing diff for #{proposal}"))?;
    let mut outcome = TestgenOutcome {
        proposal,
        issues: Vec::new(),
        tests: Vec::new(),
        decision: None,
    };
    if units.is_empty() {
        info!(proposal, "no changes, nothing to test");
        return Ok(outcome);
    }
    let changed = changed_files(&units);

    let identified = match oracles.identify.identify(&units).await {
        Ok(issues) => issues,
        Err(e) => {
            warn!(proposal, error = %e, "identify failed, generating tests without issues");
            Vec::new()
        }
    };
    let (in_scope, _) = in_changed_files(identified, &changed);
    outcome.issues = validate_issues(
        &in_scope,
        oracles,
        config.max_parallel_validations,
        |v| v,
    )
    .await
    .into_iter()
    .filter(|v| v.is_valid)
    .collect();
    info!(proposal, issues = outcome.issues.len(), "valid issues for regression tests");

    outcome.tests = oracles
        .test_gen
        .generate_tests(&units, &outcome.issues)
        .await
        .with_context(|| format!("generating tests for #{proposal}"))?;
    info!(proposal, tests = outcome.tests.len(), "tests generated");
    if config.dry_run {
        return Ok(outcome);
    }

    let coverage = oracles
        .test_runner
        .run_tests(&outcome.tests, &changed)
        .await
        .with_context(|| format!("running tests for #{proposal}"))?;
    events.record(Event::TestsRun {
        proposal,
        iteration: 1,
        passed: coverage.tests_passed,
        failed: coverage.tests_failed,
        new_code_coverage: coverage.new_code_coverage,
    });

    let decision = decide(&outcome.issues, &coverage, &config.rules)
        .with_generated_tests(outcome.tests.len());
    events.record(Event::GateDecided {
        proposal,
        approved: decision.approved,
        reason: decision.reason.clone(),
    });
    outcome.decision = Some(decision);
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::mock::MockHost;
    use crate::oracle::mock::MockOracle;
    use crate::oracle::search::LocalRepoSearch;
    use mergeloop_core::{CoverageResult, LineRange, PotentialIssue, Severity};

    const DIFF: &str = "\
diff --git a/src/lib.rs b/src/lib.rs
--- a/src/lib.rs
+++ b/src/lib.rs
@@ -1 +1,2 @@
 fn a() {}
+fn b() {}
";

    fn config(dry_run: bool) -> TestgenConfig {
        TestgenConfig {
            rules: MergeRules::default(),
            dry_run,
            max_parallel_validations: 4,
        }
    }

    fn generated() -> Vec<GeneratedTest> {
        vec![GeneratedTest {
            path: "test_b.rs".into(),
            content: "#[test] fn b() {}".into(),
            description: "covers b".into(),
        }]
    }

    #[tokio::test]
    async fn runs_generated_tests_and_decides() {
        let dir = tempfile::tempdir().unwrap();
        let search = LocalRepoSearch::new(dir.path(), &[]).unwrap();
        let oracle = MockOracle::new();
        oracle.set_generated_tests(generated());
        let host = MockHost::new();
        host.push_diff(3, DIFF);

        let outcome = run_testgen(
            &host,
            Oracles::uniform(&oracle, &search),
            3,
            &config(false),
            &EventLogger::disabled(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.tests.len(), 1);
        let decision = outcome.decision.as_ref().unwrap();
        assert!(decision.approved);
        assert_eq!(decision.generated_tests, 1);
        assert!(outcome.summary().contains("- `test_b.rs` - covers b"));
    }

    #[tokio::test]
    async fn low_new_code_coverage_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let search = LocalRepoSearch::new(dir.path(), &[]).unwrap();
        let oracle = MockOracle::new();
        oracle.push_coverage(CoverageResult {
            total_coverage: 90.0,
            new_code_coverage: 40.0,
            tests_passed: 4,
            ..Default::default()
        });
        let host = MockHost::new();
        host.push_diff(3, DIFF);

        let outcome = run_testgen(
            &host,
            Oracles::uniform(&oracle, &search),
            3,
            &config(false),
            &EventLogger::disabled(),
        )
        .await
        .unwrap();
        let decision = outcome.decision.unwrap();
        assert!(!decision.approved);
        assert!(decision.reason.contains("new code coverage 40.0% below 90.0%"));
    }

    #[tokio::test]
    async fn valid_high_issue_blocks_the_gate() {
        let dir = tempfile::tempdir().unwrap();
        let search = LocalRepoSearch::new(dir.path(), &[]).unwrap();
        let oracle = MockOracle::new();
        let issue = |description: &str, file: &str| PotentialIssue {
            file: file.into(),
            lines: LineRange::new(2, 2),
            category: "logic".into(),
            severity: Severity::High,
            description: description.into(),
            snippet: String::new(),
        };
        oracle.push_identify(vec![
            issue("b ignores errors", "src/lib.rs"),
            issue("not a real problem", "src/lib.rs"),
            issue("outside the diff", "src/other.rs"),
        ]);
        oracle.set_verdict("not a real problem", false, 0.9);
        let host = MockHost::new();
        host.push_diff(3, DIFF);

        let outcome = run_testgen(
            &host,
            Oracles::uniform(&oracle, &search),
            3,
            &config(false),
            &EventLogger::disabled(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.issues.len(), 1);
        assert_eq!(outcome.issues[0].issue.description, "b ignores errors");
        let decision = outcome.decision.unwrap();
        assert!(!decision.approved);
        assert!(decision.reason.contains("high severity issue present (1 unresolved)"));
    }

    #[tokio::test]
    async fn dry_run_does_not_run_tests() {
        let dir = tempfile::tempdir().unwrap();
        let search = LocalRepoSearch::new(dir.path(), &[]).unwrap();
        let oracle = MockOracle::new();
        oracle.set_generated_tests(generated());
        // A failing run would block the gate if it were consulted.
        oracle.push_coverage(CoverageResult {
            tests_failed: 3,
            ..Default::default()
        });
        let host = MockHost::new();
        host.push_diff(3, DIFF);

        let outcome = run_testgen(
            &host,
            Oracles::uniform(&oracle, &search),
            3,
            &config(true),
            &EventLogger::disabled(),
        )
        .await
        .unwrap();
        assert!(outcome.decision.is_none());
        assert_eq!(outcome.tests.len(), 1);
        assert!(outcome.summary().contains("Tests were not run."));
    }

    #[tokio::test]
    async fn missing_diff_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let search = LocalRepoSearch::new(dir.path(), &[]).unwrap();
        let oracle = MockOracle::new();
        let err = run_testgen(
            &MockHost::new(),
            Oracles::uniform(&oracle, &search),
            9,
            &config(false),
            &EventLogger::disabled(),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("fetching diff for #9"));
    }
}
