//! Runs the project's test suite and reads its coverage report.

use crate::config::TestSettings;
use crate::exec::{mask_secrets, run_shell, truncate, ExecError};
use crate::oracle::{OracleError, TestRunner};
use mergeloop_core::{CoverageResult, GeneratedTest};
use regex::Regex;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

const MAX_UNCOVERED_PER_FILE: usize = 50;

/// [`TestRunner`] backed by a shell command in a local checkout.
pub struct ShellTestRunner {
    settings: TestSettings,
    workdir: PathBuf,
}

impl ShellTestRunner {
    pub fn new(settings: TestSettings, workdir: impl Into<PathBuf>) -> Self {
        Self {
            settings,
            workdir: workdir.into(),
        }
    }

    async fn write_generated(&self, tests: &[GeneratedTest]) -> Result<(), OracleError> {
        let dir = self.workdir.join(&self.settings.test_dir);
        for test in tests {
            let rel = Path::new(&test.path);
            if rel.is_absolute() || !rel.components().all(|c| matches!(c, Component::Normal(_))) {
                warn!(path = %test.path, "skipping generated test with unsafe path");
                continue;
            }
            let target = dir.join(rel);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    OracleError::failure("run_tests", format!("{}: {e}", parent.display()))
                })?;
            }
            tokio::fs::write(&target, &test.content).await.map_err(|e| {
                OracleError::failure("run_tests", format!("{}: {e}", target.display()))
            })?;
            debug!(path = %target.display(), "wrote generated test");
        }
        Ok(())
    }

    /// Remove the previous run's coverage report so that a run which writes
    /// none is read as unmeasured.
    async fn clear_report(&self, path: &Path) -> Result<(), OracleError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                debug!(path = %path.display(), "removed previous coverage report");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(OracleError::failure(
                "run_tests",
                format!("{}: {e}", path.display()),
            )),
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
struct Counts {
    passed: u32,
    failed: u32,
    skipped: u32,
}

/// Sum every `N passed` / `N failed` / `N skipped` (or `ignored`) in the output.
fn parse_counts(output: &str) -> Counts {
    let mut counts = Counts::default();
    let Ok(re) = Regex::new(r"(?i)(\d+)\s+(passed|failed|skipped|ignored)") else {
        return counts;
    };
    for cap in re.captures_iter(output) {
        let n: u32 = cap[1].parse().unwrap_or(0);
        match cap[2].to_ascii_lowercase().as_str() {
            "passed" => counts.passed += n,
            "failed" => counts.failed += n,
            _ => counts.skipped += n,
        }
    }
    counts
}

// ── coverage.py JSON ──

#[derive(Deserialize)]
struct Report {
    totals: Totals,
    #[serde(default)]
    files: BTreeMap<String, FileReport>,
}

#[derive(Deserialize)]
struct Totals {
    percent_covered: f64,
}

#[derive(Deserialize)]
struct FileReport {
    #[serde(default)]
    executed_lines: Vec<u32>,
    #[serde(default)]
    missing_lines: Vec<u32>,
}

struct Coverage {
    total: f64,
    new_code: f64,
    uncovered: BTreeMap<String, Vec<u32>>,
}

/// Coverage over the changed files. A changed file absent from the report
/// contributes nothing; no measurable lines at all counts as fully covered.
fn read_coverage(json: &str, changed: &BTreeSet<String>) -> Result<Coverage, serde_json::Error> {
    let report: Report = serde_json::from_str(json)?;
    let mut executed = 0usize;
    let mut missing = 0usize;
    let mut uncovered = BTreeMap::new();
    for (path, file) in &report.files {
        let normalized = path.trim_start_matches("./").replace('\\', "/");
        if !changed.contains(&normalized) {
            continue;
        }
        executed += file.executed_lines.len();
        missing += file.missing_lines.len();
        if !file.missing_lines.is_empty() {
            let mut lines = file.missing_lines.clone();
            lines.sort_unstable();
            lines.truncate(MAX_UNCOVERED_PER_FILE);
            uncovered.insert(normalized, lines);
        }
    }
    let measured = executed + missing;
    let new_code = if measured == 0 {
        100.0
    } else {
        executed as f64 * 100.0 / measured as f64
    };
    Ok(Coverage {
        total: report.totals.percent_covered,
        new_code,
        uncovered,
    })
}

#[async_trait::async_trait]
impl TestRunner for ShellTestRunner {
    async fn run_tests(
        &self,
        generated: &[GeneratedTest],
        changed_files: &BTreeSet<String>,
    ) -> Result<CoverageResult, OracleError> {
        self.write_generated(generated).await?;
        let report_path = self.workdir.join(&self.settings.coverage_report);
        self.clear_report(&report_path).await?;

        info!(command = %self.settings.command, "running tests");
        let output = run_shell(
            &self.settings.command,
            &self.workdir,
            self.settings.timeout_sec,
            None,
        )
        .await
        .map_err(|e| match e {
            ExecError::Timeout { secs, .. } => OracleError::Timeout {
                oracle: "run_tests",
                secs,
            },
            other => OracleError::failure("run_tests", other.to_string()),
        })?;

        let text = mask_secrets(&format!("{}\n{}", output.stdout, output.stderr));
        let mut counts = parse_counts(&text);
        if !output.success && counts.failed == 0 {
            counts.failed = 1;
        }
        if counts.failed > 0 {
            debug!(output = %truncate(&text, 2000), "test output");
        }

        let coverage = match tokio::fs::read_to_string(&report_path).await {
            Ok(json) => match read_coverage(&json, changed_files) {
                Ok(c) => Some(c),
                Err(e) => {
                    warn!(path = %report_path.display(), error = %e, "unreadable coverage report");
                    None
                }
            },
            Err(_) => {
                debug!(path = %report_path.display(), "no coverage report");
                None
            }
        };
        let (total, new_code, uncovered) = match coverage {
            Some(c) => (c.total, c.new_code, c.uncovered),
            None => (0.0, 0.0, BTreeMap::new()),
        };

        Ok(CoverageResult {
            total_coverage: total,
            new_code_coverage: new_code,
            uncovered_lines: uncovered,
            tests_passed: counts.passed,
            tests_failed: counts.failed,
            tests_skipped: counts.skipped,
            duration_ms: output.duration.as_millis() as u64,
        })
    }
}
