//! Typed settings for every mergeloop command.
//!
//! Every field has a default, so an absent or partial `.mergeloop.yaml` is
//! valid. See [`parser`] for loading, env overrides and validation.

pub mod parser;

pub use parser::{apply_env_overrides, load_settings, parse_settings, validate_settings};

use crate::host::MergeStrategy;
use mergeloop_core::{MergeRules, ProposalId, Severity};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default config file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = ".mergeloop.yaml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// `owner/name` of the hosted repository.
    pub repo: Option<String>,
    /// Proposal the single-proposal commands act on.
    pub pr: Option<ProposalId>,
    pub review: ReviewSettings,
    pub merge_rules: MergeRules,
    #[serde(rename = "loop")]
    pub loop_: LoopSettings,
    pub tests: TestSettings,
    pub orchestrator: OrchestratorSettings,
    pub oracles: OracleSettings,
}

// ── review ──

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewSettings {
    pub min_confidence: f64,
    pub report_critical: bool,
    pub report_high: bool,
    pub report_medium: bool,
    pub report_low: bool,
    /// Identified issues below this severity are dropped before validation.
    pub min_severity: Severity,
    pub parallel_validation: bool,
    pub max_parallel_validations: usize,
    pub post_comments: bool,
    pub post_summary: bool,
    /// Globs excluded from repository search, relative to the checkout.
    pub exclude_paths: Vec<String>,
}

impl Default for ReviewSettings {
    fn default() -> Self {
        Self {
            min_confidence: 0.7,
            report_critical: true,
            report_high: true,
            report_medium: true,
            report_low: false,
            min_severity: Severity::Medium,
            parallel_validation: true,
            max_parallel_validations: 8,
            post_comments: true,
            post_summary: true,
            exclude_paths: Vec::new(),
        }
    }
}

impl ReviewSettings {
    /// Whether issues of this severity are reported at all.
    pub fn reports(&self, severity: Severity) -> bool {
        match severity {
            Severity::Critical => self.report_critical,
            Severity::High => self.report_high,
            Severity::Medium => self.report_medium,
            Severity::Low => self.report_low,
        }
    }
}

// ── loop ──

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopSettings {
    pub min_severity_to_fix: Severity,
    /// An unfixable issue at or above this severity ends the loop.
    pub block_severity: Severity,
    pub run_tests: bool,
    /// Generate tests and evaluate the merge gate before declaring readiness.
    pub run_gate: bool,
    pub commit_message_prefix: String,
    pub merge_strategy: MergeStrategy,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            min_severity_to_fix: Severity::Medium,
            block_severity: Severity::High,
            run_tests: false,
            run_gate: false,
            commit_message_prefix: "fix: ".into(),
            merge_strategy: MergeStrategy::Squash,
        }
    }
}

// ── tests ──

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TestSettings {
    pub command: String,
    pub timeout_sec: u64,
    /// coverage.py-style JSON report, relative to the working directory.
    pub coverage_report: String,
    /// Where generated tests are written.
    pub test_dir: String,
}

impl Default for TestSettings {
    fn default() -> Self {
        Self {
            command: "cargo test".into(),
            timeout_sec: 600,
            coverage_report: "coverage.json".into(),
            test_dir: "tests".into(),
        }
    }
}

// ── orchestrator ──

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    pub base: String,
    pub merge_strategy: MergeStrategy,
    /// Merge approved proposals; without it a run stops after review.
    pub auto_merge: bool,
    pub review_before_merge: bool,
    pub parallel_reviews: bool,
    pub max_parallel_reviews: usize,
    pub delete_branch_after_merge: bool,
    /// Rebase once and re-check when a proposal is not mergeable.
    pub auto_rebase_on_conflict: bool,
    /// Explicit dependencies: proposal id to the ids it must merge after.
    pub dependencies: BTreeMap<ProposalId, Vec<ProposalId>>,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            base: "main".into(),
            merge_strategy: MergeStrategy::Squash,
            auto_merge: false,
            review_before_merge: true,
            parallel_reviews: true,
            max_parallel_reviews: 5,
            delete_branch_after_merge: true,
            auto_rebase_on_conflict: true,
            dependencies: BTreeMap::new(),
        }
    }
}

// ── oracles ──

/// Shell commands backing each oracle capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleSettings {
    pub identify: Option<String>,
    pub validate: Option<String>,
    pub fix: Option<String>,
    pub generate_tests: Option<String>,
    pub timeout_sec: u64,
}

impl Default for OracleSettings {
    fn default() -> Self {
        Self {
            identify: None,
            validate: None,
            fix: None,
            generate_tests: None,
            timeout_sec: 600,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let s = Settings::default();
        assert_eq!(s.review.min_confidence, 0.7);
        assert!(!s.review.report_low);
        assert_eq!(s.review.min_severity, Severity::Medium);
        assert_eq!(s.loop_.block_severity, Severity::High);
        assert_eq!(s.loop_.commit_message_prefix, "fix: ");
        assert_eq!(s.tests.command, "cargo test");
        assert_eq!(s.orchestrator.base, "main");
        assert_eq!(s.orchestrator.max_parallel_reviews, 5);
        assert!(s.orchestrator.auto_rebase_on_conflict);
        assert_eq!(s.oracles.timeout_sec, 600);
        assert_eq!(s.merge_rules.max_iterations, 5);
    }

    #[test]
    fn reports_follows_toggles() {
        let mut r = ReviewSettings::default();
        assert!(r.reports(Severity::Critical));
        assert!(!r.reports(Severity::Low));
        r.report_high = false;
        assert!(!r.reports(Severity::High));
    }
}
