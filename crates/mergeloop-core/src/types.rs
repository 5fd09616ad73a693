use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Numeric identifier of a change proposal (pull request number).
pub type ProposalId = u64;

// ── Severity ──

/// Issue severity. Ordering is `Low < Medium < High < Critical`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Most severe first, the order reports are grouped in.
    pub const DESCENDING: [Severity; 4] = [
        Severity::Critical,
        Severity::High,
        Severity::Medium,
        Severity::Low,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown severity \"{0}\" (expected critical, high, medium, or low)")]
pub struct UnknownSeverity(pub String);

impl FromStr for Severity {
    type Err = UnknownSeverity;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" | "med" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" | "crit" => Ok(Severity::Critical),
            _ => Err(UnknownSeverity(s.to_string())),
        }
    }
}

// ── Change set ──

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Modified,
    Added,
    Deleted,
    Renamed,
}

/// One hunk of a diff. Line numbers refer to the new side of the file,
/// except for deleted files, which have no new side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeUnit {
    pub file: String,
    pub start_line: u32,
    pub end_line: u32,
    /// Hunk body with its `+`/`-`/` ` markers.
    pub content: String,
    pub status: FileStatus,
    #[serde(default)]
    pub added: Vec<String>,
    #[serde(default)]
    pub removed: Vec<String>,
}

/// Inclusive line range.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub struct LineRange {
    pub start: u32,
    pub end: u32,
}

impl LineRange {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    /// Ordered copy: `start <= end`, and an unset end collapses to `start`.
    pub fn normalized(self) -> Self {
        match (self.start, self.end) {
            (s, 0) => Self { start: s, end: s },
            (s, e) if s > e => Self { start: e, end: s },
            _ => self,
        }
    }
}

impl fmt::Display for LineRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = self.normalized();
        if r.start == r.end {
            write!(f, "{}", r.start)
        } else {
            write!(f, "{}-{}", r.start, r.end)
        }
    }
}

// ── Issues ──

/// A candidate issue reported by the identify oracle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PotentialIssue {
    pub file: String,
    pub lines: LineRange,
    pub category: String,
    pub severity: Severity,
    pub description: String,
    #[serde(default)]
    pub snippet: String,
}

/// The validate oracle's verdict on one [`PotentialIssue`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidatedIssue {
    pub issue: PotentialIssue,
    pub is_valid: bool,
    #[serde(default)]
    pub evidence: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mitigation: Option<String>,
    pub confidence: f64,
}

impl ValidatedIssue {
    /// A rejected verdict, used when validation itself could not run.
    pub fn rejected(issue: PotentialIssue, reason: impl Into<String>) -> Self {
        Self {
            issue,
            is_valid: false,
            evidence: vec![reason.into()],
            reference: None,
            mitigation: None,
            confidence: 0.0,
        }
    }

    pub fn severity(&self) -> Severity {
        self.issue.severity
    }
}

// ── Tests and coverage ──

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneratedTest {
    /// Path relative to the test directory.
    pub path: String,
    pub content: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CoverageResult {
    pub total_coverage: f64,
    pub new_code_coverage: f64,
    /// Uncovered line numbers keyed by file.
    #[serde(default)]
    pub uncovered_lines: BTreeMap<String, Vec<u32>>,
    pub tests_passed: u32,
    pub tests_failed: u32,
    #[serde(default)]
    pub tests_skipped: u32,
    #[serde(default)]
    pub duration_ms: u64,
}

impl CoverageResult {
    pub fn all_passed(&self) -> bool {
        self.tests_failed == 0
    }
}

// ── Merge gate ──

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MergeRules {
    pub min_total_coverage: f64,
    pub min_new_code_coverage: f64,
    pub max_medium_issues: usize,
    pub block_on_critical: bool,
    pub block_on_high: bool,
    pub auto_merge_on_pass: bool,
    pub max_iterations: u32,
}

impl Default for MergeRules {
    fn default() -> Self {
        Self {
            min_total_coverage: 80.0,
            min_new_code_coverage: 90.0,
            max_medium_issues: 3,
            block_on_critical: true,
            block_on_high: true,
            auto_merge_on_pass: false,
            max_iterations: 5,
        }
    }
}

/// Per-condition outcome. A condition that the rules switch off reads `true`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct MergeConditions {
    pub all_tests_passed: bool,
    pub new_code_coverage_met: bool,
    pub no_critical_issues: bool,
    pub no_high_issues: bool,
    pub medium_issues_within_limit: bool,
}

impl MergeConditions {
    pub fn all(&self) -> bool {
        self.all_tests_passed
            && self.new_code_coverage_met
            && self.no_critical_issues
            && self.no_high_issues
            && self.medium_issues_within_limit
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MergeDecision {
    pub approved: bool,
    pub reason: String,
    pub coverage: CoverageResult,
    pub conditions: MergeConditions,
    pub generated_tests: usize,
    #[serde(default)]
    pub blocking_issues: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_ordering() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
        assert!(Severity::High < Severity::Critical);
    }

    #[test]
    fn severity_parse_and_display() {
        assert_eq!("HIGH".parse::<Severity>().unwrap(), Severity::High);
        assert_eq!(" critical ".parse::<Severity>().unwrap(), Severity::Critical);
        assert_eq!(Severity::Medium.to_string(), "medium");
        assert!("urgent".parse::<Severity>().is_err());
    }

    #[test]
    fn severity_serde_lowercase() {
        let json = serde_json::to_string(&Severity::Critical).unwrap();
        assert_eq!(json, r#""critical""#);
        let back: Severity = serde_json::from_str(r#""low""#).unwrap();
        assert_eq!(back, Severity::Low);
    }

    #[test]
    fn line_range_normalized() {
        assert_eq!(LineRange::new(9, 3).normalized(), LineRange::new(3, 9));
        assert_eq!(LineRange::new(7, 0).normalized(), LineRange::new(7, 7));
        assert_eq!(LineRange::new(2, 4).to_string(), "2-4");
        assert_eq!(LineRange::new(5, 5).to_string(), "5");
    }

    #[test]
    fn merge_rules_defaults() {
        let rules = MergeRules::default();
        assert_eq!(rules.min_new_code_coverage, 90.0);
        assert_eq!(rules.max_medium_issues, 3);
        assert!(rules.block_on_critical);
        assert!(!rules.auto_merge_on_pass);
        assert_eq!(rules.max_iterations, 5);
    }

    #[test]
    fn merge_rules_partial_json_uses_defaults() {
        let rules: MergeRules = serde_json::from_str(r#"{"block_on_high": false}"#).unwrap();
        assert!(!rules.block_on_high);
        assert_eq!(rules.min_total_coverage, 80.0);
    }
}
