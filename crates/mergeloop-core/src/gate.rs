use crate::types::{
    CoverageResult, MergeConditions, MergeDecision, MergeRules, Severity, ValidatedIssue,
};

/// Uncovered-line recommendations are limited to this many files.
const MAX_UNCOVERED_FILES: usize = 5;
/// Line numbers listed per file in a recommendation.
const MAX_UNCOVERED_LINES: usize = 10;

/// Evaluate the merge conditions for a set of unresolved issues.
///
/// Only issues with `is_valid` count. Conditions are evaluated independently
/// and reported in a fixed order, so equal inputs give equal decisions.
pub fn decide(
    issues: &[ValidatedIssue],
    coverage: &CoverageResult,
    rules: &MergeRules,
) -> MergeDecision {
    let unresolved: Vec<&ValidatedIssue> = issues.iter().filter(|i| i.is_valid).collect();
    let count = |sev: Severity| unresolved.iter().filter(|i| i.severity() == sev).count();
    let critical = count(Severity::Critical);
    let high = count(Severity::High);
    let medium = count(Severity::Medium);

    let conditions = MergeConditions {
        all_tests_passed: coverage.tests_failed == 0,
        new_code_coverage_met: coverage.new_code_coverage >= rules.min_new_code_coverage,
        no_critical_issues: !rules.block_on_critical || critical == 0,
        no_high_issues: !rules.block_on_high || high == 0,
        medium_issues_within_limit: medium <= rules.max_medium_issues,
    };

    let mut failures = Vec::new();
    if !conditions.all_tests_passed {
        failures.push(format!("{} test(s) failing", coverage.tests_failed));
    }
    if !conditions.new_code_coverage_met {
        failures.push(format!(
            "new code coverage {:.1}% below {:.1}%",
            coverage.new_code_coverage, rules.min_new_code_coverage
        ));
    }
    if !conditions.no_critical_issues {
        failures.push(format!("critical issue present ({critical} unresolved)"));
    }
    if !conditions.no_high_issues {
        failures.push(format!("high severity issue present ({high} unresolved)"));
    }
    if !conditions.medium_issues_within_limit {
        failures.push(format!(
            "too many medium issues ({medium} > {})",
            rules.max_medium_issues
        ));
    }

    let approved = conditions.all();
    let reason = if approved {
        "all merge conditions met".to_string()
    } else {
        format!("blocked: {}", failures.join("; "))
    };

    MergeDecision {
        approved,
        reason,
        coverage: coverage.clone(),
        conditions,
        generated_tests: 0,
        blocking_issues: blocking_issues(&unresolved, rules),
        recommendations: recommendations(coverage, rules, medium),
    }
}

fn blocking_issues(unresolved: &[&ValidatedIssue], rules: &MergeRules) -> Vec<String> {
    let mut blocking: Vec<&ValidatedIssue> = unresolved
        .iter()
        .copied()
        .filter(|i| match i.severity() {
            Severity::Critical => rules.block_on_critical,
            Severity::High => rules.block_on_high,
            _ => false,
        })
        .collect();
    blocking.sort_by(|a, b| {
        b.severity()
            .cmp(&a.severity())
            .then_with(|| a.issue.file.cmp(&b.issue.file))
            .then_with(|| a.issue.lines.start.cmp(&b.issue.lines.start))
    });
    blocking
        .iter()
        .map(|i| {
            format!(
                "[{}] {}:{} {}",
                i.severity(),
                i.issue.file,
                i.issue.lines,
                i.issue.description
            )
        })
        .collect()
}

fn recommendations(coverage: &CoverageResult, rules: &MergeRules, medium: usize) -> Vec<String> {
    let mut out = Vec::new();
    if coverage.tests_failed > 0 {
        out.push(format!(
            "Fix {} failing test(s) before merging",
            coverage.tests_failed
        ));
    }
    if coverage.new_code_coverage < rules.min_new_code_coverage {
        out.push(format!(
            "Raise new code coverage from {:.1}% to at least {:.1}%",
            coverage.new_code_coverage, rules.min_new_code_coverage
        ));
    }
    for (file, lines) in coverage
        .uncovered_lines
        .iter()
        .filter(|(_, l)| !l.is_empty())
        .take(MAX_UNCOVERED_FILES)
    {
        let shown: Vec<String> = lines
            .iter()
            .take(MAX_UNCOVERED_LINES)
            .map(u32::to_string)
            .collect();
        let more = if lines.len() > MAX_UNCOVERED_LINES {
            format!(" (+{} more)", lines.len() - MAX_UNCOVERED_LINES)
        } else {
            String::new()
        };
        out.push(format!(
            "Add tests covering {file} lines {}{more}",
            shown.join(", ")
        ));
    }
    if coverage.total_coverage < rules.min_total_coverage {
        out.push(format!(
            "Total coverage {:.1}% is below the {:.1}% target",
            coverage.total_coverage, rules.min_total_coverage
        ));
    }
    if medium > rules.max_medium_issues {
        out.push(format!(
            "Resolve at least {} medium issue(s)",
            medium - rules.max_medium_issues
        ));
    }
    out
}

impl MergeDecision {
    pub fn with_generated_tests(mut self, count: usize) -> Self {
        self.generated_tests = count;
        self
    }

    /// Markdown report of the decision.
    pub fn summary(&self) -> String {
        let verdict = if self.approved { "APPROVED" } else { "BLOCKED" };
        let mark = |ok: bool| if ok { "pass" } else { "FAIL" };
        let c = &self.conditions;
        let mut out = format!("## Merge decision: {verdict}\n\n{}\n\n", self.reason);
        out.push_str("| Condition | Status |\n|---|---|\n");
        for (name, ok) in [
            ("All tests passed", c.all_tests_passed),
            ("New code coverage", c.new_code_coverage_met),
            ("No critical issues", c.no_critical_issues),
            ("No high issues", c.no_high_issues),
            ("Medium issues within limit", c.medium_issues_within_limit),
        ] {
            out.push_str(&format!("| {name} | {} |\n", mark(ok)));
        }
        out.push_str(&format!(
            "\n**Coverage:** {:.1}% total, {:.1}% new code. **Tests:** {} passed, {} failed. **Generated tests:** {}\n",
            self.coverage.total_coverage,
            self.coverage.new_code_coverage,
            self.coverage.tests_passed,
            self.coverage.tests_failed,
            self.generated_tests
        ));
        if !self.blocking_issues.is_empty() {
            out.push_str("\n### Blocking issues\n");
            for b in &self.blocking_issues {
                out.push_str(&format!("- {b}\n"));
            }
        }
        if !self.recommendations.is_empty() {
            out.push_str("\n### Recommendations\n");
            for r in &self.recommendations {
                out.push_str(&format!("- {r}\n"));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LineRange, PotentialIssue};
    use std::collections::BTreeMap;

    fn validated(severity: Severity, is_valid: bool, description: &str) -> ValidatedIssue {
        ValidatedIssue {
            issue: PotentialIssue {
                file: "src/lib.rs".into(),
                lines: LineRange::new(3, 4),
                category: "bug".into(),
                severity,
                description: description.into(),
                snippet: String::new(),
            },
            is_valid,
            evidence: vec![],
            reference: None,
            mitigation: None,
            confidence: 0.9,
        }
    }

    fn coverage(new_code: f64, failed: u32) -> CoverageResult {
        CoverageResult {
            total_coverage: 85.0,
            new_code_coverage: new_code,
            uncovered_lines: BTreeMap::new(),
            tests_passed: 12,
            tests_failed: failed,
            tests_skipped: 0,
            duration_ms: 1500,
        }
    }

    #[test]
    fn approves_when_everything_holds() {
        let d = decide(&[], &coverage(94.0, 0), &MergeRules::default());
        assert!(d.approved);
        assert_eq!(d.reason, "all merge conditions met");
        assert!(d.conditions.all());
    }

    #[test]
    fn valid_critical_blocks_and_invalid_low_ignored() {
        let issues = vec![
            validated(Severity::Critical, true, "sql injection"),
            validated(Severity::Critical, true, "command injection"),
            validated(Severity::Low, false, "naming"),
            validated(Severity::Low, false, "typo"),
            validated(Severity::Low, false, "comment"),
        ];
        let d = decide(&issues, &coverage(100.0, 0), &MergeRules::default());
        assert!(!d.approved);
        assert!(d.reason.contains("critical issue present"));
        assert!(!d.conditions.no_critical_issues);
        assert!(d.conditions.medium_issues_within_limit);
        assert_eq!(d.blocking_issues.len(), 2);
    }

    #[test]
    fn coverage_at_threshold_passes() {
        let d = decide(&[], &coverage(90.0, 0), &MergeRules::default());
        assert!(d.conditions.new_code_coverage_met);
    }

    #[test]
    fn high_blocks_only_when_configured() {
        let issues = vec![validated(Severity::High, true, "race")];
        let blocked = decide(&issues, &coverage(95.0, 0), &MergeRules::default());
        assert!(!blocked.approved);
        assert!(blocked.reason.contains("high severity issue present"));

        let rules = MergeRules {
            block_on_high: false,
            ..Default::default()
        };
        let allowed = decide(&issues, &coverage(95.0, 0), &rules);
        assert!(allowed.approved);
        assert!(allowed.conditions.no_high_issues);
        assert!(allowed.blocking_issues.is_empty());
    }

    #[test]
    fn medium_limit_is_inclusive() {
        let three: Vec<_> = (0..3)
            .map(|i| validated(Severity::Medium, true, &format!("m{i}")))
            .collect();
        assert!(decide(&three, &coverage(95.0, 0), &MergeRules::default()).approved);

        let mut four = three.clone();
        four.push(validated(Severity::Medium, true, "m3"));
        let d = decide(&four, &coverage(95.0, 0), &MergeRules::default());
        assert!(!d.approved);
        assert!(d.reason.contains("too many medium issues (4 > 3)"));
        assert!(d.recommendations.iter().any(|r| r.contains("Resolve at least 1")));
    }

    #[test]
    fn reasons_follow_fixed_order() {
        let issues = vec![
            validated(Severity::High, true, "h"),
            validated(Severity::Critical, true, "c"),
        ];
        let d = decide(&issues, &coverage(50.0, 2), &MergeRules::default());
        assert_eq!(
            d.reason,
            "blocked: 2 test(s) failing; new code coverage 50.0% below 90.0%; \
             critical issue present (1 unresolved); high severity issue present (1 unresolved)"
        );
        assert!(d.blocking_issues[0].starts_with("[critical]"));
    }

    #[test]
    fn decision_is_deterministic() {
        let issues = vec![
            validated(Severity::Medium, true, "a"),
            validated(Severity::High, true, "b"),
        ];
        let cov = coverage(70.0, 1);
        let rules = MergeRules::default();
        assert_eq!(decide(&issues, &cov, &rules), decide(&issues, &cov, &rules));
    }

    #[test]
    fn total_coverage_is_advisory() {
        let mut cov = coverage(95.0, 0);
        cov.total_coverage = 40.0;
        let d = decide(&[], &cov, &MergeRules::default());
        assert!(d.approved);
        assert!(d.recommendations.iter().any(|r| r.contains("Total coverage 40.0%")));
    }

    #[test]
    fn uncovered_lines_become_recommendations() {
        let mut cov = coverage(80.0, 0);
        cov.uncovered_lines
            .insert("src/lib.rs".into(), (1..=12).collect());
        let d = decide(&[], &cov, &MergeRules::default());
        let rec = d
            .recommendations
            .iter()
            .find(|r| r.starts_with("Add tests covering src/lib.rs"))
            .unwrap();
        assert!(rec.ends_with("(+2 more)"));
    }

    #[test]
    fn summary_renders_verdict_and_conditions() {
        let issues = vec![validated(Severity::Critical, true, "overflow")];
        let d = decide(&issues, &coverage(95.0, 0), &MergeRules::default()).with_generated_tests(3);
        let md = d.summary();
        assert!(md.contains("## Merge decision: BLOCKED"));
        assert!(md.contains("| No critical issues | FAIL |"));
        assert!(md.contains("**Generated tests:** 3"));
        assert!(md.contains("### Blocking issues"));
    }
}
