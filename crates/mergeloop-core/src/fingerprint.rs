use crate::hash::short_digest;
use crate::types::PotentialIssue;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Hex chars kept from the digest.
const FINGERPRINT_LEN: usize = 16;
/// Descriptions are compared on this many leading chars after normalization.
const DESCRIPTION_PREFIX: usize = 100;

/// Stable identity of an issue across loop iterations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IssueFingerprint(String);

impl IssueFingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IssueFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hash of (normalized path, normalized line range, category, normalized description).
///
/// Identity is exact match on those four fields; rewordings that survive
/// normalization (case, punctuation, whitespace) collide, others do not.
pub fn fingerprint(issue: &PotentialIssue) -> IssueFingerprint {
    let range = issue.lines.normalized();
    let path = normalize_path(&issue.file);
    let lines = format!("{}-{}", range.start, range.end);
    let category = normalize_category(&issue.category);
    let description = normalize_description(&issue.description);
    IssueFingerprint(short_digest(
        &[&path, &lines, &category, &description],
        FINGERPRINT_LEN,
    ))
}

pub fn normalize_path(path: &str) -> String {
    let mut p = path.trim().replace('\\', "/");
    while let Some(rest) = p.strip_prefix("./") {
        p = rest.to_string();
    }
    let mut out = String::with_capacity(p.len());
    for c in p.trim_start_matches('/').chars() {
        if c == '/' && out.ends_with('/') {
            continue;
        }
        out.push(c);
    }
    out
}

pub fn normalize_category(category: &str) -> String {
    let mut out = String::new();
    for c in category.trim().chars() {
        if c.is_alphanumeric() {
            out.extend(c.to_lowercase());
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    out.trim_matches('_').to_string()
}

pub fn normalize_description(description: &str) -> String {
    let cleaned: String = description
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .to_lowercase();
    let words: Vec<&str> = cleaned.split_whitespace().collect();
    words
        .join(" ")
        .chars()
        .take(DESCRIPTION_PREFIX)
        .collect()
}

// ── Registry ──

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    New,
    Repeat,
}

/// Per-run record of which fingerprints were seen, fixed, reappeared after a
/// fix, or given up on. Owned by a single loop run.
#[derive(Debug, Clone, Default)]
pub struct FingerprintRegistry {
    iteration: u32,
    first_seen: BTreeMap<IssueFingerprint, u32>,
    seen_this_iteration: BTreeSet<IssueFingerprint>,
    fixed: BTreeMap<IssueFingerprint, u32>,
    reappeared: BTreeSet<IssueFingerprint>,
    unfixable: BTreeMap<IssueFingerprint, String>,
}

impl FingerprintRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new iteration. Iteration numbers must not decrease.
    pub fn begin_iteration(&mut self, iteration: u32) {
        self.iteration = iteration;
        self.seen_this_iteration.clear();
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    /// True if `fp` was already registered during the current iteration.
    pub fn seen_this_iteration(&self, fp: &IssueFingerprint) -> bool {
        self.seen_this_iteration.contains(fp)
    }

    /// Record a sighting. Returns `Repeat` if `fp` was seen earlier in this run.
    /// A sighting of a fingerprint fixed in an earlier iteration marks it reappeared.
    pub fn register(&mut self, fp: &IssueFingerprint) -> Registration {
        self.seen_this_iteration.insert(fp.clone());
        if let Some(&fixed_at) = self.fixed.get(fp) {
            if fixed_at < self.iteration {
                self.reappeared.insert(fp.clone());
            }
        }
        if self.first_seen.contains_key(fp) {
            Registration::Repeat
        } else {
            self.first_seen.insert(fp.clone(), self.iteration);
            Registration::New
        }
    }

    pub fn mark_fixed(&mut self, fp: &IssueFingerprint) {
        self.fixed.insert(fp.clone(), self.iteration);
    }

    pub fn is_fixed(&self, fp: &IssueFingerprint) -> bool {
        self.fixed.contains_key(fp)
    }

    /// Fixed in a prior iteration and reported again since.
    pub fn reappeared(&self, fp: &IssueFingerprint) -> bool {
        self.reappeared.contains(fp)
    }

    pub fn mark_unfixable(&mut self, fp: &IssueFingerprint, reason: impl Into<String>) {
        self.unfixable.insert(fp.clone(), reason.into());
    }

    pub fn unfixable_reason(&self, fp: &IssueFingerprint) -> Option<&str> {
        self.unfixable.get(fp).map(String::as_str)
    }

    pub fn seen_count(&self) -> usize {
        self.first_seen.len()
    }

    pub fn fixed_count(&self) -> usize {
        self.fixed.len()
    }

    pub fn reappeared_fingerprints(&self) -> impl Iterator<Item = &IssueFingerprint> {
        self.reappeared.iter()
    }

    pub fn unfixable_fingerprints(&self) -> impl Iterator<Item = (&IssueFingerprint, &str)> {
        self.unfixable.iter().map(|(fp, r)| (fp, r.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LineRange, Severity};

    fn issue(file: &str, start: u32, end: u32, category: &str, description: &str) -> PotentialIssue {
        PotentialIssue {
            file: file.into(),
            lines: LineRange::new(start, end),
            category: category.into(),
            severity: Severity::High,
            description: description.into(),
            snippet: String::new(),
        }
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let a = issue("src/db.rs", 10, 12, "security", "SQL injection via format!");
        assert_eq!(fingerprint(&a), fingerprint(&a.clone()));
        assert_eq!(fingerprint(&a).as_str().len(), 16);
    }

    #[test]
    fn normalization_collapses_cosmetic_differences() {
        let a = issue("./src/db.rs", 12, 10, "Security", "SQL injection via format!");
        let b = issue("src//db.rs", 10, 12, " security ", "sql   injection, via format");
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn snippet_and_severity_do_not_affect_identity() {
        let a = issue("a.rs", 1, 1, "bug", "off by one");
        let mut b = a.clone();
        b.severity = Severity::Low;
        b.snippet = "for i in 0..=n".into();
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn different_fields_differ() {
        let base = issue("a.rs", 1, 2, "bug", "off by one");
        assert_ne!(fingerprint(&base), fingerprint(&issue("b.rs", 1, 2, "bug", "off by one")));
        assert_ne!(fingerprint(&base), fingerprint(&issue("a.rs", 1, 3, "bug", "off by one")));
        assert_ne!(fingerprint(&base), fingerprint(&issue("a.rs", 1, 2, "perf", "off by one")));
        assert_ne!(fingerprint(&base), fingerprint(&issue("a.rs", 1, 2, "bug", "off by two")));
    }

    #[test]
    fn long_descriptions_compare_on_prefix() {
        let prefix = "x".repeat(100);
        let a = issue("a.rs", 1, 1, "bug", &format!("{prefix} tail one"));
        let b = issue("a.rs", 1, 1, "bug", &format!("{prefix} tail two"));
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn normalize_helpers() {
        assert_eq!(normalize_path(".\\src\\main.rs"), "src/main.rs");
        assert_eq!(normalize_path("/src/main.rs"), "src/main.rs");
        assert_eq!(normalize_category("Null-Pointer  Deref"), "null_pointer_deref");
        assert_eq!(normalize_description("  Unchecked   UNWRAP()! "), "unchecked unwrap");
    }

    #[test]
    fn register_new_then_repeat() {
        let mut reg = FingerprintRegistry::new();
        reg.begin_iteration(0);
        let fp = fingerprint(&issue("a.rs", 1, 1, "bug", "x"));
        assert!(!reg.seen_this_iteration(&fp));
        assert_eq!(reg.register(&fp), Registration::New);
        assert!(reg.seen_this_iteration(&fp));
        assert_eq!(reg.register(&fp), Registration::Repeat);
        assert_eq!(reg.seen_count(), 1);
    }

    #[test]
    fn reappeared_only_after_fix_in_prior_iteration() {
        let mut reg = FingerprintRegistry::new();
        let fp = fingerprint(&issue("a.rs", 1, 1, "bug", "x"));

        reg.begin_iteration(0);
        reg.register(&fp);
        reg.mark_fixed(&fp);
        // Same iteration: not a reappearance.
        reg.register(&fp);
        assert!(!reg.reappeared(&fp));

        reg.begin_iteration(1);
        assert!(!reg.seen_this_iteration(&fp));
        assert_eq!(reg.register(&fp), Registration::Repeat);
        assert!(reg.reappeared(&fp));
        assert!(reg.is_fixed(&fp));
        assert_eq!(reg.reappeared_fingerprints().count(), 1);
    }

    #[test]
    fn repeat_without_fix_is_not_reappeared() {
        let mut reg = FingerprintRegistry::new();
        let fp = fingerprint(&issue("a.rs", 1, 1, "bug", "x"));
        reg.begin_iteration(0);
        reg.register(&fp);
        reg.begin_iteration(1);
        assert_eq!(reg.register(&fp), Registration::Repeat);
        assert!(!reg.reappeared(&fp));
    }

    #[test]
    fn unfixable_is_remembered() {
        let mut reg = FingerprintRegistry::new();
        let fp = fingerprint(&issue("a.rs", 1, 1, "style", "naming"));
        reg.mark_unfixable(&fp, "fix oracle declined");
        assert_eq!(reg.unfixable_reason(&fp), Some("fix oracle declined"));
        assert_eq!(reg.unfixable_fingerprints().count(), 1);
    }
}
