use crate::oracle::{
    DocSearch, FixOracle, FixOutcome, IdentifyOracle, OracleError, RepoSearch, TestGenOracle,
    TestRunner, ValidateOracle,
};
use mergeloop_core::{ChangeUnit, CoverageResult, GeneratedTest, PotentialIssue, ValidatedIssue};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Scripted oracle for tests. Plays every oracle role.
///
/// Identify and run-tests results are popped per call; once exhausted the
/// defaults apply (no issues, a passing fully covered suite). Verdicts and
/// fix outcomes are keyed by issue description.
pub struct MockOracle {
    identify: Mutex<Vec<Result<Vec<PotentialIssue>, OracleError>>>,
    verdicts: Mutex<HashMap<String, (bool, f64)>>,
    fixes: Mutex<HashMap<String, Vec<FixOutcome>>>,
    tests: Mutex<Vec<GeneratedTest>>,
    coverage: Mutex<Vec<CoverageResult>>,
    fix_calls: Mutex<Vec<String>>,
    validate_calls: AtomicUsize,
    identify_calls: AtomicUsize,
}

impl Default for MockOracle {
    fn default() -> Self {
        Self::new()
    }
}

impl MockOracle {
    pub fn new() -> Self {
        Self {
            identify: Mutex::new(Vec::new()),
            verdicts: Mutex::new(HashMap::new()),
            fixes: Mutex::new(HashMap::new()),
            tests: Mutex::new(Vec::new()),
            coverage: Mutex::new(Vec::new()),
            fix_calls: Mutex::new(Vec::new()),
            validate_calls: AtomicUsize::new(0),
            identify_calls: AtomicUsize::new(0),
        }
    }

    /// Queue the issues returned by successive identify calls.
    pub fn push_identify(&self, issues: Vec<PotentialIssue>) {
        self.identify.lock().unwrap().push(Ok(issues));
    }

    pub fn push_identify_error(&self, err: OracleError) {
        self.identify.lock().unwrap().push(Err(err));
    }

    /// Verdict for every issue with this description. Default: valid, 0.9.
    pub fn set_verdict(&self, description: &str, is_valid: bool, confidence: f64) {
        self.verdicts
            .lock()
            .unwrap()
            .insert(description.to_string(), (is_valid, confidence));
    }

    /// Queue fix outcomes for an issue description. Default: append a marker line.
    pub fn push_fix(&self, description: &str, outcome: FixOutcome) {
        self.fixes
            .lock()
            .unwrap()
            .entry(description.to_string())
            .or_default()
            .push(outcome);
    }

    pub fn set_generated_tests(&self, tests: Vec<GeneratedTest>) {
        *self.tests.lock().unwrap() = tests;
    }

    pub fn push_coverage(&self, coverage: CoverageResult) {
        self.coverage.lock().unwrap().push(coverage);
    }

    /// Descriptions passed to fix, in call order.
    pub fn fix_calls(&self) -> Vec<String> {
        self.fix_calls.lock().unwrap().clone()
    }

    pub fn validate_calls(&self) -> usize {
        self.validate_calls.load(Ordering::SeqCst)
    }

    pub fn identify_calls(&self) -> usize {
        self.identify_calls.load(Ordering::SeqCst)
    }
}

fn pop_front<T>(queue: &Mutex<Vec<T>>) -> Option<T> {
    let mut q = queue.lock().unwrap();
    if q.is_empty() {
        None
    } else {
        Some(q.remove(0))
    }
}

#[async_trait::async_trait]
impl IdentifyOracle for MockOracle {
    async fn identify(&self, _units: &[ChangeUnit]) -> Result<Vec<PotentialIssue>, OracleError> {
        self.identify_calls.fetch_add(1, Ordering::SeqCst);
        pop_front(&self.identify).unwrap_or_else(|| Ok(Vec::new()))
    }
}

#[async_trait::async_trait]
impl ValidateOracle for MockOracle {
    async fn validate(
        &self,
        issue: &PotentialIssue,
        _repo: &dyn RepoSearch,
        _docs: &dyn DocSearch,
    ) -> Result<ValidatedIssue, OracleError> {
        self.validate_calls.fetch_add(1, Ordering::SeqCst);
        let (is_valid, confidence) = self
            .verdicts
            .lock()
            .unwrap()
            .get(&issue.description)
            .copied()
            .unwrap_or((true, 0.9));
        // Yield so concurrent validations interleave.
        tokio::task::yield_now().await;
        Ok(ValidatedIssue {
            issue: issue.clone(),
            is_valid,
            evidence: vec![format!("(mock) checked {}", issue.file)],
            reference: None,
            mitigation: None,
            confidence,
        })
    }
}

#[async_trait::async_trait]
impl FixOracle for MockOracle {
    async fn fix(&self, issue: &ValidatedIssue, contents: &str) -> Result<FixOutcome, OracleError> {
        let description = issue.issue.description.clone();
        self.fix_calls.lock().unwrap().push(description.clone());
        let queued = {
            let mut fixes = self.fixes.lock().unwrap();
            fixes.get_mut(&description).and_then(|q| {
                if q.is_empty() {
                    None
                } else {
                    Some(q.remove(0))
                }
            })
        };
        Ok(queued.unwrap_or_else(|| FixOutcome::Applied {
            contents: format!("{contents}// fixed: {description}\n"),
        }))
    }
}

#[async_trait::async_trait]
impl TestGenOracle for MockOracle {
    async fn generate_tests(
        &self,
        _units: &[ChangeUnit],
        _issues: &[ValidatedIssue],
    ) -> Result<Vec<GeneratedTest>, OracleError> {
        Ok(self.tests.lock().unwrap().clone())
    }
}

#[async_trait::async_trait]
impl TestRunner for MockOracle {
    async fn run_tests(
        &self,
        _generated: &[GeneratedTest],
        _changed_files: &BTreeSet<String>,
    ) -> Result<CoverageResult, OracleError> {
        Ok(pop_front(&self.coverage).unwrap_or_else(|| CoverageResult {
            total_coverage: 100.0,
            new_code_coverage: 100.0,
            tests_passed: 1,
            ..Default::default()
        }))
    }
}
