//! Request/response contracts for the external analysis and mutation oracles.
//!
//! Every oracle reports failure through its return value. Callers decide how
//! a failure degrades: identify failures count as "no issues", validate
//! failures reject the issue, fix failures mark the issue unfixable.

pub mod command;
pub mod mock;
pub mod search;

use mergeloop_core::{ChangeUnit, CoverageResult, GeneratedTest, PotentialIssue, ValidatedIssue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OracleError {
    #[error("{oracle} oracle failed: {message}")]
    Failure {
        oracle: &'static str,
        message: String,
    },
    #[error("{oracle} oracle returned malformed output: {message}")]
    Malformed {
        oracle: &'static str,
        message: String,
    },
    #[error("{oracle} oracle timed out after {secs}s")]
    Timeout { oracle: &'static str, secs: u64 },
}

impl OracleError {
    pub fn failure(oracle: &'static str, message: impl Into<String>) -> Self {
        Self::Failure {
            oracle,
            message: message.into(),
        }
    }

    pub fn malformed(oracle: &'static str, message: impl Into<String>) -> Self {
        Self::Malformed {
            oracle,
            message: message.into(),
        }
    }
}

/// Result of one fix attempt. A fix is all-or-nothing: `Applied` carries the
/// complete new file contents, `Unfixable` leaves the file untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixOutcome {
    Applied { contents: String },
    Unfixable { reason: String },
}

// ── Search capabilities handed to the validator ──

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SearchHit {
    pub path: String,
    pub line: u32,
    pub text: String,
}

#[async_trait::async_trait]
pub trait RepoSearch: Send + Sync {
    /// Case-insensitive literal search over the repository.
    async fn search(&self, pattern: &str, limit: usize) -> Vec<SearchHit>;
    async fn read_file(&self, path: &str) -> Option<String>;
}

#[async_trait::async_trait]
pub trait DocSearch: Send + Sync {
    async fn lookup(&self, query: &str, limit: usize) -> Vec<String>;
}

/// Documentation search that knows nothing.
pub struct NoDocSearch;

#[async_trait::async_trait]
impl DocSearch for NoDocSearch {
    async fn lookup(&self, _query: &str, _limit: usize) -> Vec<String> {
        Vec::new()
    }
}

// ── Oracle traits ──

#[async_trait::async_trait]
pub trait IdentifyOracle: Send + Sync {
    /// Candidate issues for a change set. Order is unspecified and duplicates are allowed.
    async fn identify(&self, units: &[ChangeUnit]) -> Result<Vec<PotentialIssue>, OracleError>;
}

/// Must be safe to call concurrently for distinct issues.
#[async_trait::async_trait]
pub trait ValidateOracle: Send + Sync {
    async fn validate(
        &self,
        issue: &PotentialIssue,
        repo: &dyn RepoSearch,
        docs: &dyn DocSearch,
    ) -> Result<ValidatedIssue, OracleError>;
}

#[async_trait::async_trait]
pub trait FixOracle: Send + Sync {
    async fn fix(&self, issue: &ValidatedIssue, contents: &str) -> Result<FixOutcome, OracleError>;
}

#[async_trait::async_trait]
pub trait TestGenOracle: Send + Sync {
    async fn generate_tests(
        &self,
        units: &[ChangeUnit],
        issues: &[ValidatedIssue],
    ) -> Result<Vec<GeneratedTest>, OracleError>;
}

#[async_trait::async_trait]
pub trait TestRunner: Send + Sync {
    /// Run the suite (plus any generated tests) and measure coverage of `changed_files`.
    async fn run_tests(
        &self,
        generated: &[GeneratedTest],
        changed_files: &BTreeSet<String>,
    ) -> Result<CoverageResult, OracleError>;
}

/// The collaborators one loop run needs, borrowed for the run's duration.
#[derive(Clone, Copy)]
pub struct Oracles<'a> {
    pub identify: &'a dyn IdentifyOracle,
    pub validate: &'a dyn ValidateOracle,
    pub fix: &'a dyn FixOracle,
    pub test_gen: &'a dyn TestGenOracle,
    pub test_runner: &'a dyn TestRunner,
    pub repo_search: &'a dyn RepoSearch,
    pub doc_search: &'a dyn DocSearch,
}

impl<'a> Oracles<'a> {
    /// Bundle a single object that plays every oracle role.
    pub fn uniform<T>(oracle: &'a T, repo_search: &'a dyn RepoSearch) -> Self
    where
        T: IdentifyOracle + ValidateOracle + FixOracle + TestGenOracle + TestRunner,
    {
        Self {
            identify: oracle,
            validate: oracle,
            fix: oracle,
            test_gen: oracle,
            test_runner: oracle,
            repo_search,
            doc_search: &NoDocSearch,
        }
    }
}
