use crate::oracle::Oracles;
use futures::future::join_all;
use mergeloop_core::{PotentialIssue, ValidatedIssue};
use tokio::sync::Semaphore;
use tracing::warn;

/// Validate every issue with at most `limit` validations in flight.
///
/// `on_verdict` runs as each validation finishes, in completion order; the
/// returned values keep the input order. A failed validation yields a
/// rejected verdict carrying the error.
pub async fn validate_issues<T, F>(
    issues: &[PotentialIssue],
    oracles: Oracles<'_>,
    limit: usize,
    on_verdict: F,
) -> Vec<T>
where
    F: Fn(ValidatedIssue) -> T,
{
    let permits = Semaphore::new(limit.max(1));
    let permits = &permits;
    let on_verdict = &on_verdict;
    let tasks = issues.iter().map(|issue| async move {
        let _permit = permits.acquire().await.ok();
        let verdict = match oracles
            .validate
            .validate(issue, oracles.repo_search, oracles.doc_search)
            .await
        {
            Ok(v) => v,
            Err(e) => {
                warn!(file = %issue.file, error = %e, "validation failed");
                ValidatedIssue::rejected(issue.clone(), format!("validation failed: {e}"))
            }
        };
        on_verdict(verdict)
    });
    join_all(tasks).await
}
