//! Paginated fetching for a single query.
//!
//! [`PaginatedFetcher::fetch`] returns a lazy stream of pages. Each request is
//! paced by the shared [`RateLimiter`], bounded by a timeout, and retried with
//! exponential backoff while the failure is transient. The stream can be
//! restarted mid-pagination from a continuation token.

use crate::config::{HarvestConfig, RetryConfig};
use crate::error::{HarvestError, Result};
use crate::pacing::RateLimiter;
use crate::planner::Query;
use crate::record::Page;
use crate::scopus::{SearchApi, SearchRequest};
use futures::stream::{self, Stream};
use rand::Rng;
use std::time::Duration;
use tracing::{debug, warn};

/// Exponential backoff with jitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(retry: &RetryConfig) -> Self {
        Self {
            max_retries: retry.max_retries,
            base_delay: Duration::from_millis(retry.base_delay_ms),
            max_delay: Duration::from_millis(retry.max_delay_ms),
        }
    }

    /// Backoff before retry number `attempt + 1`, without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Backoff plus up to 25% jitter, stretched to the server's `Retry-After`
    /// but never beyond `max_delay` plus jitter.
    fn delay(&self, attempt: u32, retry_after: Option<u64>) -> Duration {
        let backoff = match retry_after {
            Some(secs) => self
                .backoff(attempt)
                .max(Duration::from_secs(secs).min(self.max_delay)),
            None => self.backoff(attempt),
        };
        let jitter_ms = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 4);
        backoff + Duration::from_millis(jitter_ms)
    }
}

pub struct PaginatedFetcher<A> {
    api: A,
    limiter: RateLimiter,
    retry: RetryPolicy,
    page_size: u32,
    ceiling: u64,
    request_timeout: Duration,
}

impl<A: SearchApi> PaginatedFetcher<A> {
    pub fn new(api: A, limiter: RateLimiter, retry: RetryPolicy) -> Self {
        Self {
            api,
            limiter,
            retry,
            page_size: 25,
            ceiling: crate::config::DEFAULT_MAX_RESULTS_PER_QUERY,
            request_timeout: Duration::from_secs(30),
        }
    }

    /// Fetcher with pacing, retries, page size, ceiling and timeout taken from `config`.
    pub fn from_config(api: A, config: &HarvestConfig) -> Self {
        Self::new(
            api,
            RateLimiter::from_config(&config.pacing),
            RetryPolicy::from_config(&config.retry),
        )
        .with_page_size(config.results_per_page)
        .with_ceiling(config.api.max_results_per_query)
        .with_request_timeout(Duration::from_secs(config.api.timeout_secs))
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Offsets at or beyond `ceiling` are never requested.
    pub fn with_ceiling(mut self, ceiling: u64) -> Self {
        self.ceiling = ceiling.max(1);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    /// Stream the pages of `query`, starting at `resume_token` when given.
    ///
    /// The stream ends after the page without a continuation token, or right
    /// after the first error.
    pub fn fetch<'a>(
        &'a self,
        query: &'a Query,
        resume_token: Option<&str>,
    ) -> impl Stream<Item = Result<Page>> + 'a {
        let start = match resume_token.map(str::parse::<u64>) {
            None => 0,
            Some(Ok(offset)) => offset,
            Some(Err(_)) => {
                warn!(
                    query_id = %query.id,
                    token = resume_token.unwrap_or_default(),
                    "Unusable resume token, restarting query from the first page"
                );
                0
            }
        };
        let first = (start < self.ceiling).then_some(start);

        stream::try_unfold(first, move |cursor| async move {
            let Some(start) = cursor else {
                return Ok::<_, HarvestError>(None);
            };
            let mut page = self.fetch_page(query, start).await?;
            let next = self.advance(query, &mut page)?;
            Ok(Some((page, next)))
        })
    }

    /// Work out the next offset, ending pagination at the ceiling.
    fn advance(&self, query: &Query, page: &mut Page) -> Result<Option<u64>> {
        let Some(token) = page.next_token.as_deref() else {
            return Ok(None);
        };
        let next: u64 = token.parse().map_err(|_| HarvestError::Fetch {
            query_id: query.id.clone(),
            attempts: 1,
            source: Box::new(HarvestError::Parse(format!(
                "Continuation token {:?} is not an offset",
                token
            ))),
        })?;

        if next >= self.ceiling {
            warn!(
                query_id = %query.id,
                total = page.total_hint,
                ceiling = self.ceiling,
                "Result ceiling reached, query truncated"
            );
            page.next_token = None;
            return Ok(None);
        }
        Ok(Some(next))
    }

    /// Total hits the API reports for `query`, from a single one-record request.
    pub async fn total_hits(&self, query: &Query) -> Result<u64> {
        let page = self.request(query, 0, 1).await?;
        Ok(page.total_hint)
    }

    async fn fetch_page(&self, query: &Query, start: u64) -> Result<Page> {
        let count = u64::from(self.page_size).min(self.ceiling - start) as u32;
        self.request(query, start, count).await
    }

    async fn request(&self, query: &Query, start: u64, count: u32) -> Result<Page> {
        let request = SearchRequest {
            query,
            start,
            count,
        };

        let mut attempt: u32 = 0;
        loop {
            self.limiter.acquire().await;

            let outcome = tokio::time::timeout(self.request_timeout, self.api.search(request))
                .await
                .unwrap_or_else(|_| Err(HarvestError::Timeout));

            let err = match outcome {
                Ok(page) => {
                    debug!(
                        query_id = %query.id,
                        start,
                        records = page.records.len(),
                        total = page.total_hint,
                        "Fetched page"
                    );
                    return Ok(page);
                }
                Err(e) => e,
            };

            if matches!(err, HarvestError::Auth { .. }) {
                return Err(err);
            }

            if err.is_transient() && attempt < self.retry.max_retries {
                let wait = self.retry.delay(attempt, err.retry_after());
                warn!(
                    query_id = %query.id,
                    start,
                    attempt = attempt + 1,
                    wait_ms = wait.as_millis() as u64,
                    error = %err,
                    "Transient failure, backing off"
                );
                tokio::time::sleep(wait).await;
                attempt += 1;
                continue;
            }

            return Err(HarvestError::Fetch {
                query_id: query.id.clone(),
                attempts: attempt + 1,
                source: Box::new(err),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Record;
    use crate::testing::FakeApi;
    use futures::TryStreamExt;
    use std::sync::Arc;

    fn query() -> Query {
        Query::new(r#"TITLE-ABS-KEY("trust")"#.to_string(), None)
    }

    fn fetcher(api: Arc<FakeApi>, max_retries: u32) -> PaginatedFetcher<Arc<FakeApi>> {
        let retry = RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        };
        PaginatedFetcher::new(api, RateLimiter::new(100, Duration::from_secs(1)), retry)
            .with_page_size(3)
    }

    fn ids(pages: &[Page]) -> Vec<String> {
        pages
            .iter()
            .flat_map(|p| p.records.iter().map(|r: &Record| r.id.clone()))
            .collect()
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(4),
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(500));
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(5), Duration::from_secs(4));
        assert_eq!(policy.backoff(40), Duration::from_secs(4));

        let delay = policy.delay(1, None);
        assert!(delay >= Duration::from_secs(1) && delay <= Duration::from_millis(1250));
        assert!(policy.delay(0, Some(3)) >= Duration::from_secs(3));
    }

    #[test]
    fn test_retry_after_is_capped_at_max_delay() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(4),
        };
        let delay = policy.delay(0, Some(86_400));
        assert!(delay >= Duration::from_secs(4));
        assert!(delay <= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pages_until_exhausted() -> Result<()> {
        let q = query();
        let api = Arc::new(FakeApi::new().with_results(&q.id, &["a", "b", "c", "d", "e", "f", "g"]));
        let fetcher = fetcher(api.clone(), 0);

        let pages: Vec<Page> = fetcher.fetch(&q, None).try_collect().await?;
        assert_eq!(pages.len(), 3);
        assert_eq!(ids(&pages), vec!["a", "b", "c", "d", "e", "f", "g"]);
        assert_eq!(pages[0].next_token.as_deref(), Some("3"));
        assert!(pages[2].is_last());
        assert_eq!(api.calls().iter().map(|(_, s)| *s).collect::<Vec<_>>(), vec![0, 3, 6]);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_resumes_from_token() -> Result<()> {
        let q = query();
        let api = Arc::new(FakeApi::new().with_results(&q.id, &["a", "b", "c", "d", "e"]));
        let fetcher = fetcher(api.clone(), 0);

        let pages: Vec<Page> = fetcher.fetch(&q, Some("3")).try_collect().await?;
        assert_eq!(ids(&pages), vec!["d", "e"]);
        assert_eq!(api.calls(), vec![(q.id.clone(), 3)]);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_unusable_token_restarts() -> Result<()> {
        let q = query();
        let api = Arc::new(FakeApi::new().with_results(&q.id, &["a", "b"]));
        let fetcher = fetcher(api, 0);

        let pages: Vec<Page> = fetcher.fetch(&q, Some("cursor-xyz")).try_collect().await?;
        assert_eq!(ids(&pages), vec!["a", "b"]);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_below_ceiling_recover() -> Result<()> {
        let q = query();
        let api = Arc::new(FakeApi::new().with_results(&q.id, &["a", "b"]));
        api.fail(
            &q.id,
            0,
            vec![
                HarvestError::RateLimited(Some(1)),
                HarvestError::Server { code: 503, message: "busy".into() },
                HarvestError::Timeout,
            ],
        );
        let fetcher = fetcher(api.clone(), 3);

        let pages: Vec<Page> = fetcher.fetch(&q, None).try_collect().await?;
        assert_eq!(ids(&pages), vec!["a", "b"]);
        assert_eq!(api.calls_for(&q.id), 4);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_yields_fetch_error() {
        let q = query();
        let api = Arc::new(FakeApi::new().with_results(&q.id, &["a", "b", "c", "d"]));
        api.fail(
            &q.id,
            3,
            (0..4)
                .map(|_| HarvestError::Server { code: 500, message: "boom".into() })
                .collect(),
        );
        let fetcher = fetcher(api.clone(), 3);

        let results: Vec<Result<Page>> = futures::StreamExt::collect(fetcher.fetch(&q, None)).await;
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        match &results[1] {
            Err(HarvestError::Fetch { query_id, attempts, source }) => {
                assert_eq!(query_id, &q.id);
                assert_eq!(*attempts, 4);
                assert!(matches!(**source, HarvestError::Server { code: 500, .. }));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_error_is_not_retried() {
        let q = query();
        let api = Arc::new(FakeApi::new().with_results(&q.id, &["a"]));
        api.fail(
            &q.id,
            0,
            vec![HarvestError::Auth { code: 401, message: "Invalid API Key".into() }],
        );
        let fetcher = fetcher(api.clone(), 5);

        let result: Result<Vec<Page>> = fetcher.fetch(&q, None).try_collect().await;
        assert!(matches!(result, Err(HarvestError::Auth { code: 401, .. })));
        assert_eq!(api.calls_for(&q.id), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_transient_error_is_not_retried() {
        let q = query();
        let api = Arc::new(FakeApi::new().with_results(&q.id, &["a"]));
        api.fail(&q.id, 0, vec![HarvestError::Api { code: 400, message: "bad".into() }]);
        let fetcher = fetcher(api.clone(), 5);

        let result: Result<Vec<Page>> = fetcher.fetch(&q, None).try_collect().await;
        assert!(matches!(result, Err(HarvestError::Fetch { attempts: 1, .. })));
        assert_eq!(api.calls_for(&q.id), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_total_hits_uses_one_small_request() -> Result<()> {
        let q = query();
        let api = Arc::new(FakeApi::new().with_results(&q.id, &["a", "b", "c", "d", "e"]));
        let fetcher = fetcher(api.clone(), 0);

        assert_eq!(fetcher.total_hits(&q).await?, 5);
        assert_eq!(api.calls(), vec![(q.id.clone(), 0)]);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_ceiling_truncates_pagination() -> Result<()> {
        let q = query();
        let all: Vec<String> = (0..10).map(|i| format!("r{}", i)).collect();
        let refs: Vec<&str> = all.iter().map(String::as_str).collect();
        let api = Arc::new(FakeApi::new().with_results(&q.id, &refs));
        let fetcher = fetcher(api.clone(), 0).with_ceiling(5);

        let pages: Vec<Page> = fetcher.fetch(&q, None).try_collect().await?;
        assert_eq!(ids(&pages), vec!["r0", "r1", "r2", "r3", "r4"]);
        assert!(pages.last().is_some_and(Page::is_last));
        // The second request asks only for what is left under the ceiling.
        assert_eq!(api.calls().len(), 2);
        Ok(())
    }

    struct StallingApi;

    #[async_trait::async_trait]
    impl SearchApi for StallingApi {
        async fn search(&self, _request: SearchRequest<'_>) -> Result<Page> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Page::default())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout_is_a_transient_failure() {
        let q = query();
        let fetcher = PaginatedFetcher::new(
            StallingApi,
            RateLimiter::new(10, Duration::from_secs(1)),
            RetryPolicy {
                max_retries: 1,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(10),
            },
        )
        .with_request_timeout(Duration::from_secs(2));

        let result: Result<Vec<Page>> = fetcher.fetch(&q, None).try_collect().await;
        match result {
            Err(HarvestError::Fetch { attempts, source, .. }) => {
                assert_eq!(attempts, 2);
                assert!(matches!(*source, HarvestError::Timeout));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
