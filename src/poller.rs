/*!
 * Pagination poller for the NPI Registry API
 *
 * Query terms are paged one after another. Each term runs a small state
 * machine:
 *
 * - `Requesting`: fetch the page at the current skip. A page with results is
 *   kept; a short page ends the term (`PageExhausted`); hitting the skip,
 *   total or request cap ends it too (`Capped`); otherwise skip advances and
 *   the poller waits out the rate-limit delay.
 * - `Retrying`: a failed request is retried after a fixed delay, up to
 *   `retry_limit` attempts for the page. Running out of attempts counts as an
 *   empty page.
 * - An empty page ends the term (`Done`).
 *
 * Before every request the run clock is checked. Past the run-time limit the
 * poller sleeps for the pause duration, restarts the clock and carries on
 * from the exact same state.
 */

use std::time::Duration;

use serde_json::Value;
use tokio::time::{sleep, Instant};
use tracing::{error, info, warn};

use crate::client::{FetchError, PageQuery, RegistryApi};
use crate::config::PollerConfig;

/// Limits and delays for one polling run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollLimits {
    pub page_size: usize,
    pub max_skip: usize,
    pub max_total_per_term: usize,
    pub max_requests_per_term: usize,
    pub retry_limit: usize,
    pub retry_delay: Duration,
    pub rate_limit_delay: Duration,
    pub run_time_limit: Duration,
    pub pause_duration: Duration,
}

impl From<&PollerConfig> for PollLimits {
    fn from(config: &PollerConfig) -> Self {
        Self {
            page_size: config.page_size,
            max_skip: config.max_skip,
            max_total_per_term: config.max_total_per_term,
            max_requests_per_term: config.max_requests_per_term,
            retry_limit: config.retry_limit.max(1),
            retry_delay: config.retry_delay(),
            rate_limit_delay: config.rate_limit_delay(),
            run_time_limit: config.run_time_limit(),
            pause_duration: config.pause_duration(),
        }
    }
}

impl Default for PollLimits {
    fn default() -> Self {
        Self::from(&PollerConfig::default())
    }
}

/// Where a term's pagination stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermState {
    Requesting,
    /// `attempt` attempts have failed for the current page
    Retrying { attempt: usize },
    /// Last page was shorter than the page size
    PageExhausted,
    /// Skip, total or request cap reached
    Capped,
    /// Empty page, genuine or after exhausted retries
    Done,
}

impl TermState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TermState::PageExhausted | TermState::Capped | TermState::Done)
    }
}

/// Pagination position of the term being polled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageCursor {
    pub skip: usize,
    pub requests: usize,
    pub fetched: usize,
}

/// Wall time since the poller started or last resumed
#[derive(Debug, Clone, Copy)]
pub struct RunClock {
    origin: Instant,
}

impl RunClock {
    pub fn start() -> Self {
        Self { origin: Instant::now() }
    }

    pub fn elapsed(&self) -> Duration {
        self.origin.elapsed()
    }

    pub fn reset(&mut self) {
        self.origin = Instant::now();
    }
}

/// How one term's pagination went
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TermSummary {
    pub term: String,
    pub requests: usize,
    pub fetched: usize,
    pub retries: usize,
    pub exhausted_pages: usize,
    pub final_state: TermState,
}

/// Everything a polling run produced
#[derive(Debug, Clone, Default)]
pub struct PollOutcome {
    /// Raw results of all terms, in term order; not deduplicated
    pub results: Vec<Value>,
    pub terms: Vec<TermSummary>,
    pub pauses: usize,
}

/// Pages query terms through a [`RegistryApi`]
pub struct Poller<A> {
    api: A,
    limits: PollLimits,
    clock: RunClock,
    pauses: usize,
}

impl<A: RegistryApi> Poller<A> {
    pub fn new(api: A, config: &PollerConfig) -> Self {
        Self::with_limits(api, PollLimits::from(config))
    }

    pub fn with_limits(api: A, limits: PollLimits) -> Self {
        Self {
            api,
            limits,
            clock: RunClock::start(),
            pauses: 0,
        }
    }

    pub fn limits(&self) -> &PollLimits {
        &self.limits
    }

    /// Poll every term to completion. Page failures are logged, never raised.
    pub async fn poll_all<S: AsRef<str>>(&mut self, terms: &[S]) -> PollOutcome {
        self.clock.reset();
        self.pauses = 0;

        let mut outcome = PollOutcome::default();
        for term in terms {
            let summary = self.poll_term(term.as_ref(), &mut outcome.results).await;
            info!(
                term = %summary.term,
                requests = summary.requests,
                fetched = summary.fetched,
                state = ?summary.final_state,
                "Finished term"
            );
            outcome.terms.push(summary);
        }
        outcome.pauses = self.pauses;
        outcome
    }

    async fn poll_term(&mut self, term: &str, out: &mut Vec<Value>) -> TermSummary {
        let mut cursor = PageCursor::default();
        let mut state = TermState::Requesting;
        let mut retries = 0;
        let mut exhausted_pages = 0;

        while !state.is_terminal() {
            let attempt = match state {
                TermState::Retrying { attempt } => {
                    retries += 1;
                    sleep(self.limits.retry_delay).await;
                    attempt + 1
                }
                _ => 1,
            };

            state = match self.request(term, &cursor).await {
                Ok(page) => self.accept_page(term, &mut cursor, page, out).await,
                Err(err) if attempt < self.limits.retry_limit => {
                    warn!(
                        term,
                        skip = cursor.skip,
                        "Error: {}. Retrying ({}/{})...",
                        err,
                        attempt,
                        self.limits.retry_limit
                    );
                    TermState::Retrying { attempt }
                }
                Err(err) => {
                    error!(
                        term,
                        skip = cursor.skip,
                        "Failed to fetch after {} attempts: {}. Treating page as empty",
                        attempt,
                        err
                    );
                    exhausted_pages += 1;
                    TermState::Done
                }
            };
        }

        TermSummary {
            term: term.to_string(),
            requests: cursor.requests,
            fetched: cursor.fetched,
            retries,
            exhausted_pages,
            final_state: state,
        }
    }

    async fn request(&mut self, term: &str, cursor: &PageCursor) -> Result<Vec<Value>, FetchError> {
        self.guard_run_time().await;
        let query = PageQuery {
            term,
            limit: self.limits.page_size,
            skip: cursor.skip,
        };
        self.api.fetch_page(&query).await
    }

    async fn accept_page(
        &mut self,
        term: &str,
        cursor: &mut PageCursor,
        page: Vec<Value>,
        out: &mut Vec<Value>,
    ) -> TermState {
        let count = page.len();
        if count == 0 {
            return TermState::Done;
        }

        out.extend(page);
        cursor.fetched += count;
        cursor.requests += 1;
        info!(term, skip = cursor.skip, "Fetched {} results", count);

        if count < self.limits.page_size {
            return TermState::PageExhausted;
        }
        if cursor.skip + self.limits.page_size > self.limits.max_skip
            || cursor.fetched >= self.limits.max_total_per_term
            || cursor.requests >= self.limits.max_requests_per_term
        {
            return TermState::Capped;
        }

        cursor.skip += self.limits.page_size;
        sleep(self.limits.rate_limit_delay).await;
        TermState::Requesting
    }

    /// Pause, without losing state, once the run-time limit has passed
    async fn guard_run_time(&mut self) {
        let elapsed = self.clock.elapsed();
        if elapsed > self.limits.run_time_limit {
            warn!(
                elapsed_secs = elapsed.as_secs(),
                pause_secs = self.limits.pause_duration.as_secs(),
                "Reached run time limit, pausing"
            );
            sleep(self.limits.pause_duration).await;
            self.clock.reset();
            self.pauses += 1;
            info!("Resuming after pause");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    /// Page sizes (or failures) per term, then empty pages forever
    #[derive(Default)]
    struct ScriptedApi {
        scripts: Mutex<HashMap<String, VecDeque<Option<usize>>>>,
        calls: Mutex<Vec<(String, usize, Instant)>>,
    }

    impl ScriptedApi {
        fn with(mut self, term: &str, pages: &[Option<usize>]) -> Self {
            self.scripts.get_mut().unwrap().insert(term.to_string(), pages.iter().copied().collect());
            self
        }

        fn calls(&self) -> Vec<(String, usize, Instant)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl<'a> RegistryApi for &'a ScriptedApi {
        async fn fetch_page(&self, query: &PageQuery<'_>) -> Result<Vec<Value>, FetchError> {
            self.calls.lock().unwrap().push((query.term.to_string(), query.skip, Instant::now()));
            let next = self
                .scripts
                .lock()
                .unwrap()
                .get_mut(query.term)
                .and_then(|s| s.pop_front())
                .unwrap_or(Some(0));
            match next {
                Some(n) => Ok((0..n).map(|i| json!({"number": query.skip + i, "term": query.term})).collect()),
                None => Err(FetchError::Transport("connection reset".to_string())),
            }
        }
    }

    fn limits() -> PollLimits {
        PollLimits {
            page_size: 200,
            max_skip: 1000,
            max_total_per_term: 1200,
            max_requests_per_term: 6,
            retry_limit: 3,
            retry_delay: Duration::from_secs(2),
            rate_limit_delay: Duration::from_secs(1),
            run_time_limit: Duration::from_secs(4 * 60 * 60),
            pause_duration: Duration::from_secs(2 * 60 * 60),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_first_page_yields_nothing() {
        let api = ScriptedApi::default().with("t", &[Some(0)]);
        let outcome = Poller::with_limits(&api, limits()).poll_all(&["t"]).await;

        assert!(outcome.results.is_empty());
        assert_eq!(outcome.terms[0].final_state, TermState::Done);
        assert_eq!(outcome.terms[0].requests, 0);
        assert_eq!(api.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_page_stops_term() {
        let api = ScriptedApi::default().with("t", &[Some(200), Some(150), Some(200)]);
        let outcome = Poller::with_limits(&api, limits()).poll_all(&["t"]).await;

        assert_eq!(outcome.results.len(), 350);
        assert_eq!(outcome.terms[0].requests, 2);
        assert_eq!(outcome.terms[0].final_state, TermState::PageExhausted);
        let skips: Vec<usize> = api.calls().iter().map(|c| c.1).collect();
        assert_eq!(skips, vec![0, 200]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_pages_stop_at_request_cap() {
        let api = ScriptedApi::default().with("t", &[Some(10); 20]);
        let mut custom = limits();
        custom.page_size = 10;
        custom.max_skip = 10_000;
        custom.max_total_per_term = 10_000;
        custom.max_requests_per_term = 3;

        let outcome = Poller::with_limits(&api, custom).poll_all(&["t"]).await;
        assert_eq!(outcome.terms[0].requests, 3);
        assert_eq!(outcome.results.len(), 30);
        assert_eq!(outcome.terms[0].final_state, TermState::Capped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_caps_bound_total() {
        let api = ScriptedApi::default().with("t", &[Some(200); 20]);
        let outcome = Poller::with_limits(&api, limits()).poll_all(&["t"]).await;

        assert_eq!(outcome.terms[0].requests, 6);
        assert_eq!(outcome.results.len(), 1200);
        let skips: Vec<usize> = api.calls().iter().map(|c| c.1).collect();
        assert_eq!(skips, vec![0, 200, 400, 600, 800, 1000]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_cap_stops_term() {
        let api = ScriptedApi::default().with("t", &[Some(200); 20]);
        let mut custom = limits();
        custom.max_skip = 400;
        custom.max_total_per_term = 100_000;
        custom.max_requests_per_term = 100;

        let outcome = Poller::with_limits(&api, custom).poll_all(&["t"]).await;
        let skips: Vec<usize> = api.calls().iter().map(|c| c.1).collect();
        assert_eq!(skips, vec![0, 200, 400]);
        assert_eq!(outcome.results.len(), 600);
        assert_eq!(outcome.terms[0].final_state, TermState::Capped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_total_cap_stops_term() {
        let api = ScriptedApi::default().with("t", &[Some(200); 20]);
        let mut custom = limits();
        custom.max_skip = 100_000;
        custom.max_total_per_term = 500;
        custom.max_requests_per_term = 100;

        let outcome = Poller::with_limits(&api, custom).poll_all(&["t"]).await;
        assert_eq!(outcome.terms[0].requests, 3);
        assert_eq!(outcome.results.len(), 600);
        assert_eq!(outcome.terms[0].final_state, TermState::Capped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_delay_between_pages() {
        let api = ScriptedApi::default().with("t", &[Some(200), Some(200), Some(5)]);
        Poller::with_limits(&api, limits()).poll_all(&["t"]).await;

        let calls = api.calls();
        assert_eq!(calls[1].2 - calls[0].2, Duration::from_secs(1));
        assert_eq!(calls[2].2 - calls[1].2, Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_yields_empty_page() {
        let api = ScriptedApi::default().with("t", &[None, None, None, Some(200)]);
        let start = Instant::now();
        let outcome = Poller::with_limits(&api, limits()).poll_all(&["t"]).await;

        assert!(outcome.results.is_empty());
        assert_eq!(outcome.terms[0].final_state, TermState::Done);
        assert_eq!(outcome.terms[0].retries, 2);
        assert_eq!(outcome.terms[0].exhausted_pages, 1);
        assert_eq!(api.calls().len(), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_same_page() {
        let api = ScriptedApi::default().with("t", &[Some(200), None, Some(20)]);
        let outcome = Poller::with_limits(&api, limits()).poll_all(&["t"]).await;

        assert_eq!(outcome.results.len(), 220);
        assert_eq!(outcome.terms[0].requests, 2);
        assert_eq!(outcome.terms[0].retries, 1);
        let skips: Vec<usize> = api.calls().iter().map(|c| c.1).collect();
        assert_eq!(skips, vec![0, 200, 200]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_time_limit_pauses_and_resumes_in_place() {
        let api = ScriptedApi::default().with("t", &[Some(200); 10]);
        let mut custom = limits();
        custom.rate_limit_delay = Duration::from_secs(4);
        custom.run_time_limit = Duration::from_secs(10);
        custom.pause_duration = Duration::from_secs(100);

        let start = Instant::now();
        let outcome = Poller::with_limits(&api, custom).poll_all(&["t"]).await;

        assert_eq!(outcome.pauses, 1);
        assert_eq!(outcome.results.len(), 1200);
        let calls = api.calls();
        let skips: Vec<usize> = calls.iter().map(|c| c.1).collect();
        assert_eq!(skips, vec![0, 200, 400, 600, 800, 1000]);
        assert_eq!(calls[2].2 - start, Duration::from_secs(8));
        assert_eq!(calls[3].2 - start, Duration::from_secs(112));
    }

    #[tokio::test(start_paused = true)]
    async fn test_terms_concatenate_in_order_without_dedup() {
        let api = ScriptedApi::default()
            .with("a", &[Some(3)])
            .with("b", &[None, None, None])
            .with("c", &[Some(3)]);
        let outcome = Poller::with_limits(&api, limits()).poll_all(&["a", "b", "c"]).await;

        assert_eq!(outcome.results.len(), 6);
        assert_eq!(outcome.results[0]["term"], "a");
        assert_eq!(outcome.results[3]["term"], "c");
        // Same numbers from both terms survive
        assert_eq!(outcome.results[0]["number"], outcome.results[3]["number"]);
        assert_eq!(outcome.terms.len(), 3);
        assert_eq!(outcome.terms[1].final_state, TermState::Done);
    }
}
