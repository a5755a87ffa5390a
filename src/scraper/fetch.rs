//! Concurrent chapter fetching.
//!
//! Every chapter gets its own task, all spawned up front. A semaphore bounds how many
//! requests are in flight; a failed attempt gives its permit back and queues again for
//! another. Chapter numbering was fixed before this phase, so completion order is irrelevant.

use crate::model::{Chapter, StoryArc};
use crate::scraper::error::ScraperError;
use crate::scraper::sanitize::sanitize;
use crate::scraper::Transport;
use indicatif::ProgressBar;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

const MIN_CONCURRENCY: usize = 1;
pub const MAX_CONCURRENCY: usize = 100;
pub const DEFAULT_CONCURRENCY: usize = 16;

/// Errors that end the fetch phase. Transient fetch failures never get here unless a retry
/// limit was configured.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid concurrency value {value}: must be between 1 and 100")]
    InvalidConcurrency { value: usize },

    #[error("Chapter {label} ({url}): {source}")]
    Chapter {
        label: String,
        url: String,
        #[source]
        source: ScraperError,
    },

    #[error("Chapter {label} ({url}) failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        label: String,
        url: String,
        attempts: u32,
        #[source]
        source: ScraperError,
    },

    #[error("{missing} chapter(s) never finished fetching")]
    Incomplete { missing: usize },

    #[error("fetch task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("fetch pool closed unexpectedly")]
    PoolClosed,
}

/// When to re-issue a failed fetch. The default retries forever, immediately.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    max_attempts: Option<u32>,
    delay: Duration,
}

impl RetryPolicy {
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// Give up after `n` attempts in total (at least 1).
    pub fn with_max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = Some(n.max(1));
        self
    }

    /// Wait this long before re-issuing a failed fetch.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    fn allows_another(&self, attempts_made: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempts_made < max)
    }
}

/// How chapter progress is shown.
#[derive(Debug, Clone)]
pub enum Reporter {
    /// One log line per finished chapter and per failed attempt.
    Log,
    /// A progress bar advanced once per finished chapter.
    Bar(ProgressBar),
    Quiet,
}

impl Reporter {
    fn chapter_done(&self, chapter: &Chapter) {
        match self {
            Reporter::Log => info!(index = chapter.index, "Processed {}", chapter.title),
            Reporter::Bar(pb) => pb.inc(1),
            Reporter::Quiet => {}
        }
    }

    fn attempt_failed(&self, chapter: &Chapter, error: &ScraperError) {
        match self {
            Reporter::Log => warn!(
                error = %error,
                "Couldn't fetch {}. Retrying...",
                chapter.short_label
            ),
            _ => debug!(label = %chapter.short_label, error = %error, "fetch attempt failed"),
        }
    }
}

/// Counters shared by all fetch tasks.
#[derive(Debug, Default)]
struct FetchCounters {
    completed: AtomicUsize,
    retried: AtomicUsize,
}

/// Outcome of a finished fetch phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchSummary {
    pub completed: usize,
    /// Failed attempts that were re-issued.
    pub retried: usize,
}

/// Bounded pool that fetches and sanitizes every chapter of a book.
#[derive(Debug)]
pub struct FetchPool {
    semaphore: Arc<Semaphore>,
    concurrency: usize,
    retry_policy: RetryPolicy,
}

impl FetchPool {
    pub fn new(concurrency: usize, retry_policy: RetryPolicy) -> Result<Self, EngineError> {
        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&concurrency) {
            return Err(EngineError::InvalidConcurrency { value: concurrency });
        }
        debug!(
            concurrency,
            max_attempts = ?retry_policy.max_attempts(),
            "creating fetch pool"
        );
        Ok(Self {
            semaphore: Arc::new(Semaphore::new(concurrency)),
            concurrency,
            retry_policy,
        })
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Fetch and sanitize every chapter, returning once all of them are done.
    ///
    /// Each task owns its chapter while it runs and hands it back on success, so chapters
    /// return to their original slots. On error the remaining tasks are aborted and the
    /// arcs are left without their chapters; the book is unusable at that point anyway.
    pub async fn fetch_all(
        &self,
        transport: Arc<dyn Transport>,
        arcs: &mut [StoryArc],
        reporter: Reporter,
    ) -> Result<FetchSummary, EngineError> {
        let counters = Arc::new(FetchCounters::default());
        let reporter = Arc::new(reporter);
        let mut slots: Vec<Vec<Option<Chapter>>> = Vec::with_capacity(arcs.len());
        let mut tasks = JoinSet::new();

        for (arc_pos, arc) in arcs.iter_mut().enumerate() {
            let chapters = std::mem::take(&mut arc.chapters);
            slots.push(vec![None; chapters.len()]);
            for (ch_pos, chapter) in chapters.into_iter().enumerate() {
                let transport = Arc::clone(&transport);
                let semaphore = Arc::clone(&self.semaphore);
                let retry_policy = self.retry_policy.clone();
                let counters = Arc::clone(&counters);
                let reporter = Arc::clone(&reporter);
                tasks.spawn(async move {
                    let chapter = fetch_chapter(
                        transport.as_ref(),
                        &semaphore,
                        chapter,
                        &retry_policy,
                        &counters,
                        &reporter,
                    )
                    .await?;
                    Ok::<_, EngineError>((arc_pos, ch_pos, chapter))
                });
            }
        }

        info!(tasks = tasks.len(), "fetching chapters");

        while let Some(joined) = tasks.join_next().await {
            let result = match joined {
                Ok(inner) => inner,
                Err(e) => Err(EngineError::Task(e)),
            };
            match result {
                Ok((arc_pos, ch_pos, chapter)) => slots[arc_pos][ch_pos] = Some(chapter),
                Err(e) => {
                    tasks.abort_all();
                    return Err(e);
                }
            }
        }

        let missing = slots
            .iter()
            .flatten()
            .filter(|slot| !slot.as_ref().is_some_and(Chapter::is_done))
            .count();
        if missing > 0 {
            return Err(EngineError::Incomplete { missing });
        }
        for (arc, arc_slots) in arcs.iter_mut().zip(slots) {
            arc.chapters = arc_slots.into_iter().flatten().collect();
        }

        let summary = FetchSummary {
            completed: counters.completed.load(Ordering::SeqCst),
            retried: counters.retried.load(Ordering::SeqCst),
        };
        info!(
            completed = summary.completed,
            retried = summary.retried,
            "all chapters fetched"
        );
        Ok(summary)
    }
}

/// Fetch one chapter until it succeeds (or the retry policy gives up), then sanitize it.
async fn fetch_chapter(
    transport: &dyn Transport,
    semaphore: &Semaphore,
    mut chapter: Chapter,
    retry_policy: &RetryPolicy,
    counters: &FetchCounters,
    reporter: &Reporter,
) -> Result<Chapter, EngineError> {
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let fetched = {
            let _permit = semaphore
                .acquire()
                .await
                .map_err(|_| EngineError::PoolClosed)?;
            transport.fetch(&chapter.url).await
        };
        match fetched {
            Ok(body) => {
                let page = sanitize(&body).map_err(|source| EngineError::Chapter {
                    label: chapter.short_label.clone(),
                    url: chapter.url.clone(),
                    source,
                })?;
                chapter.complete(page.title, page.content);
                counters.completed.fetch_add(1, Ordering::SeqCst);
                reporter.chapter_done(&chapter);
                return Ok(chapter);
            }
            Err(e) if !e.is_transient() => {
                return Err(EngineError::Chapter {
                    label: chapter.short_label.clone(),
                    url: chapter.url.clone(),
                    source: e,
                })
            }
            Err(e) => {
                chapter.mark_retrying();
                counters.retried.fetch_add(1, Ordering::SeqCst);
                reporter.attempt_failed(&chapter, &e);
                if !retry_policy.allows_another(attempts) {
                    return Err(EngineError::RetriesExhausted {
                        label: chapter.short_label.clone(),
                        url: chapter.url.clone(),
                        attempts,
                        source: e,
                    });
                }
                if !retry_policy.delay.is_zero() {
                    tokio::time::sleep(retry_policy.delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChapterDescriptor, FetchState};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory transport: serves `pages`, failing each URL `failures[url]` times first.
    #[derive(Default)]
    struct FakeTransport {
        pages: HashMap<String, String>,
        failures: Mutex<HashMap<String, u32>>,
        delays_ms: HashMap<String, u64>,
        calls: AtomicUsize,
        hold: Option<Duration>,
        in_flight: AtomicUsize,
        peak_in_flight: AtomicUsize,
    }

    impl FakeTransport {
        fn page(mut self, url: &str, title: &str) -> Self {
            self.pages.insert(
                url.to_string(),
                format!(
                    r#"<html><body><h1 class="entry-title">{}</h1><div class="entry-content"><p>Text of {}</p></div></body></html>"#,
                    title, title
                ),
            );
            self
        }

        fn raw_page(mut self, url: &str, html: &str) -> Self {
            self.pages.insert(url.to_string(), html.to_string());
            self
        }

        fn failing(self, url: &str, times: u32) -> Self {
            if let Ok(mut f) = self.failures.lock() {
                f.insert(url.to_string(), times);
            }
            self
        }

        fn delayed(mut self, url: &str, ms: u64) -> Self {
            self.delays_ms.insert(url.to_string(), ms);
            self
        }

        /// Keep every request open for `ms` so overlapping requests can be counted.
        fn holding(mut self, ms: u64) -> Self {
            self.hold = Some(Duration::from_millis(ms));
            self
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn fetch(&self, url: &str) -> Result<Vec<u8>, ScraperError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
            let result = self.respond(url).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    impl FakeTransport {
        async fn respond(&self, url: &str) -> Result<Vec<u8>, ScraperError> {
            if let Some(hold) = self.hold {
                tokio::time::sleep(hold).await;
            }
            if let Some(ms) = self.delays_ms.get(url) {
                tokio::time::sleep(Duration::from_millis(*ms)).await;
            }
            let should_fail = {
                let mut failures = self.failures.lock().expect("lock");
                match failures.get_mut(url) {
                    Some(n) if *n > 0 => {
                        *n -= 1;
                        true
                    }
                    _ => false,
                }
            };
            if should_fail {
                return Err(ScraperError::HttpStatus {
                    status: 503,
                    url: url.to_string(),
                });
            }
            self.pages
                .get(url)
                .map(|p| p.as_bytes().to_vec())
                .ok_or_else(|| ScraperError::HttpStatus {
                    status: 404,
                    url: url.to_string(),
                })
        }
    }

    fn arc(index: u32, first_seq: u32, urls: &[&str]) -> StoryArc {
        StoryArc {
            index,
            name: format!("Arc{}", index),
            chapters: urls
                .iter()
                .enumerate()
                .map(|(i, u)| {
                    Chapter::new(
                        first_seq + i as u32,
                        ChapterDescriptor {
                            label: format!("{}.{:02}", index, i + 1),
                            url: u.to_string(),
                        },
                    )
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn fetches_every_chapter_in_place() -> Result<(), EngineError> {
        let transport = FakeTransport::default()
            .page("a", "One")
            .page("b", "Two")
            .page("c", "Three");
        let mut arcs = vec![arc(1, 1, &["a"]), arc(2, 2, &["b", "c"])];
        let pool = FetchPool::new(2, RetryPolicy::unlimited())?;
        let summary = pool
            .fetch_all(Arc::new(transport), &mut arcs, Reporter::Quiet)
            .await?;
        assert_eq!(summary, FetchSummary { completed: 3, retried: 0 });
        let titles: Vec<&str> = arcs
            .iter()
            .flat_map(|a| a.chapters.iter().map(|c| c.title.as_str()))
            .collect();
        assert_eq!(titles, ["One", "Two", "Three"]);
        assert!(arcs.iter().flat_map(|a| &a.chapters).all(Chapter::is_done));
        assert_eq!(arcs[1].chapters[1].content, "<p>Text of Three</p>");
        Ok(())
    }

    #[tokio::test]
    async fn completion_order_does_not_change_chapter_order() -> Result<(), EngineError> {
        let transport = FakeTransport::default()
            .page("a", "One")
            .page("b", "Two")
            .page("c", "Three")
            .delayed("a", 60)
            .delayed("b", 30);
        let mut arcs = vec![arc(1, 1, &["a", "b", "c"])];
        let pool = FetchPool::new(3, RetryPolicy::unlimited())?;
        pool.fetch_all(Arc::new(transport), &mut arcs, Reporter::Quiet)
            .await?;
        let seq: Vec<(u32, &str)> = arcs[0]
            .chapters
            .iter()
            .map(|c| (c.index, c.title.as_str()))
            .collect();
        assert_eq!(seq, [(1, "One"), (2, "Two"), (3, "Three")]);
        Ok(())
    }

    #[tokio::test]
    async fn failing_twice_then_succeeding_completes_once() -> Result<(), EngineError> {
        let transport = Arc::new(FakeTransport::default().page("a", "One").failing("a", 2));
        let mut arcs = vec![arc(1, 1, &["a"])];
        let pool = FetchPool::new(1, RetryPolicy::unlimited())?;
        let summary = pool
            .fetch_all(transport.clone(), &mut arcs, Reporter::Log)
            .await?;
        assert_eq!(summary, FetchSummary { completed: 1, retried: 2 });
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
        assert_eq!(arcs[0].chapters[0].state, FetchState::Done);
        assert_eq!(arcs[0].chapters[0].title, "One");
        Ok(())
    }

    #[tokio::test]
    async fn bounded_retry_gives_up() -> Result<(), EngineError> {
        let transport = FakeTransport::default().page("a", "One").failing("a", 10);
        let mut arcs = vec![arc(1, 1, &["a"])];
        let pool = FetchPool::new(1, RetryPolicy::unlimited().with_max_attempts(3))?;
        let result = pool
            .fetch_all(Arc::new(transport), &mut arcs, Reporter::Quiet)
            .await;
        assert!(matches!(
            result,
            Err(EngineError::RetriesExhausted { attempts: 3, .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn missing_title_aborts_the_run() -> Result<(), EngineError> {
        let transport = FakeTransport::default()
            .page("a", "One")
            .raw_page("b", r#"<html><body><div class="entry-content"><p>x</p></div></body></html>"#);
        let mut arcs = vec![arc(1, 1, &["a", "b"])];
        let pool = FetchPool::new(2, RetryPolicy::unlimited())?;
        match pool
            .fetch_all(Arc::new(transport), &mut arcs, Reporter::Quiet)
            .await
        {
            Err(EngineError::Chapter { label, source, .. }) => {
                assert_eq!(label, "1.02");
                assert!(matches!(source, ScraperError::MissingTitle));
            }
            other => panic!("expected chapter error, got {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn concurrency_out_of_range_is_rejected() {
        assert!(matches!(
            FetchPool::new(0, RetryPolicy::unlimited()),
            Err(EngineError::InvalidConcurrency { value: 0 })
        ));
        assert!(FetchPool::new(MAX_CONCURRENCY + 1, RetryPolicy::unlimited()).is_err());
        let pool = FetchPool::new(DEFAULT_CONCURRENCY, RetryPolicy::unlimited());
        assert_eq!(pool.map(|p| p.concurrency()).ok(), Some(DEFAULT_CONCURRENCY));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn in_flight_requests_stay_under_ceiling() -> Result<(), EngineError> {
        let urls: Vec<String> = (0..40).map(|i| format!("u{}", i)).collect();
        let mut transport = FakeTransport::default().holding(5);
        for (i, url) in urls.iter().enumerate() {
            transport = transport.page(url, &format!("Chapter {}", i));
        }
        let transport = Arc::new(transport.failing("u7", 2));
        let url_refs: Vec<&str> = urls.iter().map(String::as_str).collect();
        let mut arcs = vec![arc(1, 1, &url_refs[..20]), arc(2, 21, &url_refs[20..])];

        let pool = FetchPool::new(3, RetryPolicy::unlimited())?;
        assert_eq!(pool.concurrency(), 3);
        let bar = ProgressBar::hidden();
        bar.set_length(40);
        let summary = pool
            .fetch_all(transport.clone(), &mut arcs, Reporter::Bar(bar.clone()))
            .await?;

        assert_eq!(summary, FetchSummary { completed: 40, retried: 2 });
        let peak = transport.peak_in_flight.load(Ordering::SeqCst);
        assert!(peak <= 3, "peak in flight was {}", peak);
        assert!(peak >= 2, "requests never overlapped");
        assert_eq!(transport.calls.load(Ordering::SeqCst), 42);
        // One step per finished chapter; failed attempts do not move the bar.
        assert_eq!(bar.position(), 40);
        assert!(arcs.iter().flat_map(|a| &a.chapters).all(Chapter::is_done));
        Ok(())
    }

    #[test]
    fn retry_policy_limits() {
        let unlimited = RetryPolicy::unlimited();
        assert!(unlimited.allows_another(1_000_000));
        let bounded = RetryPolicy::unlimited().with_max_attempts(2);
        assert!(bounded.allows_another(1));
        assert!(!bounded.allows_another(2));
        assert_eq!(RetryPolicy::unlimited().with_max_attempts(0).max_attempts(), Some(1));
    }
}
