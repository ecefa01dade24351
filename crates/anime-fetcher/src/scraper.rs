//! Batch scraper.
//!
//! Fetches every endpoint of one upstream for a list of ids and stores the raw
//! bodies. A failed fetch or write never aborts the batch: the id is counted
//! as failed for this run and the scraper moves on. Catalogue upstreams are
//! walked page by page instead.

use crate::api::{CancelSignal, FetchError, Fetcher, HttpTransport, Transport};
use crate::cache::ResponseCache;
use crate::provider::{Endpoint, Paging, Provider};
use futures::stream::{self, StreamExt};
use serde::de::IgnoredAny;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Upper bound on requests followed for one endpoint
const MAX_PAGES: u32 = 500;

/// Statistics for a scraping session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScraperStats {
    pub total_ids: usize,
    /// Ids (or catalogue endpoints) with every response stored
    pub completed: usize,
    /// Primary record stored but at least one secondary endpoint failed
    pub partial: usize,
    /// Primary record could not be fetched or stored
    pub failed: usize,
    pub skipped: usize,
    pub responses_stored: usize,
    pub fetch_errors: usize,
    /// Responses fetched but not written to disk
    pub storage_errors: usize,
    /// Fetches that were still throttled when their attempts ran out
    pub throttled: usize,
    pub cancelled: bool,
}

impl ScraperStats {
    fn absorb(&mut self, tally: &Tally) {
        self.responses_stored += tally.stored;
        self.fetch_errors += tally.fetch_errors;
        self.storage_errors += tally.storage_errors;
        self.throttled += tally.throttled;
    }
}

/// Counters for one id
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Tally {
    stored: usize,
    fetch_errors: usize,
    storage_errors: usize,
    throttled: usize,
}

impl Tally {
    fn record(&mut self, err: &EndpointError) {
        match err {
            EndpointError::Fetch(e) => {
                self.fetch_errors += 1;
                if e.is_exhausted() {
                    self.throttled += 1;
                }
            }
            EndpointError::Store { .. } => self.storage_errors += 1,
        }
    }

    fn errors(&self) -> usize {
        self.fetch_errors + self.storage_errors
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IdOutcome {
    Skipped,
    Completed(Tally),
    PrimaryFailed(Tally),
    Cancelled(Tally),
}

/// Why one endpoint was not fully stored
#[derive(Debug, Error)]
enum EndpointError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("failed to store response {key}: {error:#}")]
    Store { key: String, error: anyhow::Error },
}

/// Only the pagination flag is read from Jikan pages
#[derive(Debug, Deserialize)]
struct PageEnvelope {
    pagination: Option<PageInfo>,
}

#[derive(Debug, Deserialize)]
struct PageInfo {
    #[serde(default)]
    has_next_page: bool,
}

/// Catalogue pages only need their item count
#[derive(Debug, Deserialize)]
struct ItemsEnvelope {
    #[serde(default)]
    data: Vec<IgnoredAny>,
}

fn has_next_page(body: &[u8]) -> bool {
    serde_json::from_slice::<PageEnvelope>(body)
        .ok()
        .and_then(|envelope| envelope.pagination)
        .map(|page| page.has_next_page)
        .unwrap_or(false)
}

fn has_items(body: &[u8]) -> bool {
    serde_json::from_slice::<ItemsEnvelope>(body)
        .map(|envelope| !envelope.data.is_empty())
        .unwrap_or(false)
}

/// Scraper coordinator for one upstream
pub struct Scraper<T = HttpTransport> {
    provider: Provider,
    endpoints: Vec<Endpoint>,
    fetcher: Fetcher<T>,
    cache: ResponseCache,
    skip_existing: bool,
    workers: usize,
}

impl<T: Transport> Scraper<T> {
    pub fn new(
        provider: Provider,
        endpoints: Vec<Endpoint>,
        fetcher: Fetcher<T>,
        cache: ResponseCache,
    ) -> Self {
        Self {
            provider,
            endpoints,
            fetcher,
            cache,
            skip_existing: false,
            workers: 1,
        }
    }

    /// Skip ids whose primary record is already stored, and reuse stored
    /// catalogue pages instead of fetching them again
    pub fn skip_existing(mut self, skip: bool) -> Self {
        self.skip_existing = skip;
        self
    }

    /// Number of ids in flight at once; all share the upstream's rate limiter
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Run the scraper over `ids`
    pub async fn run(&self, ids: &[u32], cancel: &CancelSignal) -> ScraperStats {
        info!(
            provider = self.provider.as_str(),
            ids = ids.len(),
            workers = self.workers,
            "Starting scraper"
        );

        let mut stats = ScraperStats {
            total_ids: ids.len(),
            ..Default::default()
        };

        let mut outcomes = stream::iter(ids.iter().copied())
            .map(|id| self.process_id(id, cancel))
            .buffer_unordered(self.workers);

        let mut done = 0;
        while let Some(outcome) = outcomes.next().await {
            done += 1;
            match outcome {
                IdOutcome::Skipped => stats.skipped += 1,
                IdOutcome::Completed(tally) => {
                    stats.absorb(&tally);
                    if tally.errors() == 0 {
                        stats.completed += 1;
                    } else {
                        stats.partial += 1;
                    }
                }
                IdOutcome::PrimaryFailed(tally) => {
                    stats.absorb(&tally);
                    stats.failed += 1;
                }
                IdOutcome::Cancelled(tally) => {
                    stats.absorb(&tally);
                    stats.cancelled = true;
                }
            }

            if done % 100 == 0 || done == ids.len() {
                info!(
                    progress = format!("{}/{}", done, ids.len()),
                    window_requests = self.fetcher.rate_limiter().current_window_count(),
                    "Scraping progress"
                );
            }
        }

        self.log_finished(&stats);
        stats
    }

    /// Walk every endpoint of a catalogue upstream until it runs out of pages
    pub async fn run_catalogue(&self, cancel: &CancelSignal) -> ScraperStats {
        info!(provider = self.provider.as_str(), "Walking catalogue");

        let mut stats = ScraperStats::default();
        for endpoint in &self.endpoints {
            let mut tally = Tally::default();
            let result = self.fetch_endpoint(0, endpoint, cancel, &mut tally).await;
            match result {
                Ok(()) => stats.completed += 1,
                Err(EndpointError::Fetch(FetchError::Cancelled { .. })) => stats.cancelled = true,
                Err(e) => {
                    tally.record(&e);
                    error!(endpoint = endpoint.name, error = %e, "Catalogue walk stopped");
                    stats.failed += 1;
                }
            }
            stats.absorb(&tally);
            if stats.cancelled {
                break;
            }
        }

        self.log_finished(&stats);
        stats
    }

    fn log_finished(&self, stats: &ScraperStats) {
        info!(
            provider = self.provider.as_str(),
            completed = stats.completed,
            partial = stats.partial,
            failed = stats.failed,
            skipped = stats.skipped,
            responses_stored = stats.responses_stored,
            storage_errors = stats.storage_errors,
            throttled = stats.throttled,
            cancelled = stats.cancelled,
            "Scraper finished"
        );
    }

    async fn process_id(&self, id: u32, cancel: &CancelSignal) -> IdOutcome {
        let mut tally = Tally::default();

        if *cancel.borrow() {
            return IdOutcome::Cancelled(tally);
        }

        if id == 0 {
            debug!(provider = self.provider.as_str(), "Skipping zero id");
            return IdOutcome::Skipped;
        }

        if self.skip_existing {
            if let Some(primary) = self.endpoints.first() {
                if self.cache.exists(&cache_key(id, primary, primary.first_cursor())) {
                    debug!(id, "Already stored, skipping");
                    return IdOutcome::Skipped;
                }
            }
        }

        for (index, endpoint) in self.endpoints.iter().enumerate() {
            match self.fetch_endpoint(id, endpoint, cancel, &mut tally).await {
                Ok(()) => {}
                Err(EndpointError::Fetch(FetchError::Cancelled { .. })) => {
                    return IdOutcome::Cancelled(tally)
                }
                Err(e) => {
                    tally.record(&e);
                    if index == 0 {
                        error!(id, endpoint = endpoint.name, error = %e, "Failed to fetch primary record");
                        return IdOutcome::PrimaryFailed(tally);
                    }
                    warn!(id, endpoint = endpoint.name, error = %e, "Failed to fetch endpoint");
                }
            }
        }

        debug!(id, stored = tally.stored, errors = tally.errors(), "Processed id");
        IdOutcome::Completed(tally)
    }

    /// Fetch and store every page of one endpoint, counting stored pages in `tally`
    async fn fetch_endpoint(
        &self,
        id: u32,
        endpoint: &Endpoint,
        cancel: &CancelSignal,
        tally: &mut Tally,
    ) -> Result<(), EndpointError> {
        let mut cursor = endpoint.first_cursor();
        let mut requests = 0;

        loop {
            let key = cache_key(id, endpoint, cursor);
            let stored = if self.skip_existing {
                self.stored_body(&key)
            } else {
                None
            };
            let fresh = stored.is_none();
            let body = match stored {
                Some(body) => body,
                None => {
                    self.fetcher
                        .fetch_cancellable(&endpoint.url(id, cursor), cancel)
                        .await?
                }
            };

            let more = match endpoint.paging() {
                Paging::Single => false,
                Paging::Pages => has_next_page(&body),
                Paging::Offsets { .. } => {
                    if !has_items(&body) {
                        debug!(endpoint = endpoint.name, offset = cursor, "Catalogue exhausted");
                        break;
                    }
                    true
                }
            };

            if fresh {
                self.cache
                    .set(&key, &body)
                    .map_err(|error| EndpointError::Store { key, error })?;
                tally.stored += 1;
            }

            if !more {
                break;
            }
            requests += 1;
            if requests >= MAX_PAGES {
                warn!(id, endpoint = endpoint.name, cursor, "Page limit reached");
                break;
            }
            match endpoint.next_cursor(cursor) {
                Some(next) => cursor = next,
                None => break,
            }
        }

        Ok(())
    }

    /// Previously stored body under `key`; unreadable files count as missing
    fn stored_body(&self, key: &str) -> Option<Vec<u8>> {
        match self.cache.get(key) {
            Ok(body) => body,
            Err(e) => {
                warn!(key, error = %e, "Ignoring unreadable stored response");
                None
            }
        }
    }
}

fn cache_key(id: u32, endpoint: &Endpoint, cursor: u32) -> String {
    match endpoint.paging() {
        Paging::Single => format!("{}_{}", id, endpoint.name),
        Paging::Pages => format!("{}_{}_{}", id, endpoint.name, cursor),
        Paging::Offsets { .. } => format!("{}_{}", endpoint.name, cursor),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::fetcher::tests::ScriptedTransport;
    use crate::api::{RateLimiter, ResponseClassifier, RetryConfig};
    use shared::Config;
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::sync::watch;

    fn scraper(
        provider: Provider,
        transport: ScriptedTransport,
        cache_dir: &Path,
    ) -> Scraper<ScriptedTransport> {
        let fetcher = Fetcher::new(
            transport,
            Arc::new(RateLimiter::new(1000, 1000).unwrap()),
            ResponseClassifier::StatusOnly,
            RetryConfig::default(),
        )
        .unwrap();
        let cache = ResponseCache::new(cache_dir, provider.extension(), true).unwrap();
        Scraper::new(provider, provider.endpoints(&Config::default()), fetcher, cache)
    }

    fn upstream(scraper: &Scraper<ScriptedTransport>) -> &ScriptedTransport {
        scraper.fetcher.transport()
    }

    fn not_cancelled() -> (watch::Sender<bool>, CancelSignal) {
        watch::channel(false)
    }

    #[test]
    fn test_has_next_page() {
        assert!(has_next_page(br#"{"data":[],"pagination":{"has_next_page":true}}"#));
        assert!(!has_next_page(br#"{"data":[],"pagination":{"has_next_page":false}}"#));
        assert!(!has_next_page(br#"{"data":[]}"#));
        assert!(!has_next_page(b"<anime/>"));
    }

    #[test]
    fn test_has_items() {
        assert!(has_items(br#"{"data":[{"id":1}]}"#));
        assert!(!has_items(br#"{"data":[]}"#));
        assert!(!has_items(br#"{"error":"nope"}"#));
        assert!(!has_items(b"not json"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_follows_jikan_pages() {
        let dir = TempDir::new().unwrap();
        let transport = ScriptedTransport::new()
            .respond(200, r#"{"data":[1],"pagination":{"has_next_page":true}}"#)
            .respond(200, r#"{"data":[2],"pagination":{"has_next_page":false}}"#);
        let scraper = scraper(Provider::Jikan, transport, dir.path());
        let (_tx, cancel) = not_cancelled();

        let stats = scraper.run(&[5114], &cancel).await;

        assert_eq!(stats.completed, 1);
        assert_eq!(stats.responses_stored, 2);
        assert_eq!(
            upstream(&scraper).urls(),
            vec![
                "https://api.jikan.moe/v4/anime/5114/episodes?page=1",
                "https://api.jikan.moe/v4/anime/5114/episodes?page=2",
            ]
        );
        assert!(dir.path().join("5114_episodes_1.json").exists());
        assert!(dir.path().join("5114_episodes_2.json").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_primary_failure_skips_secondary_endpoints() {
        let dir = TempDir::new().unwrap();
        let transport = ScriptedTransport::new().respond(404, "").otherwise(200, "[]");
        let scraper = scraper(Provider::Shikimori, transport, dir.path());
        let (_tx, cancel) = not_cancelled();

        let stats = scraper.run(&[21], &cancel).await;

        assert_eq!(stats.failed, 1);
        assert_eq!(stats.fetch_errors, 1);
        assert_eq!(stats.responses_stored, 0);
        assert_eq!(upstream(&scraper).calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_secondary_failure_keeps_going() {
        let dir = TempDir::new().unwrap();
        let transport = ScriptedTransport::new()
            .respond(200, "{\"id\":21}")
            .respond(500, "")
            .respond(200, "[]")
            .respond(200, "[]");
        let scraper = scraper(Provider::Shikimori, transport, dir.path());
        let (_tx, cancel) = not_cancelled();

        let stats = scraper.run(&[21], &cancel).await;

        assert_eq!(stats.partial, 1);
        assert_eq!(stats.responses_stored, 3);
        assert_eq!(stats.fetch_errors, 1);
        assert_eq!(upstream(&scraper).calls(), 4);
        assert!(!dir.path().join("21_roles.json").exists());
        assert!(dir.path().join("21_similar.json").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_id_and_existing_are_skipped() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("21_anime.json"), "{}").unwrap();
        let transport = ScriptedTransport::new().otherwise(200, "{}");
        let scraper = scraper(Provider::Shikimori, transport, dir.path()).skip_existing(true);
        let (_tx, cancel) = not_cancelled();

        let stats = scraper.run(&[0, 21], &cancel).await;

        assert_eq!(stats.skipped, 2);
        assert_eq!(upstream(&scraper).calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_workers_share_one_limiter() {
        let dir = TempDir::new().unwrap();
        let transport = ScriptedTransport::new().otherwise(200, "{}");
        let scraper = scraper(Provider::Shikimori, transport, dir.path()).workers(3);
        let (_tx, cancel) = not_cancelled();

        let stats = scraper.run(&[1, 2, 3], &cancel).await;

        assert_eq!(stats.completed, 3);
        assert_eq!(stats.responses_stored, 12);
        assert_eq!(upstream(&scraper).calls(), 12);
        assert_eq!(scraper.fetcher.rate_limiter().current_window_count(), 12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_run_makes_no_requests() {
        let dir = TempDir::new().unwrap();
        let transport = ScriptedTransport::new().otherwise(200, "{}");
        let scraper = scraper(Provider::Jikan, transport, dir.path());
        let (_tx, cancel) = watch::channel(true);

        let stats = scraper.run(&[1, 2], &cancel).await;

        assert!(stats.cancelled);
        assert_eq!(stats.completed, 0);
        assert_eq!(upstream(&scraper).calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unwritable_store_fails_ids() {
        let dir = TempDir::new().unwrap();
        let raw = dir.path().join("anidb");
        let transport = ScriptedTransport::new().otherwise(200, "<anime/>");
        let scraper = scraper(Provider::Anidb, transport, &raw);
        // A plain file where the directory used to be
        std::fs::remove_dir(&raw).unwrap();
        std::fs::write(&raw, "").unwrap();
        let (_tx, cancel) = not_cancelled();

        let stats = scraper.run(&[1, 2], &cancel).await;

        assert_eq!(stats.completed, 0);
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.responses_stored, 0);
        assert_eq!(stats.storage_errors, 2);
        assert_eq!(stats.fetch_errors, 0);
        assert_eq!(upstream(&scraper).calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_secondary_store_failure_marks_partial() {
        let dir = TempDir::new().unwrap();
        // A directory squatting on the file name makes that single write fail
        std::fs::create_dir(dir.path().join("21_roles.json")).unwrap();
        let transport = ScriptedTransport::new().otherwise(200, "{}");
        let scraper = scraper(Provider::Shikimori, transport, dir.path());
        let (_tx, cancel) = not_cancelled();

        let stats = scraper.run(&[21], &cancel).await;

        assert_eq!(stats.partial, 1);
        assert_eq!(stats.responses_stored, 3);
        assert_eq!(stats.storage_errors, 1);
        assert_eq!(upstream(&scraper).calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttled_secondary_is_counted() {
        let dir = TempDir::new().unwrap();
        let transport = ScriptedTransport::new()
            .respond(200, "{}")
            .respond(429, "")
            .respond(429, "")
            .respond(429, "")
            .otherwise(200, "[]");
        let scraper = scraper(Provider::Shikimori, transport, dir.path());
        let (_tx, cancel) = not_cancelled();

        let stats = scraper.run(&[21], &cancel).await;

        assert_eq!(stats.partial, 1);
        assert_eq!(stats.fetch_errors, 1);
        assert_eq!(stats.throttled, 1);
        assert_eq!(stats.responses_stored, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_catalogue_walks_offsets_until_empty() {
        let dir = TempDir::new().unwrap();
        let transport = ScriptedTransport::new()
            .respond(200, r#"{"data":[{"id":1},{"id":2}]}"#)
            .respond(200, r#"{"data":[{"id":3}]}"#)
            .respond(200, r#"{"data":[]}"#);
        let mut config = Config::default();
        config.providers.anime365.page_size = 2;
        let fetcher = Fetcher::new(
            transport,
            Arc::new(RateLimiter::new(1000, 1000).unwrap()),
            ResponseClassifier::StatusOnly,
            RetryConfig::default(),
        )
        .unwrap();
        let cache = ResponseCache::new(dir.path(), "json", true).unwrap();
        let scraper = Scraper::new(
            Provider::Anime365,
            Provider::Anime365.endpoints(&config),
            fetcher,
            cache,
        );
        let (_tx, cancel) = not_cancelled();

        let stats = scraper.run_catalogue(&cancel).await;

        assert_eq!(stats.completed, 1);
        assert_eq!(stats.responses_stored, 2);
        assert_eq!(
            upstream(&scraper).urls(),
            vec![
                "https://smotret-anime.online/api/series/?limit=2&offset=0",
                "https://smotret-anime.online/api/series/?limit=2&offset=2",
                "https://smotret-anime.online/api/series/?limit=2&offset=4",
            ]
        );
        assert!(dir.path().join("series_0.json").exists());
        assert!(dir.path().join("series_2.json").exists());
        assert!(!dir.path().join("series_4.json").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_catalogue_reuses_stored_pages() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("series_0.json"), r#"{"data":[{"id":1}]}"#).unwrap();
        let transport = ScriptedTransport::new().respond(200, r#"{"data":[]}"#);
        let scraper = scraper(Provider::Anime365, transport, dir.path()).skip_existing(true);
        let (_tx, cancel) = not_cancelled();

        let stats = scraper.run_catalogue(&cancel).await;

        assert_eq!(stats.completed, 1);
        assert_eq!(stats.responses_stored, 0);
        assert_eq!(
            upstream(&scraper).urls(),
            vec!["https://smotret-anime.online/api/series/?limit=500&offset=500"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_catalogue_failure_is_reported() {
        let dir = TempDir::new().unwrap();
        let transport = ScriptedTransport::new()
            .respond(200, r#"{"data":[{"id":1}]}"#)
            .respond(503, "");
        let scraper = scraper(Provider::Anime365, transport, dir.path());
        let (_tx, cancel) = not_cancelled();

        let stats = scraper.run_catalogue(&cancel).await;

        assert_eq!(stats.failed, 1);
        assert_eq!(stats.fetch_errors, 1);
        assert_eq!(stats.responses_stored, 1);
    }
}
