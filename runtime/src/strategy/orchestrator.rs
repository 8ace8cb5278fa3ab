//! Adaptive strategy orchestration.
//!
//! For one URL the orchestrator resolves the source, builds the technique
//! chain and tries techniques one at a time until one yields a listing with
//! the required fields. Every attempt updates the shared [`StatsBook`] and
//! appends a [`TraceEntry`]. A technique that hits a rate limit or challenge
//! gets one more try after a longer backoff before the chain moves on.

use super::fanout::ListingProvider;
use super::fetchers::{FetcherFactory, TechniqueFetcher};
use super::{AttemptOutcome, StatsBook, Technique, TraceEntry};
use crate::cache::{catalog_key, parse_key, CacheStore, NoopCache};
use crate::error::{ScrapeError, ScrapeResult};
use crate::listing::normalize::Normalizer;
use crate::listing::PropertyListing;
use crate::sources::{resolve_source, SearchQuery, SourceId};
use crate::store::{SinkRecord, SinkWriter};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A successful parse.
#[derive(Debug, Clone, Serialize)]
pub struct ParseOutcome {
    pub listing: PropertyListing,
    pub technique_used: Technique,
    pub elapsed: Duration,
    /// Every attempt in order, the successful one last.
    pub trace: Vec<TraceEntry>,
    pub from_cache: bool,
}

#[derive(Serialize, Deserialize)]
struct CachedParse {
    listing: PropertyListing,
    technique: Technique,
}

type FetcherKey = (SourceId, Technique, String);

pub struct Orchestrator {
    factory: Arc<dyn FetcherFactory>,
    fetchers: DashMap<FetcherKey, Arc<dyn TechniqueFetcher>>,
    stats: Arc<StatsBook>,
    normalizer: Arc<Normalizer>,
    cache: Arc<dyn CacheStore>,
    sink: SinkWriter,
    locale: String,
    cache_ttl: Duration,
    block_backoff: Duration,
}

impl Orchestrator {
    pub fn new(
        factory: Arc<dyn FetcherFactory>,
        stats: Arc<StatsBook>,
        normalizer: Arc<Normalizer>,
        locale: impl Into<String>,
    ) -> Self {
        Self {
            factory,
            fetchers: DashMap::new(),
            stats,
            normalizer,
            cache: Arc::new(NoopCache),
            sink: SinkWriter::null(),
            locale: locale.into(),
            cache_ttl: Duration::from_secs(3600),
            block_backoff: Duration::from_secs(3),
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn CacheStore>, ttl: Duration) -> Self {
        self.cache = cache;
        self.cache_ttl = ttl;
        self
    }

    pub fn with_sink(mut self, sink: SinkWriter) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_block_backoff(mut self, backoff: Duration) -> Self {
        self.block_backoff = backoff;
        self
    }

    pub fn stats(&self) -> &Arc<StatsBook> {
        &self.stats
    }

    /// Number of fetchers instantiated so far.
    pub fn fetcher_count(&self) -> usize {
        self.fetchers.len()
    }

    /// Technique order for one request.
    ///
    /// A preferred technique moves to the front; otherwise the static chain
    /// is used with degraded techniques demoted. Without fallback only the
    /// first technique is tried.
    pub fn chain_for(
        &self,
        source: SourceId,
        preferred: Option<Technique>,
        allow_fallback: bool,
    ) -> Vec<Technique> {
        let mut chain = match preferred {
            Some(first) => {
                let mut chain = vec![first];
                chain.extend(source.techniques().iter().copied().filter(|t| *t != first));
                chain
            }
            None => self.stats.ordered_chain(source, source.techniques()),
        };
        if !allow_fallback {
            chain.truncate(1);
        }
        chain
    }

    fn fetcher(&self, source: SourceId, technique: Technique) -> ScrapeResult<Arc<dyn TechniqueFetcher>> {
        let key = (source, technique, self.locale.clone());
        if let Some(existing) = self.fetchers.get(&key) {
            return Ok(Arc::clone(existing.value()));
        }
        let created = self.factory.create(source, technique, &self.locale)?;
        Ok(Arc::clone(self.fetchers.entry(key).or_insert(created).value()))
    }

    /// Parse one listing URL, falling back through the technique chain.
    pub async fn parse(
        &self,
        url: &str,
        preferred: Option<Technique>,
        allow_fallback: bool,
    ) -> ScrapeResult<ParseOutcome> {
        let started = Instant::now();
        let source = resolve_source(url)?;

        if preferred.is_none() {
            if let Some(hit) = self.cached_parse(url).await {
                debug!(url, "parse served from cache");
                return Ok(ParseOutcome {
                    listing: hit.listing,
                    technique_used: hit.technique,
                    elapsed: started.elapsed(),
                    trace: Vec::new(),
                    from_cache: true,
                });
            }
        }

        let chain = self.chain_for(source, preferred, allow_fallback);
        let mut trace = Vec::with_capacity(chain.len());

        for technique in chain {
            let fetched = self
                .attempt(source, technique, &mut trace, |fetcher| async move {
                    let raw = fetcher.fetch_listing(url).await?;
                    Ok(vec![raw])
                })
                .await;
            let Some(raws) = fetched else { continue };

            let mut listing = raws
                .first()
                .map(|raw| self.normalizer.normalize(source, raw))
                .unwrap_or_default();
            if listing.url.is_empty() {
                listing.url = url.to_string();
            }
            let elapsed = Duration::from_millis(trace.last().map(|e: &TraceEntry| e.elapsed_ms).unwrap_or(0));

            if !listing.has_required_fields() {
                self.stats.record_failure(source, technique, elapsed);
                if let Some(last) = trace.last_mut() {
                    last.outcome = AttemptOutcome::Empty;
                    last.detail = Some("required fields missing after normalization".into());
                }
                info!(source = %source, technique = %technique, "technique returned an empty listing");
                continue;
            }

            self.stats.record_success(source, technique, elapsed);
            info!(
                source = %source,
                technique = %technique,
                attempts = trace.len(),
                "parsed {url} in {}ms",
                started.elapsed().as_millis()
            );
            self.store_parse(url, &listing, technique).await;
            self.sink.save(SinkRecord::parsed(listing.clone(), technique));
            return Ok(ParseOutcome {
                listing,
                technique_used: technique,
                elapsed: started.elapsed(),
                trace,
                from_cache: false,
            });
        }

        warn!(url, attempts = trace.len(), "every technique failed");
        Err(ScrapeError::StrategyExhausted {
            url: url.to_string(),
            trace,
        })
    }

    /// [`parse`](Self::parse) under an overall deadline. There is no partial
    /// listing, so expiry is a definitive `ResourceTimeout`.
    pub async fn parse_with_deadline(
        &self,
        url: &str,
        preferred: Option<Technique>,
        allow_fallback: bool,
        deadline: Duration,
    ) -> ScrapeResult<ParseOutcome> {
        match tokio::time::timeout(deadline, self.parse(url, preferred, allow_fallback)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(url, "parse abandoned after {}ms", deadline.as_millis());
                Err(ScrapeError::timeout(format!("parse of {url}"), deadline))
            }
        }
    }

    /// Fetch and normalize a catalog page through the source's chain.
    ///
    /// A technique that answers with an empty page is not trusted; the chain
    /// moves on and an empty result is returned only when no technique found
    /// anything. If every technique errored the chain is exhausted.
    pub async fn catalog(&self, url: &str) -> ScrapeResult<Vec<PropertyListing>> {
        let source = resolve_source(url)?;
        let key = catalog_key(url);
        if let Some(hit) = self.cache_get::<Vec<PropertyListing>>(&key).await {
            debug!(url, listings = hit.len(), "catalog served from cache");
            return Ok(hit);
        }

        let mut trace = Vec::new();
        let mut answered = false;

        for technique in self.chain_for(source, None, true) {
            let fetched = self
                .attempt(source, technique, &mut trace, |fetcher| async move {
                    fetcher.fetch_catalog(url).await
                })
                .await;
            let Some(raws) = fetched else { continue };
            answered = true;

            let elapsed = Duration::from_millis(trace.last().map(|e: &TraceEntry| e.elapsed_ms).unwrap_or(0));
            let listings: Vec<PropertyListing> = raws
                .iter()
                .map(|raw| self.normalizer.normalize(source, raw))
                .filter(PropertyListing::has_required_fields)
                .collect();

            if listings.is_empty() {
                self.stats.record_failure(source, technique, elapsed);
                if let Some(last) = trace.last_mut() {
                    last.outcome = AttemptOutcome::Empty;
                }
                continue;
            }

            self.stats.record_success(source, technique, elapsed);
            info!(source = %source, technique = %technique, listings = listings.len(), "fetched catalog {url}");
            self.cache_set(&key, &listings).await;
            return Ok(listings);
        }

        if answered {
            Ok(Vec::new())
        } else {
            Err(ScrapeError::StrategyExhausted {
                url: url.to_string(),
                trace,
            })
        }
    }

    /// Run one technique, retrying once after a block. Failures are recorded
    /// in the stats and the trace; a success is appended to the trace and its
    /// stats are left to the caller, which still has to judge the payload.
    async fn attempt<F, Fut>(
        &self,
        source: SourceId,
        technique: Technique,
        trace: &mut Vec<TraceEntry>,
        run: F,
    ) -> Option<Vec<Value>>
    where
        F: Fn(Arc<dyn TechniqueFetcher>) -> Fut,
        Fut: Future<Output = ScrapeResult<Vec<Value>>>,
    {
        let fetcher = match self.fetcher(source, technique) {
            Ok(f) => f,
            Err(e) => {
                self.stats.record_failure(source, technique, Duration::ZERO);
                trace.push(TraceEntry::new(technique, AttemptOutcome::Error, Duration::ZERO).with_detail(e.to_string()));
                return None;
            }
        };

        let mut retried_block = false;
        loop {
            let started = Instant::now();
            let result = run(Arc::clone(&fetcher)).await;
            let elapsed = started.elapsed();

            let err = match result {
                Ok(raws) => {
                    trace.push(TraceEntry::new(technique, AttemptOutcome::Success, elapsed));
                    return Some(raws);
                }
                Err(e) => e,
            };

            self.stats.record_failure(source, technique, elapsed);
            let outcome = match &err {
                ScrapeError::TransientBlock { .. } => AttemptOutcome::Blocked,
                ScrapeError::ResourceTimeout { .. } => AttemptOutcome::TimedOut,
                _ => AttemptOutcome::Error,
            };
            info!(
                source = %source,
                technique = %technique,
                ?outcome,
                "attempt failed after {}ms: {err}",
                elapsed.as_millis()
            );
            trace.push(TraceEntry::new(technique, outcome, elapsed).with_detail(err.to_string()));

            if outcome == AttemptOutcome::Blocked && !retried_block {
                retried_block = true;
                debug!(source = %source, technique = %technique, "backing off {}ms before retry", self.block_backoff.as_millis());
                tokio::time::sleep(self.block_backoff).await;
                continue;
            }
            return None;
        }
    }

    async fn cached_parse(&self, url: &str) -> Option<CachedParse> {
        self.cache_get::<CachedParse>(&parse_key(url))
            .await
            .filter(|hit| hit.listing.has_required_fields())
    }

    async fn store_parse(&self, url: &str, listing: &PropertyListing, technique: Technique) {
        let entry = CachedParse {
            listing: listing.clone(),
            technique,
        };
        self.cache_set(&parse_key(url), &entry).await;
    }

    async fn cache_get<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.cache.get(key).await {
            Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
                Ok(value) => Some(value),
                Err(e) => {
                    debug!(key, "ignoring undecodable cache entry: {e}");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                debug!(key, "cache read failed: {e}");
                None
            }
        }
    }

    async fn cache_set<T: Serialize>(&self, key: &str, value: &T) {
        let bytes = match serde_json::to_vec(value) {
            Ok(b) => b,
            Err(e) => {
                debug!(key, "cache encode failed: {e}");
                return;
            }
        };
        if let Err(e) = self.cache.set(key, bytes, self.cache_ttl).await {
            debug!(key, "cache write failed: {e}");
        }
    }
}

#[async_trait]
impl ListingProvider for Orchestrator {
    async fn search(&self, source: SourceId, query: &SearchQuery) -> ScrapeResult<Vec<PropertyListing>> {
        self.catalog(&source.search_url(query)).await
    }

    async fn fetch_catalog(&self, url: &str) -> ScrapeResult<Vec<PropertyListing>> {
        self.catalog(url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::sources::register_all;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Clone, Copy)]
    enum Behavior {
        Fail,
        Block,
        BlockOnce,
        Empty,
        Listing,
    }

    struct ScriptedFetcher {
        technique: Technique,
        behavior: Behavior,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TechniqueFetcher for ScriptedFetcher {
        fn technique(&self) -> Technique {
            self.technique
        }

        async fn fetch_listing(&self, url: &str) -> ScrapeResult<Value> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let blocked = ScrapeError::TransientBlock {
                url: url.into(),
                reason: "HTTP 429".into(),
            };
            match self.behavior {
                Behavior::Fail => Err(ScrapeError::Driver("connection reset".into())),
                Behavior::Block => Err(blocked),
                Behavior::BlockOnce if n == 0 => Err(blocked),
                Behavior::Empty => Ok(json!({ "title": "" })),
                _ => Ok(json!({ "title": "2-комн. квартира", "price": 31_000_000, "total_area": 75 })),
            }
        }

        async fn fetch_catalog(&self, _url: &str) -> ScrapeResult<Vec<Value>> {
            match self.behavior {
                Behavior::Fail => Err(ScrapeError::Http("HTTP 500".into())),
                Behavior::Empty => Ok(Vec::new()),
                _ => Ok(vec![json!({ "title": "a", "price": 1 }), json!({ "title": "" })]),
            }
        }
    }

    struct ScriptedFactory {
        behaviors: HashMap<Technique, Behavior>,
        created: Mutex<Vec<Arc<ScriptedFetcher>>>,
    }

    impl ScriptedFactory {
        fn new(behaviors: &[(Technique, Behavior)]) -> Arc<Self> {
            Arc::new(Self {
                behaviors: behaviors.iter().copied().collect(),
                created: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self, technique: Technique) -> usize {
            self.created
                .lock()
                .unwrap()
                .iter()
                .filter(|f| f.technique == technique)
                .map(|f| f.calls.load(Ordering::SeqCst))
                .sum()
        }
    }

    impl FetcherFactory for ScriptedFactory {
        fn create(&self, _source: SourceId, technique: Technique, _locale: &str) -> ScrapeResult<Arc<dyn TechniqueFetcher>> {
            let fetcher = Arc::new(ScriptedFetcher {
                technique,
                behavior: self.behaviors.get(&technique).copied().unwrap_or(Behavior::Fail),
                calls: AtomicUsize::new(0),
            });
            self.created.lock().unwrap().push(Arc::clone(&fetcher));
            Ok(fetcher)
        }
    }

    fn orchestrator(factory: Arc<ScriptedFactory>) -> Orchestrator {
        let normalizer = Arc::new(Normalizer::new());
        register_all(&normalizer);
        Orchestrator::new(factory, Arc::new(StatsBook::new()), normalizer, "ru-RU")
            .with_block_backoff(Duration::from_millis(1))
    }

    const DOMCLICK_URL: &str = "https://domclick.ru/card/sale__flat__1234567";

    #[tokio::test]
    async fn test_third_technique_succeeds_after_two_failures() {
        let factory = ScriptedFactory::new(&[
            (Technique::DirectApi, Behavior::Fail),
            (Technique::LightBrowser, Behavior::Fail),
            (Technique::HardenedBrowser, Behavior::Listing),
        ]);
        let orch = orchestrator(Arc::clone(&factory));

        let outcome = orch.parse(DOMCLICK_URL, None, true).await.unwrap();
        assert_eq!(outcome.technique_used, Technique::HardenedBrowser);
        assert_eq!(outcome.trace.len(), 3);
        assert_eq!(outcome.trace[0].outcome, AttemptOutcome::Error);
        assert_eq!(outcome.trace[2].outcome, AttemptOutcome::Success);

        let stats = orch.stats();
        for t in [Technique::DirectApi, Technique::LightBrowser] {
            let s = stats.get(SourceId::Domclick, t);
            assert_eq!((s.attempts, s.failures, s.successes), (1, 1, 0));
        }
        let s = stats.get(SourceId::Domclick, Technique::HardenedBrowser);
        assert_eq!((s.attempts, s.failures, s.successes), (1, 0, 1));
        assert_eq!(outcome.listing.source, Some(SourceId::Domclick));
        assert_eq!(outcome.listing.url, DOMCLICK_URL);
    }

    #[tokio::test]
    async fn test_exhausted_chain_carries_full_trace() {
        let factory = ScriptedFactory::new(&[]);
        let orch = orchestrator(factory);
        match orch.parse(DOMCLICK_URL, None, true).await {
            Err(ScrapeError::StrategyExhausted { trace, .. }) => {
                let order: Vec<Technique> = trace.iter().map(|e| e.technique).collect();
                assert_eq!(order, SourceId::Domclick.techniques().to_vec());
            }
            other => panic!("expected exhaustion, got {:?}", other.map(|o| o.technique_used)),
        }
    }

    #[tokio::test]
    async fn test_unsupported_domain_fails_fast() {
        let orch = orchestrator(ScriptedFactory::new(&[]));
        let err = orch.parse("https://example.com/flat/1", None, true).await.unwrap_err();
        assert!(matches!(err, ScrapeError::NotSupported(_)));
        assert_eq!(orch.fetcher_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_listing_falls_through() {
        let factory = ScriptedFactory::new(&[
            (Technique::DirectApi, Behavior::Empty),
            (Technique::LightBrowser, Behavior::Listing),
        ]);
        let orch = orchestrator(factory);
        let outcome = orch.parse(DOMCLICK_URL, None, true).await.unwrap();
        assert_eq!(outcome.technique_used, Technique::LightBrowser);
        assert_eq!(outcome.trace[0].outcome, AttemptOutcome::Empty);
        assert_eq!(orch.stats().get(SourceId::Domclick, Technique::DirectApi).failures, 1);
    }

    #[tokio::test]
    async fn test_preferred_technique_goes_first() {
        let factory = ScriptedFactory::new(&[(Technique::HardenedBrowser, Behavior::Listing)]);
        let orch = orchestrator(Arc::clone(&factory));
        let outcome = orch
            .parse(DOMCLICK_URL, Some(Technique::HardenedBrowser), true)
            .await
            .unwrap();
        assert_eq!(outcome.trace.len(), 1);
        assert_eq!(factory.calls(Technique::DirectApi), 0);
    }

    #[tokio::test]
    async fn test_no_fallback_stops_after_first_technique() {
        let factory = ScriptedFactory::new(&[(Technique::LightBrowser, Behavior::Listing)]);
        let orch = orchestrator(Arc::clone(&factory));
        let err = orch.parse(DOMCLICK_URL, None, false).await.unwrap_err();
        match err {
            ScrapeError::StrategyExhausted { trace, .. } => assert_eq!(trace.len(), 1),
            other => panic!("unexpected {other}"),
        }
        assert_eq!(factory.calls(Technique::LightBrowser), 0);
    }

    #[tokio::test]
    async fn test_block_is_retried_once_with_backoff() {
        let factory = ScriptedFactory::new(&[
            (Technique::DirectApi, Behavior::BlockOnce),
            (Technique::LightBrowser, Behavior::Listing),
        ]);
        let orch = orchestrator(Arc::clone(&factory));
        let outcome = orch.parse(DOMCLICK_URL, None, true).await.unwrap();
        assert_eq!(outcome.technique_used, Technique::DirectApi);
        assert_eq!(outcome.trace.len(), 2);
        assert_eq!(outcome.trace[0].outcome, AttemptOutcome::Blocked);
        assert_eq!(factory.calls(Technique::DirectApi), 2);

        let factory = ScriptedFactory::new(&[
            (Technique::DirectApi, Behavior::Block),
            (Technique::LightBrowser, Behavior::Listing),
        ]);
        let orch = orchestrator(Arc::clone(&factory));
        let outcome = orch.parse(DOMCLICK_URL, None, true).await.unwrap();
        assert_eq!(outcome.technique_used, Technique::LightBrowser);
        assert_eq!(factory.calls(Technique::DirectApi), 2);
    }

    #[tokio::test]
    async fn test_fetchers_are_created_once_per_technique() {
        let factory = ScriptedFactory::new(&[(Technique::DirectApi, Behavior::Listing)]);
        let orch = orchestrator(Arc::clone(&factory));
        for _ in 0..3 {
            orch.parse(DOMCLICK_URL, Some(Technique::DirectApi), true).await.unwrap();
        }
        assert_eq!(orch.fetcher_count(), 1);
        assert_eq!(factory.created.lock().unwrap().len(), 1);
        assert_eq!(factory.calls(Technique::DirectApi), 3);
    }

    #[tokio::test]
    async fn test_repeated_parse_is_served_from_cache() {
        let factory = ScriptedFactory::new(&[(Technique::DirectApi, Behavior::Listing)]);
        let orch = orchestrator(Arc::clone(&factory))
            .with_cache(Arc::new(MemoryCache::new(10)), Duration::from_secs(60));
        let first = orch.parse(DOMCLICK_URL, None, true).await.unwrap();
        let second = orch.parse(DOMCLICK_URL, None, true).await.unwrap();
        assert!(!first.from_cache);
        assert!(second.from_cache);
        assert_eq!(second.listing, first.listing);
        assert_eq!(factory.calls(Technique::DirectApi), 1);
    }

    #[tokio::test]
    async fn test_deadline_expiry_is_a_resource_timeout() {
        struct SlowFactory;
        struct SlowFetcher;

        #[async_trait]
        impl TechniqueFetcher for SlowFetcher {
            fn technique(&self) -> Technique {
                Technique::DirectApi
            }
            async fn fetch_listing(&self, _url: &str) -> ScrapeResult<Value> {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(json!({ "title": "late" }))
            }
            async fn fetch_catalog(&self, _url: &str) -> ScrapeResult<Vec<Value>> {
                Ok(Vec::new())
            }
        }

        impl FetcherFactory for SlowFactory {
            fn create(&self, _: SourceId, _: Technique, _: &str) -> ScrapeResult<Arc<dyn TechniqueFetcher>> {
                Ok(Arc::new(SlowFetcher))
            }
        }

        let orch = Orchestrator::new(Arc::new(SlowFactory), Arc::new(StatsBook::new()), Arc::new(Normalizer::new()), "ru-RU");
        let err = orch
            .parse_with_deadline(DOMCLICK_URL, None, true, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, ScrapeError::ResourceTimeout { .. }));
    }

    #[tokio::test]
    async fn test_catalog_normalizes_and_drops_untitled_items() {
        let factory = ScriptedFactory::new(&[
            (Technique::DirectApi, Behavior::Empty),
            (Technique::LightBrowser, Behavior::Listing),
        ]);
        let orch = orchestrator(factory);
        let listings = orch.catalog("https://domclick.ru/search?rooms=2").await.unwrap();
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].price, Some(1.0));
        assert_eq!(listings[0].source, Some(SourceId::Domclick));
    }

    #[tokio::test]
    async fn test_catalog_with_only_errors_is_exhausted() {
        let orch = orchestrator(ScriptedFactory::new(&[]));
        let err = orch.catalog("https://domclick.ru/search?rooms=2").await.unwrap_err();
        assert!(matches!(err, ScrapeError::StrategyExhausted { .. }));
    }
}
