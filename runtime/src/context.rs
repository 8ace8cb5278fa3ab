//! The process context: one pool, one stats book, one normalizer registry.
//!
//! Built once at the entry point and handed to everything that needs shared
//! state. Nothing in the crate keeps global singletons.

use crate::cache::{CacheStore, MemoryCache};
use crate::config::RuntimeConfig;
use crate::discovery::{ComparableEngine, DiscoveryResult, ScopeHint};
use crate::error::ScrapeResult;
use crate::fetch::{HttpClient, PageFetcher};
use crate::listing::normalize::Normalizer;
use crate::listing::TargetProperty;
use crate::pool::BrowserPool;
use crate::renderer::{BrowserDriver, NoopDriver};
use crate::sources::register_all;
use crate::store::{JsonlSink, ListingSink, NullSink, SinkWriter};
use crate::strategy::fetchers::{FetcherFactory, StandardFetcherFactory};
use crate::strategy::orchestrator::{Orchestrator, ParseOutcome};
use crate::strategy::{StatsBook, Technique};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub struct ScrapeContext {
    config: RuntimeConfig,
    pool: Arc<BrowserPool>,
    stats: Arc<StatsBook>,
    normalizer: Arc<Normalizer>,
    orchestrator: Arc<Orchestrator>,
    engine: ComparableEngine,
    writer: SinkWriter,
}

/// Collaborators default to the production implementations; tests swap them.
pub struct ScrapeContextBuilder {
    config: RuntimeConfig,
    driver: Option<Arc<dyn BrowserDriver>>,
    http: Option<Arc<dyn PageFetcher>>,
    factory: Option<Arc<dyn FetcherFactory>>,
    cache: Option<Arc<dyn CacheStore>>,
    sink: Option<Arc<dyn ListingSink>>,
}

impl ScrapeContextBuilder {
    pub fn driver(mut self, driver: Arc<dyn BrowserDriver>) -> Self {
        self.driver = Some(driver);
        self
    }

    pub fn http(mut self, http: Arc<dyn PageFetcher>) -> Self {
        self.http = Some(http);
        self
    }

    /// Replace the technique fetchers entirely (driver and HTTP are then unused
    /// by the orchestrator, though the pool still wraps the driver).
    pub fn factory(mut self, factory: Arc<dyn FetcherFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn ListingSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn build(self) -> ScrapeResult<ScrapeContext> {
        let config = self.config;
        config.validate()?;

        let driver = self.driver.unwrap_or_else(|| Arc::new(NoopDriver));
        let pool = Arc::new(BrowserPool::new(driver, &config.pool));

        let factory = match self.factory {
            Some(factory) => factory,
            None => {
                let http = self.http.unwrap_or_else(|| {
                    Arc::new(HttpClient::new(config.fetch.timeout(), &config.fetch.locale))
                });
                Arc::new(StandardFetcherFactory::new(
                    http,
                    Arc::clone(&pool),
                    &config.fetch,
                    config.pool.acquire_timeout(),
                ))
            }
        };

        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(MemoryCache::new(config.fetch.cache_max_entries)));
        let sink: Arc<dyn ListingSink> = match (self.sink, &config.sink_path) {
            (Some(sink), _) => sink,
            (None, Some(path)) => Arc::new(JsonlSink::open(path)?),
            (None, None) => Arc::new(NullSink),
        };
        let writer = SinkWriter::new(sink);

        let normalizer = Arc::new(Normalizer::new());
        register_all(&normalizer);
        let stats = Arc::new(StatsBook::new());

        let orchestrator = Arc::new(
            Orchestrator::new(
                factory,
                Arc::clone(&stats),
                Arc::clone(&normalizer),
                config.fetch.locale.clone(),
            )
            .with_cache(cache, config.fetch.cache_ttl())
            .with_sink(writer.clone())
            .with_block_backoff(config.fetch.block_backoff()),
        );
        let engine = ComparableEngine::new(orchestrator.clone(), config.discovery.clone()).with_sink(writer.clone());

        info!(
            max_browsers = config.pool.max_browsers,
            locale = %config.fetch.locale,
            broad_search = config.discovery.broad_search,
            "scrape context ready"
        );
        Ok(ScrapeContext {
            config,
            pool,
            stats,
            normalizer,
            orchestrator,
            engine,
            writer,
        })
    }
}

impl ScrapeContext {
    pub fn builder(config: RuntimeConfig) -> ScrapeContextBuilder {
        ScrapeContextBuilder {
            config,
            driver: None,
            http: None,
            factory: None,
            cache: None,
            sink: None,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn engine(&self) -> &ComparableEngine {
        &self.engine
    }

    pub fn pool(&self) -> &Arc<BrowserPool> {
        &self.pool
    }

    pub fn stats(&self) -> &Arc<StatsBook> {
        &self.stats
    }

    pub fn normalizer(&self) -> &Arc<Normalizer> {
        &self.normalizer
    }

    pub async fn parse(
        &self,
        url: &str,
        preferred: Option<Technique>,
        allow_fallback: bool,
    ) -> ScrapeResult<ParseOutcome> {
        self.orchestrator.parse(url, preferred, allow_fallback).await
    }

    /// Parse the target listing, then search its comparables.
    ///
    /// Only the target parse can fail; the search itself always answers.
    pub async fn comparables_for(
        &self,
        url: &str,
        limit: usize,
        scope: Option<ScopeHint>,
        deadline: Option<Duration>,
    ) -> ScrapeResult<(TargetProperty, DiscoveryResult)> {
        let parsed = match deadline {
            Some(d) => self.orchestrator.parse_with_deadline(url, None, true, d).await?,
            None => self.orchestrator.parse(url, None, true).await?,
        };
        let target = TargetProperty::new(parsed.listing);
        let remaining = deadline.map(|d| d.saturating_sub(parsed.elapsed));
        let result = self.engine.find_comparables(&target, limit, scope, remaining).await;
        Ok((target, result))
    }

    pub fn sink_writer(&self) -> &SinkWriter {
        &self.writer
    }

    /// Wait for pending sink writes, then close every browser session.
    pub async fn shutdown(&self) {
        self.writer.flush().await;
        self.pool.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ScrapeError;
    use crate::sources::SourceId;

    #[test]
    fn test_builds_with_defaults() {
        let context = ScrapeContext::builder(RuntimeConfig::default()).build().unwrap();
        assert!(SourceId::ALL.iter().all(|s| context.normalizer().is_registered(*s)));
        assert_eq!(context.pool().max_browsers(), 3);
        assert!(context.stats().snapshot().is_empty());
    }

    #[test]
    fn test_rejects_invalid_config() {
        let mut config = RuntimeConfig::default();
        config.pool.max_browsers = 0;
        assert!(matches!(
            ScrapeContext::builder(config).build(),
            Err(ScrapeError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_unsupported_url_is_rejected_before_any_fetch() {
        let context = ScrapeContext::builder(RuntimeConfig::default()).build().unwrap();
        let err = context.parse("https://example.com/flat/1", None, true).await.unwrap_err();
        assert!(matches!(err, ScrapeError::NotSupported(_)));
        assert_eq!(context.orchestrator().fetcher_count(), 0);
    }

    #[tokio::test]
    async fn test_jsonl_sink_from_config_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RuntimeConfig::default();
        config.sink_path = Some(dir.path().join("out").join("listings.jsonl"));
        let context = ScrapeContext::builder(config).build().unwrap();
        assert!(dir.path().join("out").exists());
        context.shutdown().await;
        assert_eq!(context.pool().stats().open, 0);
    }
}
