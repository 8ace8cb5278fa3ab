//! Orchestrator behaviour through the public context API.

use async_trait::async_trait;
use comps_runtime::config::RuntimeConfig;
use comps_runtime::context::ScrapeContext;
use comps_runtime::error::{ScrapeError, ScrapeResult};
use comps_runtime::renderer::{
    BrowserDriver, BrowserProfile, BrowserProfileKind, BrowserSession, NavigationResult, PageContext,
};
use comps_runtime::sources::{resolve_source, SourceId};
use comps_runtime::store::{ListingSink, SinkRecord};
use comps_runtime::strategy::fetchers::{FetcherFactory, TechniqueFetcher};
use comps_runtime::strategy::{AttemptOutcome, StatsBook, Technique};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct ScriptedFetcher {
    technique: Technique,
    fails: bool,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl TechniqueFetcher for ScriptedFetcher {
    fn technique(&self) -> Technique {
        self.technique
    }

    async fn fetch_listing(&self, url: &str) -> ScrapeResult<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fails {
            return Err(ScrapeError::Driver(format!("{} crashed", self.technique)));
        }
        Ok(json!({
            "url": url,
            "title": "2-комн. квартира, 75 м²",
            "price": 31_000_000,
            "total_area": 75.0,
            "rooms": 2,
            "address": "Москва, ул. Тверская, 12к2",
        }))
    }

    async fn fetch_catalog(&self, _url: &str) -> ScrapeResult<Vec<Value>> {
        Ok(Vec::new())
    }
}

struct ScriptedFactory {
    failing: Vec<Technique>,
    calls: Arc<AtomicUsize>,
}

impl FetcherFactory for ScriptedFactory {
    fn create(
        &self,
        _source: SourceId,
        technique: Technique,
        _locale: &str,
    ) -> ScrapeResult<Arc<dyn TechniqueFetcher>> {
        Ok(Arc::new(ScriptedFetcher {
            technique,
            fails: self.failing.contains(&technique),
            calls: Arc::clone(&self.calls),
        }))
    }
}

fn context_with(failing: Vec<Technique>) -> (ScrapeContext, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let factory = Arc::new(ScriptedFactory {
        failing,
        calls: Arc::clone(&calls),
    });
    let context = ScrapeContext::builder(RuntimeConfig::default())
        .factory(factory)
        .build()
        .unwrap();
    (context, calls)
}

const DOMCLICK_URL: &str = "https://domclick.ru/card/sale__flat__1234567890";

#[tokio::test]
async fn test_third_technique_succeeds_after_two_failures() {
    let (context, _) = context_with(vec![Technique::DirectApi, Technique::LightBrowser]);
    let outcome = context.parse(DOMCLICK_URL, None, true).await.unwrap();

    assert_eq!(outcome.technique_used, Technique::HardenedBrowser);
    assert_eq!(outcome.trace.len(), 3);
    assert_eq!(outcome.trace[0].outcome, AttemptOutcome::Error);
    assert_eq!(outcome.trace[1].outcome, AttemptOutcome::Error);
    assert_eq!(outcome.trace[2].outcome, AttemptOutcome::Success);
    assert_eq!(outcome.listing.source, Some(SourceId::Domclick));
    assert_eq!(outcome.listing.price, Some(31_000_000.0));

    let stats = context.stats();
    let api = stats.get(SourceId::Domclick, Technique::DirectApi);
    let light = stats.get(SourceId::Domclick, Technique::LightBrowser);
    let hardened = stats.get(SourceId::Domclick, Technique::HardenedBrowser);
    assert_eq!((api.failures, api.successes), (1, 0));
    assert_eq!((light.failures, light.successes), (1, 0));
    assert_eq!((hardened.failures, hardened.successes), (0, 1));
}

#[tokio::test]
async fn test_exhausted_chain_reports_full_trace() {
    let (context, calls) = context_with(Technique::ALL.to_vec());
    let err = context.parse(DOMCLICK_URL, None, true).await.unwrap_err();
    match err {
        ScrapeError::StrategyExhausted { url, trace } => {
            assert_eq!(url, DOMCLICK_URL);
            let order: Vec<_> = trace.iter().map(|t| t.technique).collect();
            assert_eq!(order, SourceId::Domclick.techniques().to_vec());
        }
        other => panic!("expected StrategyExhausted, got {other:?}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_second_parse_is_served_from_cache() {
    let (context, calls) = context_with(Vec::new());
    let first = context.parse(DOMCLICK_URL, None, true).await.unwrap();
    let second = context.parse(DOMCLICK_URL, None, true).await.unwrap();
    assert!(!first.from_cache);
    assert!(second.from_cache);
    assert_eq!(first.listing, second.listing);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unsupported_domain_is_not_retried() {
    let (context, calls) = context_with(Vec::new());
    let err = context
        .parse("https://example.org/sale/flat/1/", None, true)
        .await
        .unwrap_err();
    assert!(matches!(err, ScrapeError::NotSupported(_)));
    assert!(err.is_hard_failure());
    assert!(!err.is_retryable());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_parse_deadline_is_definitive_timeout() {
    struct Slow;

    #[async_trait]
    impl TechniqueFetcher for Slow {
        fn technique(&self) -> Technique {
            Technique::DirectApi
        }
        async fn fetch_listing(&self, _url: &str) -> ScrapeResult<Value> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(json!({}))
        }
        async fn fetch_catalog(&self, _url: &str) -> ScrapeResult<Vec<Value>> {
            Ok(Vec::new())
        }
    }

    struct SlowFactory;

    impl FetcherFactory for SlowFactory {
        fn create(&self, _: SourceId, _: Technique, _: &str) -> ScrapeResult<Arc<dyn TechniqueFetcher>> {
            Ok(Arc::new(Slow))
        }
    }

    let context = ScrapeContext::builder(RuntimeConfig::default())
        .factory(Arc::new(SlowFactory))
        .build()
        .unwrap();
    let err = context
        .orchestrator()
        .parse_with_deadline(DOMCLICK_URL, None, true, Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, ScrapeError::ResourceTimeout { .. }));
    assert!(err.is_retryable());
}

#[test]
fn test_resolve_source_is_pure_and_idempotent() {
    let urls = [
        ("https://www.cian.ru/sale/flat/312345678/", SourceId::Cian),
        ("https://spb.cian.ru/sale/flat/1/", SourceId::Cian),
        ("https://www.avito.ru/moskva/kvartiry/2-k._kvartira_54m_512et._4129385731", SourceId::Avito),
        (DOMCLICK_URL, SourceId::Domclick),
        ("https://realty.yandex.ru/offer/1234567890123/", SourceId::YandexRealty),
    ];
    for (url, expected) in urls {
        let first = resolve_source(url).unwrap();
        assert_eq!(first, expected, "{url}");
        assert_eq!(resolve_source(url).unwrap(), first);
    }
}

#[test]
fn test_stats_counters_commute_across_threads() {
    let book = Arc::new(StatsBook::new());
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let book = Arc::clone(&book);
            std::thread::spawn(move || {
                for j in 0..100 {
                    if (i + j) % 3 == 0 {
                        book.record_failure(SourceId::Avito, Technique::ProxyBrowser, Duration::from_millis(5));
                    } else {
                        book.record_success(SourceId::Avito, Technique::ProxyBrowser, Duration::from_millis(5));
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    let stats = book.get(SourceId::Avito, Technique::ProxyBrowser);
    assert_eq!(stats.attempts, 800);
    assert_eq!(stats.successes + stats.failures, stats.attempts);
    let rate = stats.success_rate();
    assert!((0.0..=1.0).contains(&rate));
}

struct StaticTab;

#[async_trait]
impl PageContext for StaticTab {
    async fn navigate(&mut self, url: &str, _timeout_ms: u64) -> anyhow::Result<NavigationResult> {
        Ok(NavigationResult {
            final_url: url.to_string(),
            load_time_ms: 1,
        })
    }

    async fn get_html(&self) -> anyhow::Result<String> {
        Ok("<html><head><title>Квартира</title></head></html>".into())
    }

    async fn close(self: Box<Self>) -> anyhow::Result<()> {
        Ok(())
    }
}

struct StaticSession;

#[async_trait]
impl BrowserSession for StaticSession {
    async fn new_context(&self) -> anyhow::Result<Box<dyn PageContext>> {
        Ok(Box::new(StaticTab))
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Chromium that takes 200ms to start.
struct SlowStartDriver;

#[async_trait]
impl BrowserDriver for SlowStartDriver {
    async fn launch(&self, _profile: &BrowserProfile) -> anyhow::Result<Box<dyn BrowserSession>> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(Box::new(StaticSession))
    }
}

#[tokio::test]
async fn test_parse_deadline_keeps_pool_capacity() {
    let mut config = RuntimeConfig::default();
    config.pool.max_browsers = 1;
    let context = ScrapeContext::builder(config)
        .driver(Arc::new(SlowStartDriver))
        .build()
        .unwrap();

    // Yandex starts with a browser technique, so the deadline hits mid-launch.
    let err = context
        .orchestrator()
        .parse_with_deadline(
            "https://realty.yandex.ru/offer/1234567890123/",
            None,
            true,
            Duration::from_millis(30),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ScrapeError::ResourceTimeout { .. }));

    let stats = context.pool().stats();
    assert_eq!((stats.pending, stats.leased), (0, 0));
    let profile = BrowserProfile::new(BrowserProfileKind::Light, "ru-RU");
    let lease = context
        .pool()
        .acquire(&profile, Duration::from_millis(500))
        .await
        .unwrap();
    context.pool().release(lease).await;
    context.shutdown().await;
}

/// Records every saved listing after a delay.
struct LaggingSink {
    saved: Arc<std::sync::Mutex<Vec<SinkRecord>>>,
}

#[async_trait]
impl ListingSink for LaggingSink {
    async fn save(&self, record: SinkRecord) -> ScrapeResult<()> {
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.saved.lock().unwrap().push(record);
        Ok(())
    }
}

#[tokio::test]
async fn test_shutdown_waits_for_sink_writes() {
    let saved = Arc::new(std::sync::Mutex::new(Vec::new()));
    let context = ScrapeContext::builder(RuntimeConfig::default())
        .factory(Arc::new(ScriptedFactory {
            failing: Vec::new(),
            calls: Arc::new(AtomicUsize::new(0)),
        }))
        .sink(Arc::new(LaggingSink {
            saved: Arc::clone(&saved),
        }))
        .build()
        .unwrap();

    context.parse(DOMCLICK_URL, None, true).await.unwrap();
    assert!(saved.lock().unwrap().is_empty());
    assert_eq!(context.sink_writer().pending(), 1);

    context.shutdown().await;
    let saved = saved.lock().unwrap();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].kind, "listing");
    assert_eq!(saved[0].technique, Some(Technique::DirectApi));
    assert_eq!(context.sink_writer().pending(), 0);
}
