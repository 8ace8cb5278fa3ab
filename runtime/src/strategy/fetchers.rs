//! Technique fetchers.
//!
//! A [`TechniqueFetcher`] retrieves raw listing payloads with one technique.
//! The direct-API technique goes through the [`PageFetcher`] capability;
//! browser techniques lease a session from the [`BrowserPool`] with the
//! matching launch profile, render the page and hand the HTML to the
//! source's extraction adapter.

use super::Technique;
use crate::config::FetchConfig;
use crate::error::{ScrapeError, ScrapeResult};
use crate::fetch::{classify, FetchedDocument, PageFetcher};
use crate::pool::BrowserPool;
use crate::renderer::{BrowserProfile, BrowserProfileKind};
use crate::sources::extract::{extract_catalog, extract_listing};
use crate::sources::SourceId;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Retrieves raw payloads for one (source, technique) pair.
#[async_trait]
pub trait TechniqueFetcher: Send + Sync {
    fn technique(&self) -> Technique;

    /// Raw payload of a single listing page.
    async fn fetch_listing(&self, url: &str) -> ScrapeResult<Value>;

    /// Raw payloads of every listing on a catalog page.
    async fn fetch_catalog(&self, url: &str) -> ScrapeResult<Vec<Value>>;
}

/// Creates fetchers on first use. The orchestrator caches what it returns.
pub trait FetcherFactory: Send + Sync {
    fn create(
        &self,
        source: SourceId,
        technique: Technique,
        locale: &str,
    ) -> ScrapeResult<Arc<dyn TechniqueFetcher>>;
}

/// Round-robin over the configured proxy list.
#[derive(Debug, Default)]
pub struct ProxyRotation {
    proxies: Vec<String>,
    next: AtomicUsize,
}

impl ProxyRotation {
    pub fn new(proxies: Vec<String>) -> Self {
        Self {
            proxies,
            next: AtomicUsize::new(0),
        }
    }

    pub fn next_proxy(&self) -> Option<&str> {
        if self.proxies.is_empty() {
            return None;
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.proxies.len();
        Some(&self.proxies[i])
    }
}

/// JSON endpoint first, plain page second, over the HTTP capability.
pub struct DirectApiFetcher {
    source: SourceId,
    http: Arc<dyn PageFetcher>,
}

impl DirectApiFetcher {
    pub fn new(source: SourceId, http: Arc<dyn PageFetcher>) -> Self {
        Self { source, http }
    }
}

#[async_trait]
impl TechniqueFetcher for DirectApiFetcher {
    fn technique(&self) -> Technique {
        Technique::DirectApi
    }

    async fn fetch_listing(&self, url: &str) -> ScrapeResult<Value> {
        let target = self.source.api_url(url).unwrap_or_else(|| url.to_string());
        let headers = vec![
            ("accept".to_string(), "application/json, text/html;q=0.8".to_string()),
            ("referer".to_string(), self.source.origin().to_string()),
        ];
        let doc = self.http.fetch(&target, &headers).await?;
        let mut payload = extract_listing(self.source, &doc)?;
        // API responses carry their own URL; the listing is known by its page URL.
        if let Value::Object(obj) = &mut payload {
            if target != url {
                obj.insert("url".into(), Value::String(url.to_string()));
            }
        }
        Ok(payload)
    }

    async fn fetch_catalog(&self, url: &str) -> ScrapeResult<Vec<Value>> {
        let headers = vec![("accept".to_string(), "text/html,application/json".to_string())];
        let doc = self.http.fetch(url, &headers).await?;
        extract_catalog(self.source, &doc)
    }
}

/// Renders pages in a pooled browser session.
pub struct BrowserFetcher {
    source: SourceId,
    technique: Technique,
    kind: BrowserProfileKind,
    locale: String,
    pool: Arc<BrowserPool>,
    proxies: Arc<ProxyRotation>,
    acquire_timeout: Duration,
    navigation_timeout: Duration,
}

impl BrowserFetcher {
    pub fn new(
        source: SourceId,
        technique: Technique,
        kind: BrowserProfileKind,
        locale: &str,
        pool: Arc<BrowserPool>,
        proxies: Arc<ProxyRotation>,
    ) -> Self {
        Self {
            source,
            technique,
            kind,
            locale: locale.to_string(),
            pool,
            proxies,
            acquire_timeout: Duration::from_secs(30),
            navigation_timeout: Duration::from_secs(20),
        }
    }

    pub fn with_timeouts(mut self, acquire: Duration, navigation: Duration) -> Self {
        self.acquire_timeout = acquire;
        self.navigation_timeout = navigation;
        self
    }

    fn profile(&self) -> ScrapeResult<BrowserProfile> {
        let profile = BrowserProfile::new(self.kind, self.locale.clone());
        if self.kind != BrowserProfileKind::Proxied {
            return Ok(profile);
        }
        match self.proxies.next_proxy() {
            Some(proxy) => Ok(profile.with_proxy(proxy)),
            None => Err(ScrapeError::Config("proxy technique needs COMPS_PROXIES".into())),
        }
    }

    async fn render(&self, url: &str) -> ScrapeResult<FetchedDocument> {
        let profile = self.profile()?;
        let mut lease = self.pool.acquire(&profile, self.acquire_timeout).await?;
        let started = Instant::now();
        let timeout_ms = self.navigation_timeout.as_millis() as u64;

        let rendered = async {
            let context = lease.context()?;
            let nav = context
                .navigate(url, timeout_ms)
                .await
                .map_err(|e| navigation_error(url, started.elapsed(), e))?;
            let html = context
                .get_html()
                .await
                .map_err(|e| ScrapeError::Driver(format!("{e:#}")))?;
            Ok::<_, ScrapeError>((nav.final_url, html))
        }
        .await;
        self.pool.release(lease).await;

        let (final_url, body) = rendered?;
        debug!(
            source = %self.source,
            technique = %self.technique,
            bytes = body.len(),
            "rendered {url} in {}ms",
            started.elapsed().as_millis()
        );
        classify(FetchedDocument {
            url: url.to_string(),
            final_url,
            status: 200,
            content_type: Some("text/html".into()),
            body,
        })
    }
}

fn navigation_error(url: &str, elapsed: Duration, e: anyhow::Error) -> ScrapeError {
    let message = format!("{e:#}");
    if message.contains("timeout") || message.contains("timed out") {
        ScrapeError::timeout(format!("navigation to {url}"), elapsed)
    } else {
        ScrapeError::Driver(message)
    }
}

#[async_trait]
impl TechniqueFetcher for BrowserFetcher {
    fn technique(&self) -> Technique {
        self.technique
    }

    async fn fetch_listing(&self, url: &str) -> ScrapeResult<Value> {
        let doc = self.render(url).await?;
        extract_listing(self.source, &doc)
    }

    async fn fetch_catalog(&self, url: &str) -> ScrapeResult<Vec<Value>> {
        let doc = self.render(url).await?;
        extract_catalog(self.source, &doc)
    }
}

/// The production factory: HTTP capability plus the shared browser pool.
pub struct StandardFetcherFactory {
    http: Arc<dyn PageFetcher>,
    pool: Arc<BrowserPool>,
    proxies: Arc<ProxyRotation>,
    acquire_timeout: Duration,
    navigation_timeout: Duration,
}

impl StandardFetcherFactory {
    pub fn new(
        http: Arc<dyn PageFetcher>,
        pool: Arc<BrowserPool>,
        fetch: &FetchConfig,
        acquire_timeout: Duration,
    ) -> Self {
        Self {
            http,
            pool,
            proxies: Arc::new(ProxyRotation::new(fetch.proxies.clone())),
            acquire_timeout,
            navigation_timeout: fetch.timeout(),
        }
    }
}

impl FetcherFactory for StandardFetcherFactory {
    fn create(
        &self,
        source: SourceId,
        technique: Technique,
        locale: &str,
    ) -> ScrapeResult<Arc<dyn TechniqueFetcher>> {
        debug!(source = %source, technique = %technique, locale, "instantiating fetcher");
        match technique.browser_profile() {
            None => Ok(Arc::new(DirectApiFetcher::new(source, Arc::clone(&self.http)))),
            Some(kind) => Ok(Arc::new(
                BrowserFetcher::new(
                    source,
                    technique,
                    kind,
                    locale,
                    Arc::clone(&self.pool),
                    Arc::clone(&self.proxies),
                )
                .with_timeouts(self.acquire_timeout, self.navigation_timeout),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::renderer::{BrowserDriver, BrowserSession, NavigationResult, NoopDriver, PageContext};
    use std::sync::Mutex;

    struct StaticPage(&'static str);

    #[async_trait]
    impl PageFetcher for StaticPage {
        async fn fetch(&self, url: &str, _headers: &[(String, String)]) -> ScrapeResult<FetchedDocument> {
            Ok(FetchedDocument {
                url: url.to_string(),
                final_url: url.to_string(),
                status: 200,
                content_type: Some("application/json".into()),
                body: self.0.to_string(),
            })
        }
    }

    /// Records the proxy of every launched profile and serves one fixed page.
    struct RecordingDriver {
        html: &'static str,
        proxies: Arc<Mutex<Vec<Option<String>>>>,
    }

    struct Session(&'static str);
    struct Context(&'static str);

    #[async_trait]
    impl BrowserDriver for RecordingDriver {
        async fn launch(&self, profile: &BrowserProfile) -> anyhow::Result<Box<dyn BrowserSession>> {
            self.proxies.lock().unwrap().push(profile.proxy.clone());
            Ok(Box::new(Session(self.html)))
        }
    }

    #[async_trait]
    impl BrowserSession for Session {
        async fn new_context(&self) -> anyhow::Result<Box<dyn PageContext>> {
            Ok(Box::new(Context(self.0)))
        }
        async fn close(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl PageContext for Context {
        async fn navigate(&mut self, url: &str, _timeout_ms: u64) -> anyhow::Result<NavigationResult> {
            Ok(NavigationResult {
                final_url: url.to_string(),
                load_time_ms: 3,
            })
        }
        async fn get_html(&self) -> anyhow::Result<String> {
            Ok(self.0.to_string())
        }
        async fn close(self: Box<Self>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn pool(driver: Arc<dyn BrowserDriver>) -> Arc<BrowserPool> {
        let config = PoolConfig {
            max_uses: 1,
            ..PoolConfig::default()
        };
        Arc::new(BrowserPool::new(driver, &config))
    }

    #[tokio::test]
    async fn test_direct_api_keeps_page_url() {
        let http = Arc::new(StaticPage(r#"{"offer":{"title":"Квартира","bargainTerms":{"priceRur":1}}}"#));
        let fetcher = DirectApiFetcher::new(SourceId::Cian, http);
        let payload = fetcher
            .fetch_listing("https://www.cian.ru/sale/flat/312345678/")
            .await
            .unwrap();
        assert_eq!(payload["url"], "https://www.cian.ru/sale/flat/312345678/");
        assert_eq!(payload["title"], "Квартира");
    }

    #[tokio::test]
    async fn test_proxy_browser_rotates_proxies() {
        let proxies = Arc::new(Mutex::new(Vec::new()));
        let driver = Arc::new(RecordingDriver {
            html: r#"<html><script>window.__state__ = {"item":{"title":"t","priceDetailed":{"value":5}}};</script></html>"#,
            proxies: Arc::clone(&proxies),
        });
        let rotation = Arc::new(ProxyRotation::new(vec!["http://p1:1".into(), "http://p2:2".into()]));
        let fetcher = BrowserFetcher::new(
            SourceId::Avito,
            Technique::ProxyBrowser,
            BrowserProfileKind::Proxied,
            "ru-RU",
            pool(driver),
            rotation,
        );
        for _ in 0..3 {
            let payload = fetcher.fetch_listing("https://www.avito.ru/moskva/kvartiry/x_1234").await.unwrap();
            assert_eq!(payload["title"], "t");
        }
        assert_eq!(
            *proxies.lock().unwrap(),
            vec![
                Some("http://p1:1".to_string()),
                Some("http://p2:2".to_string()),
                Some("http://p1:1".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_proxy_technique_without_proxies_fails() {
        let fetcher = BrowserFetcher::new(
            SourceId::Cian,
            Technique::ProxyBrowser,
            BrowserProfileKind::Proxied,
            "ru-RU",
            pool(Arc::new(NoopDriver)),
            Arc::new(ProxyRotation::default()),
        );
        let err = fetcher.fetch_listing("https://www.cian.ru/sale/flat/1234/").await.unwrap_err();
        assert!(matches!(err, ScrapeError::Config(_)));
    }

    #[tokio::test]
    async fn test_rendered_challenge_page_is_blocked() {
        let driver = Arc::new(RecordingDriver {
            html: "<html><body>Подтвердите, что вы не робот</body></html>",
            proxies: Arc::new(Mutex::new(Vec::new())),
        });
        let fetcher = BrowserFetcher::new(
            SourceId::Cian,
            Technique::HardenedBrowser,
            BrowserProfileKind::Hardened,
            "ru-RU",
            pool(driver),
            Arc::new(ProxyRotation::default()),
        );
        let err = fetcher.fetch_listing("https://www.cian.ru/sale/flat/1234/").await.unwrap_err();
        assert!(matches!(err, ScrapeError::TransientBlock { .. }));
    }

    #[tokio::test]
    async fn test_failed_launch_surfaces_driver_error() {
        let fetcher = BrowserFetcher::new(
            SourceId::Domclick,
            Technique::LightBrowser,
            BrowserProfileKind::Light,
            "ru-RU",
            pool(Arc::new(NoopDriver)),
            Arc::new(ProxyRotation::default()),
        );
        let err = fetcher.fetch_listing("https://domclick.ru/card/sale__flat__1234").await.unwrap_err();
        assert!(matches!(err, ScrapeError::Driver(_)));
    }
}
