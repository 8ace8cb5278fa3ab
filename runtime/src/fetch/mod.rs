//! Plain HTTP page fetching.
//!
//! Not a browser, just HTTP requests. The orchestrator depends on the
//! [`PageFetcher`] capability only; [`HttpClient`] is the reqwest-backed
//! implementation. It follows redirects, retries 5xx with exponential
//! backoff, honours `Retry-After` on 429 and classifies rate limits and
//! anti-bot challenges as [`ScrapeError::TransientBlock`].

use crate::error::{ScrapeError, ScrapeResult};
use crate::renderer::DESKTOP_USER_AGENT;
use async_trait::async_trait;
use rand::Rng;
use std::time::{Duration, Instant};
use tracing::debug;

/// Longest `Retry-After` we are willing to sleep for.
const MAX_RETRY_AFTER_SECS: u64 = 10;

/// Bodies shorter than this are scanned for challenge markers.
const CHALLENGE_SCAN_LIMIT: usize = 16 * 1024;

const CHALLENGE_MARKERS: &[&str] = &[
    "captcha",
    "access denied",
    "доступ ограничен",
    "проверка браузера",
    "вы не робот",
];

/// A fetched page or API response.
#[derive(Debug, Clone)]
pub struct FetchedDocument {
    /// Requested URL.
    pub url: String,
    /// Final URL after redirects.
    pub final_url: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
}

impl FetchedDocument {
    pub fn is_json(&self) -> bool {
        self.content_type
            .as_deref()
            .map(|ct| ct.contains("json"))
            .unwrap_or(false)
            || self.body.trim_start().starts_with('{')
    }
}

/// `fetch(url, headers) -> body` capability used by HTTP-only techniques.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str, headers: &[(String, String)]) -> ScrapeResult<FetchedDocument>;
}

/// reqwest-backed [`PageFetcher`].
#[derive(Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    /// HTTP/1.1-only fallback client for CDNs that reject HTTP/2.
    h1_client: reqwest::Client,
    timeout: Duration,
    max_retries: u32,
    retry_base: Duration,
}

impl HttpClient {
    /// Create a client presenting a desktop Chrome user-agent and `locale`.
    pub fn new(timeout: Duration, locale: &str) -> Self {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Ok(value) = reqwest::header::HeaderValue::from_str(&accept_language(locale)) {
            headers.insert(reqwest::header::ACCEPT_LANGUAGE, value);
        }

        let build = |h1: bool| {
            let mut builder = reqwest::Client::builder()
                .timeout(timeout)
                .redirect(reqwest::redirect::Policy::limited(5))
                .user_agent(DESKTOP_USER_AGENT)
                .default_headers(headers.clone());
            if h1 {
                builder = builder.http1_only();
            }
            builder.build().unwrap_or_default()
        };

        Self {
            client: build(false),
            h1_client: build(true),
            timeout,
            max_retries: 2,
            retry_base: Duration::from_millis(500),
        }
    }

    /// Override the retry budget and the base delay of the exponential backoff.
    pub fn with_retries(mut self, max_retries: u32, retry_base: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_base = retry_base;
        self
    }

    /// GET with retry, falling back to HTTP/1.1 on protocol errors.
    pub async fn get(&self, url: &str, headers: &[(String, String)]) -> ScrapeResult<FetchedDocument> {
        match self.get_inner(&self.client, url, headers).await {
            Err(ScrapeError::Http(msg))
                if msg.contains("http2") || msg.contains("protocol") || msg.contains("connection closed") =>
            {
                debug!(url, "retrying over HTTP/1.1: {msg}");
                self.get_inner(&self.h1_client, url, headers).await
            }
            other => other,
        }
    }

    async fn get_inner(
        &self,
        client: &reqwest::Client,
        url: &str,
        headers: &[(String, String)],
    ) -> ScrapeResult<FetchedDocument> {
        let started = Instant::now();
        let mut retries = 0u32;

        loop {
            let mut request = client.get(url).timeout(self.timeout);
            for (name, value) in headers {
                request = request.header(name.as_str(), value.as_str());
            }

            let response = match request.send().await {
                Ok(r) => r,
                Err(e) if e.is_timeout() => {
                    return Err(ScrapeError::timeout(format!("GET {url}"), started.elapsed()));
                }
                Err(e) => {
                    if retries < self.max_retries {
                        retries += 1;
                        tokio::time::sleep(self.backoff(retries)).await;
                        continue;
                    }
                    return Err(ScrapeError::Http(format!("GET {url}: {e}")));
                }
            };

            let status = response.status().as_u16();

            if status >= 500 && retries < self.max_retries {
                retries += 1;
                debug!(url, status, retries, "server error, backing off");
                tokio::time::sleep(self.backoff(retries)).await;
                continue;
            }

            if status == 429 && retries < self.max_retries {
                retries += 1;
                let retry_after = response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.trim().parse::<u64>().ok())
                    .unwrap_or(2);
                debug!(url, retry_after, "rate limited, honouring Retry-After");
                tokio::time::sleep(Duration::from_secs(retry_after.min(MAX_RETRY_AFTER_SECS))).await;
                continue;
            }

            let final_url = response.url().to_string();
            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(String::from);
            let body = match response.text().await {
                Ok(body) => body,
                Err(e) if e.is_timeout() => {
                    return Err(ScrapeError::timeout(format!("GET {url}"), started.elapsed()));
                }
                Err(e) => return Err(ScrapeError::Http(format!("GET {url}: reading body: {e}"))),
            };

            let document = FetchedDocument {
                url: url.to_string(),
                final_url,
                status,
                content_type,
                body,
            };
            return classify(document);
        }
    }

    /// Exponential backoff with up to 20% random jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.retry_base * 2u32.pow(attempt.saturating_sub(1));
        let jitter_ms = base.as_millis() as u64 / 5;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

#[async_trait]
impl PageFetcher for HttpClient {
    async fn fetch(&self, url: &str, headers: &[(String, String)]) -> ScrapeResult<FetchedDocument> {
        self.get(url, headers).await
    }
}

/// Turn access-denied statuses and challenge pages into `TransientBlock`.
pub fn classify(document: FetchedDocument) -> ScrapeResult<FetchedDocument> {
    match document.status {
        403 | 429 => {
            return Err(ScrapeError::TransientBlock {
                url: document.url,
                reason: format!("HTTP {}", document.status),
            })
        }
        s if s >= 400 => {
            return Err(ScrapeError::Http(format!("GET {}: HTTP {s}", document.url)));
        }
        _ => {}
    }
    if let Some(marker) = challenge_marker(&document.body) {
        return Err(ScrapeError::TransientBlock {
            url: document.url,
            reason: format!("challenge page ({marker})"),
        });
    }
    Ok(document)
}

/// The first challenge marker found in a short page body.
pub fn challenge_marker(body: &str) -> Option<&'static str> {
    if body.len() > CHALLENGE_SCAN_LIMIT {
        return None;
    }
    let lower = body.to_lowercase();
    CHALLENGE_MARKERS.iter().copied().find(|m| lower.contains(m))
}

fn accept_language(locale: &str) -> String {
    match locale.split(['-', '_']).next() {
        Some(lang) if !lang.is_empty() && lang != locale => format!("{locale},{lang};q=0.9,en;q=0.5"),
        _ => locale.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client() -> HttpClient {
        HttpClient::new(Duration::from_secs(5), "ru-RU").with_retries(2, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_fetch_returns_body_and_sends_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/offer/1"))
            .and(header("accept", "application/json"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "application/json")
                    .set_body_string(r#"{"title":"Квартира"}"#),
            )
            .mount(&server)
            .await;

        let url = format!("{}/offer/1", server.uri());
        let doc = client()
            .fetch(&url, &[("accept".into(), "application/json".into())])
            .await
            .unwrap();
        assert_eq!(doc.status, 200);
        assert!(doc.is_json());
        assert!(doc.body.contains("Квартира"));
    }

    #[tokio::test]
    async fn test_server_error_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>ok</html>"))
            .mount(&server)
            .await;

        let doc = client().fetch(&format!("{}/flaky", server.uri()), &[]).await.unwrap();
        assert_eq!(doc.status, 200);
    }

    #[tokio::test]
    async fn test_truncated_body_is_an_error() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut request = [0u8; 1024];
                let _ = socket.read(&mut request).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 200 OK\r\ncontent-type: text/html\r\ncontent-length: 4096\r\n\r\n<html>")
                    .await;
                let _ = socket.shutdown().await;
            }
        });

        let err = client()
            .with_retries(0, Duration::from_millis(1))
            .fetch(&format!("http://{addr}/offer/1"), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ScrapeError::Http(ref msg) if msg.contains("reading body")), "{err}");
    }

    #[tokio::test]
    async fn test_forbidden_is_a_transient_block() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let err = client().fetch(&server.uri(), &[]).await.unwrap_err();
        assert!(matches!(err, ScrapeError::TransientBlock { .. }));
    }

    #[tokio::test]
    async fn test_persistent_rate_limit_is_a_transient_block() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
            .expect(3)
            .mount(&server)
            .await;

        let err = client().fetch(&server.uri(), &[]).await.unwrap_err();
        assert!(matches!(err, ScrapeError::TransientBlock { ref reason, .. } if reason == "HTTP 429"));
    }

    #[tokio::test]
    async fn test_challenge_page_is_a_transient_block() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("<html><title>Доступ ограничен</title>Подтвердите, что вы не робот</html>"),
            )
            .mount(&server)
            .await;

        let err = client().fetch(&server.uri(), &[]).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_not_found_is_an_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = client().fetch(&server.uri(), &[]).await.unwrap_err();
        assert!(matches!(err, ScrapeError::Http(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_large_pages_are_not_scanned_for_markers() {
        let mut body = "x".repeat(CHALLENGE_SCAN_LIMIT + 1);
        body.push_str("captcha");
        assert_eq!(challenge_marker(&body), None);
        assert_eq!(challenge_marker("<div>Captcha</div>"), Some("captcha"));
    }

    #[test]
    fn test_accept_language() {
        assert_eq!(accept_language("ru-RU"), "ru-RU,ru;q=0.9,en;q=0.5");
        assert_eq!(accept_language("ru"), "ru");
    }

    #[test]
    fn test_backoff_grows_with_bounded_jitter() {
        let client = HttpClient::new(Duration::from_secs(1), "ru-RU")
            .with_retries(3, Duration::from_millis(100));
        for attempt in 1..=3u32 {
            let base = 100 * 2u64.pow(attempt - 1);
            let delay = client.backoff(attempt).as_millis() as u64;
            assert!(delay >= base && delay <= base + base / 5, "attempt {attempt}: {delay}ms");
        }
    }
}
