//! Browser pool bounds under concurrent load.

use async_trait::async_trait;
use comps_runtime::config::PoolConfig;
use comps_runtime::pool::BrowserPool;
use comps_runtime::renderer::{
    BrowserDriver, BrowserProfile, BrowserProfileKind, BrowserSession, NavigationResult, PageContext,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct Live {
    open: AtomicUsize,
    peak: AtomicUsize,
}

struct CountingDriver(Arc<Live>);

/// A driver whose launches take a while, so callers can give up mid-launch.
struct SlowDriver {
    live: Arc<Live>,
    launch_time: Duration,
}

#[async_trait]
impl BrowserDriver for SlowDriver {
    async fn launch(&self, profile: &BrowserProfile) -> anyhow::Result<Box<dyn BrowserSession>> {
        tokio::time::sleep(self.launch_time).await;
        CountingDriver(Arc::clone(&self.live)).launch(profile).await
    }
}

struct CountingSession(Arc<Live>);

struct BlankPage;

#[async_trait]
impl BrowserDriver for CountingDriver {
    async fn launch(&self, _profile: &BrowserProfile) -> anyhow::Result<Box<dyn BrowserSession>> {
        tokio::time::sleep(Duration::from_millis(3)).await;
        let now = self.0.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.0.peak.fetch_max(now, Ordering::SeqCst);
        Ok(Box::new(CountingSession(Arc::clone(&self.0))))
    }
}

#[async_trait]
impl BrowserSession for CountingSession {
    async fn new_context(&self) -> anyhow::Result<Box<dyn PageContext>> {
        Ok(Box::new(BlankPage))
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.0.open.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl PageContext for BlankPage {
    async fn navigate(&mut self, url: &str, _timeout_ms: u64) -> anyhow::Result<NavigationResult> {
        Ok(NavigationResult {
            final_url: url.to_string(),
            load_time_ms: 1,
        })
    }

    async fn get_html(&self) -> anyhow::Result<String> {
        Ok("<html><body></body></html>".into())
    }

    async fn close(self: Box<Self>) -> anyhow::Result<()> {
        Ok(())
    }
}

fn pool(max_browsers: usize, max_uses: u32) -> (Arc<BrowserPool>, Arc<Live>) {
    let live = Arc::new(Live::default());
    let config = PoolConfig {
        max_browsers,
        max_age_secs: 600,
        max_uses,
        poll_interval_ms: 2,
        acquire_timeout_ms: 5_000,
    };
    let pool = BrowserPool::new(Arc::new(CountingDriver(Arc::clone(&live))), &config);
    (Arc::new(pool), live)
}

#[tokio::test]
async fn test_concurrent_leases_never_exceed_capacity() {
    let (pool, live) = pool(3, 4);
    let mut tasks = Vec::new();
    for i in 0..24 {
        let pool = Arc::clone(&pool);
        tasks.push(tokio::spawn(async move {
            let kind = if i % 2 == 0 {
                BrowserProfileKind::Light
            } else {
                BrowserProfileKind::Hardened
            };
            let profile = BrowserProfile::new(kind, "ru-RU");
            let mut lease = pool.acquire(&profile, Duration::from_secs(5)).await.unwrap();
            let stats = pool.stats();
            assert!(stats.leased <= 3, "leased {} > 3", stats.leased);
            assert!(stats.open + stats.pending <= 3);
            lease
                .context()
                .unwrap()
                .navigate("https://www.cian.ru/sale/flat/1/", 1_000)
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
            pool.release(lease).await;
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert!(live.peak.load(Ordering::SeqCst) <= 3);
    assert_eq!(pool.stats().leased, 0);
}

#[tokio::test]
async fn test_shutdown_closes_every_session() {
    let (pool, live) = pool(2, 100);
    let profile = BrowserProfile::new(BrowserProfileKind::Light, "ru-RU");
    let held = pool.acquire(&profile, Duration::from_secs(1)).await.unwrap();
    let free = pool.acquire(&profile, Duration::from_secs(1)).await.unwrap();
    pool.release(free).await;

    pool.shutdown().await;
    let stats = pool.stats();
    assert_eq!(stats.open, 0);
    assert_eq!(stats.created, stats.closed);
    assert_eq!(live.open.load(Ordering::SeqCst), 0);

    drop(held);
    assert!(pool.acquire(&profile, Duration::from_millis(20)).await.is_err());
}

#[tokio::test]
async fn test_cancelled_launch_returns_capacity() {
    let live = Arc::new(Live::default());
    let config = PoolConfig {
        max_browsers: 1,
        max_age_secs: 600,
        max_uses: 10,
        poll_interval_ms: 2,
        acquire_timeout_ms: 1_000,
    };
    let driver = SlowDriver {
        live: Arc::clone(&live),
        launch_time: Duration::from_millis(200),
    };
    let pool = BrowserPool::new(Arc::new(driver), &config);
    let profile = BrowserProfile::new(BrowserProfileKind::Light, "ru-RU");

    let abandoned = tokio::time::timeout(
        Duration::from_millis(20),
        pool.acquire(&profile, Duration::from_secs(1)),
    )
    .await;
    assert!(abandoned.is_err());
    let stats = pool.stats();
    assert_eq!((stats.pending, stats.open, stats.leased), (0, 0, 0));

    let lease = pool.acquire(&profile, Duration::from_millis(500)).await.unwrap();
    assert_eq!(pool.stats().leased, 1);
    pool.release(lease).await;
}

/// A tab whose close never finishes.
struct HangingTab;

#[async_trait]
impl PageContext for HangingTab {
    async fn navigate(&mut self, url: &str, _timeout_ms: u64) -> anyhow::Result<NavigationResult> {
        Ok(NavigationResult {
            final_url: url.to_string(),
            load_time_ms: 1,
        })
    }

    async fn get_html(&self) -> anyhow::Result<String> {
        Ok(String::new())
    }

    async fn close(self: Box<Self>) -> anyhow::Result<()> {
        std::future::pending::<()>().await;
        Ok(())
    }
}

struct HangingSession;

#[async_trait]
impl BrowserSession for HangingSession {
    async fn new_context(&self) -> anyhow::Result<Box<dyn PageContext>> {
        Ok(Box::new(HangingTab))
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

struct HangingDriver;

#[async_trait]
impl BrowserDriver for HangingDriver {
    async fn launch(&self, _profile: &BrowserProfile) -> anyhow::Result<Box<dyn BrowserSession>> {
        Ok(Box::new(HangingSession))
    }
}

#[tokio::test]
async fn test_cancelled_release_frees_slot() {
    let config = PoolConfig {
        max_browsers: 1,
        max_age_secs: 600,
        max_uses: 10,
        poll_interval_ms: 2,
        acquire_timeout_ms: 1_000,
    };
    let pool = BrowserPool::new(Arc::new(HangingDriver), &config);
    let profile = BrowserProfile::new(BrowserProfileKind::Light, "ru-RU");

    let lease = pool.acquire(&profile, Duration::from_secs(1)).await.unwrap();
    let release = tokio::time::timeout(Duration::from_millis(20), pool.release(lease)).await;
    assert!(release.is_err());
    assert_eq!(pool.stats().leased, 0);

    let again = pool.acquire(&profile, Duration::from_millis(100)).await.unwrap();
    assert_eq!(pool.stats().open, 1);
    drop(again);
}
