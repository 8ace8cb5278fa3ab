//! Chromium driver on top of chromiumoxide.

use super::{BrowserDriver, BrowserProfile, BrowserSession, NavigationResult, PageContext};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::target::{CreateBrowserContextParams, CreateTargetParams};
use chromiumoxide::page::Page;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Executable names looked up on `PATH`, most specific first.
const PATH_BINARIES: &[&str] = &["google-chrome", "google-chrome-stable", "chromium", "chromium-browser"];

/// Install locations relative to the user's home directory.
#[cfg(target_os = "macos")]
const HOME_INSTALLS: &[&str] = &[
    ".comps/chromium/chrome-mac-arm64/Google Chrome for Testing.app/Contents/MacOS/Google Chrome for Testing",
    ".comps/chromium/chrome",
];
#[cfg(not(target_os = "macos"))]
const HOME_INSTALLS: &[&str] = &[".comps/chromium/chrome-linux64/chrome", ".comps/chromium/chrome"];

#[cfg(target_os = "macos")]
const SYSTEM_INSTALLS: &[&str] = &["/Applications/Google Chrome.app/Contents/MacOS/Google Chrome"];
#[cfg(not(target_os = "macos"))]
const SYSTEM_INSTALLS: &[&str] = &[];

/// Locate a Chrome or Chromium executable.
///
/// `COMPS_CHROMIUM_PATH` wins, then a private install under `~/.comps`,
/// then `PATH`, then the platform's default application folder.
pub fn find_chromium() -> Option<PathBuf> {
    let from_env = std::env::var_os("COMPS_CHROMIUM_PATH").map(PathBuf::from);
    let home = dirs::home_dir();
    let private = HOME_INSTALLS
        .iter()
        .filter_map(|rel| home.as_ref().map(|h| h.join(rel)));

    from_env
        .into_iter()
        .chain(private)
        .find(|p| p.exists())
        .or_else(|| PATH_BINARIES.iter().find_map(|bin| which::which(bin).ok()))
        .or_else(|| {
            SYSTEM_INSTALLS
                .iter()
                .map(PathBuf::from)
                .find(|p| p.exists())
        })
}

/// Launches one Chromium process per pooled session.
pub struct ChromiumDriver {
    executable: PathBuf,
}

impl ChromiumDriver {
    pub fn detect() -> Result<Self> {
        let executable = find_chromium()
            .context("no Chrome/Chromium executable found; install one or set COMPS_CHROMIUM_PATH")?;
        Ok(Self { executable })
    }

    pub fn path(&self) -> &Path {
        &self.executable
    }

    /// Start one Chromium process configured for `profile`.
    pub async fn start(&self, profile: &BrowserProfile) -> Result<ChromiumSession> {
        let config = profile
            .launch_args()
            .into_iter()
            .fold(
                BrowserConfig::builder().chrome_executable(&self.executable),
                |builder, arg| builder.arg(arg),
            )
            .build()
            .map_err(|e| anyhow!("invalid Chromium config for {:?} profile: {e}", profile.kind))?;

        let (browser, mut events) = Browser::launch(config)
            .await
            .with_context(|| format!("Chromium failed to start ({:?} profile)", profile.kind))?;

        // The CDP connection only makes progress while its event stream is drained.
        let pump = tokio::spawn(async move { while events.next().await.is_some() {} });

        Ok(ChromiumSession {
            browser: Arc::new(Mutex::new(Some(browser))),
            pump,
        })
    }
}

#[async_trait]
impl BrowserDriver for ChromiumDriver {
    async fn launch(&self, profile: &BrowserProfile) -> Result<Box<dyn BrowserSession>> {
        Ok(Box::new(self.start(profile).await?))
    }
}

pub struct ChromiumSession {
    browser: Arc<Mutex<Option<Browser>>>,
    pump: JoinHandle<()>,
}

impl ChromiumSession {
    /// Open a tab in a fresh browser context, so cookies and storage never
    /// carry over between leases of the same process.
    pub async fn open_tab(&self) -> Result<ChromiumTab> {
        let guard = self.browser.lock().await;
        let Some(browser) = guard.as_ref() else {
            return Err(anyhow!("Chromium session already closed"));
        };
        let context_id = browser
            .create_browser_context(CreateBrowserContextParams::default())
            .await
            .context("creating a browser context")?;

        let mut target = CreateTargetParams::new("about:blank");
        target.browser_context_id = Some(context_id.clone());
        let page = match browser.new_page(target).await {
            Ok(page) => page,
            Err(e) => {
                let _ = browser.dispose_browser_context(context_id).await;
                return Err(e).context("opening a tab");
            }
        };
        Ok(ChromiumTab {
            page,
            context_id,
            browser: Arc::clone(&self.browser),
        })
    }
}

#[async_trait]
impl BrowserSession for ChromiumSession {
    async fn new_context(&self) -> Result<Box<dyn PageContext>> {
        Ok(Box::new(self.open_tab().await?))
    }

    async fn close(&self) -> Result<()> {
        let Some(mut browser) = self.browser.lock().await.take() else {
            return Ok(());
        };
        let closed = browser.close().await;
        let _ = browser.wait().await;
        self.pump.abort();
        closed.map(drop).context("Chromium did not exit cleanly")
    }
}

/// One tab of a leased session, alone in its browser context.
pub struct ChromiumTab {
    page: Page,
    context_id: BrowserContextId,
    browser: Arc<Mutex<Option<Browser>>>,
}

#[async_trait]
impl PageContext for ChromiumTab {
    async fn navigate(&mut self, url: &str, timeout_ms: u64) -> Result<NavigationResult> {
        let started = Instant::now();
        tokio::time::timeout(Duration::from_millis(timeout_ms), async {
            self.page.goto(url).await?;
            self.page.wait_for_navigation().await?;
            Ok::<_, chromiumoxide::error::CdpError>(())
        })
        .await
        .map_err(|_| anyhow!("loading {url} took longer than {timeout_ms}ms"))?
        .with_context(|| format!("loading {url}"))?;

        let final_url = match self.page.url().await {
            Ok(Some(current)) => current,
            _ => url.to_string(),
        };
        Ok(NavigationResult {
            final_url,
            load_time_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn get_html(&self) -> Result<String> {
        self.page.content().await.context("reading page HTML")
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let ChromiumTab {
            page,
            context_id,
            browser,
        } = *self;
        let closed = page.close().await.context("closing tab");
        if let Some(browser) = browser.lock().await.as_ref() {
            browser
                .dispose_browser_context(context_id)
                .await
                .context("disposing browser context")?;
        }
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::BrowserProfileKind;

    #[tokio::test]
    #[ignore] // needs a local Chromium
    async fn test_hardened_tab_reads_cyrillic_markup() {
        let driver = ChromiumDriver::detect().unwrap();
        let profile = BrowserProfile::new(BrowserProfileKind::Hardened, "ru-RU");
        let session = driver.launch(&profile).await.unwrap();
        let mut tab = session.new_context().await.unwrap();

        tab.navigate("data:text/html,<h1>Квартира</h1>", 10_000).await.unwrap();
        let html = tab.get_html().await.unwrap();
        assert!(html.contains("<h1>Квартира</h1>"));

        tab.close().await.unwrap();
        session.close().await.unwrap();
    }

    #[tokio::test]
    #[ignore] // needs a local Chromium
    async fn test_tabs_do_not_share_browser_context() {
        let driver = ChromiumDriver::detect().unwrap();
        let profile = BrowserProfile::new(BrowserProfileKind::Light, "ru-RU");
        let session = driver.start(&profile).await.unwrap();

        let first = session.open_tab().await.unwrap();
        let second = session.open_tab().await.unwrap();
        assert_ne!(first.context_id, second.context_id);

        Box::new(first).close().await.unwrap();
        Box::new(second).close().await.unwrap();
        session.close().await.unwrap();
    }
}
