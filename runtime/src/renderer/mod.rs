//! Browser-automation capability.
//!
//! Defines the `BrowserDriver`, `BrowserSession` and `PageContext` traits
//! that abstract over the browser engine (currently Chromium via
//! chromiumoxide). The pool and the browser techniques only see these traits.

pub mod chromium;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Desktop Chrome user-agent presented by hardened sessions.
pub const DESKTOP_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// Which flavour of browser a technique needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrowserProfileKind {
    Light,
    Hardened,
    Proxied,
}

/// Launch parameters for one browser session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BrowserProfile {
    pub kind: BrowserProfileKind,
    pub locale: String,
    /// Proxy server URL; only set for `Proxied` profiles.
    pub proxy: Option<String>,
}

impl BrowserProfile {
    pub fn new(kind: BrowserProfileKind, locale: impl Into<String>) -> Self {
        Self {
            kind,
            locale: locale.into(),
            proxy: None,
        }
    }

    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    /// Extra command-line flags for this profile.
    pub fn launch_args(&self) -> Vec<String> {
        let mut args = vec![
            "--headless=new".to_string(),
            "--disable-gpu".to_string(),
            "--no-sandbox".to_string(),
            "--disable-dev-shm-usage".to_string(),
            "--disable-extensions".to_string(),
            format!("--lang={}", self.locale),
        ];
        if matches!(self.kind, BrowserProfileKind::Hardened | BrowserProfileKind::Proxied) {
            args.push("--disable-blink-features=AutomationControlled".to_string());
            args.push(format!("--user-agent={DESKTOP_USER_AGENT}"));
            args.push("--window-size=1366,768".to_string());
        }
        if let Some(proxy) = &self.proxy {
            args.push(format!("--proxy-server={proxy}"));
        }
        args
    }
}

/// Result of navigating to a URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NavigationResult {
    /// The final URL after any redirects.
    pub final_url: String,
    /// Time taken to load the page in milliseconds.
    pub load_time_ms: u64,
}

/// A browser engine that can launch sessions.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    /// Launch a new browser session with the given profile.
    async fn launch(&self, profile: &BrowserProfile) -> Result<Box<dyn BrowserSession>>;
}

/// A launched browser process.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    /// Open a new isolated context (tab with its own state).
    async fn new_context(&self) -> Result<Box<dyn PageContext>>;
    /// Terminate the browser. Called exactly once, by the pool.
    async fn close(&self) -> Result<()>;
}

/// A single isolated page context.
#[async_trait]
pub trait PageContext: Send + Sync {
    /// Navigate to a URL with a timeout.
    async fn navigate(&mut self, url: &str, timeout_ms: u64) -> Result<NavigationResult>;
    /// Get the full page HTML.
    async fn get_html(&self) -> Result<String>;
    /// Close this context.
    async fn close(self: Box<Self>) -> Result<()>;
}

/// A driver used when no browser is installed. Every launch fails, so
/// browser techniques fail over while the direct-API technique keeps working.
pub struct NoopDriver;

#[async_trait]
impl BrowserDriver for NoopDriver {
    async fn launch(&self, _profile: &BrowserProfile) -> Result<Box<dyn BrowserSession>> {
        Err(anyhow::anyhow!("browser not available, HTTP-only mode"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_light_profile_has_no_stealth_flags() {
        let args = BrowserProfile::new(BrowserProfileKind::Light, "ru-RU").launch_args();
        assert!(args.contains(&"--lang=ru-RU".to_string()));
        assert!(!args.iter().any(|a| a.contains("AutomationControlled")));
        assert!(!args.iter().any(|a| a.starts_with("--proxy-server")));
    }

    #[test]
    fn test_proxied_profile_flags() {
        let args = BrowserProfile::new(BrowserProfileKind::Proxied, "ru-RU")
            .with_proxy("http://10.0.0.1:8080")
            .launch_args();
        assert!(args.iter().any(|a| a.contains("AutomationControlled")));
        assert!(args.contains(&"--proxy-server=http://10.0.0.1:8080".to_string()));
    }

    #[tokio::test]
    async fn test_noop_driver_fails_launch() {
        let profile = BrowserProfile::new(BrowserProfileKind::Light, "ru-RU");
        assert!(NoopDriver.launch(&profile).await.is_err());
    }
}
