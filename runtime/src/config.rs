//! Runtime configuration.
//!
//! Built from defaults, then overridden from `COMPS_*` environment variables,
//! then from CLI flags. Unparseable values are ignored with a warning.

use crate::error::{ScrapeError, ScrapeResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Browser pool sizing and recycling policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub max_browsers: usize,
    pub max_age_secs: u64,
    pub max_uses: u32,
    pub poll_interval_ms: u64,
    pub acquire_timeout_ms: u64,
}

impl PoolConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_browsers: 3,
            max_age_secs: 600,
            max_uses: 20,
            poll_interval_ms: 100,
            acquire_timeout_ms: 30_000,
        }
    }
}

/// Page fetching settings shared by every technique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    pub timeout_ms: u64,
    /// Extra wait before retrying a technique that hit a rate limit or challenge.
    pub block_backoff_ms: u64,
    pub locale: String,
    pub proxies: Vec<String>,
    pub cache_ttl_secs: u64,
    pub cache_max_entries: usize,
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn block_backoff(&self) -> Duration {
        Duration::from_millis(self.block_backoff_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 20_000,
            block_backoff_ms: 3_000,
            locale: "ru-RU".to_string(),
            proxies: Vec::new(),
            cache_ttl_secs: 3600,
            cache_max_entries: 500,
        }
    }
}

/// Comparable search policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Stop escalating once this many comparables are accepted.
    pub close_enough: usize,
    /// Target count inside the per-address neighbor loop.
    pub preferred: usize,
    /// Enables the city-wide and relaxed tiers after the geographic ones.
    pub broad_search: bool,
    /// Half-width of the street window around the target house number.
    pub street_window: u32,
    /// Half-width of the neighboring-house radius.
    pub neighbor_radius: u32,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            close_enough: 3,
            preferred: 8,
            broad_search: false,
            street_window: 5,
            neighbor_radius: 4,
        }
    }
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub pool: PoolConfig,
    pub fetch: FetchConfig,
    pub discovery: DiscoveryConfig,
    /// JSONL file receiving every fetched listing. `None` disables persistence.
    pub sink_path: Option<PathBuf>,
}

impl RuntimeConfig {
    /// Defaults overridden by `COMPS_*` process environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_with(|name| std::env::var(name).ok());
        config
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| lookup(name).map(|v| v.trim().to_string());

        override_parsed(&read, "COMPS_MAX_BROWSERS", &mut self.pool.max_browsers);
        override_parsed(&read, "COMPS_BROWSER_MAX_AGE_SECS", &mut self.pool.max_age_secs);
        override_parsed(&read, "COMPS_BROWSER_MAX_USES", &mut self.pool.max_uses);
        override_parsed(&read, "COMPS_ACQUIRE_TIMEOUT_MS", &mut self.pool.acquire_timeout_ms);
        override_parsed(&read, "COMPS_FETCH_TIMEOUT_MS", &mut self.fetch.timeout_ms);
        override_parsed(&read, "COMPS_BLOCK_BACKOFF_MS", &mut self.fetch.block_backoff_ms);
        override_parsed(&read, "COMPS_CLOSE_ENOUGH", &mut self.discovery.close_enough);
        override_parsed(&read, "COMPS_PREFERRED", &mut self.discovery.preferred);

        if let Some(locale) = read("COMPS_LOCALE").filter(|v| !v.is_empty()) {
            self.fetch.locale = locale;
        }
        if let Some(raw) = read("COMPS_PROXIES") {
            self.fetch.proxies = raw
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(raw) = read("COMPS_BROAD_SEARCH") {
            match raw.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => self.discovery.broad_search = true,
                "0" | "false" | "no" | "off" => self.discovery.broad_search = false,
                other => warn!("ignoring COMPS_BROAD_SEARCH={other}: expected a boolean"),
            }
        }
        if let Some(path) = read("COMPS_SINK_PATH").filter(|v| !v.is_empty()) {
            self.sink_path = Some(PathBuf::from(path));
        }
    }

    /// Default JSONL sink location (`~/.comps/listings.jsonl`).
    pub fn default_sink_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".comps")
            .join("listings.jsonl")
    }

    pub fn validate(&self) -> ScrapeResult<()> {
        if self.pool.max_browsers == 0 {
            return Err(ScrapeError::Config("max_browsers must be at least 1".into()));
        }
        if self.pool.max_uses == 0 {
            return Err(ScrapeError::Config("max_uses must be at least 1".into()));
        }
        if self.discovery.close_enough == 0 {
            return Err(ScrapeError::Config("close_enough must be at least 1".into()));
        }
        if self.discovery.close_enough > self.discovery.preferred {
            return Err(ScrapeError::Config(format!(
                "close_enough ({}) exceeds preferred ({})",
                self.discovery.close_enough, self.discovery.preferred
            )));
        }
        Ok(())
    }
}

fn override_parsed<T, R>(read: &R, name: &str, slot: &mut T)
where
    T: std::str::FromStr,
    R: Fn(&str) -> Option<String>,
{
    if let Some(raw) = read(name) {
        match raw.parse::<T>() {
            Ok(v) => *slot = v,
            Err(_) => warn!("ignoring {name}={raw}: not a valid value"),
        }
    }
}
