//! Fetch techniques, per-technique statistics and the fallback trace.

pub mod fanout;
pub mod fetchers;
pub mod orchestrator;

use crate::renderer::BrowserProfileKind;
use crate::sources::SourceId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Consecutive failures after which a technique is demoted behind healthy ones.
pub const DEMOTE_AFTER_FAILURES: u32 = 3;

/// Smoothing factor of the latency moving average.
const LATENCY_ALPHA: f64 = 0.2;

/// One method of retrieving a page from a source site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Technique {
    DirectApi,
    LightBrowser,
    HardenedBrowser,
    ProxyBrowser,
}

impl Technique {
    pub const ALL: [Technique; 4] = [
        Technique::DirectApi,
        Technique::LightBrowser,
        Technique::HardenedBrowser,
        Technique::ProxyBrowser,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::DirectApi => "direct_api",
            Self::LightBrowser => "light_browser",
            Self::HardenedBrowser => "hardened_browser",
            Self::ProxyBrowser => "proxy_browser",
        }
    }

    /// Browser launch profile, or `None` for techniques that only need HTTP.
    pub fn browser_profile(self) -> Option<BrowserProfileKind> {
        match self {
            Self::DirectApi => None,
            Self::LightBrowser => Some(BrowserProfileKind::Light),
            Self::HardenedBrowser => Some(BrowserProfileKind::Hardened),
            Self::ProxyBrowser => Some(BrowserProfileKind::Proxied),
        }
    }
}

impl fmt::Display for Technique {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Technique {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "direct_api" | "api" => Ok(Self::DirectApi),
            "light_browser" | "light" => Ok(Self::LightBrowser),
            "hardened_browser" | "hardened" => Ok(Self::HardenedBrowser),
            "proxy_browser" | "proxy" => Ok(Self::ProxyBrowser),
            other => Err(format!("unknown technique: {other}")),
        }
    }
}

/// Counters for one (source, technique) pair.
///
/// `successes + failures == attempts` holds after any sequence of records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StrategyStats {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    pub avg_latency_ms: f64,
}

impl StrategyStats {
    pub fn record_success(&mut self, elapsed: Duration) {
        self.attempts += 1;
        self.successes += 1;
        self.consecutive_failures = 0;
        self.observe_latency(elapsed);
    }

    pub fn record_failure(&mut self, elapsed: Duration) {
        self.attempts += 1;
        self.failures += 1;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.observe_latency(elapsed);
    }

    /// Success ratio in `[0, 1]`; zero before any attempt.
    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.successes as f64 / self.attempts as f64
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.consecutive_failures >= DEMOTE_AFTER_FAILURES
    }

    fn observe_latency(&mut self, elapsed: Duration) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        if self.attempts == 1 {
            self.avg_latency_ms = ms;
        } else {
            self.avg_latency_ms = LATENCY_ALPHA * ms + (1.0 - LATENCY_ALPHA) * self.avg_latency_ms;
        }
    }
}

/// A row of the stats snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct StatsRow {
    pub source: SourceId,
    pub technique: Technique,
    #[serde(flatten)]
    pub stats: StrategyStats,
    pub success_rate: f64,
}

/// Process-wide technique statistics, guarded by a single mutex.
#[derive(Debug, Default)]
pub struct StatsBook {
    inner: Mutex<HashMap<(SourceId, Technique), StrategyStats>>,
}

impl StatsBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, source: SourceId, technique: Technique, elapsed: Duration) {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        map.entry((source, technique))
            .or_default()
            .record_success(elapsed);
    }

    pub fn record_failure(&self, source: SourceId, technique: Technique, elapsed: Duration) {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        map.entry((source, technique))
            .or_default()
            .record_failure(elapsed);
    }

    pub fn get(&self, source: SourceId, technique: Technique) -> StrategyStats {
        let map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        map.get(&(source, technique)).copied().unwrap_or_default()
    }

    /// All recorded pairs, sorted by source then technique.
    pub fn snapshot(&self) -> Vec<StatsRow> {
        let map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let mut rows: Vec<StatsRow> = map
            .iter()
            .map(|(&(source, technique), stats)| StatsRow {
                source,
                technique,
                stats: *stats,
                success_rate: stats.success_rate(),
            })
            .collect();
        rows.sort_by_key(|r| (r.source, r.technique));
        rows
    }

    /// Static chain with degraded techniques moved behind healthy ones.
    ///
    /// The sort is stable, so the relative static order is kept inside each group.
    pub fn ordered_chain(&self, source: SourceId, chain: &[Technique]) -> Vec<Technique> {
        let map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let mut ordered = chain.to_vec();
        ordered.sort_by_key(|t| {
            map.get(&(source, *t))
                .map(StrategyStats::is_degraded)
                .unwrap_or(false)
        });
        ordered
    }
}

/// Outcome of one technique attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    /// The fetch worked but required fields were missing after normalization.
    Empty,
    Error,
    Blocked,
    TimedOut,
}

/// One entry of the ordered fallback trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub technique: Technique,
    pub outcome: AttemptOutcome,
    pub elapsed_ms: u64,
    pub detail: Option<String>,
}

impl TraceEntry {
    pub fn new(technique: Technique, outcome: AttemptOutcome, elapsed: Duration) -> Self {
        Self {
            technique,
            outcome,
            elapsed_ms: elapsed.as_millis() as u64,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}
