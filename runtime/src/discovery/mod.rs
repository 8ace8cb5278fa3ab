//! Comparable discovery: a cascading, geographically tight search.
//!
//! Tiers run in a fixed order and the whole search stops as soon as the
//! close-enough count is reached. Every raw candidate goes through region,
//! plausibility and schema validation before the cross-tier dedup, and
//! rejections never escape the tier that produced them.

pub mod neighbors;
pub mod tiers;
pub mod transit;
pub mod validate;

use crate::config::DiscoveryConfig;
use crate::error::{ScrapeError, ScrapeResult};
use crate::listing::address::parse_address;
use crate::listing::{normalize_key_text, PropertyListing, TargetProperty};
use crate::sources::{SearchQuery, SourceId};
use crate::store::{SinkRecord, SinkWriter};
use crate::strategy::fanout::{fan_out, FanOutResult, ListingProvider};
use neighbors::neighboring_houses;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tiers::{SearchTier, Tolerance};
use tracing::{debug, info, warn};
use transit::{normalize_station, one_hop};
use uuid::Uuid;
use validate::{validate_candidate, Deduplicator};

/// Words that do not identify a residential complex by themselves.
const COMPLEX_STOP_WORDS: &[&str] = &["жк", "жилой", "комплекс", "квартал", "дом"];

/// Which geographic filter the DistrictOrStop tier prefers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeHint {
    Stop,
    District,
}

impl FromStr for ScopeHint {
    type Err = ScrapeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stop" | "metro" => Ok(Self::Stop),
            "district" => Ok(Self::District),
            other => Err(ScrapeError::Config(format!("unknown scope hint: {other}"))),
        }
    }
}

/// An accepted comparable and where it came from.
#[derive(Debug, Clone, Serialize)]
pub struct Comparable {
    pub listing: PropertyListing,
    pub tier: SearchTier,
    /// House-number distance, or relative price closeness for band tiers.
    pub distance: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TierStatus {
    Completed,
    Skipped,
    Failed,
    TimedOut,
}

/// One line of the tier trace.
#[derive(Debug, Clone, Serialize)]
pub struct TierReport {
    pub tier: SearchTier,
    pub status: TierStatus,
    pub fetched: usize,
    pub accepted: usize,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl fmt::Display for TierReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<20} {:<10} fetched={:<4} accepted={:<3} {}ms",
            self.tier.as_str(),
            format!("{:?}", self.status).to_lowercase(),
            self.fetched,
            self.accepted,
            self.elapsed_ms
        )?;
        if let Some(detail) = &self.detail {
            write!(f, "  {detail}")?;
        }
        Ok(())
    }
}

/// Ranked comparables plus the trace of every tier that ran.
///
/// An empty comparable list is a valid answer, not an error.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DiscoveryResult {
    pub comparables: Vec<Comparable>,
    pub tier_trace: Vec<TierReport>,
}

impl DiscoveryResult {
    pub fn ran(&self, tier: SearchTier) -> bool {
        self.tier_trace
            .iter()
            .any(|r| r.tier == tier && r.status != TierStatus::Skipped)
    }

    pub fn listings(&self) -> impl Iterator<Item = &PropertyListing> {
        self.comparables.iter().map(|c| &c.listing)
    }
}

enum TierOutcome {
    Ran,
    Skipped(&'static str),
}

/// Per-request mutable search state. Tiers append to it directly so that
/// whatever was accepted before a deadline survives cancellation.
struct SearchState {
    accepted: Vec<Comparable>,
    seen: Deduplicator,
    /// Raw DistrictOrStop results, re-filtered by NeighboringStops.
    district_pool: Vec<PropertyListing>,
    fetched: usize,
}

impl SearchState {
    fn new(target: &TargetProperty) -> Self {
        let mut seen = Deduplicator::new();
        seen.insert(target.listing());
        Self {
            accepted: Vec::new(),
            seen,
            district_pool: Vec::new(),
            fetched: 0,
        }
    }
}

/// Multi-tier comparable search over a [`ListingProvider`].
pub struct ComparableEngine {
    provider: Arc<dyn ListingProvider>,
    config: DiscoveryConfig,
    sources: Vec<SourceId>,
    sink: Option<SinkWriter>,
}

impl ComparableEngine {
    pub fn new(provider: Arc<dyn ListingProvider>, config: DiscoveryConfig) -> Self {
        Self {
            provider,
            config,
            sources: SourceId::ALL.to_vec(),
            sink: None,
        }
    }

    /// Restrict fan-out tiers to these sources.
    pub fn with_sources(mut self, sources: Vec<SourceId>) -> Self {
        self.sources = sources;
        self
    }

    pub fn with_sink(mut self, sink: SinkWriter) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Run the tier cascade for `target`.
    ///
    /// Stops before a tier once `close_enough` (or `limit`) comparables are
    /// accepted. On `deadline` expiry the in-flight tier is abandoned and the
    /// comparables validated so far are returned.
    pub async fn find_comparables(
        &self,
        target: &TargetProperty,
        limit: usize,
        scope: Option<ScopeHint>,
        deadline: Option<Duration>,
    ) -> DiscoveryResult {
        let started = Instant::now();
        let mut state = SearchState::new(target);
        let mut trace = Vec::new();
        let stop_at = self.config.close_enough.min(limit);
        let request = Uuid::new_v4();

        info!(
            %request,
            url = %target.listing().url,
            segment = target.segment().as_str(),
            limit,
            "searching comparables"
        );

        for tier in SearchTier::cascade(self.config.broad_search) {
            if state.accepted.len() >= stop_at {
                debug!(accepted = state.accepted.len(), "close enough, stopping before {tier}");
                break;
            }

            let remaining = match deadline {
                Some(d) => {
                    let left = d.saturating_sub(started.elapsed());
                    if left.is_zero() {
                        trace.push(report(tier, TierStatus::TimedOut, 0, 0, Duration::ZERO, None));
                        break;
                    }
                    Some(left)
                }
                None => None,
            };

            let tier_started = Instant::now();
            let before = state.accepted.len();
            state.fetched = 0;

            let run = self.run_tier(tier, target, scope, limit, &mut state);
            let result = match remaining {
                Some(left) => tokio::time::timeout(left, run).await.ok(),
                None => Some(run.await),
            };

            let accepted = state.accepted.len() - before;
            let elapsed = tier_started.elapsed();
            let entry = match result {
                Some(Ok(TierOutcome::Ran)) => {
                    report(tier, TierStatus::Completed, state.fetched, accepted, elapsed, None)
                }
                Some(Ok(TierOutcome::Skipped(reason))) => {
                    report(tier, TierStatus::Skipped, 0, 0, elapsed, Some(reason.to_string()))
                }
                Some(Err(e)) => {
                    warn!(tier = %tier, "tier failed: {e}");
                    report(tier, TierStatus::Failed, state.fetched, accepted, elapsed, Some(e.to_string()))
                }
                None => {
                    warn!(tier = %tier, "search deadline reached");
                    report(
                        tier,
                        TierStatus::TimedOut,
                        state.fetched,
                        accepted,
                        elapsed,
                        Some("deadline reached".into()),
                    )
                }
            };
            info!(
                %request,
                tier = %tier,
                fetched = entry.fetched,
                accepted = entry.accepted,
                total = state.accepted.len(),
                "tier finished"
            );
            let timed_out = entry.status == TierStatus::TimedOut;
            trace.push(entry);
            if timed_out {
                break;
            }
        }

        let mut comparables = state.accepted;
        comparables.truncate(limit);
        info!(
            %request,
            comparables = comparables.len(),
            tiers = trace.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "comparable search finished"
        );
        DiscoveryResult {
            comparables,
            tier_trace: trace,
        }
    }

    async fn run_tier(
        &self,
        tier: SearchTier,
        target: &TargetProperty,
        scope: Option<ScopeHint>,
        limit: usize,
        state: &mut SearchState,
    ) -> ScrapeResult<TierOutcome> {
        match tier {
            SearchTier::ComplexMatch => self.complex_match(target, state).await,
            SearchTier::StreetWindow => self.street_window(target, state).await,
            SearchTier::DistrictOrStop => self.district_or_stop(target, scope, state).await,
            SearchTier::NeighboringHouses => self.neighboring_houses(target, limit, state).await,
            SearchTier::NeighboringStops => Ok(self.neighboring_stops(target, state)),
            SearchTier::CityWide | SearchTier::Relaxed => self.region_band(tier, target, state).await,
        }
    }

    async fn complex_match(
        &self,
        target: &TargetProperty,
        state: &mut SearchState,
    ) -> ScrapeResult<TierOutcome> {
        let listing = target.listing();
        let complex = match listing.residential_complex.as_deref() {
            Some(name) if target.is_new_build() => name,
            _ => return Ok(TierOutcome::Skipped("target is not a new-build in a named complex")),
        };

        let raw = match listing.residential_complex_url.as_deref() {
            Some(url) => self.provider.fetch_catalog(url).await?,
            None => {
                let query = SearchQuery {
                    region: target.region().cloned(),
                    market: Some(target.market()),
                    text: Some(complex.to_string()),
                    ..Default::default()
                };
                let found = fan_out(self.provider.as_ref(), &self.home_sources(target), &query).await;
                into_listings(found)?
                    .into_iter()
                    .filter(|c| {
                        c.residential_complex
                            .as_deref()
                            .is_some_and(|name| same_complex(complex, name))
                    })
                    .collect()
            }
        };
        state.fetched += raw.len();

        let target_ppa = listing.price_per_area();
        let candidates = raw
            .into_iter()
            .map(|c| {
                let distance = match (target_ppa, c.price_per_area()) {
                    (Some(t), Some(p)) if t > 0.0 => Some((p - t).abs() / t),
                    _ => None,
                };
                (c, distance)
            })
            .collect();
        self.admit(SearchTier::ComplexMatch, target, state, candidates);
        Ok(TierOutcome::Ran)
    }

    async fn street_window(
        &self,
        target: &TargetProperty,
        state: &mut SearchState,
    ) -> ScrapeResult<TierOutcome> {
        let Some(address) = target.address() else {
            return Ok(TierOutcome::Skipped("target address could not be parsed"));
        };
        let query = SearchQuery {
            region: target.region().cloned(),
            text: Some(address.street.clone()),
            ..Default::default()
        };
        let raw = into_listings(fan_out(self.provider.as_ref(), &self.home_sources(target), &query).await)?;
        state.fetched += raw.len();

        let window = self.config.street_window;
        let candidates = raw
            .into_iter()
            .filter_map(|c| {
                let parsed = c.address.as_deref().and_then(parse_address)?;
                let distance = parsed.house_number.abs_diff(address.house_number);
                (address.same_street(&parsed) && distance <= window).then_some((c, Some(f64::from(distance))))
            })
            .collect();
        self.admit(SearchTier::StreetWindow, target, state, candidates);
        Ok(TierOutcome::Ran)
    }

    async fn district_or_stop(
        &self,
        target: &TargetProperty,
        scope: Option<ScopeHint>,
        state: &mut SearchState,
    ) -> ScrapeResult<TierOutcome> {
        let listing = target.listing();
        let stop = listing.transit_stops.first().cloned();
        let district = listing.district.clone();
        let (transit_stop, district) = match (scope, stop, district) {
            (Some(ScopeHint::District), _, Some(d)) => (None, Some(d)),
            (_, Some(s), _) => (Some(s), None),
            (_, None, Some(d)) => (None, Some(d)),
            (_, None, None) => return Ok(TierOutcome::Skipped("target has no transit stop or district")),
        };

        let tier = SearchTier::DistrictOrStop;
        let tolerance = tier.tolerance(target.segment());
        let query = SearchQuery {
            region: target.region().cloned(),
            rooms: listing.rooms,
            studio: listing.is_studio,
            market: Some(target.market()),
            price_range: tolerance.zip(listing.price).map(|(t, p)| t.price_window(p)),
            area_range: tolerance.zip(listing.total_area).map(|(t, a)| t.area_window(a)),
            transit_stop: transit_stop.clone(),
            district: district.clone(),
            text: None,
        };

        let sources = self.sources.clone();
        let mut raw = into_listings(fan_out(self.provider.as_ref(), &sources, &query).await)?;
        let essentials_only = raw.is_empty();
        if essentials_only {
            debug!("district/stop query returned nothing, retrying with essential filters");
            let relaxed = query.essentials_only();
            raw = into_listings(fan_out(self.provider.as_ref(), &sources, &relaxed).await)?;
        }
        state.fetched += raw.len();
        state.district_pool.extend(raw.iter().cloned());

        let in_scope = |c: &PropertyListing| match (&transit_stop, &district) {
            (Some(stop), _) => {
                let stop = normalize_station(stop);
                c.transit_stops.is_empty()
                    || c.transit_stops.iter().any(|s| normalize_station(s) == stop)
            }
            (None, Some(d)) => c
                .district
                .as_deref()
                .map_or(true, |cd| normalize_key_text(cd) == normalize_key_text(d)),
            (None, None) => true,
        };
        let candidates = if essentials_only {
            raw.into_iter().filter(|c| same_class(target, c)).collect()
        } else {
            let filtered: Vec<_> = raw
                .into_iter()
                .filter(|c| same_class(target, c) && in_scope(c))
                .collect();
            match tolerance {
                Some(t) => band_filter(target, filtered, &t),
                None => filtered,
            }
        };

        let candidates = by_price_closeness(target, candidates);
        self.admit(tier, target, state, candidates);
        Ok(TierOutcome::Ran)
    }

    async fn neighboring_houses(
        &self,
        target: &TargetProperty,
        limit: usize,
        state: &mut SearchState,
    ) -> ScrapeResult<TierOutcome> {
        let Some(address) = target.address() else {
            return Ok(TierOutcome::Skipped("target address could not be parsed"));
        };
        let listing = target.listing();
        let sources = self.home_sources(target);
        let stop_at = self.config.preferred.min(limit);
        let mut last_error = None;
        let mut queried = 0usize;

        for neighbor in neighboring_houses(address, self.config.neighbor_radius) {
            if state.accepted.len() >= stop_at {
                break;
            }
            queried += 1;
            let query = SearchQuery {
                region: target.region().cloned(),
                rooms: listing.rooms,
                studio: listing.is_studio,
                market: Some(target.market()),
                text: Some(format!("{}, {}", address.street, neighbor.label())),
                ..Default::default()
            };
            let raw = match into_listings(fan_out(self.provider.as_ref(), &sources, &query).await) {
                Ok(raw) => raw,
                Err(e) => {
                    debug!(house = %neighbor.label(), "neighbor query failed: {e}");
                    last_error = Some(e);
                    continue;
                }
            };
            state.fetched += raw.len();
            let candidates = raw
                .into_iter()
                .filter(|c| {
                    c.address
                        .as_deref()
                        .and_then(parse_address)
                        .is_some_and(|parsed| neighbor.matches(address, &parsed))
                })
                .map(|c| (c, Some(f64::from(neighbor.distance))))
                .collect();
            self.admit(SearchTier::NeighboringHouses, target, state, candidates);
        }

        match last_error {
            Some(e) if state.fetched == 0 && queried > 0 => Err(e),
            _ => Ok(TierOutcome::Ran),
        }
    }

    fn neighboring_stops(&self, target: &TargetProperty, state: &mut SearchState) -> TierOutcome {
        if state.district_pool.is_empty() {
            return TierOutcome::Skipped("no district or stop results to re-filter");
        }
        let Some(region) = target.region() else {
            return TierOutcome::Skipped("target region unknown");
        };
        let adjacent: HashSet<String> = one_hop(region, &target.listing().transit_stops);
        if adjacent.is_empty() {
            return TierOutcome::Skipped("no adjacent stops known for the target");
        }

        let tier = SearchTier::NeighboringStops;
        let pool = std::mem::take(&mut state.district_pool);
        state.fetched += pool.len();
        let near: Vec<PropertyListing> = pool
            .iter()
            .filter(|c| c.transit_stops.iter().any(|s| adjacent.contains(&normalize_station(s))))
            .filter(|c| same_class(target, c))
            .cloned()
            .collect();
        let near = match tier.tolerance(target.segment()) {
            Some(t) => band_filter(target, near, &t),
            None => near,
        };
        let candidates = by_price_closeness(target, near);
        self.admit(tier, target, state, candidates);
        state.district_pool = pool;
        TierOutcome::Ran
    }

    /// CityWide and Relaxed: region-only query with segment bands.
    async fn region_band(
        &self,
        tier: SearchTier,
        target: &TargetProperty,
        state: &mut SearchState,
    ) -> ScrapeResult<TierOutcome> {
        let Some(tolerance) = tier.tolerance(target.segment()) else {
            return Ok(TierOutcome::Skipped("tier has no tolerance band"));
        };
        let listing = target.listing();
        let query = SearchQuery {
            region: target.region().cloned(),
            rooms: listing.rooms,
            studio: listing.is_studio,
            market: Some(target.market()),
            price_range: listing.price.map(|p| tolerance.price_window(p)),
            area_range: listing.total_area.map(|a| tolerance.area_window(a)),
            ..Default::default()
        };
        let raw = into_listings(fan_out(self.provider.as_ref(), &self.sources, &query).await)?;
        state.fetched += raw.len();
        let filtered = raw.into_iter().filter(|c| same_class(target, c)).collect();
        let candidates = by_price_closeness(target, band_filter(target, filtered, &tolerance));
        self.admit(tier, target, state, candidates);
        Ok(TierOutcome::Ran)
    }

    /// Validate, order nearest-first, dedup and append. Returns how many were accepted.
    fn admit(
        &self,
        tier: SearchTier,
        target: &TargetProperty,
        state: &mut SearchState,
        mut candidates: Vec<(PropertyListing, Option<f64>)>,
    ) -> usize {
        candidates.sort_by(|a, b| match (a.1, b.1) {
            (Some(x), Some(y)) => x.total_cmp(&y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        });

        let thresholds = tier.thresholds();
        let mut accepted = 0;
        for (listing, distance) in candidates {
            if let Err(e) = validate_candidate(target.listing(), target.region(), &listing, &thresholds) {
                debug!(tier = %tier, url = %listing.url, "candidate rejected: {e}");
                continue;
            }
            if !state.seen.insert(&listing) {
                continue;
            }
            if let Some(sink) = &self.sink {
                sink.save(SinkRecord::comparable(listing.clone(), tier.as_str()));
            }
            state.accepted.push(Comparable {
                listing,
                tier,
                distance,
            });
            accepted += 1;
        }
        accepted
    }

    /// The target's own source when known and enabled, else every source.
    fn home_sources(&self, target: &TargetProperty) -> Vec<SourceId> {
        match target.listing().source {
            Some(source) if self.sources.contains(&source) => vec![source],
            _ => self.sources.clone(),
        }
    }
}

fn report(
    tier: SearchTier,
    status: TierStatus,
    fetched: usize,
    accepted: usize,
    elapsed: Duration,
    detail: Option<String>,
) -> TierReport {
    TierReport {
        tier,
        status,
        fetched,
        accepted,
        elapsed_ms: elapsed.as_millis() as u64,
        detail,
    }
}

/// Listings from a fan-out, or the first error when every source failed.
fn into_listings(result: FanOutResult) -> ScrapeResult<Vec<PropertyListing>> {
    if result.all_failed() {
        if let Some((_, e)) = result.failures.into_iter().next() {
            return Err(e);
        }
    }
    Ok(result.listings)
}

/// Room count and new/resale class both match the target's.
///
/// Studios compare as one room; the tag itself is not required to match.
fn same_class(target: &TargetProperty, candidate: &PropertyListing) -> bool {
    let rooms_ok = match target.listing().rooms {
        Some(rooms) => candidate.rooms == Some(rooms),
        None => true,
    };
    rooms_ok && candidate.market_class() == target.market()
}

/// Keep candidates inside the tolerance bands around the target.
pub fn band_filter(
    target: &TargetProperty,
    candidates: Vec<PropertyListing>,
    tolerance: &Tolerance,
) -> Vec<PropertyListing> {
    candidates
        .into_iter()
        .filter(|c| tolerance.admits(target.listing(), c))
        .collect()
}

fn by_price_closeness(
    target: &TargetProperty,
    candidates: Vec<PropertyListing>,
) -> Vec<(PropertyListing, Option<f64>)> {
    let target_price = target.listing().price;
    candidates
        .into_iter()
        .map(|c| {
            let distance = match (target_price, c.price) {
                (Some(t), Some(p)) if t > 0.0 => Some((p - t).abs() / t),
                _ => None,
            };
            (c, distance)
        })
        .collect()
}

fn significant_words(name: &str) -> HashSet<String> {
    normalize_key_text(name)
        .split(' ')
        .filter(|w| w.chars().count() >= 3 && !COMPLEX_STOP_WORDS.contains(w))
        .map(String::from)
        .collect()
}

/// Two complex names refer to the same complex when they share at least two
/// significant words. Shorter names only match when spelled identically.
pub fn same_complex(a: &str, b: &str) -> bool {
    let (wa, wb) = (significant_words(a), significant_words(b));
    if wa.intersection(&wb).count() >= 2 {
        return true;
    }
    let (na, nb) = (normalize_key_text(a), normalize_key_text(b));
    !wa.is_empty() && na == nb
}
