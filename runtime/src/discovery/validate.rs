//! Candidate validation: region, plausibility, schema, then deduplication.
//!
//! Rejections are `ValidationRejected` values that the calling tier logs and
//! drops; they never propagate further.

use super::tiers::PlausibilityThresholds;
use crate::error::{ScrapeError, ScrapeResult};
use crate::listing::address::{infer_region_from_text, infer_region_from_url, Region};
use crate::listing::{DedupKey, PropertyListing};
use std::collections::HashSet;

/// Region consistency.
///
/// Region is inferred separately from the address text and from the URL. At
/// least one must resolve and every resolved region must equal the target's.
pub fn check_region(target: Option<&Region>, candidate: &PropertyListing) -> ScrapeResult<()> {
    let Some(target) = target else {
        return Ok(());
    };
    let from_text = candidate.address.as_deref().and_then(infer_region_from_text);
    let from_url = infer_region_from_url(&candidate.url);

    if from_text.is_none() && from_url.is_none() {
        return Err(ScrapeError::ValidationRejected(format!(
            "region unknown for {}",
            candidate.url
        )));
    }
    for inferred in [from_text, from_url].into_iter().flatten() {
        if inferred != *target {
            return Err(ScrapeError::ValidationRejected(format!(
                "region {inferred} differs from target region {target}"
            )));
        }
    }
    Ok(())
}

fn ratio(a: f64, b: f64) -> f64 {
    if a >= b {
        a / b
    } else {
        b / a
    }
}

/// Reject candidates whose price, area or price per area are implausibly far
/// from the target's. A value missing on either side skips only its check.
pub fn check_plausibility(
    target: &PropertyListing,
    candidate: &PropertyListing,
    thresholds: &PlausibilityThresholds,
) -> ScrapeResult<()> {
    let checks = [
        ("price", target.price, candidate.price, thresholds.price_ratio),
        ("area", target.total_area, candidate.total_area, thresholds.area_ratio),
        (
            "price per area",
            target.price_per_area(),
            candidate.price_per_area(),
            thresholds.price_per_area_ratio,
        ),
    ];
    for (name, t, c, limit) in checks {
        if let (Some(t), Some(c)) = (t, c) {
            if t > 0.0 && c > 0.0 {
                let r = ratio(t, c);
                if r > limit {
                    return Err(ScrapeError::ValidationRejected(format!(
                        "{name} ratio {r:.2} exceeds {limit}"
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Required numeric fields present and positive.
pub fn check_schema(candidate: &PropertyListing) -> ScrapeResult<()> {
    if !candidate.price.is_some_and(|p| p > 0.0) {
        return Err(ScrapeError::ValidationRejected("price missing or non-positive".into()));
    }
    if !candidate.total_area.is_some_and(|a| a > 0.0) {
        return Err(ScrapeError::ValidationRejected("area missing or non-positive".into()));
    }
    Ok(())
}

/// Region, plausibility and schema checks in order.
pub fn validate_candidate(
    target: &PropertyListing,
    target_region: Option<&Region>,
    candidate: &PropertyListing,
    thresholds: &PlausibilityThresholds,
) -> ScrapeResult<()> {
    check_region(target_region, candidate)?;
    check_plausibility(target, candidate, thresholds)?;
    check_schema(candidate)
}

/// Cross-tier duplicate filter keyed by (address, area, floor) and by URL.
#[derive(Debug, Default)]
pub struct Deduplicator {
    keys: HashSet<DedupKey>,
    urls: HashSet<String>,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` the first time a listing is seen.
    pub fn insert(&mut self, listing: &PropertyListing) -> bool {
        if !listing.url.is_empty() && self.urls.contains(&listing.url) {
            return false;
        }
        if !self.keys.insert(listing.dedup_key()) {
            return false;
        }
        if !listing.url.is_empty() {
            self.urls.insert(listing.url.clone());
        }
        true
    }

    pub fn contains(&self, listing: &PropertyListing) -> bool {
        (!listing.url.is_empty() && self.urls.contains(&listing.url))
            || self.keys.contains(&listing.dedup_key())
    }
}

/// Keep the first occurrence of every listing, preserving order.
pub fn dedup(listings: Vec<PropertyListing>) -> Vec<PropertyListing> {
    let mut seen = Deduplicator::new();
    listings.into_iter().filter(|l| seen.insert(l)).collect()
}
