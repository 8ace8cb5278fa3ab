//! Comparable discovery through the public engine API.

use async_trait::async_trait;
use comps_runtime::config::DiscoveryConfig;
use comps_runtime::discovery::tiers::{SearchTier, Tolerance};
use comps_runtime::discovery::validate::{dedup, validate_candidate};
use comps_runtime::discovery::{band_filter, ComparableEngine, TierStatus};
use comps_runtime::error::{ScrapeError, ScrapeResult};
use comps_runtime::listing::{PriceSegment, PropertyListing, TargetProperty};
use comps_runtime::sources::{SearchQuery, SourceId};
use comps_runtime::strategy::fanout::ListingProvider;
use std::sync::Arc;

fn flat(source: SourceId, id: u32, price: f64, area: f64, address: &str) -> PropertyListing {
    PropertyListing {
        source: Some(source),
        url: format!("{}/offer/{id}/", source.origin()),
        title: "2-комн. квартира".into(),
        price: Some(price),
        total_area: Some(area),
        rooms: Some(2),
        floor: Some(5),
        address: Some(address.into()),
        transit_stops: vec!["Сокол".into()],
        is_new_build: Some(false),
        ..Default::default()
    }
}

fn target() -> TargetProperty {
    TargetProperty::new(flat(SourceId::Cian, 1, 31_000_000.0, 75.0, "Москва, ул. Лесная, 5"))
}

/// Every source lists the same two flats under its own URLs; Avito is down.
struct MirroredProvider;

#[async_trait]
impl ListingProvider for MirroredProvider {
    async fn search(&self, source: SourceId, _query: &SearchQuery) -> ScrapeResult<Vec<PropertyListing>> {
        if source == SourceId::Avito {
            return Err(ScrapeError::TransientBlock {
                url: source.origin().into(),
                reason: "captcha".into(),
            });
        }
        let mut second = flat(source, 3, 33_000_000.0, 78.0, "Москва, ул. Лесная, 9");
        second.floor = Some(8);
        Ok(vec![
            flat(source, 2, 30_000_000.0, 74.0, "Москва, ул. Лесная, 7"),
            second,
        ])
    }

    async fn fetch_catalog(&self, _url: &str) -> ScrapeResult<Vec<PropertyListing>> {
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn test_cross_source_duplicates_are_merged() {
    let engine = ComparableEngine::new(Arc::new(MirroredProvider), DiscoveryConfig::default());
    let result = engine.find_comparables(&target(), 10, None, None).await;

    assert_eq!(result.comparables.len(), 2);
    let first = &result.comparables[0];
    assert_eq!(first.tier, SearchTier::StreetWindow);
    assert!(first.listing.address.as_deref().unwrap().ends_with("7"));
    assert_eq!(result.tier_trace[0].tier, SearchTier::ComplexMatch);
    assert_eq!(result.tier_trace[0].status, TierStatus::Skipped);
    assert!(result
        .tier_trace
        .iter()
        .all(|r| r.status != TierStatus::Failed));
}

#[test]
fn test_mid_segment_windows() {
    let target = target();
    assert_eq!(target.segment(), PriceSegment::Mid);
    let tolerance = SearchTier::DistrictOrStop.tolerance(target.segment()).unwrap();
    assert_eq!(tolerance.price_window(31_000_000.0), (23_250_000.0, 38_750_000.0));
    assert_eq!(tolerance.area_window(75.0), (60.0, 90.0));
}

#[test]
fn test_price_ratio_four_depends_on_tier() {
    let target = flat(SourceId::Cian, 1, 10_000_000.0, 50.0, "Москва, ул. Лесная, 5");
    let mut candidate = flat(SourceId::Avito, 2, 40_000_000.0, 50.0, "Москва, ул. Лесная, 7");
    candidate.floor = Some(2);
    let region = target.region();

    let strict = SearchTier::DistrictOrStop.thresholds();
    let err = validate_candidate(&target, region.as_ref(), &candidate, &strict).unwrap_err();
    assert!(matches!(err, ScrapeError::ValidationRejected(_)));

    // Area unchanged, so the per-area ratio is also 4.0 and only the relaxed set admits it.
    let relaxed = SearchTier::Relaxed.thresholds();
    assert!(validate_candidate(&target, region.as_ref(), &candidate, &relaxed).is_ok());
}

#[test]
fn test_identical_candidate_accepted_by_every_tier() {
    for price in [8_000_000.0, 20_000_000.0, 70_000_000.0, 150_000_000.0] {
        let target = TargetProperty::new(flat(SourceId::Cian, 1, price, 60.0, "Москва, ул. Лесная, 5"));
        let mut twin = target.listing().clone();
        twin.url = "https://domclick.ru/card/sale__flat__42".into();
        twin.source = Some(SourceId::Domclick);
        for tier in SearchTier::cascade(true) {
            let accepted = validate_candidate(
                target.listing(),
                target.region(),
                &twin,
                &tier.thresholds(),
            );
            assert!(accepted.is_ok(), "{tier} rejected a twin at {price}");
            if let Some(tolerance) = tier.tolerance(target.segment()) {
                assert!(tolerance.admits(target.listing(), &twin));
            }
        }
    }
}

#[test]
fn test_tightening_tolerance_never_admits_more() {
    let target = target();
    let candidates: Vec<_> = (0..40)
        .map(|i| {
            let i = f64::from(i);
            flat(
                SourceId::Cian,
                100 + i as u32,
                20_000_000.0 + i * 600_000.0,
                55.0 + i * 1.1,
                "Москва, ул. Лесная, 7",
            )
        })
        .collect();
    let base = Tolerance::for_segment(target.segment());
    let mut previous = usize::MAX;
    for factor in [2.0, 1.5, 1.0, 0.75, 0.5, 0.25, 0.0] {
        let kept = band_filter(&target, candidates.clone(), &base.scaled(factor)).len();
        assert!(kept <= previous, "factor {factor} admitted {kept} > {previous}");
        previous = kept;
    }
}

#[test]
fn test_dedup_is_idempotent() {
    let a = flat(SourceId::Cian, 2, 30_000_000.0, 74.0, "Москва, ул. Лесная, 7");
    let mut a_elsewhere = a.clone();
    a_elsewhere.url = "https://www.avito.ru/moskva/kvartiry/2".into();
    a_elsewhere.address = Some("Москва, Лесная улица, д. 7".into());
    let b = flat(SourceId::Cian, 3, 33_000_000.0, 78.0, "Москва, ул. Лесная, 9");

    let once = dedup(vec![a.clone(), a_elsewhere, b.clone(), a.clone()]);
    assert_eq!(once, vec![a, b]);
    assert_eq!(dedup(once.clone()), once);
}
