//! Search tiers, tolerance bands and plausibility thresholds.

use crate::listing::{PriceSegment, PropertyListing};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One escalation level of the comparable search, in cascade order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchTier {
    ComplexMatch,
    StreetWindow,
    DistrictOrStop,
    NeighboringHouses,
    NeighboringStops,
    /// Region-wide query. Only with broad search enabled.
    CityWide,
    /// Doubled tolerances and loose plausibility. Only with broad search enabled.
    Relaxed,
}

impl SearchTier {
    /// The geographic cascade.
    pub const DEFAULT_CASCADE: [SearchTier; 5] = [
        SearchTier::ComplexMatch,
        SearchTier::StreetWindow,
        SearchTier::DistrictOrStop,
        SearchTier::NeighboringHouses,
        SearchTier::NeighboringStops,
    ];

    pub fn cascade(broad_search: bool) -> Vec<SearchTier> {
        let mut tiers = Self::DEFAULT_CASCADE.to_vec();
        if broad_search {
            tiers.extend([SearchTier::CityWide, SearchTier::Relaxed]);
        }
        tiers
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ComplexMatch => "complex_match",
            Self::StreetWindow => "street_window",
            Self::DistrictOrStop => "district_or_stop",
            Self::NeighboringHouses => "neighboring_houses",
            Self::NeighboringStops => "neighboring_stops",
            Self::CityWide => "city_wide",
            Self::Relaxed => "relaxed",
        }
    }

    pub fn thresholds(self) -> PlausibilityThresholds {
        match self {
            Self::ComplexMatch => PlausibilityThresholds::COMPLEX,
            Self::Relaxed => PlausibilityThresholds::RELAXED,
            _ => PlausibilityThresholds::STRICT,
        }
    }

    /// Price/area band applied to query results, if the tier filters numerically.
    pub fn tolerance(self, segment: PriceSegment) -> Option<Tolerance> {
        match self {
            Self::DistrictOrStop | Self::NeighboringStops | Self::CityWide => {
                Some(Tolerance::for_segment(segment))
            }
            Self::Relaxed => Some(Tolerance::for_segment(segment).scaled(2.0)),
            Self::ComplexMatch | Self::StreetWindow | Self::NeighboringHouses => None,
        }
    }
}

impl fmt::Display for SearchTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Symmetric price and area bands, in percent of the target's values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tolerance {
    pub price_pct: f64,
    pub area_pct: f64,
}

impl Tolerance {
    /// Bands widen as the segment gets cheaper.
    pub fn for_segment(segment: PriceSegment) -> Self {
        let (price_pct, area_pct) = match segment {
            PriceSegment::Luxury => (15.0, 10.0),
            PriceSegment::Premium => (20.0, 15.0),
            PriceSegment::Mid => (25.0, 20.0),
            PriceSegment::Economy => (40.0, 30.0),
        };
        Self { price_pct, area_pct }
    }

    pub fn scaled(self, factor: f64) -> Self {
        Self {
            price_pct: (self.price_pct * factor).min(95.0),
            area_pct: (self.area_pct * factor).min(95.0),
        }
    }

    pub fn price_window(&self, price: f64) -> (f64, f64) {
        band(price, self.price_pct)
    }

    pub fn area_window(&self, area: f64) -> (f64, f64) {
        band(area, self.area_pct)
    }

    /// Whether `candidate` falls inside the bands around `target`.
    ///
    /// A band is only applied when both sides know the value.
    pub fn admits(&self, target: &PropertyListing, candidate: &PropertyListing) -> bool {
        let within = |window: (f64, f64), value: f64| value >= window.0 && value <= window.1;
        let price_ok = match (target.price, candidate.price) {
            (Some(t), Some(c)) => within(self.price_window(t), c),
            _ => true,
        };
        let area_ok = match (target.total_area, candidate.total_area) {
            (Some(t), Some(c)) => within(self.area_window(t), c),
            _ => true,
        };
        price_ok && area_ok
    }
}

fn band(value: f64, pct: f64) -> (f64, f64) {
    (value * (100.0 - pct) / 100.0, value * (100.0 + pct) / 100.0)
}

/// Maximum tolerated ratios between a candidate and the target.
///
/// Ratios are symmetric: `max(a / b, b / a)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlausibilityThresholds {
    pub price_ratio: f64,
    pub area_ratio: f64,
    pub price_per_area_ratio: f64,
}

impl PlausibilityThresholds {
    pub const STRICT: Self = Self {
        price_ratio: 3.0,
        area_ratio: 3.0,
        price_per_area_ratio: 2.0,
    };

    /// Inside one complex the price per square meter is nearly uniform while
    /// flat sizes vary widely.
    pub const COMPLEX: Self = Self {
        price_ratio: 5.0,
        area_ratio: 5.0,
        price_per_area_ratio: 1.5,
    };

    pub const RELAXED: Self = Self {
        price_ratio: 5.0,
        area_ratio: 5.0,
        price_per_area_ratio: 5.0,
    };
}
