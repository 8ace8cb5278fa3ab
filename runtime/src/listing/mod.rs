//! Canonical listing schema shared by every source and every search tier.

pub mod address;
pub mod normalize;

use crate::sources::SourceId;
use address::{infer_region_from_text, infer_region_from_url, parse_address, ParsedAddress, Region};
use chrono::Datelike;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Price above which a listing is in the luxury segment.
pub const LUXURY_THRESHOLD: f64 = 100_000_000.0;
/// Price above which a listing is in the premium segment.
pub const PREMIUM_THRESHOLD: f64 = 50_000_000.0;
/// Price above which a listing is in the mid segment.
pub const MID_THRESHOLD: f64 = 15_000_000.0;

/// One listing in canonical form, regardless of which site it came from.
///
/// `price` and `total_area` are strictly positive whenever present;
/// normalization drops non-positive values instead of storing them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropertyListing {
    pub source: Option<SourceId>,
    pub url: String,
    pub title: String,
    pub price: Option<f64>,
    pub total_area: Option<f64>,
    pub living_area: Option<f64>,
    pub kitchen_area: Option<f64>,
    /// Room count; studios are stored as 1 with `is_studio` set.
    pub rooms: Option<u32>,
    pub is_studio: bool,
    pub floor: Option<i32>,
    pub floor_count: Option<i32>,
    pub address: Option<String>,
    pub district: Option<String>,
    pub transit_stops: Vec<String>,
    pub residential_complex: Option<String>,
    pub residential_complex_url: Option<String>,
    pub build_year: Option<i32>,
    pub structure_type: Option<String>,
    /// Explicit new-build marker when the source publishes one.
    pub is_new_build: Option<bool>,
    pub characteristics: BTreeMap<String, String>,
    pub amenities: BTreeMap<String, bool>,
    pub images: Vec<String>,
}

impl PropertyListing {
    /// Price per square meter, when both price and area are known.
    pub fn price_per_area(&self) -> Option<f64> {
        match (self.price, self.total_area) {
            (Some(p), Some(a)) if a > 0.0 => Some(p / a),
            _ => None,
        }
    }

    /// Whether the listing carries the fields a successful parse requires.
    pub fn has_required_fields(&self) -> bool {
        !self.title.trim().is_empty()
    }

    /// Key used to collapse the same flat listed on several sites or tiers.
    pub fn dedup_key(&self) -> DedupKey {
        let address = match self.address.as_deref() {
            Some(text) => match parse_address(text) {
                Some(parsed) => format!("{} {}", parsed.street_key, parsed.house_label().to_lowercase()),
                None => normalize_key_text(text),
            },
            None => self.url.clone(),
        };
        DedupKey {
            address,
            area_decimals: self.total_area.map(|a| (a * 10.0).round() as i64),
            floor: self.floor,
        }
    }

    pub fn region(&self) -> Option<Region> {
        self.address
            .as_deref()
            .and_then(infer_region_from_text)
            .or_else(|| infer_region_from_url(&self.url))
    }

    /// New-build vs. resale, from the explicit flag, build year, or complex metadata.
    pub fn market_class(&self) -> MarketClass {
        if let Some(flag) = self.is_new_build {
            return if flag {
                MarketClass::NewBuild
            } else {
                MarketClass::Resale
            };
        }
        let current_year = chrono::Utc::now().year();
        if let Some(year) = self.build_year {
            return if year >= current_year - 2 {
                MarketClass::NewBuild
            } else {
                MarketClass::Resale
            };
        }
        let has_handover = self.characteristics.keys().any(|k| {
            let k = k.to_lowercase();
            k.contains("сдача") || k.contains("срок сдачи") || k.contains("handover")
        });
        if self.residential_complex.is_some() && has_handover {
            MarketClass::NewBuild
        } else {
            MarketClass::Resale
        }
    }
}

/// Deduplication key: normalized address, area in tenths of a square meter, floor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub address: String,
    pub area_decimals: Option<i64>,
    pub floor: Option<i32>,
}

/// Lowercased, `ё`-folded, punctuation-collapsed text for key comparisons.
pub fn normalize_key_text(text: &str) -> String {
    text.to_lowercase()
        .replace('ё', "е")
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Price-based classification that drives tolerance-band width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceSegment {
    Economy,
    Mid,
    Premium,
    Luxury,
}

impl PriceSegment {
    pub fn from_price(price: Option<f64>) -> Self {
        match price {
            Some(p) if p > LUXURY_THRESHOLD => Self::Luxury,
            Some(p) if p > PREMIUM_THRESHOLD => Self::Premium,
            Some(p) if p > MID_THRESHOLD => Self::Mid,
            _ => Self::Economy,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Economy => "economy",
            Self::Mid => "mid",
            Self::Premium => "premium",
            Self::Luxury => "luxury",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketClass {
    NewBuild,
    Resale,
}

/// The reference listing with its derived search attributes.
///
/// Built once per search request and never mutated afterwards.
#[derive(Debug, Clone)]
pub struct TargetProperty {
    listing: PropertyListing,
    segment: PriceSegment,
    address: Option<ParsedAddress>,
    market: MarketClass,
    region: Option<Region>,
}

impl TargetProperty {
    pub fn new(listing: PropertyListing) -> Self {
        let segment = PriceSegment::from_price(listing.price);
        let address = listing.address.as_deref().and_then(parse_address);
        let market = listing.market_class();
        let region = listing.region();
        Self {
            listing,
            segment,
            address,
            market,
            region,
        }
    }

    pub fn listing(&self) -> &PropertyListing {
        &self.listing
    }

    pub fn segment(&self) -> PriceSegment {
        self.segment
    }

    pub fn address(&self) -> Option<&ParsedAddress> {
        self.address.as_ref()
    }

    pub fn market(&self) -> MarketClass {
        self.market
    }

    pub fn region(&self) -> Option<&Region> {
        self.region.as_ref()
    }

    pub fn is_new_build(&self) -> bool {
        self.market == MarketClass::NewBuild
    }
}
