//! Supported listing sites.
//!
//! Each source is a closed enum variant with a static technique chain, a
//! normalization rule table and a search URL builder. Markup-specific payload
//! extraction lives in [`extract`] so a markup change never touches
//! orchestration or search logic.

pub mod extract;

use crate::error::{ScrapeError, ScrapeResult};
use crate::listing::address::Region;
use crate::listing::normalize::{transforms, FieldRule, Normalizer};
use crate::listing::MarketClass;
use crate::strategy::Technique;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceId {
    Cian,
    Avito,
    Domclick,
    YandexRealty,
}

impl SourceId {
    pub const ALL: [SourceId; 4] = [
        SourceId::Cian,
        SourceId::Avito,
        SourceId::Domclick,
        SourceId::YandexRealty,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cian => "cian",
            Self::Avito => "avito",
            Self::Domclick => "domclick",
            Self::YandexRealty => "yandex_realty",
        }
    }

    /// Registrable domains served by this source.
    pub fn domains(self) -> &'static [&'static str] {
        match self {
            Self::Cian => &["cian.ru"],
            Self::Avito => &["avito.ru"],
            Self::Domclick => &["domclick.ru"],
            Self::YandexRealty => &["realty.yandex.ru", "realty.ya.ru"],
        }
    }

    pub fn origin(self) -> &'static str {
        match self {
            Self::Cian => "https://www.cian.ru",
            Self::Avito => "https://www.avito.ru",
            Self::Domclick => "https://domclick.ru",
            Self::YandexRealty => "https://realty.yandex.ru",
        }
    }

    /// Static technique order for this source, most preferred first.
    pub fn techniques(self) -> &'static [Technique] {
        match self {
            Self::Cian => &[
                Technique::DirectApi,
                Technique::LightBrowser,
                Technique::HardenedBrowser,
                Technique::ProxyBrowser,
            ],
            Self::Avito => &[
                Technique::DirectApi,
                Technique::HardenedBrowser,
                Technique::ProxyBrowser,
            ],
            Self::Domclick => &[
                Technique::DirectApi,
                Technique::LightBrowser,
                Technique::HardenedBrowser,
            ],
            Self::YandexRealty => &[
                Technique::LightBrowser,
                Technique::HardenedBrowser,
                Technique::ProxyBrowser,
            ],
        }
    }

    /// Direct JSON endpoint for a listing page, when the site exposes one.
    pub fn api_url(self, listing_url: &str) -> Option<String> {
        let id = listing_id(listing_url)?;
        match self {
            Self::Cian => Some(format!(
                "https://api.cian.ru/offer-card/v1/get-offer-card/?cianId={id}&dealType=sale"
            )),
            Self::Avito => Some(format!("https://www.avito.ru/web/1/items/card/{id}")),
            Self::Domclick => Some(format!(
                "https://offers-service.domclick.ru/research/v5/offers/{id}"
            )),
            Self::YandexRealty => None,
        }
    }

    /// Catalog URL for a parametrized search.
    pub fn search_url(self, query: &SearchQuery) -> String {
        let region_slug = query
            .region
            .as_ref()
            .map(Region::slug)
            .unwrap_or_else(|| "rossiya".to_string());
        let path = match self {
            Self::Cian => "/cat.php".to_string(),
            Self::Avito => format!("/{region_slug}/kvartiry/prodam"),
            Self::Domclick => "/search".to_string(),
            Self::YandexRealty => format!("/{region_slug}/kupit/kvartira/"),
        };
        let mut pairs = url::form_urlencoded::Serializer::new(String::new());
        {
            let mut push = |k: &str, v: String| {
                pairs.append_pair(k, &v);
            };
            match self {
                Self::Cian => {
                    push("deal_type", "sale".into());
                    push("engine_version", "2".into());
                    push("offer_type", "flat".into());
                    if let Some(id) = query.region.as_ref().and_then(Region::api_id) {
                        push("region", id.to_string());
                    }
                    if let Some(rooms) = query.rooms {
                        let key = if query.studio { "room9".to_string() } else { format!("room{rooms}") };
                        push(&key, "1".into());
                    }
                    match query.market {
                        Some(MarketClass::NewBuild) => push("object_type[0]", "2".into()),
                        Some(MarketClass::Resale) => push("object_type[0]", "1".into()),
                        None => {}
                    }
                    if let Some((lo, hi)) = query.price_range {
                        push("minprice", format!("{lo:.0}"));
                        push("maxprice", format!("{hi:.0}"));
                    }
                    if let Some((lo, hi)) = query.area_range {
                        push("mintarea", format!("{lo:.0}"));
                        push("maxtarea", format!("{hi:.0}"));
                    }
                }
                Self::Avito => {
                    if let Some((lo, hi)) = query.price_range {
                        push("pmin", format!("{lo:.0}"));
                        push("pmax", format!("{hi:.0}"));
                    }
                    if let Some(rooms) = query.rooms {
                        let label = if query.studio { "studiya".to_string() } else { format!("{rooms}-komnatnye") };
                        push("rooms", label);
                    }
                    match query.market {
                        Some(MarketClass::NewBuild) => push("market", "novostroyka".into()),
                        Some(MarketClass::Resale) => push("market", "vtorichka".into()),
                        None => {}
                    }
                }
                Self::Domclick => {
                    push("deal_type", "sale".into());
                    push("category", "living".into());
                    push("offer_type", "flat".into());
                    if let Some(rooms) = query.rooms {
                        push("rooms", if query.studio { "st".into() } else { rooms.to_string() });
                    }
                    if let Some((lo, hi)) = query.price_range {
                        push("sale_price__gte", format!("{lo:.0}"));
                        push("sale_price__lte", format!("{hi:.0}"));
                    }
                    if let Some((lo, hi)) = query.area_range {
                        push("area__gte", format!("{lo:.0}"));
                        push("area__lte", format!("{hi:.0}"));
                    }
                    match query.market {
                        Some(MarketClass::NewBuild) => push("is_newbuilding", "1".into()),
                        Some(MarketClass::Resale) => push("is_newbuilding", "0".into()),
                        None => {}
                    }
                    if let Some(region) = &query.region {
                        push("address", region.to_string());
                    }
                }
                Self::YandexRealty => {
                    if let Some(rooms) = query.rooms {
                        push("roomsTotal", if query.studio { "STUDIO".into() } else { rooms.to_string() });
                    }
                    if let Some((lo, hi)) = query.price_range {
                        push("priceMin", format!("{lo:.0}"));
                        push("priceMax", format!("{hi:.0}"));
                    }
                    if let Some((lo, hi)) = query.area_range {
                        push("areaMin", format!("{lo:.0}"));
                        push("areaMax", format!("{hi:.0}"));
                    }
                    match query.market {
                        Some(MarketClass::NewBuild) => push("newFlat", "YES".into()),
                        Some(MarketClass::Resale) => push("newFlat", "NO".into()),
                        None => {}
                    }
                }
            }
            if let Some(text) = query.free_text() {
                let key = match self {
                    Self::Cian | Self::Avito => "q",
                    Self::Domclick => "text",
                    Self::YandexRealty => "text",
                };
                push(key, text);
            }
        }
        let query_string = pairs.finish();
        if query_string.is_empty() {
            format!("{}{path}", self.origin())
        } else {
            format!("{}{path}?{query_string}", self.origin())
        }
    }

    /// Normalization rules mapping this source's payload shape onto the canonical schema.
    pub fn rules(self) -> Vec<FieldRule> {
        match self {
            Self::Cian => vec![
                FieldRule::new("title", "title"),
                FieldRule::new("seo.title", "title"),
                FieldRule::new("fullUrl", "url"),
                FieldRule::new("bargainTerms.priceRur", "price").with_transform(transforms::number),
                FieldRule::new("bargainTerms.price", "price").with_transform(transforms::number),
                FieldRule::new("totalArea", "total_area").with_transform(transforms::number),
                FieldRule::new("livingArea", "living_area").with_transform(transforms::number),
                FieldRule::new("kitchenArea", "kitchen_area").with_transform(transforms::number),
                FieldRule::new("flatType", "rooms").with_transform(studio_marker),
                FieldRule::new("roomsCount", "rooms").with_transform(transforms::rooms),
                FieldRule::new("floorNumber", "floor"),
                FieldRule::new("building.floorsCount", "floor_count"),
                FieldRule::new("geo.address", "address").with_transform(transforms::join_names),
                FieldRule::new("geo.undergrounds", "transit_stops"),
                FieldRule::new("geo.district", "district"),
                FieldRule::new("newbuilding.name", "residential_complex"),
                FieldRule::new("newbuilding.url", "residential_complex_url"),
                FieldRule::new("building.buildYear", "build_year"),
                FieldRule::new("building.materialType", "structure_type"),
                FieldRule::new("isNewbuilding", "is_new_build"),
                FieldRule::new("photos", "images"),
            ],
            Self::Avito => vec![
                FieldRule::new("title", "title"),
                FieldRule::new("urlPath", "url")
                    .with_transform(transforms::absolute_url(Self::Avito.origin())),
                FieldRule::new("priceDetailed.value", "price").with_transform(transforms::number),
                FieldRule::new("params.area", "total_area").with_transform(transforms::number),
                FieldRule::new("params.living_area", "living_area").with_transform(transforms::number),
                FieldRule::new("params.kitchen_area", "kitchen_area").with_transform(transforms::number),
                FieldRule::new("params.rooms", "rooms").with_transform(transforms::rooms),
                FieldRule::new("params.floor", "floor").with_transform(transforms::floor_of),
                FieldRule::new("params.floor", "floor_count").with_transform(transforms::floor_count_of),
                FieldRule::new("geo.formattedAddress", "address"),
                FieldRule::new("geo.geoReferences", "transit_stops").with_transform(content_names),
                FieldRule::new("params.house_type", "structure_type"),
                FieldRule::new("params.build_year", "build_year").with_transform(transforms::number),
                FieldRule::new("params.market", "is_new_build"),
                FieldRule::new("development.name", "residential_complex"),
                FieldRule::new("images", "images"),
            ],
            Self::Domclick => vec![
                FieldRule::new("title", "title"),
                FieldRule::new("path", "url")
                    .with_transform(transforms::absolute_url(Self::Domclick.origin())),
                FieldRule::new("price", "price").with_transform(transforms::number),
                FieldRule::new("objectInfo.area", "total_area").with_transform(transforms::number),
                FieldRule::new("objectInfo.livingArea", "living_area").with_transform(transforms::number),
                FieldRule::new("objectInfo.kitchenArea", "kitchen_area").with_transform(transforms::number),
                FieldRule::new("objectInfo.rooms", "rooms").with_transform(transforms::rooms),
                FieldRule::new("objectInfo.floor", "floor"),
                FieldRule::new("house.floors", "floor_count"),
                FieldRule::new("address.displayName", "address"),
                FieldRule::new("location.subways", "transit_stops"),
                FieldRule::new("location.district", "district"),
                FieldRule::new("complex.name", "residential_complex"),
                FieldRule::new("complex.url", "residential_complex_url"),
                FieldRule::new("house.buildYear", "build_year"),
                FieldRule::new("house.wallType", "structure_type"),
                FieldRule::new("isNewBuilding", "is_new_build"),
                FieldRule::new("photos", "images"),
            ],
            Self::YandexRealty => vec![
                FieldRule::new("title", "title"),
                FieldRule::new("url", "url")
                    .with_transform(transforms::absolute_url(Self::YandexRealty.origin())),
                FieldRule::new("price.value", "price").with_transform(transforms::number),
                FieldRule::new("area.value", "total_area").with_transform(transforms::number),
                FieldRule::new("livingSpace.value", "living_area").with_transform(transforms::number),
                FieldRule::new("kitchenSpace.value", "kitchen_area").with_transform(transforms::number),
                FieldRule::new("roomsTotal", "rooms").with_transform(transforms::rooms),
                FieldRule::new("floorsOffered.0", "floor"),
                FieldRule::new("floorsTotal", "floor_count"),
                FieldRule::new("location.address", "address"),
                FieldRule::new("location.metroList", "transit_stops"),
                FieldRule::new("location.subLocalityName", "district"),
                FieldRule::new("building.siteName", "residential_complex"),
                FieldRule::new("building.builtYear", "build_year"),
                FieldRule::new("building.buildingType", "structure_type"),
                FieldRule::new("flatType", "is_new_build").with_transform(yandex_flat_type),
                FieldRule::new("appMiddleImages", "images"),
            ],
        }
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceId {
    type Err = ScrapeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cian" => Ok(Self::Cian),
            "avito" => Ok(Self::Avito),
            "domclick" => Ok(Self::Domclick),
            "yandex" | "yandex_realty" | "yandex-realty" => Ok(Self::YandexRealty),
            other => Err(ScrapeError::NotSupported(other.to_string())),
        }
    }
}

/// Resolve the source that serves `url`, from its domain alone.
pub fn resolve_source(url: &str) -> ScrapeResult<SourceId> {
    let parsed = url::Url::parse(url).map_err(|_| ScrapeError::NotSupported(url.to_string()))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| ScrapeError::NotSupported(url.to_string()))?
        .to_ascii_lowercase();
    SourceId::ALL
        .into_iter()
        .find(|source| {
            source
                .domains()
                .iter()
                .any(|d| host == *d || host.ends_with(&format!(".{d}")))
        })
        .ok_or(ScrapeError::NotSupported(host))
}

/// Register every source's rule table with a normalizer.
pub fn register_all(normalizer: &Normalizer) {
    for source in SourceId::ALL {
        normalizer.register(source, source.rules());
    }
}

/// Parametrized catalog query shared by every source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub region: Option<Region>,
    pub rooms: Option<u32>,
    pub studio: bool,
    pub market: Option<MarketClass>,
    pub price_range: Option<(f64, f64)>,
    pub area_range: Option<(f64, f64)>,
    pub transit_stop: Option<String>,
    pub district: Option<String>,
    /// Free-form text such as a street address or complex name.
    pub text: Option<String>,
}

impl SearchQuery {
    /// Text sent to the site's search box: explicit text, else stop, else district.
    pub fn free_text(&self) -> Option<String> {
        self.text
            .clone()
            .or_else(|| self.transit_stop.as_ref().map(|s| format!("метро {s}")))
            .or_else(|| self.district.as_ref().map(|d| format!("район {d}")))
    }

    /// Keep only region, room count and market class.
    pub fn essentials_only(&self) -> Self {
        Self {
            region: self.region.clone(),
            rooms: self.rooms,
            studio: self.studio,
            market: self.market,
            ..Default::default()
        }
    }
}

/// Trailing numeric id of a listing URL: `/sale/flat/312345678/` or `..._4129385731`.
pub fn listing_id(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let last = parsed
        .path_segments()?
        .filter(|s| !s.is_empty())
        .next_back()?
        .to_string();
    let digits: String = last
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    (digits.len() >= 4).then_some(digits)
}

fn studio_marker(v: &Value) -> Result<Value, String> {
    match v.as_str() {
        Some(s) if s.eq_ignore_ascii_case("studio") => Ok(json!("studio")),
        _ => Ok(Value::Null),
    }
}

fn content_names(v: &Value) -> Result<Value, String> {
    let items = v.as_array().ok_or_else(|| format!("expected array, got {v}"))?;
    Ok(Value::Array(
        items
            .iter()
            .filter_map(|item| item.get("content").or_else(|| item.get("name")).cloned())
            .collect(),
    ))
}

fn yandex_flat_type(v: &Value) -> Result<Value, String> {
    match v.as_str() {
        Some("NEW_FLAT") | Some("NEW_SECONDARY") => Ok(json!(true)),
        Some("SECONDARY") => Ok(json!(false)),
        _ => Err(format!("unknown flat type {v}")),
    }
}
