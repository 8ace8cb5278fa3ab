//! Map each source's raw payload onto the canonical listing schema.
//!
//! A source registers an ordered list of [`FieldRule`]s. Normalizing applies
//! every rule, passes through keys that are already canonical, then stamps the
//! source id. A failing transform drops only its own field.

use super::PropertyListing;
use crate::sources::SourceId;
use dashmap::DashMap;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

/// Canonical field names accepted by [`Normalizer::normalize`].
pub const CANONICAL_FIELDS: &[&str] = &[
    "url",
    "title",
    "price",
    "total_area",
    "living_area",
    "kitchen_area",
    "rooms",
    "floor",
    "floor_count",
    "address",
    "district",
    "transit_stops",
    "residential_complex",
    "residential_complex_url",
    "build_year",
    "structure_type",
    "is_new_build",
    "characteristics",
    "amenities",
    "images",
];

pub type Transform = Arc<dyn Fn(&Value) -> Result<Value, String> + Send + Sync>;

/// One mapping from a path in the raw payload to a canonical field.
#[derive(Clone)]
pub struct FieldRule {
    /// Dot-separated path; numeric segments index into arrays (`photos.0.url`).
    pub source_path: String,
    pub canonical: &'static str,
    pub transform: Option<Transform>,
    pub default: Option<Value>,
}

impl FieldRule {
    pub fn new(source_path: impl Into<String>, canonical: &'static str) -> Self {
        Self {
            source_path: source_path.into(),
            canonical,
            transform: None,
            default: None,
        }
    }

    pub fn with_transform<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.transform = Some(Arc::new(f));
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }
}

impl fmt::Debug for FieldRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldRule")
            .field("source_path", &self.source_path)
            .field("canonical", &self.canonical)
            .field("transform", &self.transform.is_some())
            .field("default", &self.default)
            .finish()
    }
}

/// Registry of per-source normalization rules.
#[derive(Default)]
pub struct Normalizer {
    rules: DashMap<SourceId, Arc<Vec<FieldRule>>>,
}

impl Normalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the rules for a source.
    pub fn register(&self, source: SourceId, rules: Vec<FieldRule>) {
        debug!(source = %source, rules = rules.len(), "registered normalization rules");
        self.rules.insert(source, Arc::new(rules));
    }

    pub fn is_registered(&self, source: SourceId) -> bool {
        self.rules.contains_key(&source)
    }

    /// Normalize a raw payload. Never fails: bad fields are dropped and logged.
    pub fn normalize(&self, source: SourceId, raw: &Value) -> PropertyListing {
        let rules = self
            .rules
            .get(&source)
            .map(|r| Arc::clone(r.value()))
            .unwrap_or_default();

        let mut canonical = Map::new();
        for rule in rules.iter() {
            let found = lookup_path(raw, &rule.source_path).filter(|v| !v.is_null());
            let value = match (found, &rule.transform) {
                (Some(v), Some(transform)) => match transform(v) {
                    Ok(out) => Some(out),
                    Err(e) => {
                        warn!(
                            source = %source,
                            field = rule.canonical,
                            path = %rule.source_path,
                            "dropping field: {e}"
                        );
                        continue;
                    }
                },
                (Some(v), None) => Some(v.clone()),
                (None, _) => rule.default.clone(),
            };
            if let Some(v) = value.filter(|v| !v.is_null()) {
                canonical.entry(rule.canonical.to_string()).or_insert(v);
            }
        }

        if let Value::Object(obj) = raw {
            for (key, value) in obj {
                if CANONICAL_FIELDS.contains(&key.as_str()) && !canonical.contains_key(key) {
                    canonical.insert(key.clone(), value.clone());
                }
            }
        }

        let mut listing = build_listing(&canonical, source);
        listing.source = Some(source);
        listing
    }
}

/// Resolve a dot path inside a JSON value.
pub fn lookup_path<'a>(raw: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = raw;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn build_listing(map: &Map<String, Value>, source: SourceId) -> PropertyListing {
    let mut listing = PropertyListing::default();

    listing.url = map.get("url").and_then(as_text).unwrap_or_default();
    listing.title = map.get("title").and_then(as_text).unwrap_or_default();
    listing.price = positive(map, "price", source);
    listing.total_area = positive(map, "total_area", source);
    listing.living_area = positive(map, "living_area", source);
    listing.kitchen_area = positive(map, "kitchen_area", source);

    if let Some(v) = map.get("rooms") {
        match parse_rooms(v) {
            Some((rooms, studio)) => {
                listing.rooms = Some(rooms);
                listing.is_studio = studio;
            }
            None => warn!(source = %source, field = "rooms", "dropping unparseable value {v}"),
        }
    }

    listing.floor = map.get("floor").and_then(|v| parse_floor_pair(v).0);
    listing.floor_count = map
        .get("floor_count")
        .and_then(|v| parse_floor_pair(v).1.or_else(|| as_number(v).map(|n| n as i32)))
        .or_else(|| map.get("floor").and_then(|v| parse_floor_pair(v).1));

    listing.address = map.get("address").and_then(as_text);
    listing.district = map.get("district").and_then(as_text);
    listing.transit_stops = map.get("transit_stops").map(as_name_list).unwrap_or_default();
    listing.residential_complex = map.get("residential_complex").and_then(as_text);
    listing.residential_complex_url = map.get("residential_complex_url").and_then(as_text);
    listing.build_year = map
        .get("build_year")
        .and_then(as_number)
        .map(|n| n as i32)
        .filter(|y| (1700..=2100).contains(y));
    listing.structure_type = map.get("structure_type").and_then(as_text);
    listing.is_new_build = map.get("is_new_build").and_then(as_new_build_flag);
    listing.characteristics = map
        .get("characteristics")
        .map(as_characteristics)
        .unwrap_or_default();
    listing.amenities = map.get("amenities").map(as_amenities).unwrap_or_default();
    listing.images = map.get("images").map(as_url_list).unwrap_or_default();

    listing
}

fn positive(map: &Map<String, Value>, key: &str, source: SourceId) -> Option<f64> {
    let value = map.get(key)?;
    match as_number(value) {
        Some(n) if n > 0.0 && n.is_finite() => Some(n),
        _ => {
            warn!(source = %source, field = key, "dropping non-positive value {value}");
            None
        }
    }
}

fn as_text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_number_text(s),
        _ => None,
    }
}

/// Parse human-formatted numbers: `31 000 000 ₽`, `75,5 м²`, `12.5 млн`.
pub fn parse_number_text(text: &str) -> Option<f64> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"\d+(?:[.,]\d+)?").ok()).as_ref()?;

    let compact: String = text
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '\u{a0}' && *c != '\u{202f}')
        .collect();
    let m = re.find(&compact)?;
    let base: f64 = m.as_str().replace(',', ".").parse().ok()?;
    let lower = compact.to_lowercase();
    let multiplier = if lower.contains("млрд") {
        1e9
    } else if lower.contains("млн") {
        1e6
    } else if lower.contains("тыс") {
        1e3
    } else {
        1.0
    };
    Some(base * multiplier)
}

/// Room count plus studio tag. Studios and zero-room layouts count as one room.
fn parse_rooms(v: &Value) -> Option<(u32, bool)> {
    match v {
        Value::Number(n) => match n.as_u64()? {
            0 => Some((1, true)),
            k => Some((k.min(50) as u32, false)),
        },
        Value::String(s) => {
            let lower = s.to_lowercase();
            if lower.contains("студ") || lower.contains("studio") {
                return Some((1, true));
            }
            let n = parse_number_text(&lower)? as u32;
            match n {
                0 => Some((1, true)),
                k => Some((k, false)),
            }
        }
        _ => None,
    }
}

/// `5/12`, `5 из 12`, `5` → (floor, floor_count).
fn parse_floor_pair(v: &Value) -> (Option<i32>, Option<i32>) {
    match v {
        Value::Number(n) => (n.as_i64().map(|f| f as i32), None),
        Value::String(s) => {
            static RE: OnceLock<Option<Regex>> = OnceLock::new();
            let re = RE.get_or_init(|| Regex::new(r"(-?\d+)(?:\s*(?:/|из|of)\s*(\d+))?").ok());
            match re.as_ref().and_then(|re| re.captures(s)) {
                Some(caps) => (
                    caps.get(1).and_then(|m| m.as_str().parse().ok()),
                    caps.get(2).and_then(|m| m.as_str().parse().ok()),
                ),
                None => (None, None),
            }
        }
        _ => (None, None),
    }
}

fn as_name_list(v: &Value) -> Vec<String> {
    match v {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::Object(obj) => obj
                    .get("name")
                    .or_else(|| obj.get("title"))
                    .and_then(as_text),
                other => as_text(other),
            })
            .collect(),
        Value::String(s) => s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
        _ => Vec::new(),
    }
}

fn as_url_list(v: &Value) -> Vec<String> {
    match v {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::Object(obj) => obj
                    .get("url")
                    .or_else(|| obj.get("src"))
                    .or_else(|| obj.get("fullUrl"))
                    .and_then(as_text),
                other => as_text(other),
            })
            .collect(),
        Value::String(s) => vec![s.clone()],
        _ => Vec::new(),
    }
}

fn as_characteristics(v: &Value) -> BTreeMap<String, String> {
    match v {
        Value::Object(obj) => obj
            .iter()
            .filter_map(|(k, v)| as_text(v).map(|t| (k.clone(), t)))
            .collect(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| {
                let obj = item.as_object()?;
                let name = obj.get("name").or_else(|| obj.get("title")).and_then(as_text)?;
                let value = obj.get("value").and_then(as_text)?;
                Some((name, value))
            })
            .collect(),
        _ => BTreeMap::new(),
    }
}

fn as_amenities(v: &Value) -> BTreeMap<String, bool> {
    match v {
        Value::Object(obj) => obj
            .iter()
            .filter_map(|(k, v)| as_flag(v).map(|b| (k.clone(), b)))
            .collect(),
        Value::Array(items) => items
            .iter()
            .filter_map(as_text)
            .map(|name| (name, true))
            .collect(),
        _ => BTreeMap::new(),
    }
}

fn as_flag(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|i| i != 0),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "да" | "есть" | "yes" | "true" | "1" => Some(true),
            "нет" | "no" | "false" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn as_new_build_flag(v: &Value) -> Option<bool> {
    if let Value::String(s) = v {
        let lower = s.to_lowercase();
        if lower.contains("новостр") || lower.contains("new") {
            return Some(true);
        }
        if lower.contains("вторич") || lower.contains("resale") || lower.contains("secondary") {
            return Some(false);
        }
    }
    as_flag(v)
}

/// Reusable transforms for source rule tables.
pub mod transforms {
    use super::{parse_floor_pair, parse_number_text, parse_rooms};
    use serde_json::{json, Value};

    /// Human-formatted number to a JSON number.
    pub fn number(v: &Value) -> Result<Value, String> {
        match v {
            Value::Number(_) => Ok(v.clone()),
            Value::String(s) => parse_number_text(s)
                .map(|n| json!(n))
                .ok_or_else(|| format!("not a number: {s:?}")),
            other => Err(format!("not a number: {other}")),
        }
    }

    /// Room label to a count, or `"studio"`.
    pub fn rooms(v: &Value) -> Result<Value, String> {
        match parse_rooms(v) {
            Some((_, true)) => Ok(json!("studio")),
            Some((n, false)) => Ok(json!(n)),
            None => Err(format!("unrecognized room label: {v}")),
        }
    }

    pub fn floor_of(v: &Value) -> Result<Value, String> {
        parse_floor_pair(v)
            .0
            .map(|f| json!(f))
            .ok_or_else(|| format!("no floor in {v}"))
    }

    pub fn floor_count_of(v: &Value) -> Result<Value, String> {
        parse_floor_pair(v)
            .1
            .map(|f| json!(f))
            .ok_or_else(|| format!("no floor count in {v}"))
    }

    /// Join an array of address parts (`[{"name": ..}, ..]` or strings) with commas.
    pub fn join_names(v: &Value) -> Result<Value, String> {
        let parts: Vec<String> = match v {
            Value::Array(items) => items
                .iter()
                .filter_map(|item| match item {
                    Value::Object(obj) => obj
                        .get("fullName")
                        .or_else(|| obj.get("name"))
                        .and_then(Value::as_str)
                        .map(String::from),
                    Value::String(s) => Some(s.clone()),
                    _ => None,
                })
                .collect(),
            Value::String(s) => vec![s.clone()],
            other => return Err(format!("cannot join {other}")),
        };
        if parts.is_empty() {
            return Err("empty address parts".into());
        }
        Ok(json!(parts.join(", ")))
    }

    /// Prefix a site-relative path with the given origin.
    pub fn absolute_url(origin: &'static str) -> impl Fn(&Value) -> Result<Value, String> {
        move |v| {
            let s = v.as_str().ok_or_else(|| format!("not a url: {v}"))?;
            if s.starts_with("http://") || s.starts_with("https://") {
                Ok(json!(s))
            } else {
                Ok(json!(format!("{}/{}", origin.trim_end_matches('/'), s.trim_start_matches('/'))))
            }
        }
    }
}
