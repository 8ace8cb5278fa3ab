//! Raw payload extraction, one adapter per source.
//!
//! Turns a fetched body (API JSON or rendered HTML) into the raw JSON payload
//! that [`Normalizer`](crate::listing::normalize::Normalizer) maps onto the
//! canonical schema. HTML pages are searched, in order, for the site's
//! embedded state (`window.__X__ = {...}` or JSON script tags), then JSON-LD,
//! then OpenGraph. Markup knowledge lives only here.

use super::SourceId;
use crate::error::{ScrapeError, ScrapeResult};
use crate::fetch::FetchedDocument;
use scraper::{Html, Selector};
use serde_json::{json, Map, Value};

impl SourceId {
    /// A key that only this source's listing objects carry. Used to locate
    /// listings inside arbitrarily nested API responses and page state.
    pub fn signature_key(self) -> &'static str {
        match self {
            Self::Cian => "bargainTerms",
            Self::Avito => "priceDetailed",
            Self::Domclick => "objectInfo",
            Self::YandexRealty => "offerId",
        }
    }
}

/// Extract the single listing payload from a listing page or API response.
pub fn extract_listing(source: SourceId, doc: &FetchedDocument) -> ScrapeResult<Value> {
    let found = if doc.is_json() {
        let value: Value = serde_json::from_str(&doc.body)?;
        first_with_key(&value, source.signature_key())
            .cloned()
            .or_else(|| value.is_object().then_some(value))
    } else {
        let html = Html::parse_document(&doc.body);
        let state = embedded_state(&html)
            .iter()
            .find_map(|s| first_with_key(s, source.signature_key()).cloned());
        let mut found = state.unwrap_or_else(|| Value::Object(Map::new()));
        if let Value::Object(obj) = &mut found {
            if let Some(Value::Object(ld)) = jsonld_listing(&html) {
                fill_missing(obj, ld);
            }
            fill_missing(obj, opengraph(&html));
        }
        let empty = found.as_object().map_or(true, Map::is_empty);
        (!empty).then_some(found)
    };
    let mut payload = found.ok_or_else(|| {
        ScrapeError::Extraction(format!("no {source} listing payload in {}", doc.final_url))
    })?;

    if let Value::Object(obj) = &mut payload {
        obj.entry("url").or_insert_with(|| json!(doc.final_url));
    }
    Ok(payload)
}

/// Extract every listing payload from a catalog (search results) page.
pub fn extract_catalog(source: SourceId, doc: &FetchedDocument) -> ScrapeResult<Vec<Value>> {
    let key = source.signature_key();
    let mut items = Vec::new();

    if doc.is_json() {
        let value: Value = serde_json::from_str(&doc.body)?;
        collect_with_key(&value, key, &mut items);
    } else {
        let html = Html::parse_document(&doc.body);
        for state in embedded_state(&html) {
            collect_with_key(&state, key, &mut items);
        }
        if items.is_empty() {
            items.extend(jsonld_item_list(&html));
        }
    }
    Ok(items)
}

/// JSON blobs embedded in the page: JSON script tags and `window.X = {...}` assignments.
fn embedded_state(html: &Html) -> Vec<Value> {
    let mut blobs = Vec::new();
    let Ok(sel) = Selector::parse("script") else {
        return blobs;
    };
    for script in html.select(&sel) {
        let text: String = script.text().collect();
        let script_type = script.value().attr("type").unwrap_or_default();
        if script_type == "application/ld+json" {
            continue;
        }
        if script_type.contains("json") {
            if let Ok(value) = serde_json::from_str::<Value>(text.trim()) {
                blobs.push(value);
            }
            continue;
        }
        let mut rest = text.as_str();
        while let Some(pos) = rest.find("window.") {
            rest = &rest[pos + "window.".len()..];
            let Some(eq) = rest.find('=') else { break };
            let name = rest[..eq].trim();
            if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || "_$[]'\".-".contains(c)) {
                continue;
            }
            let value_text = rest[eq + 1..].trim_start();
            if !value_text.starts_with('{') && !value_text.starts_with('[') {
                continue;
            }
            let mut stream = serde_json::Deserializer::from_str(value_text).into_iter::<Value>();
            if let Some(Ok(value)) = stream.next() {
                blobs.push(value);
            }
        }
    }
    blobs
}

fn jsonld_blocks(html: &Html) -> Vec<Value> {
    let Ok(sel) = Selector::parse(r#"script[type="application/ld+json"]"#) else {
        return Vec::new();
    };
    html.select(&sel)
        .filter_map(|s| serde_json::from_str::<Value>(s.text().collect::<String>().trim()).ok())
        .flat_map(|v| match v {
            Value::Array(items) => items,
            Value::Object(ref obj) if obj.contains_key("@graph") => {
                obj["@graph"].as_array().cloned().unwrap_or_default()
            }
            other => vec![other],
        })
        .collect()
}

fn is_listing_type(v: &Value) -> bool {
    let matches = |t: &str| {
        matches!(
            t,
            "Product" | "Offer" | "Apartment" | "SingleFamilyResidence" | "Residence" | "RealEstateListing"
        )
    };
    match v.get("@type") {
        Some(Value::String(t)) => matches(t),
        Some(Value::Array(ts)) => ts.iter().filter_map(Value::as_str).any(matches),
        _ => false,
    }
}

/// First JSON-LD listing block mapped onto canonical keys.
fn jsonld_listing(html: &Html) -> Option<Value> {
    jsonld_blocks(html)
        .into_iter()
        .find(is_listing_type)
        .map(|block| Value::Object(jsonld_to_canonical(&block)))
}

/// `ItemList` entries mapped onto canonical keys.
fn jsonld_item_list(html: &Html) -> Vec<Value> {
    jsonld_blocks(html)
        .into_iter()
        .filter(|b| b.get("@type").and_then(Value::as_str) == Some("ItemList"))
        .flat_map(|list| {
            list.get("itemListElement")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default()
        })
        .map(|el| el.get("item").cloned().unwrap_or(el))
        .filter(is_listing_type)
        .map(|item| Value::Object(jsonld_to_canonical(&item)))
        .collect()
}

fn jsonld_to_canonical(block: &Value) -> Map<String, Value> {
    let mut out = Map::new();
    let mut put = |key: &str, value: Option<&Value>| {
        if let Some(v) = value.filter(|v| !v.is_null()) {
            out.entry(key.to_string()).or_insert_with(|| v.clone());
        }
    };
    put("title", block.get("name"));
    put("url", block.get("url"));
    let offers = block.get("offers").map(|o| match o {
        Value::Array(items) => items.first().cloned().unwrap_or(Value::Null),
        other => other.clone(),
    });
    put("price", offers.as_ref().and_then(|o| o.get("price")));
    put("price", block.get("price"));
    put("total_area", block.get("floorSize").and_then(|f| f.get("value").or(Some(f))));
    put("rooms", block.get("numberOfRooms"));
    let address = block.get("address").map(|a| match a {
        Value::Object(parts) => {
            let joined: Vec<&str> = ["addressLocality", "streetAddress"]
                .iter()
                .filter_map(|k| parts.get(*k).and_then(Value::as_str))
                .collect();
            json!(joined.join(", "))
        }
        other => other.clone(),
    });
    put("address", address.as_ref());
    put("images", block.get("image"));
    out
}

fn opengraph(html: &Html) -> Map<String, Value> {
    let mut out = Map::new();
    let Ok(sel) = Selector::parse(r#"meta[property^="og:"]"#) else {
        return out;
    };
    for meta in html.select(&sel) {
        let (Some(property), Some(content)) = (meta.value().attr("property"), meta.value().attr("content"))
        else {
            continue;
        };
        let key = match property {
            "og:title" => "title",
            "og:url" => "url",
            "og:image" => "images",
            "og:price:amount" => "price",
            _ => continue,
        };
        out.entry(key.to_string())
            .or_insert_with(|| json!(content.trim()));
    }
    out
}

fn fill_missing(target: &mut Map<String, Value>, extra: Map<String, Value>) {
    for (k, v) in extra {
        target.entry(k).or_insert(v);
    }
}

/// Depth-first search for the first object carrying `key`.
fn first_with_key<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    match value {
        Value::Object(obj) if obj.contains_key(key) => Some(value),
        Value::Object(obj) => obj.values().find_map(|v| first_with_key(v, key)),
        Value::Array(items) => items.iter().find_map(|v| first_with_key(v, key)),
        _ => None,
    }
}

/// Every outermost object carrying `key`, in document order.
fn collect_with_key(value: &Value, key: &str, out: &mut Vec<Value>) {
    match value {
        Value::Object(obj) if obj.contains_key(key) => out.push(value.clone()),
        Value::Object(obj) => obj.values().for_each(|v| collect_with_key(v, key, out)),
        Value::Array(items) => items.iter().for_each(|v| collect_with_key(v, key, out)),
        _ => {}
    }
}
