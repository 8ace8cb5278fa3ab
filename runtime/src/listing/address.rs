//! Address parsing and region inference.
//!
//! Region is inferred independently from free-form address text and from a
//! listing URL so the two can be cross-checked during validation.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// Locale used to keep comparables geographically admissible.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Region {
    Moscow,
    MoscowOblast,
    SaintPetersburg,
    LeningradOblast,
    Other(String),
}

impl Region {
    /// Path slug used by catalog URLs.
    pub fn slug(&self) -> String {
        match self {
            Self::Moscow => "moskva".into(),
            Self::MoscowOblast => "moskovskaya_oblast".into(),
            Self::SaintPetersburg => "sankt-peterburg".into(),
            Self::LeningradOblast => "leningradskaya_oblast".into(),
            Self::Other(name) => name.replace(' ', "_"),
        }
    }

    /// Numeric region id used by search APIs that take one.
    pub fn api_id(&self) -> Option<u32> {
        match self {
            Self::Moscow => Some(1),
            Self::SaintPetersburg => Some(2),
            Self::LeningradOblast => Some(4588),
            Self::MoscowOblast => Some(4593),
            Self::Other(_) => None,
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Moscow => write!(f, "Москва"),
            Self::MoscowOblast => write!(f, "Московская область"),
            Self::SaintPetersburg => write!(f, "Санкт-Петербург"),
            Self::LeningradOblast => write!(f, "Ленинградская область"),
            Self::Other(name) => write!(f, "{name}"),
        }
    }
}

/// Infer the region from address text. Oblasts are checked before cities so
/// "Московская область" never resolves to Moscow.
pub fn infer_region_from_text(text: &str) -> Option<Region> {
    let t = text.to_lowercase().replace('ё', "е");

    if t.contains("московская обл") || t.contains("моск. обл") || t.contains("moscow oblast") {
        return Some(Region::MoscowOblast);
    }
    if t.contains("ленинградская обл") || t.contains("лен. обл") || t.contains("leningrad oblast") {
        return Some(Region::LeningradOblast);
    }
    if t.contains("санкт-петербург")
        || t.contains("петербург")
        || t.contains("спб")
        || t.contains("saint petersburg")
        || t.contains("st. petersburg")
    {
        return Some(Region::SaintPetersburg);
    }
    if t.contains("москва") || t.contains("moscow") {
        return Some(Region::Moscow);
    }

    static OBLAST_RE: OnceLock<Option<Regex>> = OnceLock::new();
    let oblast_re = OBLAST_RE
        .get_or_init(|| Regex::new(r"([а-я-]+)\s+(?:обл\.?|область)").ok())
        .as_ref()?;
    if let Some(caps) = oblast_re.captures(&t) {
        return Some(Region::Other(format!("{} область", &caps[1])));
    }
    None
}

/// Infer the region from a listing or catalog URL (subdomain, path slug or
/// `region=` query parameter).
pub fn infer_region_from_url(raw: &str) -> Option<Region> {
    let parsed = url::Url::parse(raw).ok()?;
    let host = parsed.host_str().unwrap_or_default().to_lowercase();

    if host.starts_with("spb.") {
        return Some(Region::SaintPetersburg);
    }
    if host.starts_with("msk.") {
        return Some(Region::Moscow);
    }

    if let Some(segments) = parsed.path_segments() {
        for segment in segments {
            match segment.to_lowercase().as_str() {
                "moskva" => return Some(Region::Moscow),
                "sankt-peterburg" => return Some(Region::SaintPetersburg),
                "moskovskaya_oblast" | "moskovskaya-oblast" => return Some(Region::MoscowOblast),
                "leningradskaya_oblast" | "leningradskaya-oblast" => {
                    return Some(Region::LeningradOblast)
                }
                _ => {}
            }
        }
    }

    for (key, value) in parsed.query_pairs() {
        if key == "region" {
            return match value.as_ref() {
                "1" => Some(Region::Moscow),
                "2" => Some(Region::SaintPetersburg),
                "4588" => Some(Region::LeningradOblast),
                "4593" => Some(Region::MoscowOblast),
                _ => None,
            };
        }
    }
    None
}

/// Street, house number and building suffix parsed from an address line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedAddress {
    /// Street as written, used to build search text.
    pub street: String,
    /// Street without type words, lowercased, used for comparisons.
    pub street_key: String,
    pub house_number: u32,
    /// Letter or korpus/stroenie suffix, e.g. `А`, `к2`, `с1`.
    pub building: Option<String>,
}

impl ParsedAddress {
    /// House label as it appears in listings: `12`, `12А`, `12к2`.
    pub fn house_label(&self) -> String {
        match &self.building {
            Some(b) => format!("{}{}", self.house_number, b),
            None => self.house_number.to_string(),
        }
    }

    pub fn same_street(&self, other: &ParsedAddress) -> bool {
        !self.street_key.is_empty() && self.street_key == other.street_key
    }

    /// House-number distance, defined only on the same street.
    pub fn house_distance(&self, other: &ParsedAddress) -> Option<u32> {
        self.same_street(other)
            .then(|| self.house_number.abs_diff(other.house_number))
    }
}

const STREET_TYPE_WORDS: &[&str] = &[
    "ул", "улица", "пр-т", "проспект", "просп", "пр", "пер", "переулок", "ш", "шоссе", "б-р",
    "бульвар", "наб", "набережная", "пл", "площадь", "проезд", "пр-д", "туп", "тупик", "аллея",
];

/// Parse an address line such as `Москва, ул. Тверская, 12к2`.
///
/// Returns `None` when no street/house pair can be identified; callers treat
/// that as "skip address-based tiers", never as an error.
pub fn parse_address(text: &str) -> Option<ParsedAddress> {
    let segments: Vec<&str> = text
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();

    for i in (0..segments.len()).rev() {
        if let Some((house_number, building)) = parse_house(segments[i]) {
            if i == 0 {
                continue;
            }
            let street_raw = segments[i - 1];
            let key = street_key(street_raw);
            if key.is_empty()
                || (infer_region_from_text(street_raw).is_some() && key.split(' ').count() < 2)
            {
                continue;
            }
            return Some(ParsedAddress {
                street: street_raw.to_string(),
                street_key: key,
                house_number,
                building,
            });
        }

        if let Some(parsed) = parse_inline(segments[i]) {
            return Some(parsed);
        }
    }
    None
}

fn house_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)^(?:д\.?|дом)?\s*(\d{1,4})\s*([а-яa-z])?\s*(?:(корпус|корп\.?|к|строение|стр\.?|с)\s*(\d{1,3}))?$",
        )
        .ok()
    })
    .as_ref()
}

/// Parse a house segment like `12`, `д. 5А`, `12к2`, `7 стр. 1`.
fn parse_house(segment: &str) -> Option<(u32, Option<String>)> {
    let caps = house_regex()?.captures(segment.trim())?;
    let number: u32 = caps.get(1)?.as_str().parse().ok()?;
    if number == 0 {
        return None;
    }
    let letter = caps.get(2).map(|m| m.as_str().to_uppercase());
    let korpus = match (caps.get(3), caps.get(4)) {
        (Some(kind), Some(n)) => {
            let kind = kind.as_str().to_lowercase();
            let prefix = if kind.starts_with('к') { "к" } else { "с" };
            Some(format!("{prefix}{}", n.as_str()))
        }
        _ => None,
    };
    let building = match (letter, korpus) {
        (Some(l), Some(k)) => Some(format!("{l}{k}")),
        (Some(l), None) => Some(l),
        (None, Some(k)) => Some(k),
        (None, None) => None,
    };
    Some((number, building))
}

/// `Тверская ул. 12к2` or `улица Ленина д. 5` without a separating comma.
fn parse_inline(segment: &str) -> Option<ParsedAddress> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = RE
        .get_or_init(|| Regex::new(r"^(.*?\D)\s+((?:д\.?|дом)?\s*\d{1,4}.*)$").ok())
        .as_ref()?;
    let caps = re.captures(segment)?;
    let street_raw = caps.get(1)?.as_str().trim();
    let (house_number, building) = parse_house(caps.get(2)?.as_str())?;
    let key = street_key(street_raw);
    if key.is_empty() || (infer_region_from_text(street_raw).is_some() && key.split(' ').count() < 2) {
        return None;
    }
    Some(ParsedAddress {
        street: street_raw.to_string(),
        street_key: key,
        house_number,
        building,
    })
}

/// Lowercased street name without type words such as `ул.` or `проспект`.
pub fn street_key(street: &str) -> String {
    street
        .to_lowercase()
        .replace('ё', "е")
        .split(|c: char| c.is_whitespace() || c == '.' || c == ',')
        .filter(|w| !w.is_empty() && !STREET_TYPE_WORDS.contains(w))
        .collect::<Vec<_>>()
        .join(" ")
}
