//! Output mode flags and formatting helpers shared by every subcommand.

use comps_runtime::listing::PropertyListing;
use serde::Serialize;

/// Set by `--json`.
pub fn is_json() -> bool {
    std::env::var("COMPS_JSON").is_ok_and(|v| v == "1")
}

/// Set by `--quiet`.
pub fn is_quiet() -> bool {
    std::env::var("COMPS_QUIET").is_ok_and(|v| v == "1")
}

pub fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(e) => eprintln!("  Error: failed to serialize output: {e}"),
    }
}

/// `31 000 000 ₽`, or `-` when unknown.
pub fn money(value: Option<f64>) -> String {
    let Some(v) = value else {
        return "-".to_string();
    };
    let digits = format!("{:.0}", v.round());
    let mut out = String::new();
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(' ');
        }
        out.push(c);
    }
    format!("{out} ₽")
}

pub fn area(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |a| format!("{a:.1} м²"))
}

/// One-line summary: rooms, area, floor, price, address.
pub fn listing_line(listing: &PropertyListing) -> String {
    let rooms = match (listing.is_studio, listing.rooms) {
        (true, _) => "студия".to_string(),
        (false, Some(r)) => format!("{r}-комн."),
        (false, None) => "?-комн.".to_string(),
    };
    let floor = match (listing.floor, listing.floor_count) {
        (Some(f), Some(n)) => format!("{f}/{n} эт."),
        (Some(f), None) => format!("{f} эт."),
        _ => "-".to_string(),
    };
    format!(
        "{rooms:<8} {:<10} {:<9} {:>16}  {}",
        area(listing.total_area),
        floor,
        money(listing.price),
        listing.address.as_deref().unwrap_or("-")
    )
}
