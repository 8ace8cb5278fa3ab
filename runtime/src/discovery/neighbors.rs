//! Neighboring house-number generation.

use crate::listing::address::ParsedAddress;

/// Highest building suffix tried on the target's own house number.
const MAX_KORPUS: u32 = 3;

/// One neighboring address to query, with its house-number distance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborAddress {
    pub house_number: u32,
    pub building: Option<String>,
    pub distance: u32,
}

impl NeighborAddress {
    pub fn label(&self) -> String {
        match &self.building {
            Some(b) => format!("{}{}", self.house_number, b),
            None => self.house_number.to_string(),
        }
    }

    /// Whether a parsed candidate address is this house on the given street.
    pub fn matches(&self, street: &ParsedAddress, candidate: &ParsedAddress) -> bool {
        street.same_street(candidate)
            && candidate.house_number == self.house_number
            && candidate.building.as_deref().map(str::to_lowercase)
                == self.building.as_deref().map(str::to_lowercase)
    }
}

/// Neighbors of `address` within `radius` house numbers.
///
/// Order: other buildings of the same house first, then same-parity numbers
/// (the same side of the street) by distance, then the opposite side.
/// The target itself is never included.
pub fn neighboring_houses(address: &ParsedAddress, radius: u32) -> Vec<NeighborAddress> {
    let n = address.house_number;
    let own = address.building.as_deref().map(str::to_lowercase);
    let mut out = Vec::new();

    if own.is_some() {
        out.push(NeighborAddress {
            house_number: n,
            building: None,
            distance: 0,
        });
    }
    for k in 1..=MAX_KORPUS {
        let building = format!("к{k}");
        if own.as_deref() == Some(building.as_str()) {
            continue;
        }
        out.push(NeighborAddress {
            house_number: n,
            building: Some(building),
            distance: 0,
        });
    }

    let same_side = (1..=radius).filter(|d| d % 2 == 0);
    let opposite_side = (1..=radius).filter(|d| d % 2 == 1);
    for d in same_side.chain(opposite_side) {
        if n > d {
            out.push(NeighborAddress {
                house_number: n - d,
                building: None,
                distance: d,
            });
        }
        out.push(NeighborAddress {
            house_number: n + d,
            building: None,
            distance: d,
        });
    }
    out
}
