/// Unit-token parsing shared by the post-processor and the unit tagger.
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Closed set of dispatchable unit types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitType {
    Ambulance,
    Ems,
    Medic,
    Squad,
    Engine,
    Ladder,
    Rescue,
    Truck,
    Battalion,
    Chief,
}

impl UnitType {
    pub fn parse(token: &str) -> Option<Self> {
        match token.to_ascii_lowercase().as_str() {
            "ambulance" => Some(Self::Ambulance),
            "ems" => Some(Self::Ems),
            "medic" => Some(Self::Medic),
            "squad" => Some(Self::Squad),
            "engine" => Some(Self::Engine),
            "ladder" => Some(Self::Ladder),
            "rescue" => Some(Self::Rescue),
            "truck" => Some(Self::Truck),
            "battalion" => Some(Self::Battalion),
            "chief" => Some(Self::Chief),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ambulance => "ambulance",
            Self::Ems => "ems",
            Self::Medic => "medic",
            Self::Squad => "squad",
            Self::Engine => "engine",
            Self::Ladder => "ladder",
            Self::Rescue => "rescue",
            Self::Truck => "truck",
            Self::Battalion => "battalion",
            Self::Chief => "chief",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Ambulance => "Ambulance",
            Self::Ems => "EMS",
            Self::Medic => "Medic",
            Self::Squad => "Squad",
            Self::Engine => "Engine",
            Self::Ladder => "Ladder",
            Self::Rescue => "Rescue",
            Self::Truck => "Truck",
            Self::Battalion => "Battalion",
            Self::Chief => "Chief",
        }
    }

    /// Default marker color used when a tag is auto-created.
    pub fn default_color(&self) -> &'static str {
        match self {
            Self::Ambulance | Self::Ems | Self::Medic => "#d43d2a",
            Self::Engine | Self::Ladder | Self::Truck => "#c7841e",
            Self::Squad | Self::Rescue => "#2a6fd4",
            Self::Battalion | Self::Chief => "#6b4fd4",
        }
    }
}

/// Alternation used inside the address and unit extraction regexes.
pub const UNIT_TOKEN_ALTERNATION: &str =
    "ambulance|ems|medic|squad|engine|ladder|rescue|truck|battalion|chief";

static UNIT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)\b({UNIT_TOKEN_ALTERNATION})\s*(\d{{1,2}})(?:[-,]\d{{1,2}})?\b"
    ))
    .unwrap()
});

static UNIT_TOKEN_ONLY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!(r"(?i)\b({UNIT_TOKEN_ALTERNATION})\b")).unwrap());

/// Extract `(unit_type, unit_number)` pairs from a cleaned transcript.
/// Numbers outside 1..=99 are dropped; duplicates collapse.
pub fn parse_units(text: &str) -> Vec<(UnitType, u16)> {
    let mut seen = Vec::new();
    for caps in UNIT_RE.captures_iter(text) {
        let Some(unit_type) = UnitType::parse(&caps[1]) else {
            continue;
        };
        let Ok(number) = caps[2].parse::<u16>() else {
            continue;
        };
        if !(1..=99).contains(&number) {
            continue;
        }
        if !seen.contains(&(unit_type, number)) {
            seen.push((unit_type, number));
        }
    }
    seen
}

/// Whether `text` mentions any unit-type token at all, numbered or not.
pub fn contains_unit_token(text: &str) -> bool {
    UNIT_TOKEN_ONLY_RE.is_match(text)
}

/// Whether `text` is nothing but unit callouts (e.g. "Engine 26, Medic 26"),
/// the signature of a dispatch header cut off before the address.
pub fn is_units_only(text: &str) -> bool {
    let stripped = UNIT_RE.replace_all(text, "");
    !parse_units(text).is_empty()
        && stripped
            .chars()
            .all(|c| c.is_whitespace() || c.is_ascii_punctuation())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_units_basic() {
        let units = parse_units("Engine 19, 1555 South Harding Street, Chest Pain");
        assert_eq!(units, vec![(UnitType::Engine, 19)]);
    }

    #[test]
    fn test_out_of_range_numbers_dropped() {
        // Three-digit numbers are never unit numbers here.
        let units = parse_units("Engine 995, Medic 73 responding");
        assert_eq!(units, vec![(UnitType::Medic, 73)]);
        assert!(parse_units("engine 0 responding").is_empty());
    }

    #[test]
    fn test_dedup() {
        let units = parse_units("medic 26 copy, medic 26 en route");
        assert_eq!(units, vec![(UnitType::Medic, 26)]);
    }

    #[test]
    fn test_units_only_detection() {
        assert!(is_units_only("Engine 26, Medic 26"));
        assert!(!is_units_only("Engine 26 responding to Main Street"));
        assert!(!is_units_only("7212 US 31 South"));
    }
}
