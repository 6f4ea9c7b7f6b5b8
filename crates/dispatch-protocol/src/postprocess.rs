/// Transcript post-processing: noise/hallucination rejection, dictionary
/// correction, number reconstruction, and structured-field extraction
/// (address, units, call type, acuity).
///
/// `PostProcessor::process` is a pure function over the raw transcript
/// and its confidence; cleaning is a fixed point, so re-processing an
/// already-cleaned transcript yields the same cleaned text.
use std::sync::LazyLock;

use regex::Regex;

use crate::call::AcuityLevel;
use crate::dictionary::CorrectionDictionary;
use crate::taxonomy::{self, CallType};
use crate::units::{self, UnitType};

/// Confidence floor forced onto rejected (noise/hallucination) transcripts.
const REJECT_CONFIDENCE: f64 = 0.1;

/// Confidence penalty per parse error.
const PARSE_ERROR_PENALTY: f64 = 0.05;

const STREET_TYPES: &str = "street|st|avenue|ave|road|rd|drive|dr|lane|ln|place|pl|court|ct|\
circle|cir|boulevard|blvd|parkway|pkwy|way|trail|terrace|ter|alley|loop|row|plaza|square";

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedAddress {
    pub text: String,
    pub confidence: f64,
}

#[derive(Debug, Clone)]
pub struct PostProcessOutput {
    pub cleaned: String,
    pub is_noise: bool,
    pub is_hallucination: bool,
    pub address: Option<ExtractedAddress>,
    pub units: Vec<(UnitType, u16)>,
    pub call_type: Option<CallType>,
    pub acuity: Option<AcuityLevel>,
    pub confidence: f64,
    pub parse_errors: u32,
}

pub struct PostProcessor {
    dict: CorrectionDictionary,
    /// Reject address candidates made entirely of call-type phrase words
    /// ("Chest Pain Street" is almost never a street). Tunable because it
    /// can mask rare legitimate addresses.
    reject_call_type_addresses: bool,
}

impl Default for PostProcessor {
    fn default() -> Self {
        Self::new(CorrectionDictionary::default(), true)
    }
}

impl PostProcessor {
    pub fn new(dict: CorrectionDictionary, reject_call_type_addresses: bool) -> Self {
        Self {
            dict,
            reject_call_type_addresses,
        }
    }

    pub fn process(&self, raw: &str, raw_confidence: f64) -> PostProcessOutput {
        let is_noise = detect_noise(raw);
        let is_hallucination = detect_hallucination(raw);

        let cleaned = self.clean(raw);

        if is_noise || is_hallucination {
            return PostProcessOutput {
                cleaned,
                is_noise,
                is_hallucination,
                address: None,
                units: Vec::new(),
                call_type: Some(CallType::NonEmergency),
                acuity: None,
                confidence: REJECT_CONFIDENCE,
                parse_errors: 0,
            };
        }

        let mut parse_errors = 0u32;
        let units = units::parse_units(&cleaned);
        let address = self.extract_address(&cleaned, &mut parse_errors);
        let lowered = cleaned.to_lowercase();
        let call_type = taxonomy::match_call_type(&lowered).map(|(t, _)| t);
        let acuity = extract_acuity(&cleaned, &lowered);

        let confidence = (raw_confidence
            * (1.0 - PARSE_ERROR_PENALTY * f64::from(parse_errors)))
        .clamp(0.0, 1.0);

        PostProcessOutput {
            cleaned,
            is_noise,
            is_hallucination,
            address,
            units,
            call_type,
            acuity,
            confidence,
            parse_errors,
        }
    }

    /// Dictionary pass, number reconstruction, whitespace collapse.
    /// Idempotent: cleaning a cleaned transcript changes nothing.
    pub fn clean(&self, raw: &str) -> String {
        let corrected = self.dict.apply(raw.trim());
        let rejoined = reconstruct_numbers(&corrected);
        collapse_whitespace(&rejoined)
    }

    // ── Address extraction ──────────────────────────────────────────────

    /// Four pattern families in priority order; the first candidate that
    /// survives validation wins.
    fn extract_address(&self, cleaned: &str, parse_errors: &mut u32) -> Option<ExtractedAddress> {
        let candidates = [
            (address_after_units(cleaned), AddressKind::Numbered, 0.95),
            (numbered_street(cleaned), AddressKind::Numbered, 0.85),
            (intersection(cleaned), AddressKind::Intersection, 0.8),
            (grid_coordinate(cleaned), AddressKind::Grid, 0.6),
        ];

        for (candidate, kind, confidence) in candidates {
            let Some(text) = candidate else { continue };
            if self.validate(&text, kind) {
                return Some(ExtractedAddress {
                    text: normalize_address(&text),
                    confidence,
                });
            }
            *parse_errors += 1;
        }
        None
    }

    fn validate(&self, candidate: &str, kind: AddressKind) -> bool {
        if candidate.len() < 3 {
            return false;
        }
        if !candidate.chars().any(|c| c.is_ascii_alphabetic()) {
            return false;
        }
        if !matches!(kind, AddressKind::Intersection | AddressKind::Grid)
            && !STREET_TYPE_RE.is_match(candidate)
        {
            return false;
        }
        if units::contains_unit_token(candidate) {
            return false;
        }
        if self.reject_call_type_addresses && is_all_call_type_words(candidate) {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Copy)]
enum AddressKind {
    Numbered,
    Intersection,
    Grid,
}

// ── Noise / hallucination detection ─────────────────────────────────────

static BEEP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\{beep(?:ing)?\}|[\[(](?:tone|tones|static|beeping)[\])]").unwrap()
});

static PROMO_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)for more\b.{0,60}\bvisit|\bsubscribe\b|https?://|\bwww\.|\.(?:com|net|org)\b")
        .unwrap()
});

fn detect_noise(raw: &str) -> bool {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return true;
    }
    if BEEP_RE.is_match(trimmed) {
        return true;
    }
    // Every character a digit or punctuation: tones transcribed as "1 1 1".
    if trimmed
        .chars()
        .all(|c| c.is_ascii_digit() || c.is_ascii_punctuation() || c.is_whitespace())
    {
        return true;
    }
    // Single-word transcripts carry no dispatch content.
    let without_markers = BEEP_RE.replace_all(trimmed, "");
    if without_markers.split_whitespace().count() <= 1 {
        return true;
    }
    false
}

fn detect_hallucination(raw: &str) -> bool {
    PROMO_RE.is_match(raw)
}

// ── Number reconstruction ───────────────────────────────────────────────

static COMMA_NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{1,3}(?:,\d{3})+\b").unwrap());

static DASH_NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d+)-(\d+)\b").unwrap());

static SPACED_DIGITS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{1,3}(?: \d{1,3})+\b").unwrap());

/// `"10,301"` → `"10301"`, `"78-47"` → `"7847"`, `"78 47 12"` → `"784712"`.
fn reconstruct_numbers(text: &str) -> String {
    let step = COMMA_NUMBER_RE.replace_all(text, |caps: &regex::Captures<'_>| {
        caps[0].replace(',', "")
    });
    let step = DASH_NUMBER_RE.replace_all(&step, "$1$2");
    SPACED_DIGITS_RE
        .replace_all(&step, |caps: &regex::Captures<'_>| caps[0].replace(' ', ""))
        .into_owned()
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ── Address pattern families ────────────────────────────────────────────

static STREET_TYPE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!(r"(?i)\b(?:{STREET_TYPES})\b")).unwrap());

static UNIT_PREFIX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:engine|medic|ambulance|squad|rescue|ladder|ems)\s+\d+[,\s]+").unwrap()
});

static NUMBERED_STREET_RE: LazyLock<Regex> = LazyLock::new(|| {
    let cardinal = r"(?:north|south|east|west|n|s|e|w)\.?\s+";
    let name = r"[a-z][a-z']*(?:\s+[a-z][a-z']*){0,3}?";
    Regex::new(&format!(
        r"(?i)\b(\d{{1,6}})[,\s]+(?:{cardinal})?{name}\s+(?:{STREET_TYPES})\b"
    ))
    .unwrap()
});

static INTERSECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    let side = r"[A-Z0-9][\w']*(?:\s+[A-Za-z][\w']*)";
    Regex::new(&format!(
        r"\b({side}{{0,3}})\s+(?:and|&|at)\s+({side}{{0,3}}?(?:\s+(?i:{STREET_TYPES}))?)\b"
    ))
    .unwrap()
});

static GRID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b[nsew]\s*\d+\s*&\s*\d+\s*[nsew]\b").unwrap());

/// Family 1: the text after the last numbered unit callout usually opens
/// with the incident address.
fn address_after_units(cleaned: &str) -> Option<String> {
    let last = UNIT_PREFIX_RE.find_iter(cleaned).last()?;
    let tail = &cleaned[last.end()..];
    NUMBERED_STREET_RE
        .find(tail)
        .map(|m| m.as_str().to_string())
}

/// Family 2: standard numbered street anywhere in the transcript.
fn numbered_street(cleaned: &str) -> Option<String> {
    NUMBERED_STREET_RE
        .find(cleaned)
        .map(|m| m.as_str().to_string())
}

/// Family 3: `<street> and|&|at <street>`. Both sides must read like
/// proper nouns (capitalized or numbered) to keep "fell and injured"
/// out of the candidate pool. The second side stops early unless it ends
/// with a street type.
fn intersection(cleaned: &str) -> Option<String> {
    let caps = INTERSECTION_RE.captures(cleaned)?;
    Some(caps.get(0)?.as_str().to_string())
}

/// Family 4: grid coordinate like `N 200 & 450 W`.
fn grid_coordinate(cleaned: &str) -> Option<String> {
    GRID_RE.find(cleaned).map(|m| m.as_str().to_string())
}

/// Strip commas and collapse runs of spaces in a validated candidate:
/// `"10301, Terminal Way"` → `"10301 Terminal Way"`.
fn normalize_address(candidate: &str) -> String {
    collapse_whitespace(&candidate.replace(',', " "))
        .trim_matches(|c: char| c == ',' || c.is_whitespace())
        .to_string()
}

/// Whether every word of the candidate appears in some taxonomy keyword
/// (plus connective filler), i.e. the "address" is really a call type.
fn is_all_call_type_words(candidate: &str) -> bool {
    const FILLER: &[&str] = &["and", "at", "the", "of", "a", "an", "&"];
    let mut saw_word = false;
    for word in candidate.split_whitespace() {
        let word = word
            .trim_matches(|c: char| !c.is_alphanumeric())
            .to_lowercase();
        if word.is_empty() || FILLER.contains(&word.as_str()) {
            continue;
        }
        saw_word = true;
        let in_keyword = taxonomy::KEYWORD_TABLE
            .iter()
            .any(|(k, _)| k.split_whitespace().any(|kw| kw == word));
        if !in_keyword {
            return false;
        }
    }
    saw_word
}

// ── Acuity ──────────────────────────────────────────────────────────────

static SPOKEN_ACUITY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(alpha|bravo|charlie)\b").unwrap());

static LETTER_ACUITY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([ABC])\b").unwrap());

/// Acuity is announced right after the call type ("chest pain, Charlie")
/// or as a trailing letter. Single letters only count in uppercase so the
/// article "a" never reads as acuity A.
fn extract_acuity(cleaned: &str, lowered: &str) -> Option<AcuityLevel> {
    if let Some((_, keyword)) = taxonomy::match_call_type(lowered) {
        if let Some(pos) = lowered.rfind(keyword) {
            let tail = cleaned.get(pos + keyword.len()..).unwrap_or("");
            let window = truncate_at_char_boundary(tail, 20);
            if let Some(m) = SPOKEN_ACUITY_RE.find(window) {
                return AcuityLevel::from_spoken(m.as_str());
            }
            if let Some(caps) = LETTER_ACUITY_RE.captures(window) {
                return AcuityLevel::from_letter(caps[1].chars().next()?);
            }
        }
    }
    // Trailing token of the whole transcript.
    let last = cleaned
        .split_whitespace()
        .last()?
        .trim_matches(|c: char| !c.is_alphanumeric());
    if last.len() == 1 {
        let c = last.chars().next()?;
        if c.is_ascii_uppercase() {
            return AcuityLevel::from_letter(c);
        }
    }
    AcuityLevel::from_spoken(last)
}

fn truncate_at_char_boundary(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
