/// Dictionary-based correction of misheard phrases.
///
/// Corrections apply as whole-word substitutions with case preservation:
/// the replacement copies the casing shape of the word it replaces
/// (ALL-CAPS stays ALL-CAPS, Initial-Cap stays Initial-Cap).
use std::collections::BTreeMap;

use regex::Regex;

/// Built-in misheard-phrase families: chief-complaint aliases, unit
/// aliases, spoken acuity letters. Config may extend or override these.
const BUILTIN_CORRECTIONS: &[(&str, &str)] = &[
    // Chief-complaint aliases
    ("cedar", "seizure"),
    ("seizing", "seizure"),
    ("seashore", "seizure"),
    ("chess pain", "chest pain"),
    ("just pain", "chest pain"),
    ("difficulty breeding", "difficulty breathing"),
    ("short of breath", "shortness of breath"),
    ("over dose", "overdose"),
    ("overdosed", "overdose"),
    ("site person", "sick person"),
    ("six person", "sick person"),
    // Unit aliases
    ("medical 1", "medic 1"),
    ("engines", "engine"),
    ("lateral", "ladder"),
    ("medics", "medic"),
    // Spoken acuity letters
    ("alfa", "alpha"),
    ("brava", "bravo"),
    ("charley", "charlie"),
];

#[derive(Debug, Clone)]
pub struct CorrectionDictionary {
    /// Misheard phrase (lowercase) -> canonical phrase (lowercase).
    entries: BTreeMap<String, String>,
    /// One compiled alternation over every misheard phrase, longest first
    /// so "difficulty breeding" wins over "breeding".
    matcher: Regex,
}

impl Default for CorrectionDictionary {
    fn default() -> Self {
        Self::with_overrides(&BTreeMap::new())
    }
}

impl CorrectionDictionary {
    /// Build from the built-in families plus config-supplied overrides.
    pub fn with_overrides(overrides: &BTreeMap<String, String>) -> Self {
        let mut entries: BTreeMap<String, String> = BUILTIN_CORRECTIONS
            .iter()
            .map(|(from, to)| (from.to_lowercase(), to.to_lowercase()))
            .collect();
        for (from, to) in overrides {
            entries.insert(from.to_lowercase(), to.to_lowercase());
        }

        let mut phrases: Vec<&String> = entries.keys().collect();
        phrases.sort_by_key(|p| std::cmp::Reverse(p.len()));
        let alternation = phrases
            .iter()
            .map(|p| regex::escape(p))
            .collect::<Vec<_>>()
            .join("|");
        let matcher = Regex::new(&format!(r"(?i)\b(?:{alternation})\b")).unwrap();

        Self { entries, matcher }
    }

    /// Apply every correction to `text`, preserving the matched casing.
    pub fn apply(&self, text: &str) -> String {
        self.matcher
            .replace_all(text, |caps: &regex::Captures<'_>| {
                let matched = &caps[0];
                let canonical = &self.entries[&matched.to_lowercase()];
                copy_case(matched, canonical)
            })
            .into_owned()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Copy the casing shape of `source` onto `replacement`.
fn copy_case(source: &str, replacement: &str) -> String {
    let letters: Vec<char> = source.chars().filter(|c| c.is_alphabetic()).collect();
    if !letters.is_empty() && letters.iter().all(|c| c.is_uppercase()) {
        return replacement.to_uppercase();
    }
    if letters.first().is_some_and(|c| c.is_uppercase()) {
        let mut out = String::with_capacity(replacement.len());
        let mut chars = replacement.chars();
        if let Some(first) = chars.next() {
            out.extend(first.to_uppercase());
            out.extend(chars);
        }
        return out;
    }
    replacement.to_string()
}
