/// Bounded chief-complaint taxonomy.
///
/// Every enriched call carries exactly one of these tags. `ScannerAudio`
/// is the intake placeholder assigned when the preliminary row is created
/// and is never produced by keyword classification.
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallType {
    #[serde(rename = "Cardiac Arrest")]
    CardiacArrest,
    #[serde(rename = "Chest Pain/Heart")]
    ChestPain,
    #[serde(rename = "Difficulty Breathing")]
    DifficultyBreathing,
    #[serde(rename = "Unconscious/Fainting")]
    Unconscious,
    #[serde(rename = "Seizure")]
    Seizure,
    #[serde(rename = "Choking")]
    Choking,
    #[serde(rename = "Sick Person")]
    SickPerson,
    #[serde(rename = "Injured Person")]
    InjuredPerson,
    #[serde(rename = "Abdominal Pain")]
    AbdominalPain,
    #[serde(rename = "Back Pain")]
    BackPain,
    #[serde(rename = "Overdose")]
    Overdose,
    #[serde(rename = "Psychiatric/Mental-Emotional")]
    Psychiatric,
    #[serde(rename = "Fire/Hazmat")]
    FireHazmat,
    #[serde(rename = "Trash Fire")]
    TrashFire,
    #[serde(rename = "Vehicle Accident (MVC)")]
    VehicleAccident,
    #[serde(rename = "Trauma/Assault")]
    Trauma,
    #[serde(rename = "Gunshot Wound")]
    GunshotWound,
    #[serde(rename = "Building Alarm")]
    BuildingAlarm,
    #[serde(rename = "Investigation")]
    Investigation,
    #[serde(rename = "EMS-Hospital Communications")]
    HospitalComms,
    #[serde(rename = "Environmental")]
    Environmental,
    #[serde(rename = "OB/Childbirth")]
    Childbirth,
    #[serde(rename = "Medical Emergency")]
    MedicalEmergency,
    #[serde(rename = "Unknown Call Type")]
    Unknown,
    #[serde(rename = "Non-Emergency Content")]
    NonEmergency,
    #[serde(rename = "Scanner Audio")]
    ScannerAudio,
}

impl CallType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CardiacArrest => "Cardiac Arrest",
            Self::ChestPain => "Chest Pain/Heart",
            Self::DifficultyBreathing => "Difficulty Breathing",
            Self::Unconscious => "Unconscious/Fainting",
            Self::Seizure => "Seizure",
            Self::Choking => "Choking",
            Self::SickPerson => "Sick Person",
            Self::InjuredPerson => "Injured Person",
            Self::AbdominalPain => "Abdominal Pain",
            Self::BackPain => "Back Pain",
            Self::Overdose => "Overdose",
            Self::Psychiatric => "Psychiatric/Mental-Emotional",
            Self::FireHazmat => "Fire/Hazmat",
            Self::TrashFire => "Trash Fire",
            Self::VehicleAccident => "Vehicle Accident (MVC)",
            Self::Trauma => "Trauma/Assault",
            Self::GunshotWound => "Gunshot Wound",
            Self::BuildingAlarm => "Building Alarm",
            Self::Investigation => "Investigation",
            Self::HospitalComms => "EMS-Hospital Communications",
            Self::Environmental => "Environmental",
            Self::Childbirth => "OB/Childbirth",
            Self::MedicalEmergency => "Medical Emergency",
            Self::Unknown => "Unknown Call Type",
            Self::NonEmergency => "Non-Emergency Content",
            Self::ScannerAudio => "Scanner Audio",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(s.to_string())).ok()
    }

    /// Per-type urgency weight. The classifier takes the max weight over
    /// every matched keyword's type.
    pub fn urgency_weight(&self) -> f64 {
        match self {
            Self::CardiacArrest => 1.0,
            Self::GunshotWound => 0.95,
            Self::Overdose => 0.9,
            Self::ChestPain | Self::DifficultyBreathing | Self::Unconscious => 0.8,
            Self::Trauma | Self::VehicleAccident => 0.7,
            Self::Seizure => 0.7,
            Self::SickPerson => 0.3,
            _ => 0.2,
        }
    }

    /// Whether this tag belongs to the chief-complaint set the classifier
    /// may emit (everything except the intake placeholder).
    pub fn is_classifiable(&self) -> bool {
        !matches!(self, Self::ScannerAudio)
    }
}

/// Keyword table mapping transcript phrases to taxonomy tags.
///
/// Multi-keyword disambiguation picks the longest matching keyword, so
/// "cardiac arrest" beats "cardiac" and "chest pain" beats "pain".
pub const KEYWORD_TABLE: &[(&str, CallType)] = &[
    ("cardiac arrest", CallType::CardiacArrest),
    ("cpr in progress", CallType::CardiacArrest),
    ("code blue", CallType::CardiacArrest),
    ("not breathing", CallType::CardiacArrest),
    ("chest pain", CallType::ChestPain),
    ("heart attack", CallType::ChestPain),
    ("heart problem", CallType::ChestPain),
    ("difficulty breathing", CallType::DifficultyBreathing),
    ("shortness of breath", CallType::DifficultyBreathing),
    ("trouble breathing", CallType::DifficultyBreathing),
    ("respiratory distress", CallType::DifficultyBreathing),
    ("unconscious", CallType::Unconscious),
    ("unresponsive", CallType::Unconscious),
    ("fainting", CallType::Unconscious),
    ("passed out", CallType::Unconscious),
    ("syncopal", CallType::Unconscious),
    ("seizure", CallType::Seizure),
    ("convulsion", CallType::Seizure),
    ("choking", CallType::Choking),
    ("sick person", CallType::SickPerson),
    ("ill person", CallType::SickPerson),
    ("injured person", CallType::InjuredPerson),
    ("personal injury", CallType::InjuredPerson),
    ("fall victim", CallType::InjuredPerson),
    ("abdominal pain", CallType::AbdominalPain),
    ("stomach pain", CallType::AbdominalPain),
    ("back pain", CallType::BackPain),
    ("overdose", CallType::Overdose),
    ("poisoning", CallType::Overdose),
    ("narcan", CallType::Overdose),
    ("psychiatric", CallType::Psychiatric),
    ("mental emotional", CallType::Psychiatric),
    ("emotionally disturbed", CallType::Psychiatric),
    ("suicidal", CallType::Psychiatric),
    ("structure fire", CallType::FireHazmat),
    ("working fire", CallType::FireHazmat),
    ("hazmat", CallType::FireHazmat),
    ("gas leak", CallType::FireHazmat),
    ("smoke in the building", CallType::FireHazmat),
    ("trash fire", CallType::TrashFire),
    ("dumpster fire", CallType::TrashFire),
    ("vehicle accident", CallType::VehicleAccident),
    ("motor vehicle", CallType::VehicleAccident),
    ("car accident", CallType::VehicleAccident),
    ("mvc", CallType::VehicleAccident),
    ("pi accident", CallType::VehicleAccident),
    ("trauma", CallType::Trauma),
    ("assault", CallType::Trauma),
    ("stabbing", CallType::Trauma),
    ("gunshot", CallType::GunshotWound),
    ("shots fired", CallType::GunshotWound),
    ("shooting", CallType::GunshotWound),
    ("building alarm", CallType::BuildingAlarm),
    ("fire alarm", CallType::BuildingAlarm),
    ("alarm sounding", CallType::BuildingAlarm),
    ("investigation", CallType::Investigation),
    ("environmental", CallType::Environmental),
    ("heat exhaustion", CallType::Environmental),
    ("hypothermia", CallType::Environmental),
    ("childbirth", CallType::Childbirth),
    ("in labor", CallType::Childbirth),
    ("pregnancy", CallType::Childbirth),
    ("maternity", CallType::Childbirth),
    ("medical emergency", CallType::MedicalEmergency),
];

/// Scan `text` (lowercased by the caller) for taxonomy keywords and
/// return the most specific match, i.e. the longest keyword found.
pub fn match_call_type(text: &str) -> Option<(CallType, &'static str)> {
    let mut best: Option<(CallType, &'static str)> = None;
    for (keyword, call_type) in KEYWORD_TABLE {
        if contains_phrase(text, keyword) {
            match best {
                Some((_, k)) if k.len() >= keyword.len() => {}
                _ => best = Some((*call_type, keyword)),
            }
        }
    }
    best
}

/// All keywords present in `text`, for the classifier's keyword set.
pub fn match_all_keywords(text: &str) -> Vec<(&'static str, CallType)> {
    KEYWORD_TABLE
        .iter()
        .filter(|(keyword, _)| contains_phrase(text, keyword))
        .map(|(k, t)| (*k, *t))
        .collect()
}

/// Whole-word phrase containment: "mvc" must not match inside "mvcx".
fn contains_phrase(text: &str, phrase: &str) -> bool {
    let mut start = 0;
    while let Some(pos) = text[start..].find(phrase) {
        let abs = start + pos;
        let before_ok = abs == 0
            || !text[..abs]
                .chars()
                .next_back()
                .is_some_and(|c| c.is_alphanumeric());
        let after = abs + phrase.len();
        let after_ok = after >= text.len()
            || !text[after..].chars().next().is_some_and(|c| c.is_alphanumeric());
        if before_ok && after_ok {
            return true;
        }
        start = abs + phrase.len().max(1);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_longest_keyword_wins() {
        let (t, k) = match_call_type("report of chest pain at the mall").unwrap();
        assert_eq!(t, CallType::ChestPain);
        assert_eq!(k, "chest pain");

        // "cardiac arrest" (14) beats "chest pain" (10)
        let (t, _) = match_call_type("chest pain now cardiac arrest").unwrap();
        assert_eq!(t, CallType::CardiacArrest);
    }

    #[test]
    fn test_whole_word_matching() {
        assert!(match_call_type("possible mvc on the interstate").is_some());
        assert!(match_call_type("mvcx9000 system test").is_none());
    }

    #[test]
    fn test_no_match_is_none() {
        assert!(match_call_type("routine radio check").is_none());
    }

    #[test]
    fn test_urgency_weights() {
        assert_eq!(CallType::CardiacArrest.urgency_weight(), 1.0);
        assert_eq!(CallType::GunshotWound.urgency_weight(), 0.95);
        assert_eq!(CallType::Overdose.urgency_weight(), 0.9);
        assert_eq!(CallType::SickPerson.urgency_weight(), 0.3);
        assert_eq!(CallType::BuildingAlarm.urgency_weight(), 0.2);
    }

    #[test]
    fn test_serde_round_trip_display_names() {
        let json = serde_json::to_string(&CallType::VehicleAccident).unwrap();
        assert_eq!(json, "\"Vehicle Accident (MVC)\"");
        assert_eq!(CallType::parse("Chest Pain/Heart"), Some(CallType::ChestPain));
        assert_eq!(CallType::parse("bogus"), None);
    }
}
