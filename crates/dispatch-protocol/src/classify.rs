/// Chief-complaint classification over post-processed transcripts.
///
/// The post-processor's extracted call type is authoritative when
/// present; the classifier's own keyword table is the last resort. The
/// urgency score is the max of per-keyword weights.
use crate::call::AcuityLevel;
use crate::postprocess::PostProcessOutput;
use crate::taxonomy::{self, CallType};

#[derive(Debug, Clone)]
pub struct Classification {
    pub call_type: CallType,
    pub keywords: Vec<String>,
    pub acuity: AcuityLevel,
    pub urgency_score: f64,
    pub location: Option<String>,
}

/// Default urgency for transcripts with no scored keyword.
const BASE_URGENCY: f64 = 0.2;

pub fn classify(output: &PostProcessOutput) -> Classification {
    if output.is_noise || output.is_hallucination {
        return Classification {
            call_type: CallType::NonEmergency,
            keywords: Vec::new(),
            acuity: AcuityLevel::Unknown,
            urgency_score: 0.0,
            location: None,
        };
    }

    let lowered = output.cleaned.to_lowercase();
    let matches = taxonomy::match_all_keywords(&lowered);

    let call_type = output
        .call_type
        .filter(|t| t.is_classifiable())
        .or_else(|| taxonomy::match_call_type(&lowered).map(|(t, _)| t))
        .unwrap_or(CallType::Unknown);

    let keywords: Vec<String> = matches.iter().map(|(k, _)| (*k).to_string()).collect();

    let urgency_score = matches
        .iter()
        .map(|(_, t)| t.urgency_weight())
        .chain(std::iter::once(if call_type == CallType::Unknown {
            BASE_URGENCY
        } else {
            call_type.urgency_weight()
        }))
        .fold(BASE_URGENCY, f64::max);

    Classification {
        call_type,
        keywords,
        acuity: output.acuity.unwrap_or(AcuityLevel::Unknown),
        urgency_score,
        location: output.address.as_ref().map(|a| a.text.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::postprocess::PostProcessor;

    #[test]
    fn test_confirms_extracted_call_type() {
        let out = PostProcessor::default()
            .process("Engine 19, 1555 South Harding Street, Chest Pain", 0.9);
        let c = classify(&out);
        assert_eq!(c.call_type, CallType::ChestPain);
        assert!(c.urgency_score >= 0.8);
        assert_eq!(c.location.as_deref(), Some("1555 South Harding Street"));
        assert!(c.keywords.iter().any(|k| k == "chest pain"));
    }

    #[test]
    fn test_urgency_is_max_of_keyword_weights() {
        let out = PostProcessor::default()
            .process("medic 4 chest pain patient now in cardiac arrest", 0.9);
        let c = classify(&out);
        assert_eq!(c.call_type, CallType::CardiacArrest);
        assert_eq!(c.urgency_score, 1.0);
    }

    #[test]
    fn test_unknown_when_nothing_matches() {
        let out = PostProcessor::default().process("medic 4 copy that, clear of the scene", 0.9);
        let c = classify(&out);
        assert_eq!(c.call_type, CallType::Unknown);
        assert_eq!(c.urgency_score, BASE_URGENCY);
        assert!(c.keywords.is_empty());
    }

    #[test]
    fn test_noise_classifies_as_non_emergency() {
        let out = PostProcessor::default().process("{beep}", 0.9);
        let c = classify(&out);
        assert_eq!(c.call_type, CallType::NonEmergency);
        assert_eq!(c.urgency_score, 0.0);
        assert!(c.location.is_none());
    }
}
