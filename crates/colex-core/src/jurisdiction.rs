use anyhow::Result;
use tracing::{debug, info};

use crate::completion::CompletionService;
use crate::steps::truncate_chars;
use crate::types::{
    ChatMessage, CompletionRequest, Confidence, DetectionMethod, JurisdictionFamily,
    JurisdictionVerdict,
};

/// Texts shorter than this (after trimming) are not treated as decisions.
pub const MIN_TEXT_LEN: usize = 50;

const DETECTION_TEXT_BUDGET: usize = 2_000;

/// Names that carry no jurisdiction information.
const PLACEHOLDER_NAMES: [&str; 3] = ["unknown", "n/a", "none"];

static CIVIL_LAW: &[&str] = &[
    "switzerland", "germany", "france", "italy", "spain", "austria", "netherlands", "belgium",
    "luxembourg", "portugal", "greece", "finland", "sweden", "denmark", "norway", "poland",
    "czech republic", "slovakia", "hungary", "romania", "bulgaria", "croatia", "slovenia",
    "estonia", "latvia", "lithuania", "malta", "cyprus", "japan", "south korea", "china",
    "taiwan", "brazil", "argentina", "mexico", "chile", "colombia", "peru", "ecuador",
    "bolivia", "paraguay", "uruguay", "venezuela", "russia", "ukraine", "turkey", "egypt",
    "morocco", "tunisia", "algeria", "iran", "lebanon", "jordan", "qatar", "kuwait", "bahrain",
    "uae", "united arab emirates", "saudi arabia", "israel", "indonesia", "thailand", "vietnam",
    "cambodia", "laos", "ethiopia", "angola", "mozambique", "kazakhstan", "uzbekistan",
    "tajikistan", "kyrgyzstan", "belarus", "moldova", "georgia", "armenia", "azerbaijan",
    "albania", "bosnia and herzegovina", "north macedonia", "montenegro", "serbia", "kosovo",
    "iceland", "liechtenstein", "monaco", "san marino", "andorra", "european union", "ohada",
    "quebec", "louisiana", "senegal", "ivory coast", "cameroon", "dominican republic",
    "costa rica", "panama", "guatemala", "honduras", "el salvador", "nicaragua", "cuba",
];

static COMMON_LAW: &[&str] = &[
    "united states", "usa", "united kingdom", "england", "scotland", "wales",
    "northern ireland", "ireland", "canada", "australia", "new zealand", "india", "pakistan",
    "bangladesh", "sri lanka", "malaysia", "singapore", "hong kong", "south africa",
    "nigeria", "ghana", "kenya", "uganda", "tanzania", "zambia", "zimbabwe", "botswana",
    "malawi", "sierra leone", "gambia", "jamaica", "barbados", "trinidad and tobago",
    "bahamas", "belize", "guyana", "philippines", "myanmar", "cayman islands",
    "british virgin islands", "bermuda", "gibraltar", "isle of man", "jersey", "guernsey",
];

/// Whether `needle` occurs in `haystack` as whole words, so that "iran" is
/// not found inside "miranda".
fn contains_words(haystack: &str, needle: &str) -> bool {
    let is_word = |c: char| c.is_alphanumeric();
    haystack.match_indices(needle).any(|(start, m)| {
        let before = haystack[..start].chars().next_back();
        let after = haystack[start + m.len()..].chars().next();
        !before.is_some_and(is_word) && !after.is_some_and(is_word)
    })
}

/// Static name lookup: exact match first, then whole-word containment in
/// either direction, civil-law names before common-law names.
pub fn lookup(name: &str) -> Option<JurisdictionFamily> {
    let name = name.trim().to_lowercase();
    if name.is_empty() || PLACEHOLDER_NAMES.contains(&name.as_str()) {
        return None;
    }

    let table = CIVIL_LAW
        .iter()
        .map(|n| (*n, JurisdictionFamily::CivilLaw))
        .chain(COMMON_LAW.iter().map(|n| (*n, JurisdictionFamily::CommonLaw)));

    let mut partial = None;
    for (known, family) in table {
        if known == name {
            return Some(family);
        }
        // A name of one or two letters would be "contained" in half the table.
        let reverse = name.len() >= 3 && contains_words(known, &name);
        if partial.is_none() && (contains_words(&name, known) || reverse) {
            partial = Some(family);
        }
    }
    partial
}

/// Read the model's answer by case-insensitive label search. Anything that
/// names no label is a `NoDecision`.
pub fn parse_family(raw: &str) -> JurisdictionFamily {
    let lower = raw.to_lowercase();
    [
        JurisdictionFamily::CivilLaw,
        JurisdictionFamily::CommonLaw,
        JurisdictionFamily::NoDecision,
    ]
    .into_iter()
    .find(|f| lower.contains(&f.label().to_lowercase()))
    .unwrap_or(JurisdictionFamily::NoDecision)
}

pub fn detection_request(name: &str, text: &str, temperature: f32) -> CompletionRequest {
    let prompt = format!(
        "Classify the court decision below as exactly one of:\n\
         - '{civil}'\n\
         - '{common}'\n\
         - '{none}'\n\n\
         Jurisdiction named by the user: {name}\n\n\
         Indicators to weigh: citation format, court structure and naming, \
         style of legal reasoning, reliance on precedent, and approach to \
         statutory interpretation. Answer '{none}' if the text is not a \
         judicial decision.\n\n\
         Court decision text:\n{text}\n\n\
         Answer with the label only.",
        civil = JurisdictionFamily::CivilLaw.label(),
        common = JurisdictionFamily::CommonLaw.label(),
        none = JurisdictionFamily::NoDecision.label(),
        name = if name.trim().is_empty() { "Unknown" } else { name },
        text = truncate_chars(text, DETECTION_TEXT_BUDGET),
    );
    CompletionRequest {
        messages: vec![
            ChatMessage::system("You are an expert in comparative legal systems."),
            ChatMessage::user(prompt),
        ],
        temperature: Some(temperature),
        ..Default::default()
    }
}

/// Resolve the legal family of a decision. Only the model-fallback path
/// touches the completion service; its errors propagate.
pub async fn classify(
    name: &str,
    text: &str,
    completion: &dyn CompletionService,
    temperature: f32,
) -> Result<JurisdictionVerdict> {
    let precise_name = if name.trim().is_empty() {
        "Unknown".to_string()
    } else {
        name.trim().to_string()
    };

    if text.trim().chars().count() < MIN_TEXT_LEN {
        debug!(name = %precise_name, "text too short for a decision");
        return Ok(JurisdictionVerdict {
            family: JurisdictionFamily::NoDecision,
            precise_name,
            confidence: Confidence::High,
            method: DetectionMethod::TextLength,
        });
    }

    if let Some(family) = lookup(name) {
        info!(name = %precise_name, family = family.label(), "jurisdiction resolved from table");
        return Ok(JurisdictionVerdict {
            family,
            precise_name,
            confidence: Confidence::High,
            method: DetectionMethod::NameMapping,
        });
    }

    let response = completion
        .complete(&detection_request(name, text, temperature))
        .await?;
    let family = parse_family(&response.content);
    info!(
        name = %precise_name,
        family = family.label(),
        backend = completion.name(),
        "jurisdiction resolved by model"
    );
    Ok(JurisdictionVerdict {
        family,
        precise_name,
        confidence: Confidence::Medium,
        method: DetectionMethod::LlmAnalysis,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_and_case_insensitive() {
        assert_eq!(lookup("Switzerland"), Some(JurisdictionFamily::CivilLaw));
        assert_eq!(lookup("  ENGLAND "), Some(JurisdictionFamily::CommonLaw));
    }

    #[test]
    fn containment_both_ways() {
        assert_eq!(
            lookup("Supreme Court of the United Kingdom"),
            Some(JurisdictionFamily::CommonLaw)
        );
        assert_eq!(lookup("Bosnia"), Some(JurisdictionFamily::CivilLaw));
    }

    #[test]
    fn citations_do_not_match_inside_words() {
        assert_eq!(lookup("Miranda v. Arizona"), None);
        assert_eq!(lookup("Jerusalem District Court"), None);
        assert_eq!(lookup("Iran-United States Claims Tribunal"), Some(JurisdictionFamily::CivilLaw));
        assert_eq!(lookup("Hoge Raad (Netherlands)"), Some(JurisdictionFamily::CivilLaw));
    }

    #[test]
    fn placeholders_and_noise() {
        assert_eq!(lookup(""), None);
        assert_eq!(lookup("Unknown"), None);
        assert_eq!(lookup("N/A"), None);
        assert_eq!(lookup("none"), None);
        assert_eq!(lookup("ab"), None);
        assert_eq!(lookup("Atlantis"), None);
    }

    #[test]
    fn label_parsing_defaults_to_no_decision() {
        assert_eq!(
            parse_family("This is a COMMON-LAW JURISDICTION."),
            JurisdictionFamily::CommonLaw
        );
        assert_eq!(parse_family("Civil-law jurisdiction"), JurisdictionFamily::CivilLaw);
        assert_eq!(parse_family("I am not sure"), JurisdictionFamily::NoDecision);
    }

    #[test]
    fn detection_prompt_is_bounded() {
        let text = "x".repeat(10_000);
        let req = detection_request("", &text, 0.3);
        let user = &req.messages[1].content;
        assert!(user.contains("Jurisdiction named by the user: Unknown"));
        assert!(user.len() < 3_000);
    }
}
