//! Prompt construction for each extraction step. Pure: a step kind and the
//! current case state in, a completion request out.

use crate::jurisdiction;
use crate::parse::PIL_THEMES;
use crate::types::{CaseState, ChatMessage, CompletionRequest, JurisdictionFamily, StepKind};

/// Character budget for the case text embedded in each step's prompt.
pub fn text_budget(kind: StepKind) -> usize {
    match kind {
        StepKind::DetectJurisdiction => 2_000,
        StepKind::ExtractColSection => 8_000,
        StepKind::ClassifyThemes => 1_500,
        StepKind::IdentifyColIssue | StepKind::AnalyzeCourtsPosition => 5_000,
        StepKind::AnalyzeRelevantFacts
        | StepKind::IdentifyPilProvisions
        | StepKind::ExtractObiterDicta
        | StepKind::ExtractDissentingOpinions => 6_000,
        StepKind::GenerateAbstract => 0,
    }
}

/// Cut `text` to at most `max` characters on a char boundary, marking the cut.
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

/// Families other than common law get the civil-law framing.
fn is_common(state: &CaseState) -> bool {
    state.jurisdiction_family == JurisdictionFamily::CommonLaw
}

fn family_label(state: &CaseState) -> &'static str {
    if is_common(state) {
        JurisdictionFamily::CommonLaw.label()
    } else {
        JurisdictionFamily::CivilLaw.label()
    }
}

pub fn build_prompt(kind: StepKind, state: &CaseState, temperature: f32) -> CompletionRequest {
    let text = truncate_chars(&state.full_text, text_budget(kind));
    let col = state.latest(StepKind::ExtractColSection);
    let family = family_label(state);

    let (system, user) = match kind {
        StepKind::DetectJurisdiction => {
            return jurisdiction::detection_request(
                state.jurisdiction_name(),
                &state.full_text,
                temperature,
            );
        }
        StepKind::ExtractColSection => (
            format!("You are an expert in {family} choice of law analysis."),
            col_section_prompt(is_common(state), &text),
        ),
        StepKind::ClassifyThemes => (
            "You are an expert in private international law classification.".to_string(),
            format!(
                "Classify the private international law themes present in this court decision.\n\n\
                 Available themes: {themes}\n\n\
                 Instructions:\n\
                 1. Identify the main PIL themes discussed in the case\n\
                 2. Return a JSON list of theme names\n\
                 3. Use only themes from the list above, spelled exactly as given\n\
                 4. Prefer themes that bear on the choice of law analysis\n\n\
                 Jurisdiction: {family}\n\n\
                 Full text: {text}\n\n\
                 Choice of law section: {col}\n\n\
                 Return only the JSON list:",
                themes = PIL_THEMES.join(", "),
            ),
        ),
        StepKind::AnalyzeRelevantFacts => (
            format!("You are a legal analyst specialising in {family} choice of law."),
            format!(
                "Synthesise the facts needed to follow the choice of law analysis.\n\n\
                 Requirements:\n\
                 1. At most 300 words of narrative prose\n\
                 2. Cover the parties, the geography of the transaction and any indication of the applicable law\n\
                 3. Name connecting factors, international elements and what triggered the conflict\n\
                 4. Leave out amounts, exact dates and procedural history\n\n\
                 Jurisdiction: {family}\n\n\
                 Court decision: {text}\n\n\
                 Choice of law section: {col}\n\n\
                 Relevant facts:"
            ),
        ),
        StepKind::IdentifyPilProvisions => (
            "You are an expert in identifying private international law provisions.".to_string(),
            format!(
                "List the private international law provisions cited in this court decision.\n\n\
                 Instructions:\n\
                 1. Include articles or sections of PIL statutes, treaties and conventions\n\
                 2. Format each entry as \"Article number, abbreviated instrument name\"\n\
                 3. Return a JSON list only\n\
                 4. If none are cited, return [\"NA\"]\n\n\
                 Examples:\n\
                 - Switzerland: [\"Art. 187, PILA\"]\n\
                 - EU: [\"Art. 3, Rome I Regulation\"]\n\
                 - US: [\"Restatement (Second) Conflict of Laws § 187\"]\n\n\
                 Jurisdiction: {family}\n\n\
                 Court decision: {text}\n\n\
                 Choice of law section: {col}\n\n\
                 PIL provisions (JSON):"
            ),
        ),
        StepKind::IdentifyColIssue => (
            "You are an expert in identifying choice of law issues.".to_string(),
            format!(
                "State the main private international law issue as one concise question.\n\n\
                 The question should:\n\
                 1. Be phrased as a general legal question\n\
                 2. Concern choice of law methodology\n\
                 3. Apply beyond this particular case\n\
                 4. Relate to these themes: {themes}\n\n\
                 Examples:\n\
                 - \"Can parties validly choose the law of a country with no connection to their contract?\"\n\
                 - \"Does the closest connection test apply when the parties made no express choice of law?\"\n\n\
                 Jurisdiction: {family}\n\n\
                 Court decision: {text}\n\n\
                 Choice of law section: {col}\n\n\
                 The choice of law issue is:",
                themes = state.themes().join(", "),
            ),
        ),
        StepKind::AnalyzeCourtsPosition => {
            let issue = state.latest(StepKind::IdentifyColIssue);
            (
                "You are an expert in analysing judicial positions.".to_string(),
                format!(
                    "Summarise the court's position on the choice of law issue in general terms.\n\n\
                     Requirements:\n\
                     1. Answer this issue: {issue}\n\
                     2. Generalise so the principle can guide other PIL cases\n\
                     3. At most 300 words in a neutral tone\n\n\
                     Jurisdiction: {family}\n\
                     Themes: {themes}\n\n\
                     Court decision: {text}\n\n\
                     Choice of law section: {col}\n\n\
                     The court's position is:",
                    themes = state.themes().join(", "),
                ),
            )
        }
        StepKind::ExtractObiterDicta => (
            "You are an expert in common law judicial analysis.".to_string(),
            format!(
                "Extract the obiter dicta from this common law decision: judicial remarks \
                 not essential to the outcome, hypotheticals the court discussed, broader \
                 principles it mentioned and comments on future application.\n\n\
                 Court decision: {text}\n\n\
                 Choice of law section: {col}\n\n\
                 Obiter dicta:"
            ),
        ),
        StepKind::ExtractDissentingOpinions => (
            "You are an expert in common law judicial analysis.".to_string(),
            format!(
                "Extract any dissenting opinions from this common law decision: alternative \
                 legal reasoning, different choice of law approaches, criticism of the \
                 majority and alternative readings of precedent. Say plainly if there is \
                 no dissent.\n\n\
                 Court decision: {text}\n\n\
                 Choice of law section: {col}\n\n\
                 Dissenting opinions:"
            ),
        ),
        StepKind::GenerateAbstract => (
            "You are an expert legal researcher writing case abstracts.".to_string(),
            format!(
                "Write a one-paragraph abstract of this PIL case's choice of law analysis. \
                 Open with the factual context, move through the legal question and the \
                 reasoning, and close with the principle the case stands for. At most 300 \
                 words in professional legal research language.\n\n\
                 Case information:\n\
                 - Citation: {citation}\n\
                 - Jurisdiction: {jurisdiction} ({family})\n\
                 - Themes: {themes}\n\
                 - Facts: {facts}\n\
                 - PIL provisions: {provisions}\n\
                 - Choice of law issue: {issue}\n\
                 - Court's position: {position}\n\n\
                 Abstract:",
                citation = state.case_citation,
                jurisdiction = state.precise_jurisdiction.as_deref().unwrap_or("Unknown"),
                themes = state.themes().join(", "),
                facts = state.latest(StepKind::AnalyzeRelevantFacts),
                provisions = state.provisions().join("; "),
                issue = state.latest(StepKind::IdentifyColIssue),
                position = state.latest(StepKind::AnalyzeCourtsPosition),
            ),
        ),
    };

    CompletionRequest {
        messages: vec![ChatMessage::system(system), ChatMessage::user(user)],
        temperature: Some(temperature),
        ..Default::default()
    }
}

fn col_section_prompt(common: bool, text: &str) -> String {
    let focus = if common {
        "1. Choice of law analysis and rules\n\
         2. The most significant relationship test\n\
         3. Party autonomy in selecting the law\n\
         4. Conflicts principles and precedents\n\
         5. Application of foreign law"
    } else {
        "1. Discussion of how the applicable law is determined\n\
         2. Analysis of connecting factors\n\
         3. Application of PIL provisions or articles\n\
         4. Choice of law methodology\n\
         5. Application of conflict rules"
    };
    format!(
        "Extract the passages of this court decision that deal with choice of law, \
         conflict of laws or private international law. Focus on:\n\n{focus}\n\n\
         Leave out purely procedural or jurisdictional discussion.\n\n\
         Court decision:\n{text}\n\n\
         Extracted choice of law section:"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Confidence, DetectionMethod, JurisdictionVerdict, StepValue};

    fn state(family: JurisdictionFamily) -> CaseState {
        let mut s = CaseState::new("s", "Case 1", "ü".repeat(9_000), Some("Somewhere".into()));
        s.apply(
            StepKind::DetectJurisdiction,
            StepValue::Jurisdiction(JurisdictionVerdict {
                family,
                precise_name: "Somewhere".into(),
                confidence: Confidence::High,
                method: DetectionMethod::NameMapping,
            }),
        );
        s
    }

    #[test]
    fn truncation_is_char_safe() {
        assert_eq!(truncate_chars("äöü", 2), "äö...");
        assert_eq!(truncate_chars("abc", 3), "abc");
    }

    #[test]
    fn framing_follows_family() {
        let civil = build_prompt(StepKind::ExtractColSection, &state(JurisdictionFamily::CivilLaw), 0.3);
        assert!(civil.messages[1].content.contains("connecting factors"));
        assert!(civil.messages[0].content.contains("Civil-law"));

        let common = build_prompt(StepKind::ExtractColSection, &state(JurisdictionFamily::CommonLaw), 0.3);
        assert!(common.messages[1].content.contains("most significant relationship"));
        assert!(common.messages[0].content.contains("Common-law"));
    }

    #[test]
    fn prompts_respect_budget() {
        let s = state(JurisdictionFamily::CivilLaw);
        let req = build_prompt(StepKind::ClassifyThemes, &s, 0.3);
        let embedded = req.messages[1].content.matches('ü').count();
        assert_eq!(embedded, 1_500);
    }

    #[test]
    fn downstream_prompts_embed_prior_results() {
        let mut s = state(JurisdictionFamily::CivilLaw);
        s.apply(StepKind::ClassifyThemes, StepValue::List(vec!["Renvoi".into()]));
        s.apply(StepKind::IdentifyColIssue, StepValue::Text("Does renvoi apply?".into()));
        let req = build_prompt(StepKind::AnalyzeCourtsPosition, &s, 0.3);
        assert!(req.messages[1].content.contains("Does renvoi apply?"));
        assert!(req.messages[1].content.contains("Themes: Renvoi"));
    }
}
