use tracing::{debug, info, warn};

use crate::completion::CompletionService;
use crate::error::AnalysisError;
use crate::jurisdiction::{self, MIN_TEXT_LEN};
use crate::parse::{parse_constrained_list, ItemValidator, ProvisionFormat, ThemeVocabulary, NO_PROVISIONS};
use crate::steps::build_prompt;
use crate::types::{CaseState, StepKind, StepValue};

pub const INSUFFICIENT_TEXT: &str = "Insufficient case text for analysis.";
pub const FALLBACK_THEME: &str = "Cross-border Transactions";

#[derive(Debug, Clone, Copy)]
pub struct StepSettings {
    /// Completion calls a structured step makes before falling back.
    pub parse_attempts: u32,
    pub temperature: f32,
}

impl Default for StepSettings {
    fn default() -> Self {
        Self {
            parse_attempts: 3,
            temperature: 0.3,
        }
    }
}

/// Result a step returns for input too short to analyse. No model call.
pub fn short_input_sentinel(kind: StepKind) -> StepValue {
    match kind {
        StepKind::ClassifyThemes => StepValue::List(vec![FALLBACK_THEME.to_string()]),
        StepKind::IdentifyPilProvisions => StepValue::List(vec![NO_PROVISIONS.to_string()]),
        _ => StepValue::Text(INSUFFICIENT_TEXT.to_string()),
    }
}

fn is_short(text: &str) -> bool {
    text.trim().chars().count() < MIN_TEXT_LEN
}

/// Run one step against the current state. Parse ambiguity is resolved
/// here with defaults; completion failures come back as `StepFailed`.
pub async fn run_step(
    kind: StepKind,
    state: &CaseState,
    completion: &dyn CompletionService,
    settings: &StepSettings,
) -> Result<StepValue, AnalysisError> {
    if kind == StepKind::DetectJurisdiction {
        let verdict = jurisdiction::classify(
            state.jurisdiction_name(),
            &state.full_text,
            completion,
            settings.temperature,
        )
        .await
        .map_err(|e| AnalysisError::step_failed(kind, format!("{e:#}")))?;
        return Ok(StepValue::Jurisdiction(verdict));
    }

    if !state.jurisdiction_family.is_resolved() {
        return Err(AnalysisError::JurisdictionUnresolved { step: kind.name() });
    }

    if is_short(&state.full_text) {
        debug!(session_id = %state.session_id, step = kind.name(), "short input, returning sentinel");
        return Ok(short_input_sentinel(kind));
    }

    match kind {
        StepKind::ClassifyThemes => {
            let themes = run_structured(kind, state, completion, settings, &ThemeVocabulary).await?;
            Ok(StepValue::List(
                themes.unwrap_or_else(|| vec![FALLBACK_THEME.to_string()]),
            ))
        }
        StepKind::IdentifyPilProvisions => {
            let provisions = run_structured(kind, state, completion, settings, &ProvisionFormat)
                .await?
                .map(drop_na_when_cited)
                .unwrap_or_else(|| vec![NO_PROVISIONS.to_string()]);
            Ok(StepValue::List(provisions))
        }
        _ => run_text(kind, state, completion, settings).await,
    }
}

async fn run_text(
    kind: StepKind,
    state: &CaseState,
    completion: &dyn CompletionService,
    settings: &StepSettings,
) -> Result<StepValue, AnalysisError> {
    let request = build_prompt(kind, state, settings.temperature);
    let response = completion
        .complete(&request)
        .await
        .map_err(|e| AnalysisError::step_failed(kind, format!("{e:#}")))?;
    let text = response.content.trim();
    if text.is_empty() {
        return Err(AnalysisError::step_failed(kind, "completion returned no content"));
    }
    Ok(StepValue::Text(text.to_string()))
}

/// Up to `parse_attempts` calls with the same prompt, then the validator's
/// heuristic on the last response. `None` means the caller should default.
async fn run_structured(
    kind: StepKind,
    state: &CaseState,
    completion: &dyn CompletionService,
    settings: &StepSettings,
    validator: &dyn ItemValidator,
) -> Result<Option<Vec<String>>, AnalysisError> {
    let request = build_prompt(kind, state, settings.temperature);
    let attempts = settings.parse_attempts.max(1);
    let mut last_raw = String::new();

    for attempt in 1..=attempts {
        let response = completion
            .complete(&request)
            .await
            .map_err(|e| AnalysisError::step_failed(kind, format!("{e:#}")))?;
        match parse_constrained_list(&response.content, validator) {
            Ok(items) => {
                info!(
                    session_id = %state.session_id,
                    step = kind.name(),
                    attempt,
                    items = items.len(),
                    "structured output parsed"
                );
                return Ok(Some(items));
            }
            Err(e) => {
                debug!(session_id = %state.session_id, step = kind.name(), attempt, "parse failed: {e}");
                last_raw = response.content;
            }
        }
    }

    let recovered = validator.heuristic(&last_raw);
    if recovered.is_empty() {
        warn!(session_id = %state.session_id, step = kind.name(), attempts, "no usable output, using default");
        return Ok(None);
    }
    warn!(session_id = %state.session_id, step = kind.name(), attempts, "recovered items heuristically");
    Ok(Some(dedup(recovered)))
}

fn drop_na_when_cited(items: Vec<String>) -> Vec<String> {
    if items.iter().any(|i| i != NO_PROVISIONS) {
        items.into_iter().filter(|i| i != NO_PROVISIONS).collect()
    } else {
        items
    }
}

fn dedup(items: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(items.len());
    for item in items {
        if !out.contains(&item) {
            out.push(item);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn na_dropped_only_alongside_citations() {
        assert_eq!(
            drop_na_when_cited(vec!["NA".into(), "Art. 3, Rome I".into()]),
            vec!["Art. 3, Rome I"]
        );
        assert_eq!(drop_na_when_cited(vec!["NA".into()]), vec!["NA"]);
    }

    #[test]
    fn sentinels_by_kind() {
        assert_eq!(
            short_input_sentinel(StepKind::ClassifyThemes),
            StepValue::List(vec![FALLBACK_THEME.into()])
        );
        assert_eq!(
            short_input_sentinel(StepKind::GenerateAbstract),
            StepValue::Text(INSUFFICIENT_TEXT.into())
        );
    }
}
