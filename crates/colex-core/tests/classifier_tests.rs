mod common;

use colex_core::jurisdiction::{classify, MIN_TEXT_LEN};
use colex_core::types::{Completion, Confidence, DetectionMethod, JurisdictionFamily};
use common::{FnCompletion, ScriptedCompletion, SWISS_TEXT};

#[tokio::test]
async fn switzerland_resolves_from_table_without_model() {
    let llm = FnCompletion::steps();
    let verdict = classify("Switzerland", SWISS_TEXT, llm.as_ref(), 0.3).await.unwrap();

    assert_eq!(verdict.family, JurisdictionFamily::CivilLaw);
    assert_eq!(verdict.method, DetectionMethod::NameMapping);
    assert_eq!(verdict.confidence, Confidence::High);
    assert_eq!(verdict.precise_name, "Switzerland");
    assert_eq!(llm.calls(), 0);
}

#[tokio::test]
async fn short_text_wins_over_known_name() {
    let llm = FnCompletion::steps();
    let text = "x".repeat(MIN_TEXT_LEN - 1);
    let verdict = classify("England", &text, llm.as_ref(), 0.3).await.unwrap();

    assert_eq!(verdict.family, JurisdictionFamily::NoDecision);
    assert_eq!(verdict.method, DetectionMethod::TextLength);
    assert_eq!(llm.calls(), 0);
}

#[tokio::test]
async fn whitespace_padding_does_not_count_towards_length() {
    let llm = FnCompletion::steps();
    let text = format!("{}{}", " ".repeat(100), "short");
    let verdict = classify("", &text, llm.as_ref(), 0.3).await.unwrap();
    assert_eq!(verdict.method, DetectionMethod::TextLength);
    assert_eq!(verdict.precise_name, "Unknown");
}

#[tokio::test]
async fn placeholder_name_goes_to_model() {
    let llm = ScriptedCompletion::new(vec![Completion::text("Civil-law jurisdiction.")]);
    let verdict = classify("n/a", SWISS_TEXT, llm.as_ref(), 0.3).await.unwrap();

    assert_eq!(verdict.family, JurisdictionFamily::CivilLaw);
    assert_eq!(verdict.method, DetectionMethod::LlmAnalysis);
    assert_eq!(verdict.confidence, Confidence::Medium);
    assert_eq!(llm.calls(), 1);
}

#[tokio::test]
async fn free_text_answer_defaults_to_no_decision() {
    let llm = ScriptedCompletion::new(vec![Completion::text("Probably a mixed system?")]);
    let verdict = classify("Narnia", SWISS_TEXT, llm.as_ref(), 0.3).await.unwrap();
    assert_eq!(verdict.family, JurisdictionFamily::NoDecision);
}

#[tokio::test]
async fn model_failure_propagates() {
    let llm = ScriptedCompletion::new(vec![]);
    let err = classify("Narnia", SWISS_TEXT, llm.as_ref(), 0.3).await.unwrap_err();
    assert!(err.to_string().contains("script exhausted"));
}
