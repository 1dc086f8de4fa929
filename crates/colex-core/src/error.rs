use thiserror::Error;

use crate::types::StepKind;

/// Failures surfaced to callers of the analysis orchestrator.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session {0} does not exist yet and no case text was supplied")]
    MissingCaseText(String),

    #[error("step {step} requires a resolved jurisdiction family")]
    JurisdictionUnresolved { step: &'static str },

    #[error("step {step} failed: {message}")]
    StepFailed { step: &'static str, message: String },

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl AnalysisError {
    pub fn step_failed(kind: StepKind, err: impl std::fmt::Display) -> Self {
        Self::StepFailed {
            step: kind.name(),
            message: err.to_string(),
        }
    }

    /// Name of the failing step, when the error came from one.
    pub fn step(&self) -> Option<&'static str> {
        match self {
            Self::StepFailed { step, .. } | Self::JurisdictionUnresolved { step } => Some(step),
            _ => None,
        }
    }
}

/// Why a model response could not be read as a constrained list.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("empty response")]
    Empty,
    #[error("no JSON array found in response")]
    NotAList,
    #[error("malformed JSON: {0}")]
    Malformed(String),
    #[error("no item passed validation")]
    NoValidItems,
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("conversation not found: {0}")]
    ConversationNotFound(i64),

    #[error("completion failed: {0}")]
    Completion(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}
