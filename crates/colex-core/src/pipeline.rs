use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{error, info};

use crate::{
    completion::CompletionService,
    error::AnalysisError,
    exec_log::ExecutionLog,
    extraction::{self, StepSettings},
    store::{CaseStore, SessionLocks},
    types::{
        AnalysisPattern, AnalysisReport, AnalysisStage, AnalyzeRequest, CaseResults, CaseState,
        JurisdictionFamily, SessionSummary, StepKind, StepReport, StepStatus, StepValue,
    },
};

pub use crate::types::PipelineEvent;

const COMMON_LAW_PIPELINE: [StepKind; 10] = StepKind::ALL;

const CIVIL_LAW_PIPELINE: [StepKind; 8] = [
    StepKind::DetectJurisdiction,
    StepKind::ExtractColSection,
    StepKind::ClassifyThemes,
    StepKind::AnalyzeRelevantFacts,
    StepKind::IdentifyPilProvisions,
    StepKind::IdentifyColIssue,
    StepKind::AnalyzeCourtsPosition,
    StepKind::GenerateAbstract,
];

const QUICK_PIPELINE: [StepKind; 2] = [StepKind::DetectJurisdiction, StepKind::ClassifyThemes];

/// Ordered steps required for a family. Anything not common law, including
/// a family not yet resolved, uses the civil-law sequence.
pub fn pipeline_for(family: JurisdictionFamily) -> &'static [StepKind] {
    match family {
        JurisdictionFamily::CommonLaw => &COMMON_LAW_PIPELINE,
        _ => &CIVIL_LAW_PIPELINE,
    }
}

/// Share of the family's required steps that have output, in percent,
/// rounded to one decimal.
pub fn completion_percentage(state: &CaseState) -> f64 {
    let required = pipeline_for(state.jurisdiction_family);
    let done = required.iter().filter(|k| state.is_complete(**k)).count();
    let pct = done as f64 / required.len() as f64 * 100.0;
    (pct * 10.0).round() / 10.0
}

fn next_stage(state: &CaseState) -> Option<AnalysisStage> {
    pipeline_for(state.jurisdiction_family)
        .iter()
        .find(|k| !state.is_complete(**k))
        .map(StepKind::stage)
}

fn build_report(state: &CaseState, steps: Vec<StepReport>) -> AnalysisReport {
    AnalysisReport {
        session_id: state.session_id.clone(),
        case_citation: state.case_citation.clone(),
        stage: state.analysis_stage,
        jurisdiction_family: state.jurisdiction_family,
        precise_jurisdiction: state.precise_jurisdiction.clone(),
        confidence: state.confidence,
        method: state.method,
        results: state.results.clone(),
        completion_percentage: completion_percentage(state),
        completion_done: state.completion_done,
        next_stage: next_stage(state),
        steps,
    }
}

/// Full session dump for export.
#[derive(Debug, Clone, Serialize)]
pub struct SessionExport {
    pub session_id: String,
    pub case_citation: String,
    pub jurisdiction_family: JurisdictionFamily,
    pub precise_jurisdiction: Option<String>,
    pub themes: Vec<String>,
    pub provisions: Vec<String>,
    pub results: CaseResults,
    pub completion_percentage: f64,
    pub analysis_complete: bool,
    pub exported_at: chrono::DateTime<chrono::Utc>,
}

// ── Orchestrator ─────────────────────────────────────────────────────────

pub struct Orchestrator {
    store: Arc<dyn CaseStore>,
    completion: Arc<dyn CompletionService>,
    exec_log: Arc<ExecutionLog>,
    settings: StepSettings,
    locks: SessionLocks,
    pub event_tx: broadcast::Sender<PipelineEvent>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn CaseStore>,
        completion: Arc<dyn CompletionService>,
        exec_log: Arc<ExecutionLog>,
        settings: StepSettings,
    ) -> (Self, broadcast::Receiver<PipelineEvent>) {
        let (tx, rx) = broadcast::channel(256);
        let orchestrator = Self {
            store,
            completion,
            exec_log,
            settings,
            locks: SessionLocks::new(),
            event_tx: tx,
        };
        (orchestrator, rx)
    }

    fn emit(&self, event: PipelineEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Start or resume the analysis for a session. Steps that already have
    /// output are skipped; the first failing step stops the run and is
    /// reported with its name. Everything completed before it stays saved.
    pub async fn analyze(&self, req: AnalyzeRequest) -> Result<AnalysisReport, AnalysisError> {
        let session_id = req
            .session_id
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(new_session_id);

        let guard = self.locks.acquire(&session_id).await;
        let mut state = match self.store.get(&session_id).await? {
            Some(existing) => existing,
            None => {
                let Some(text) = req.full_text else {
                    drop(guard);
                    self.locks.forget(&session_id).await;
                    return Err(AnalysisError::MissingCaseText(session_id));
                };
                let state = CaseState::new(
                    session_id.clone(),
                    req.case_citation.unwrap_or_default(),
                    text,
                    req.jurisdiction,
                );
                self.store.put(&state).await?;
                info!(session_id = %session_id, citation = %state.case_citation, "analysis session created");
                state
            }
        };

        let mut steps = Vec::new();
        for kind in StepKind::ALL {
            // A target outside the quick subset still ends the walk at its position.
            let selected = req.pattern != AnalysisPattern::Quick || QUICK_PIPELINE.contains(&kind);
            if selected {
                let (status, duration_ms) = if kind.common_law_only()
                    && state.jurisdiction_family != JurisdictionFamily::CommonLaw
                {
                    (StepStatus::NotApplicable, None)
                } else if state.is_complete(kind) {
                    (StepStatus::AlreadyComplete, None)
                } else {
                    let ms = self.execute(kind, &mut state).await?;
                    (StepStatus::Executed, Some(ms))
                };
                steps.push(StepReport {
                    step: kind,
                    status,
                    duration_ms,
                });
            }

            if req.target_stage == Some(kind.stage()) {
                break;
            }
        }

        let finished_now = steps
            .iter()
            .any(|s| s.step == StepKind::GenerateAbstract && s.status == StepStatus::Executed);
        if finished_now {
            self.emit(PipelineEvent::AnalysisComplete {
                session_id: session_id.clone(),
                message: format!("analysis of {} complete", state.case_citation),
            });
        }

        Ok(build_report(&state, steps))
    }

    /// Run one step, merge its output and persist. Returns the duration.
    async fn execute(&self, kind: StepKind, state: &mut CaseState) -> Result<u64, AnalysisError> {
        let family = state
            .jurisdiction_family
            .is_resolved()
            .then(|| state.jurisdiction_family.label());
        let entry = self.exec_log.start(&state.session_id, kind.name(), family);
        self.emit(PipelineEvent::StepStarted {
            session_id: state.session_id.clone(),
            step: kind,
        });
        let started = Instant::now();

        let outcome =
            extraction::run_step(kind, state, self.completion.as_ref(), &self.settings).await;
        let value = match outcome {
            Ok(v) => v,
            Err(e) => {
                error!(session_id = %state.session_id, step = kind.name(), "step failed: {e}");
                self.exec_log.finish_err(entry, &e.to_string());
                self.emit(PipelineEvent::StepFailed {
                    session_id: state.session_id.clone(),
                    step: kind,
                    error: e.to_string(),
                });
                return Err(e);
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        self.exec_log.finish_ok(entry, value.kind(), value.len());
        let summary = describe(&value);
        state.apply(kind, value);
        self.store.put(state).await?;

        info!(
            session_id = %state.session_id,
            step = kind.name(),
            duration_ms,
            "step completed"
        );
        self.emit(PipelineEvent::StepCompleted {
            session_id: state.session_id.clone(),
            step: kind,
            message: format!("{} completed: {summary}", kind.name()),
        });
        Ok(duration_ms)
    }

    pub async fn report(&self, session_id: &str) -> Result<AnalysisReport, AnalysisError> {
        let state = self.load(session_id).await?;
        Ok(build_report(&state, Vec::new()))
    }

    pub async fn state(&self, session_id: &str) -> Result<CaseState, AnalysisError> {
        self.load(session_id).await
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionSummary>, AnalysisError> {
        let states = self.store.list().await?;
        Ok(states
            .iter()
            .map(|s| SessionSummary {
                session_id: s.session_id.clone(),
                case_citation: s.case_citation.clone(),
                jurisdiction_family: s.jurisdiction_family,
                stage: s.analysis_stage,
                completion_percentage: completion_percentage(s),
                updated_at: s.updated_at,
            })
            .collect())
    }

    /// The only path that destroys analysis state.
    pub async fn delete(&self, session_id: &str) -> Result<(), AnalysisError> {
        let removed = {
            let _guard = self.locks.acquire(session_id).await;
            self.store.delete(session_id).await?
        };
        self.locks.forget(session_id).await;
        if !removed {
            return Err(AnalysisError::SessionNotFound(session_id.to_string()));
        }
        info!(session_id = %session_id, "analysis session deleted");
        Ok(())
    }

    pub async fn export(&self, session_id: &str) -> Result<SessionExport, AnalysisError> {
        let state = self.load(session_id).await?;
        Ok(SessionExport {
            session_id: state.session_id.clone(),
            case_citation: state.case_citation.clone(),
            jurisdiction_family: state.jurisdiction_family,
            precise_jurisdiction: state.precise_jurisdiction.clone(),
            themes: state.themes(),
            provisions: state.provisions(),
            results: state.results.clone(),
            completion_percentage: completion_percentage(&state),
            analysis_complete: state.completion_done,
            exported_at: chrono::Utc::now(),
        })
    }

    async fn load(&self, session_id: &str) -> Result<CaseState, AnalysisError> {
        self.store
            .get(session_id)
            .await?
            .ok_or_else(|| AnalysisError::SessionNotFound(session_id.to_string()))
    }
}

fn describe(value: &StepValue) -> String {
    match value {
        StepValue::Jurisdiction(v) => format!("{} ({})", v.family.label(), v.precise_name),
        StepValue::Text(t) => format!("{} chars", t.len()),
        StepValue::List(items) => items.join(", "),
    }
}

fn new_session_id() -> String {
    format!("case-{:016x}", rand::random::<u64>())
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::store::MemoryCaseStore;
    use crate::types::{Completion, CompletionRequest};

    struct Unreachable;

    #[async_trait]
    impl CompletionService for Unreachable {
        fn name(&self) -> &str {
            "unreachable"
        }

        async fn complete(&self, _request: &CompletionRequest) -> anyhow::Result<Completion> {
            anyhow::bail!("no model in this test")
        }
    }

    #[tokio::test]
    async fn rejected_session_ids_do_not_accumulate_locks() {
        let (orch, _rx) = Orchestrator::new(
            Arc::new(MemoryCaseStore::new()),
            Arc::new(Unreachable),
            ExecutionLog::new(16),
            StepSettings::default(),
        );
        for i in 0..5 {
            let req = AnalyzeRequest {
                session_id: Some(format!("bogus-{i}")),
                ..Default::default()
            };
            assert!(matches!(
                orch.analyze(req).await,
                Err(AnalysisError::MissingCaseText(_))
            ));
        }
        assert_eq!(orch.locks.tracked().await, 0);
    }
}
