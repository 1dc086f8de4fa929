use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::chat::{Tool, ToolRegistry};
use crate::completion::CompletionService;
use crate::jurisdiction;
use crate::parse::PIL_THEMES;
use crate::pipeline::completion_percentage;
use crate::store::CaseStore;
use crate::types::ToolSpec;

fn str_arg<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str)
}

/// Classify a jurisdiction by name and decision text.
pub struct DetectJurisdictionTool {
    completion: Arc<dyn CompletionService>,
    temperature: f32,
}

impl DetectJurisdictionTool {
    pub fn new(completion: Arc<dyn CompletionService>, temperature: f32) -> Self {
        Self {
            completion,
            temperature,
        }
    }
}

#[async_trait]
impl Tool for DetectJurisdictionTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "detect_jurisdiction".into(),
            description: "Classify a court decision as civil-law, common-law or no court decision, \
                          using the jurisdiction name and the decision text."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "jurisdiction_name": { "type": "string", "description": "Country or court system, if known" },
                    "text": { "type": "string", "description": "Text of the court decision" }
                },
                "required": ["text"]
            }),
        }
    }

    async fn call(&self, arguments: Value) -> Result<Value> {
        let text = str_arg(&arguments, "text").ok_or_else(|| anyhow!("missing 'text'"))?;
        let name = str_arg(&arguments, "jurisdiction_name").unwrap_or("");
        let verdict =
            jurisdiction::classify(name, text, self.completion.as_ref(), self.temperature).await?;
        Ok(json!({
            "jurisdiction_type": verdict.family.label(),
            "precise_jurisdiction": verdict.precise_name,
            "confidence": verdict.confidence,
            "method": verdict.method,
        }))
    }
}

/// Read-only view of a stored analysis.
pub struct CaseAnalysisTool {
    store: Arc<dyn CaseStore>,
}

impl CaseAnalysisTool {
    pub fn new(store: Arc<dyn CaseStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for CaseAnalysisTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "get_case_analysis".into(),
            description: "Fetch the stored choice-of-law analysis for an analysis session.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "session_id": { "type": "string" }
                },
                "required": ["session_id"]
            }),
        }
    }

    async fn call(&self, arguments: Value) -> Result<Value> {
        let id = str_arg(&arguments, "session_id").ok_or_else(|| anyhow!("missing 'session_id'"))?;
        let state = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| anyhow!("no analysis session '{id}'"))?;
        Ok(json!({
            "session_id": state.session_id,
            "case_citation": state.case_citation,
            "jurisdiction_type": state.jurisdiction_family.label(),
            "precise_jurisdiction": state.precise_jurisdiction,
            "themes": state.themes(),
            "pil_provisions": state.provisions(),
            "results": state.results,
            "analysis_stage": state.analysis_stage,
            "completion_percentage": completion_percentage(&state),
        }))
    }
}

pub struct ListThemesTool;

#[async_trait]
impl Tool for ListThemesTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "list_pil_themes".into(),
            description: "List the private international law themes used for classification.".into(),
            parameters: json!({ "type": "object", "properties": {} }),
        }
    }

    async fn call(&self, _arguments: Value) -> Result<Value> {
        Ok(json!(PIL_THEMES))
    }
}

pub fn default_registry(
    completion: Arc<dyn CompletionService>,
    store: Arc<dyn CaseStore>,
    temperature: f32,
) -> ToolRegistry {
    ToolRegistry::new()
        .with(Arc::new(DetectJurisdictionTool::new(completion, temperature)))
        .with(Arc::new(CaseAnalysisTool::new(store)))
        .with(Arc::new(ListThemesTool))
}
