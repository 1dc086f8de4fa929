use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Jurisdiction ─────────────────────────────────────────────────────────

/// Legal-system family a decision belongs to. Drives prompt framing and
/// whether the common-law-only steps run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JurisdictionFamily {
    CivilLaw,
    CommonLaw,
    NoDecision,
    #[default]
    Unset,
}

impl JurisdictionFamily {
    /// Label used in prompts and in the model's constrained answer set.
    pub fn label(&self) -> &'static str {
        match self {
            Self::CivilLaw => "Civil-law jurisdiction",
            Self::CommonLaw => "Common-law jurisdiction",
            Self::NoDecision => "No court decision",
            Self::Unset => "Unset",
        }
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(self, Self::Unset)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    Medium,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    TextLength,
    NameMapping,
    LlmAnalysis,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JurisdictionVerdict {
    pub family: JurisdictionFamily,
    pub precise_name: String,
    pub confidence: Confidence,
    pub method: DetectionMethod,
}

// ── Pipeline Steps ───────────────────────────────────────────────────────

/// Stage of the analysis state machine. Holds the last stage that completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStage {
    #[default]
    NotStarted,
    JurisdictionDetection,
    ColExtraction,
    ThemeClassification,
    FactAnalysis,
    PilProvisions,
    ColIssue,
    CourtsPosition,
    ObiterDicta,
    DissentingOpinions,
    Abstract,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    DetectJurisdiction,
    ExtractColSection,
    ClassifyThemes,
    AnalyzeRelevantFacts,
    IdentifyPilProvisions,
    IdentifyColIssue,
    AnalyzeCourtsPosition,
    ExtractObiterDicta,
    ExtractDissentingOpinions,
    GenerateAbstract,
}

impl StepKind {
    /// Every step in pipeline order.
    pub const ALL: [StepKind; 10] = [
        Self::DetectJurisdiction,
        Self::ExtractColSection,
        Self::ClassifyThemes,
        Self::AnalyzeRelevantFacts,
        Self::IdentifyPilProvisions,
        Self::IdentifyColIssue,
        Self::AnalyzeCourtsPosition,
        Self::ExtractObiterDicta,
        Self::ExtractDissentingOpinions,
        Self::GenerateAbstract,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::DetectJurisdiction => "detect_jurisdiction",
            Self::ExtractColSection => "extract_col_section",
            Self::ClassifyThemes => "classify_themes",
            Self::AnalyzeRelevantFacts => "analyze_relevant_facts",
            Self::IdentifyPilProvisions => "identify_pil_provisions",
            Self::IdentifyColIssue => "identify_col_issue",
            Self::AnalyzeCourtsPosition => "analyze_courts_position",
            Self::ExtractObiterDicta => "extract_obiter_dicta",
            Self::ExtractDissentingOpinions => "extract_dissenting_opinions",
            Self::GenerateAbstract => "generate_abstract",
        }
    }

    pub fn stage(&self) -> AnalysisStage {
        match self {
            Self::DetectJurisdiction => AnalysisStage::JurisdictionDetection,
            Self::ExtractColSection => AnalysisStage::ColExtraction,
            Self::ClassifyThemes => AnalysisStage::ThemeClassification,
            Self::AnalyzeRelevantFacts => AnalysisStage::FactAnalysis,
            Self::IdentifyPilProvisions => AnalysisStage::PilProvisions,
            Self::IdentifyColIssue => AnalysisStage::ColIssue,
            Self::AnalyzeCourtsPosition => AnalysisStage::CourtsPosition,
            Self::ExtractObiterDicta => AnalysisStage::ObiterDicta,
            Self::ExtractDissentingOpinions => AnalysisStage::DissentingOpinions,
            Self::GenerateAbstract => AnalysisStage::Abstract,
        }
    }

    /// Steps that only make sense for common-law decisions.
    pub fn common_law_only(&self) -> bool {
        matches!(self, Self::ExtractObiterDicta | Self::ExtractDissentingOpinions)
    }
}

/// Value produced by one step before it is merged into [`CaseState`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum StepValue {
    Jurisdiction(JurisdictionVerdict),
    Text(String),
    List(Vec<String>),
}

impl StepValue {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Jurisdiction(_) => "jurisdiction",
            Self::Text(_) => "text",
            Self::List(_) => "list",
        }
    }

    /// Size of the result, used for execution-log bookkeeping.
    pub fn len(&self) -> usize {
        match self {
            Self::Jurisdiction(v) => v.family.label().len(),
            Self::Text(t) => t.len(),
            Self::List(items) => items.iter().map(String::len).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Case State ───────────────────────────────────────────────────────────

pub const CIVIL_LAW_NOT_APPLICABLE: &str = "N/A - Not applicable for civil law jurisdiction";
pub const NO_DECISION_NOT_APPLICABLE: &str = "N/A - Not applicable without a court decision";

/// Separator used when a list-valued step result is stored as one element.
pub const THEME_SEPARATOR: &str = ", ";
pub const PROVISION_SEPARATOR: &str = "; ";

/// Ordered-append outputs. A non-empty list means the step completed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseResults {
    #[serde(default)]
    pub col_section: Vec<String>,
    #[serde(default)]
    pub classification: Vec<String>,
    #[serde(default)]
    pub relevant_facts: Vec<String>,
    #[serde(default)]
    pub pil_provisions: Vec<String>,
    #[serde(default)]
    pub col_issue: Vec<String>,
    #[serde(default)]
    pub courts_position: Vec<String>,
    #[serde(default)]
    pub obiter_dicta: Vec<String>,
    #[serde(default)]
    pub dissenting_opinions: Vec<String>,
    #[serde(rename = "abstract", default)]
    pub abstract_: Vec<String>,
}

impl CaseResults {
    pub fn list(&self, kind: StepKind) -> Option<&Vec<String>> {
        Some(match kind {
            StepKind::DetectJurisdiction => return None,
            StepKind::ExtractColSection => &self.col_section,
            StepKind::ClassifyThemes => &self.classification,
            StepKind::AnalyzeRelevantFacts => &self.relevant_facts,
            StepKind::IdentifyPilProvisions => &self.pil_provisions,
            StepKind::IdentifyColIssue => &self.col_issue,
            StepKind::AnalyzeCourtsPosition => &self.courts_position,
            StepKind::ExtractObiterDicta => &self.obiter_dicta,
            StepKind::ExtractDissentingOpinions => &self.dissenting_opinions,
            StepKind::GenerateAbstract => &self.abstract_,
        })
    }

    fn list_mut(&mut self, kind: StepKind) -> Option<&mut Vec<String>> {
        Some(match kind {
            StepKind::DetectJurisdiction => return None,
            StepKind::ExtractColSection => &mut self.col_section,
            StepKind::ClassifyThemes => &mut self.classification,
            StepKind::AnalyzeRelevantFacts => &mut self.relevant_facts,
            StepKind::IdentifyPilProvisions => &mut self.pil_provisions,
            StepKind::IdentifyColIssue => &mut self.col_issue,
            StepKind::AnalyzeCourtsPosition => &mut self.courts_position,
            StepKind::ExtractObiterDicta => &mut self.obiter_dicta,
            StepKind::ExtractDissentingOpinions => &mut self.dissenting_opinions,
            StepKind::GenerateAbstract => &mut self.abstract_,
        })
    }
}

/// Mutable analysis record for one case, keyed by `session_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseState {
    pub session_id: String,
    pub case_citation: String,
    pub full_text: String,
    /// Jurisdiction name supplied by the caller, if any.
    #[serde(default)]
    pub jurisdiction_hint: Option<String>,
    pub jurisdiction_family: JurisdictionFamily,
    #[serde(default)]
    pub precise_jurisdiction: Option<String>,
    #[serde(default)]
    pub confidence: Option<Confidence>,
    #[serde(default)]
    pub method: Option<DetectionMethod>,
    #[serde(flatten)]
    pub results: CaseResults,
    pub analysis_stage: AnalysisStage,
    pub completion_done: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CaseState {
    pub fn new(
        session_id: impl Into<String>,
        case_citation: impl Into<String>,
        full_text: impl Into<String>,
        jurisdiction_hint: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            case_citation: case_citation.into(),
            full_text: full_text.into(),
            jurisdiction_hint,
            jurisdiction_family: JurisdictionFamily::Unset,
            precise_jurisdiction: None,
            confidence: None,
            method: None,
            results: CaseResults::default(),
            analysis_stage: AnalysisStage::NotStarted,
            completion_done: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Name handed to the classifier: the explicit hint, else the citation.
    pub fn jurisdiction_name(&self) -> &str {
        self.jurisdiction_hint
            .as_deref()
            .filter(|h| !h.trim().is_empty())
            .unwrap_or(&self.case_citation)
    }

    pub fn is_complete(&self, kind: StepKind) -> bool {
        match self.results.list(kind) {
            Some(list) => !list.is_empty(),
            None => self.jurisdiction_family.is_resolved(),
        }
    }

    /// Most recent value of a free-text step, or "" when not yet run.
    pub fn latest(&self, kind: StepKind) -> &str {
        self.results
            .list(kind)
            .and_then(|l| l.last())
            .map(String::as_str)
            .unwrap_or("")
    }

    pub fn themes(&self) -> Vec<String> {
        split_stored(self.latest(StepKind::ClassifyThemes), THEME_SEPARATOR)
    }

    pub fn provisions(&self) -> Vec<String> {
        split_stored(self.latest(StepKind::IdentifyPilProvisions), PROVISION_SEPARATOR)
    }

    /// Merge a step result. Completed lists are never overwritten.
    pub fn apply(&mut self, kind: StepKind, value: StepValue) {
        match value {
            StepValue::Jurisdiction(verdict) => {
                if self.jurisdiction_family.is_resolved() {
                    return;
                }
                self.jurisdiction_family = verdict.family;
                self.precise_jurisdiction = Some(verdict.precise_name);
                self.confidence = Some(verdict.confidence);
                self.method = Some(verdict.method);
                self.gate_common_law_steps();
            }
            StepValue::Text(text) => self.push_once(kind, text),
            StepValue::List(items) => {
                let sep = if kind == StepKind::IdentifyPilProvisions {
                    PROVISION_SEPARATOR
                } else {
                    THEME_SEPARATOR
                };
                self.push_once(kind, items.join(sep));
            }
        }
        self.analysis_stage = kind.stage();
        if kind == StepKind::GenerateAbstract {
            self.analysis_stage = AnalysisStage::Complete;
            self.completion_done = true;
        }
        self.updated_at = Utc::now();
    }

    fn push_once(&mut self, kind: StepKind, value: String) {
        if let Some(list) = self.results.list_mut(kind) {
            if list.is_empty() {
                list.push(value);
            }
        }
    }

    /// Fill the common-law-only lists with a not-applicable marker once the
    /// family is known to be something other than common law.
    fn gate_common_law_steps(&mut self) {
        let marker = match self.jurisdiction_family {
            JurisdictionFamily::CivilLaw => CIVIL_LAW_NOT_APPLICABLE,
            JurisdictionFamily::NoDecision => NO_DECISION_NOT_APPLICABLE,
            JurisdictionFamily::CommonLaw | JurisdictionFamily::Unset => return,
        };
        for kind in [StepKind::ExtractObiterDicta, StepKind::ExtractDissentingOpinions] {
            self.push_once(kind, marker.to_string());
        }
    }
}

fn split_stored(stored: &str, sep: &str) -> Vec<String> {
    stored
        .split(sep)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// ── Requests & Reports ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisPattern {
    /// Jurisdiction detection and theme classification only.
    Quick,
    #[default]
    Comprehensive,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalyzeRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub case_citation: Option<String>,
    #[serde(default)]
    pub full_text: Option<String>,
    #[serde(default)]
    pub jurisdiction: Option<String>,
    #[serde(default)]
    pub pattern: AnalysisPattern,
    #[serde(default)]
    pub target_stage: Option<AnalysisStage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Executed,
    AlreadyComplete,
    NotApplicable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepReport {
    pub step: StepKind,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub session_id: String,
    pub case_citation: String,
    pub stage: AnalysisStage,
    pub jurisdiction_family: JurisdictionFamily,
    pub precise_jurisdiction: Option<String>,
    pub confidence: Option<Confidence>,
    pub method: Option<DetectionMethod>,
    pub results: CaseResults,
    pub completion_percentage: f64,
    pub completion_done: bool,
    pub next_stage: Option<AnalysisStage>,
    pub steps: Vec<StepReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub case_citation: String,
    pub jurisdiction_family: JurisdictionFamily,
    pub stage: AnalysisStage,
    pub completion_percentage: f64,
    pub updated_at: DateTime<Utc>,
}

// ── Completion Messages ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "system" => Some(Self::System),
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "tool" => Some(Self::Tool),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Tool name, set on tool-result messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    pub fn tool_result(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            tool_call_id: Some(call_id.into()),
            name: Some(tool_name.into()),
            ..Self::plain(Role::Tool, content)
        }
    }
}

/// JSON-schema description of a callable tool, sent to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

impl Completion {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }
}

// ── Events ───────────────────────────────────────────────────────────────

/// Broadcast event emitted as the orchestrator walks a session's pipeline.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    StepStarted {
        session_id: String,
        step: StepKind,
    },
    StepCompleted {
        session_id: String,
        step: StepKind,
        message: String,
    },
    StepFailed {
        session_id: String,
        step: StepKind,
        error: String,
    },
    AnalysisComplete {
        session_id: String,
        message: String,
    },
}

impl PipelineEvent {
    pub fn kind(&self) -> &str {
        match self {
            Self::StepStarted { .. } => "step_started",
            Self::StepCompleted { .. } => "step_completed",
            Self::StepFailed { .. } => "step_failed",
            Self::AnalysisComplete { .. } => "analysis_complete",
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            Self::StepStarted { session_id, .. }
            | Self::StepCompleted { session_id, .. }
            | Self::StepFailed { session_id, .. }
            | Self::AnalysisComplete { session_id, .. } => session_id,
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::StepStarted { step, .. } => format!("{} started", step.name()),
            Self::StepCompleted { message, .. } | Self::AnalysisComplete { message, .. } => {
                message.clone()
            }
            Self::StepFailed { step, error, .. } => format!("{} failed: {error}", step.name()),
        }
    }
}
