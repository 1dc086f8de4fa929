use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::completion::CompletionService;
use crate::error::ChatError;
use crate::store::{CaseStore, Conversation, ConversationStore, NewMessage, StoredMessage};
use crate::types::{
    CaseState, ChatMessage, Completion, CompletionRequest, Role, StepKind, ToolCall, ToolSpec,
};

pub const MAX_ITERATIONS_MESSAGE: &str = "Maximum tool iterations exceeded";

const TITLE_CHARS: usize = 60;

// ── Tools ────────────────────────────────────────────────────────────────

#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;
    async fn call(&self, arguments: Value) -> Result<Value>;
}

/// Named tools offered to the model, in registration order.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools.iter().map(|t| t.spec()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.spec().name == name)
    }
}

// ── Events ───────────────────────────────────────────────────────────────

/// Incremental output of a chat turn, streamed to the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    Token(String),
    Tool {
        call_id: String,
        name: String,
        arguments: Value,
    },
    ToolResult {
        call_id: String,
        name: String,
        content: String,
        is_error: bool,
    },
    Done {
        content: String,
    },
    Error {
        message: String,
    },
}

impl ChatEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Token(_) => "token",
            Self::Tool { .. } => "tool",
            Self::ToolResult { .. } => "tool_result",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
        }
    }

    pub fn to_json(&self, conversation_id: i64) -> Value {
        let mut v = match self {
            Self::Token(t) => json!({ "content": t, "done": false }),
            Self::Tool { call_id, name, arguments } => {
                json!({ "tool_call_id": call_id, "tool_name": name, "arguments": arguments, "done": false })
            }
            Self::ToolResult { call_id, name, content, is_error } => json!({
                "tool_call_id": call_id,
                "tool_name": name,
                "content": content,
                "is_error": is_error,
                "done": false,
            }),
            Self::Done { content } => json!({ "content": content, "done": true }),
            Self::Error { message } => json!({ "content": message, "done": true }),
        };
        if let Some(obj) = v.as_object_mut() {
            obj.insert("type".into(), json!(self.kind()));
            obj.insert("conversation_id".into(), json!(conversation_id));
        }
        v
    }
}

fn send(events: Option<&mpsc::UnboundedSender<ChatEvent>>, event: ChatEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event);
    }
}

// ── Agent loop ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Answered,
    MaxIterations,
}

#[derive(Debug, Clone)]
pub struct ChatOutcome {
    /// Assistant and tool messages produced this turn, in order.
    pub new_messages: Vec<ChatMessage>,
    pub final_answer: String,
    pub iterations: u32,
    pub stop: StopReason,
}

/// Agent/tools loop: call the model, run any requested tools, feed the
/// results back, until the model answers without tool calls or the
/// iteration cap is hit.
pub struct ChatAgent {
    completion: Arc<dyn CompletionService>,
    tools: ToolRegistry,
    system_prompt: String,
    max_iterations: u32,
    temperature: f32,
}

impl ChatAgent {
    pub fn new(
        completion: Arc<dyn CompletionService>,
        tools: ToolRegistry,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            completion,
            tools,
            system_prompt: system_prompt.into(),
            max_iterations: 8,
            temperature: 0.3,
        }
    }

    pub fn with_max_iterations(mut self, n: u32) -> Self {
        self.max_iterations = n.max(1);
        self
    }

    pub fn with_temperature(mut self, t: f32) -> Self {
        self.temperature = t;
        self
    }

    pub fn tool_specs(&self) -> Vec<ToolSpec> {
        self.tools.specs()
    }

    pub async fn run(
        &self,
        history: &[ChatMessage],
        context: Option<&str>,
        events: Option<&mpsc::UnboundedSender<ChatEvent>>,
    ) -> Result<ChatOutcome, ChatError> {
        let system = match context {
            Some(ctx) if !ctx.is_empty() => format!("{}\n\n{ctx}", self.system_prompt),
            _ => self.system_prompt.clone(),
        };
        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(ChatMessage::system(system));
        messages.extend(history.iter().filter(|m| m.role != Role::System).cloned());

        let specs = self.tools.specs();
        let mut new_messages = Vec::new();

        for iteration in 1..=self.max_iterations {
            let request = CompletionRequest {
                messages: messages.clone(),
                temperature: Some(self.temperature),
                model: None,
                tools: specs.clone(),
            };
            let completion = match self.call_model(&request, events).await {
                Ok(c) => c,
                Err(e) => {
                    send(events, ChatEvent::Error { message: e.to_string() });
                    return Err(e);
                }
            };

            let assistant = ChatMessage {
                tool_calls: completion.tool_calls.clone(),
                ..ChatMessage::assistant(completion.content.clone())
            };
            messages.push(assistant.clone());
            new_messages.push(assistant);

            if completion.tool_calls.is_empty() {
                send(events, ChatEvent::Done { content: completion.content.clone() });
                return Ok(ChatOutcome {
                    new_messages,
                    final_answer: completion.content,
                    iterations: iteration,
                    stop: StopReason::Answered,
                });
            }

            for call in &completion.tool_calls {
                send(
                    events,
                    ChatEvent::Tool {
                        call_id: call.id.clone(),
                        name: call.name.clone(),
                        arguments: call.arguments.clone(),
                    },
                );
                let (content, is_error) = self.invoke(call).await;
                send(
                    events,
                    ChatEvent::ToolResult {
                        call_id: call.id.clone(),
                        name: call.name.clone(),
                        content: content.clone(),
                        is_error,
                    },
                );
                let result = ChatMessage::tool_result(&call.id, &call.name, content);
                messages.push(result.clone());
                new_messages.push(result);
            }
        }

        warn!(max_iterations = self.max_iterations, "chat turn hit the tool iteration cap");
        new_messages.push(ChatMessage::assistant(MAX_ITERATIONS_MESSAGE));
        send(events, ChatEvent::Error { message: MAX_ITERATIONS_MESSAGE.to_string() });
        Ok(ChatOutcome {
            new_messages,
            final_answer: MAX_ITERATIONS_MESSAGE.to_string(),
            iterations: self.max_iterations,
            stop: StopReason::MaxIterations,
        })
    }

    async fn call_model(
        &self,
        request: &CompletionRequest,
        events: Option<&mpsc::UnboundedSender<ChatEvent>>,
    ) -> Result<Completion, ChatError> {
        let result = match events {
            Some(tx) => {
                let (delta_tx, mut delta_rx) = mpsc::unbounded_channel::<String>();
                let tx = tx.clone();
                let forward = tokio::spawn(async move {
                    while let Some(delta) = delta_rx.recv().await {
                        let _ = tx.send(ChatEvent::Token(delta));
                    }
                });
                let result = self.completion.complete_streaming(request, delta_tx).await;
                let _ = forward.await;
                result
            }
            None => self.completion.complete(request).await,
        };
        result.map_err(|e| ChatError::Completion(format!("{e:#}")))
    }

    /// Tool failures and unknown tools become an error payload for the model
    /// instead of aborting the turn.
    async fn invoke(&self, call: &ToolCall) -> (String, bool) {
        let Some(tool) = self.tools.get(&call.name) else {
            warn!(tool = %call.name, "model requested an unknown tool");
            let body = json!({ "error": format!("Tool '{}' is not available", call.name) });
            return (body.to_string(), true);
        };
        match tool.call(call.arguments.clone()).await {
            Ok(Value::String(s)) => (s, false),
            Ok(v) => (v.to_string(), false),
            Err(e) => {
                warn!(tool = %call.name, "tool failed: {e:#}");
                (json!({ "error": format!("{e:#}") }).to_string(), true)
            }
        }
    }
}

// ── Persistence mapping ──────────────────────────────────────────────────

/// Rebuild model history from stored rows. Assistant rows carrying a
/// `tool_call_id` are tool-call requests; they fold into the assistant
/// message they follow.
pub fn history_from_rows(rows: &[StoredMessage]) -> Vec<ChatMessage> {
    let mut out: Vec<ChatMessage> = Vec::with_capacity(rows.len());
    for row in rows {
        match (row.role, &row.tool_call_id) {
            (Role::Assistant, Some(call_id)) => {
                let call = ToolCall {
                    id: call_id.clone(),
                    name: row.tool_name.clone().unwrap_or_default(),
                    arguments: serde_json::from_str(&row.content).unwrap_or(Value::Null),
                };
                match out.last_mut() {
                    Some(last) if last.role == Role::Assistant => last.tool_calls.push(call),
                    _ => out.push(ChatMessage {
                        tool_calls: vec![call],
                        ..ChatMessage::assistant("")
                    }),
                }
            }
            (Role::Tool, _) => out.push(ChatMessage::tool_result(
                row.tool_call_id.clone().unwrap_or_default(),
                row.tool_name.clone().unwrap_or_default(),
                row.content.clone(),
            )),
            (Role::System, _) => {}
            (role, _) => out.push(ChatMessage {
                role,
                ..ChatMessage::user(row.content.clone())
            }),
        }
    }
    out
}

/// Inverse of [`history_from_rows`].
pub fn rows_from_messages(messages: &[ChatMessage]) -> Vec<NewMessage> {
    let mut rows = Vec::new();
    for m in messages {
        match m.role {
            Role::System => {}
            Role::Assistant if !m.tool_calls.is_empty() => {
                if !m.content.is_empty() {
                    rows.push(NewMessage {
                        role: Role::Assistant,
                        content: m.content.clone(),
                        tool_name: None,
                        tool_call_id: None,
                    });
                }
                rows.extend(m.tool_calls.iter().map(|c| NewMessage {
                    role: Role::Assistant,
                    content: c.arguments.to_string(),
                    tool_name: Some(c.name.clone()),
                    tool_call_id: Some(c.id.clone()),
                }));
            }
            role => rows.push(NewMessage {
                role,
                content: m.content.clone(),
                tool_name: m.name.clone(),
                tool_call_id: m.tool_call_id.clone(),
            }),
        }
    }
    rows
}

/// System-prompt addendum describing the analysed case under discussion.
pub fn case_context(state: &CaseState) -> String {
    let mut lines = vec![
        "Case context:".to_string(),
        format!("- Citation: {}", state.case_citation),
        format!(
            "- Jurisdiction: {} ({})",
            state.precise_jurisdiction.as_deref().unwrap_or("Unknown"),
            state.jurisdiction_family.label()
        ),
    ];
    let themes = state.themes();
    if !themes.is_empty() {
        lines.push(format!("- Themes: {}", themes.join(", ")));
    }
    let issue = state.latest(StepKind::IdentifyColIssue);
    if !issue.is_empty() {
        lines.push(format!("- Choice of law issue: {issue}"));
    }
    lines.join("\n")
}

// ── Conversation-backed chat ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct ChatReply {
    pub conversation_id: i64,
    pub session_id: Option<String>,
    pub answer: String,
    pub iterations: u32,
    pub stop: StopReason,
}

/// Runs chat turns against stored conversations. Every message of a turn is
/// persisted whether or not anyone is still listening for events.
pub struct ChatService {
    agent: ChatAgent,
    conversations: Arc<dyn ConversationStore>,
    cases: Arc<dyn CaseStore>,
}

impl ChatService {
    pub fn new(
        agent: ChatAgent,
        conversations: Arc<dyn ConversationStore>,
        cases: Arc<dyn CaseStore>,
    ) -> Self {
        Self {
            agent,
            conversations,
            cases,
        }
    }

    pub fn conversations(&self) -> &Arc<dyn ConversationStore> {
        &self.conversations
    }

    pub fn tool_specs(&self) -> Vec<ToolSpec> {
        self.agent.tool_specs()
    }

    /// The caller's existing conversation, or a new one titled after the
    /// opening message.
    pub async fn open_conversation(
        &self,
        user_id: &str,
        conversation_id: Option<i64>,
        message: &str,
        session_id: Option<&str>,
    ) -> Result<Conversation, ChatError> {
        match conversation_id {
            Some(id) => self
                .conversations
                .get(id, user_id)
                .await?
                .ok_or(ChatError::ConversationNotFound(id)),
            None => {
                let title: String = message.trim().chars().take(TITLE_CHARS).collect();
                Ok(self.conversations.create(user_id, &title, session_id).await?)
            }
        }
    }

    pub async fn send(
        &self,
        user_id: &str,
        conversation_id: Option<i64>,
        message: &str,
        session_id: Option<&str>,
        events: Option<&mpsc::UnboundedSender<ChatEvent>>,
    ) -> Result<ChatReply, ChatError> {
        let conversation = self
            .open_conversation(user_id, conversation_id, message, session_id)
            .await?;

        let session_id = session_id
            .map(str::to_string)
            .or_else(|| conversation.session_id.clone());
        let context = match &session_id {
            Some(id) => self.cases.get(id).await?.map(|s| case_context(&s)),
            None => None,
        };

        let mut history = history_from_rows(&self.conversations.messages(conversation.id).await?);
        history.push(ChatMessage::user(message));

        let outcome = match self.agent.run(&history, context.as_deref(), events).await {
            Ok(o) => o,
            Err(e) => {
                warn!(conversation_id = conversation.id, "chat turn failed: {e}");
                return Err(e);
            }
        };
        // The user row is only kept together with an answer, so a failed turn
        // leaves the history as it was.
        let mut rows = vec![NewMessage::user(message)];
        rows.extend(rows_from_messages(&outcome.new_messages));
        self.conversations.append(conversation.id, &rows).await?;

        info!(
            conversation_id = conversation.id,
            iterations = outcome.iterations,
            stop = ?outcome.stop,
            "chat turn finished"
        );
        Ok(ChatReply {
            conversation_id: conversation.id,
            session_id,
            answer: outcome.final_answer,
            iterations: outcome.iterations,
            stop: outcome.stop,
        })
    }
}
