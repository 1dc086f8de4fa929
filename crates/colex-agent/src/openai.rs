use std::collections::BTreeMap;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use colex_core::completion::CompletionService;
use colex_core::types::{ChatMessage, Completion, CompletionRequest, Role, ToolCall, ToolSpec};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

/// Any server speaking the OpenAI chat-completions protocol.
pub struct OpenAiBackend {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub timeout_secs: u64,
}

impl OpenAiBackend {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            timeout_secs: 120,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    fn url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(self.timeout_secs))
            .build()?;

        let response = match client
            .post(self.url())
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                warn!(timeout_secs = self.timeout_secs, "openai request timed out");
                bail!("completion request timed out after {}s", self.timeout_secs);
            }
            Err(e) => {
                warn!("openai request failed: {e}");
                return Err(anyhow!(e).context("completion request failed"));
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, "openai returned non-200: {}", body);
            bail!("completion backend error {status}: {body}");
        }
        Ok(response)
    }
}

#[async_trait]
impl CompletionService for OpenAiBackend {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let body = request_body(request, &self.model, false);
        info!(
            model = body["model"].as_str().unwrap_or_default(),
            messages = request.messages.len(),
            tools = request.tools.len(),
            "calling chat completions"
        );

        let parsed: ChatResponse = self
            .post(&body)
            .await?
            .json()
            .await
            .context("failed to parse completion response")?;
        let completion = parsed.into_completion()?;

        info!(
            output_len = completion.content.len(),
            tool_calls = completion.tool_calls.len(),
            "completion received"
        );
        Ok(completion)
    }

    async fn complete_streaming(
        &self,
        request: &CompletionRequest,
        deltas: mpsc::UnboundedSender<String>,
    ) -> Result<Completion> {
        let body = request_body(request, &self.model, true);
        info!(
            model = body["model"].as_str().unwrap_or_default(),
            messages = request.messages.len(),
            "calling chat completions (streaming)"
        );

        let mut stream = self.post(&body).await?.bytes_stream();
        let mut acc = StreamAccumulator::default();
        let mut buffer = String::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("completion stream interrupted")?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(end) = buffer.find('\n') {
                let line: String = buffer.drain(..=end).collect();
                if let Some(delta) = acc.push_line(&line) {
                    let _ = deltas.send(delta);
                }
            }
            if acc.is_done() {
                break;
            }
        }
        if let Some(delta) = acc.push_line(&buffer) {
            let _ = deltas.send(delta);
        }

        let completion = acc.finish();
        info!(
            output_len = completion.content.len(),
            tool_calls = completion.tool_calls.len(),
            "streamed completion finished"
        );
        Ok(completion)
    }
}

// ── Wire format ──────────────────────────────────────────────────────────

pub fn request_body(request: &CompletionRequest, default_model: &str, stream: bool) -> Value {
    let mut body = json!({
        "model": request.model.as_deref().unwrap_or(default_model),
        "messages": request.messages.iter().map(wire_message).collect::<Vec<_>>(),
        "stream": stream,
    });
    if let Some(t) = request.temperature {
        body["temperature"] = json!(t);
    }
    if !request.tools.is_empty() {
        body["tools"] = request.tools.iter().map(wire_tool).collect();
    }
    body
}

pub fn wire_message(m: &ChatMessage) -> Value {
    match m.role {
        Role::Assistant if !m.tool_calls.is_empty() => json!({
            "role": "assistant",
            "content": if m.content.is_empty() { Value::Null } else { json!(m.content) },
            "tool_calls": m.tool_calls.iter().map(|c| json!({
                "id": c.id,
                "type": "function",
                "function": { "name": c.name, "arguments": c.arguments.to_string() },
            })).collect::<Vec<_>>(),
        }),
        Role::Tool => json!({
            "role": "tool",
            "tool_call_id": m.tool_call_id.as_deref().unwrap_or_default(),
            "content": m.content,
        }),
        role => json!({ "role": role.as_str(), "content": m.content }),
    }
}

pub fn wire_tool(spec: &ToolSpec) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": spec.name,
            "description": spec.description,
            "parameters": spec.parameters,
        }
    })
}

/// Tool arguments arrive as a JSON-encoded string. Unparseable arguments are
/// passed through as a string so the tool can report the problem.
fn decode_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return json!({});
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

#[derive(Deserialize)]
pub struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ResponseToolCall>,
}

#[derive(Deserialize)]
struct ResponseToolCall {
    id: String,
    function: ResponseFunction,
}

#[derive(Deserialize)]
struct ResponseFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

impl ChatResponse {
    pub fn into_completion(self) -> Result<Completion> {
        let choice = self
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("completion response has no choices"))?;
        Ok(Completion {
            content: choice.message.content.unwrap_or_default(),
            tool_calls: choice
                .message
                .tool_calls
                .into_iter()
                .map(|c| ToolCall {
                    id: c.id,
                    name: c.function.name,
                    arguments: decode_arguments(&c.function.arguments),
                })
                .collect(),
        })
    }
}

// ── Streaming ────────────────────────────────────────────────────────────

#[derive(Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// Folds server-sent `data:` lines into a completion. Tool-call fragments
/// are keyed by their `index` and concatenated.
#[derive(Default)]
pub struct StreamAccumulator {
    content: String,
    calls: BTreeMap<u64, PartialCall>,
    done: bool,
}

impl StreamAccumulator {
    /// Returns the content delta carried by this line, if any.
    pub fn push_line(&mut self, line: &str) -> Option<String> {
        let data = line.trim().strip_prefix("data:")?.trim();
        if data == "[DONE]" {
            self.done = true;
            return None;
        }
        let chunk: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => {
                debug!("skipping malformed stream chunk: {e}");
                return None;
            }
        };
        let delta = chunk.pointer("/choices/0/delta")?;

        if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
            for fragment in calls {
                let index = fragment.get("index").and_then(Value::as_u64).unwrap_or(0);
                let call = self.calls.entry(index).or_default();
                if let Some(id) = fragment.get("id").and_then(Value::as_str) {
                    call.id = id.to_string();
                }
                if let Some(f) = fragment.get("function") {
                    if let Some(name) = f.get("name").and_then(Value::as_str) {
                        call.name.push_str(name);
                    }
                    if let Some(args) = f.get("arguments").and_then(Value::as_str) {
                        call.arguments.push_str(args);
                    }
                }
            }
        }

        let text = delta.get("content").and_then(Value::as_str)?;
        if text.is_empty() {
            return None;
        }
        self.content.push_str(text);
        Some(text.to_string())
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn finish(self) -> Completion {
        Completion {
            content: self.content,
            tool_calls: self
                .calls
                .into_values()
                .filter(|c| !c.name.is_empty())
                .map(|c| ToolCall {
                    id: c.id,
                    name: c.name,
                    arguments: decode_arguments(&c.arguments),
                })
                .collect(),
        }
    }
}
