use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use colex_core::completion::CompletionService;
use colex_core::types::{ChatMessage, Completion, CompletionRequest, ToolCall, ToolSpec};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::openai::wire_tool;

/// Calls a locally-hosted Ollama model via its native chat API.
///
/// Suitable when decision texts must not leave the machine. Tool calls are
/// passed through when the model supports them; Ollama assigns no call ids,
/// so they are numbered per response.
pub struct OllamaBackend {
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
}

impl OllamaBackend {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
            timeout_secs: 300,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

#[derive(Debug, Serialize)]
pub struct OllamaMessage {
    role: String,
    content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<OllamaToolCall>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OllamaToolCall {
    function: OllamaFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct OllamaFunction {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f32,
}

#[derive(Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: Vec<OllamaMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<OllamaOptions>,
}

#[derive(Deserialize)]
pub struct OllamaChatResponse {
    message: OllamaResponseMessage,
}

#[derive(Deserialize)]
struct OllamaResponseMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Vec<OllamaToolCall>,
}

impl OllamaChatResponse {
    pub fn into_completion(self) -> Completion {
        Completion {
            content: self.message.content,
            tool_calls: self
                .message
                .tool_calls
                .into_iter()
                .enumerate()
                .map(|(i, c)| ToolCall {
                    id: format!("call_{i}"),
                    name: c.function.name,
                    arguments: c.function.arguments,
                })
                .collect(),
        }
    }
}

pub fn ollama_message(m: &ChatMessage) -> OllamaMessage {
    OllamaMessage {
        role: m.role.as_str().into(),
        content: m.content.clone(),
        tool_calls: m
            .tool_calls
            .iter()
            .map(|c| OllamaToolCall {
                function: OllamaFunction {
                    name: c.name.clone(),
                    arguments: c.arguments.clone(),
                },
            })
            .collect(),
    }
}

fn tools(specs: &[ToolSpec]) -> Vec<Value> {
    specs.iter().map(wire_tool).collect()
}

#[async_trait]
impl CompletionService for OllamaBackend {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let model = request.model.as_deref().unwrap_or(&self.model);
        let request_body = OllamaChatRequest {
            model,
            messages: request.messages.iter().map(ollama_message).collect(),
            stream: false,
            tools: tools(&request.tools),
            options: request.temperature.map(|temperature| OllamaOptions { temperature }),
        };

        info!(
            model = %model,
            base_url = %self.base_url,
            messages = request.messages.len(),
            "calling ollama chat API"
        );

        let url = format!("{}/api/chat", self.base_url.trim_end_matches('/'));

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(self.timeout_secs))
            .build()?;

        let response = match client.post(&url).json(&request_body).send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                warn!(timeout_secs = self.timeout_secs, "ollama request timed out");
                bail!("Ollama request timed out after {}s", self.timeout_secs);
            }
            Err(e) => {
                warn!("ollama request failed: {}", e);
                return Err(anyhow!(e).context("Ollama request failed"));
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, "ollama returned non-200: {}", body);
            bail!("Ollama error {}: {}", status, body);
        }

        let parsed: OllamaChatResponse = response
            .json()
            .await
            .context("failed to parse Ollama response")?;
        let completion = parsed.into_completion();

        info!(
            output_len = completion.content.len(),
            tool_calls = completion.tool_calls.len(),
            "ollama response received"
        );
        Ok(completion)
    }
}
