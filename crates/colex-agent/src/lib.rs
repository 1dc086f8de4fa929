pub mod ollama;
pub mod openai;

use std::sync::Arc;

use colex_core::completion::CompletionService;
use colex_core::config::{Config, LlmBackendKind};

pub use ollama::OllamaBackend;
pub use openai::OpenAiBackend;

/// Completion backend selected by `LLM_BACKEND`.
pub fn backend_from_config(config: &Config) -> Arc<dyn CompletionService> {
    match config.llm_backend {
        LlmBackendKind::OpenAi => Arc::new(
            OpenAiBackend::new(&config.llm_base_url, &config.openai_api_key, &config.llm_model)
                .with_timeout(config.llm_timeout_s),
        ),
        LlmBackendKind::Ollama => Arc::new(
            OllamaBackend::new(&config.llm_base_url, &config.llm_model)
                .with_timeout(config.llm_timeout_s),
        ),
    }
}
