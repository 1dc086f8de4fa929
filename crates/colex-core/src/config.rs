use std::collections::HashMap;

use anyhow::{bail, Result};

use crate::extraction::StepSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmBackendKind {
    OpenAi,
    Ollama,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub web_bind: String,
    pub web_port: u16,
    pub llm_backend: LlmBackendKind,
    pub llm_base_url: String,
    pub openai_api_key: String,
    pub llm_model: String,
    pub llm_temperature: f32,
    pub llm_timeout_s: u64,
    /// Empty means in-memory stores.
    pub database_url: String,
    /// Empty disables token verification; every caller is `anonymous`.
    pub jwt_secret: String,
    pub parse_attempts: u32,
    pub chat_max_tool_iterations: u32,
    pub exec_log_capacity: usize,
    pub assistant_name: String,
}

type Lookup<'a> = dyn Fn(&str) -> Option<String> + 'a;

impl Config {
    /// Process environment first, then `.env` in the working directory.
    pub fn from_env() -> Result<Self> {
        let dotenv = parse_dotenv();
        Self::from_lookup(&|key| std::env::var(key).ok().or_else(|| dotenv.get(key).cloned()))
    }

    pub fn from_map(vars: &HashMap<String, String>) -> Result<Self> {
        Self::from_lookup(&|key| vars.get(key).cloned())
    }

    fn from_lookup(get: &Lookup<'_>) -> Result<Self> {
        let llm_backend = match get_str("LLM_BACKEND", get, "openai").to_lowercase().as_str() {
            "openai" => LlmBackendKind::OpenAi,
            "ollama" => LlmBackendKind::Ollama,
            other => bail!("unknown LLM_BACKEND '{other}' (expected openai or ollama)"),
        };
        let default_base = match llm_backend {
            LlmBackendKind::OpenAi => "https://api.openai.com/v1",
            LlmBackendKind::Ollama => "http://localhost:11434",
        };

        let config = Self {
            web_bind: get_str("WEB_BIND", get, "127.0.0.1"),
            web_port: get_u16("WEB_PORT", get, 8000),
            llm_backend,
            llm_base_url: get_str("LLM_BASE_URL", get, default_base),
            openai_api_key: get_str("OPENAI_API_KEY", get, ""),
            llm_model: get_str("LLM_MODEL", get, "gpt-4o-mini"),
            llm_temperature: get_f32("LLM_TEMPERATURE", get, 0.3),
            llm_timeout_s: get_u64("LLM_TIMEOUT_S", get, 120),
            database_url: get_str("DATABASE_URL", get, ""),
            jwt_secret: get_str("JWT_SECRET", get, ""),
            parse_attempts: get_u32("PARSE_ATTEMPTS", get, 3).max(1),
            chat_max_tool_iterations: get_u32("CHAT_MAX_TOOL_ITERATIONS", get, 8).max(1),
            exec_log_capacity: get_u64("EXEC_LOG_CAPACITY", get, 10_000).max(1) as usize,
            assistant_name: get_str("ASSISTANT_NAME", get, "Colex"),
        };

        if config.llm_backend == LlmBackendKind::OpenAi && config.openai_api_key.is_empty() {
            bail!("OPENAI_API_KEY must be set when LLM_BACKEND=openai");
        }
        Ok(config)
    }

    pub fn step_settings(&self) -> StepSettings {
        StepSettings {
            parse_attempts: self.parse_attempts,
            temperature: self.llm_temperature,
        }
    }

    pub fn chat_system_prompt(&self) -> String {
        format!(
            "You are {}, an assistant for private international law research. \
             You help users analyse court decisions for choice-of-law questions: \
             the legal family of the deciding court, the choice-of-law reasoning, \
             the themes involved, the provisions cited and the court's position. \
             Use the available tools when a question needs case data or a \
             jurisdiction classification. Be precise, cite the decision's own \
             wording where possible, and say so when the text does not answer \
             the question.",
            self.assistant_name
        )
    }

    pub fn auth_enabled(&self) -> bool {
        !self.jwt_secret.is_empty()
    }
}

fn parse_dotenv() -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Ok(contents) = std::fs::read_to_string(".env") else {
        return map;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            let v = v.trim().trim_matches('"');
            map.insert(k.trim().to_string(), v.to_string());
        }
    }
    map
}

fn get_str(key: &str, get: &Lookup<'_>, default: &str) -> String {
    get(key).unwrap_or_else(|| default.to_string())
}

fn get_f32(key: &str, get: &Lookup<'_>, default: f32) -> f32 {
    get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn get_u16(key: &str, get: &Lookup<'_>, default: u16) -> u16 {
    get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn get_u32(key: &str, get: &Lookup<'_>, default: u32) -> u32 {
    get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn get_u64(key: &str, get: &Lookup<'_>, default: u64) -> u64 {
    get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}
