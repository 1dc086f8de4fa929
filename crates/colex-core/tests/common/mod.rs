#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use colex_core::completion::CompletionService;
use colex_core::exec_log::ExecutionLog;
use colex_core::extraction::StepSettings;
use colex_core::pipeline::Orchestrator;
use colex_core::store::MemoryCaseStore;
use colex_core::types::{Completion, CompletionRequest, ToolCall};

pub const SWISS_TEXT: &str = "The Federal Supreme Court held that under Art. 187 PILA the \
    arbitral tribunal correctly applied Swiss law chosen by the parties to the distribution agreement.";

pub const ENGLISH_TEXT: &str = "Lord Justice Smith: the appellant contends that the contract is \
    governed by English law by virtue of the express choice in clause 12. I would dismiss the appeal.";

type Responder = dyn Fn(&CompletionRequest, usize) -> Result<Completion> + Send + Sync;

/// Completion double driven by a closure. Counts calls and keeps every
/// request for later inspection.
pub struct FnCompletion {
    respond: Box<Responder>,
    calls: AtomicUsize,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl FnCompletion {
    pub fn new(
        respond: impl Fn(&CompletionRequest, usize) -> Result<Completion> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            respond: Box::new(respond),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Answers each step with plausible output based on its prompt.
    pub fn steps() -> Arc<Self> {
        Self::new(|req, _| Ok(Completion::text(step_reply(req))))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.messages.last().map(|m| m.content.clone()).unwrap_or_default())
            .collect()
    }
}

#[async_trait]
impl CompletionService for FnCompletion {
    fn name(&self) -> &str {
        "fn"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        (self.respond)(request, n)
    }
}

pub fn user_prompt(req: &CompletionRequest) -> &str {
    req.messages.last().map(|m| m.content.as_str()).unwrap_or("")
}

pub fn step_reply(req: &CompletionRequest) -> String {
    let prompt = user_prompt(req);
    if prompt.contains("Classify the court decision below") {
        "Common-law jurisdiction".into()
    } else if prompt.contains("Return only the JSON list:") {
        r#"["Party Autonomy", "Choice of Law Clauses"]"#.into()
    } else if prompt.contains("PIL provisions (JSON):") {
        r#"["Art. 187, PILA"]"#.into()
    } else if prompt.contains("Obiter dicta:") {
        "The court remarked that an implied choice might also have sufficed.".into()
    } else if prompt.contains("Dissenting opinions:") {
        "Lady Justice Jones would have applied the law of closest connection.".into()
    } else if prompt.contains("The choice of law issue is:") {
        "Can parties validly choose a law unconnected to their contract?".into()
    } else {
        "Generated analysis text.".into()
    }
}

/// Queue of canned completions. Runs dry with an error.
pub struct ScriptedCompletion {
    replies: Mutex<VecDeque<Completion>>,
    calls: AtomicUsize,
}

impl ScriptedCompletion {
    pub fn new(replies: Vec<Completion>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionService for ScriptedCompletion {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, _request: &CompletionRequest) -> Result<Completion> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow!("script exhausted"))
    }
}

pub fn tool_call(id: &str, name: &str, arguments: serde_json::Value) -> Completion {
    Completion {
        content: String::new(),
        tool_calls: vec![ToolCall {
            id: id.into(),
            name: name.into(),
            arguments,
        }],
    }
}

pub fn orchestrator(completion: Arc<dyn CompletionService>) -> (Orchestrator, Arc<ExecutionLog>) {
    let log = ExecutionLog::new(1_000);
    let (orch, _rx) = Orchestrator::new(
        Arc::new(MemoryCaseStore::new()),
        completion,
        Arc::clone(&log),
        StepSettings::default(),
    );
    (orch, log)
}
