mod common;

use std::sync::Arc;

use chrono::Utc;
use colex_core::chat::{
    history_from_rows, rows_from_messages, ChatAgent, ChatEvent, ChatService, StopReason,
    ToolRegistry, MAX_ITERATIONS_MESSAGE,
};
use colex_core::error::ChatError;
use colex_core::store::{CaseStore, ConversationStore, MemoryCaseStore, MemoryConversationStore, StoredMessage};
use colex_core::tools::default_registry;
use colex_core::types::{CaseState, ChatMessage, Completion, JurisdictionFamily, Role, ToolCall};
use common::{tool_call, FnCompletion, ScriptedCompletion};
use serde_json::json;
use tokio::sync::mpsc;

// ── helpers ──────────────────────────────────────────────────────────────────

fn agent(llm: Arc<dyn colex_core::completion::CompletionService>, store: Arc<dyn CaseStore>) -> ChatAgent {
    let tools = default_registry(Arc::clone(&llm), store, 0.3);
    ChatAgent::new(llm, tools, "You are a test assistant.").with_max_iterations(3)
}

fn drain(rx: &mut mpsc::UnboundedReceiver<ChatEvent>) -> Vec<ChatEvent> {
    let mut out = Vec::new();
    while let Ok(e) = rx.try_recv() {
        out.push(e);
    }
    out
}

fn row(id: i64, role: Role, content: &str, tool: Option<(&str, &str)>) -> StoredMessage {
    StoredMessage {
        id,
        conversation_id: 1,
        role,
        content: content.into(),
        tool_name: tool.map(|t| t.0.to_string()),
        tool_call_id: tool.map(|t| t.1.to_string()),
        created_at: Utc::now(),
    }
}

// ── agent loop ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn plain_answer_stops_after_one_call() {
    let llm = ScriptedCompletion::new(vec![Completion::text("Hello.")]);
    let a = agent(llm.clone(), Arc::new(MemoryCaseStore::new()));

    let out = a.run(&[ChatMessage::user("hi")], None, None).await.unwrap();
    assert_eq!(out.final_answer, "Hello.");
    assert_eq!(out.stop, StopReason::Answered);
    assert_eq!(out.iterations, 1);
    assert_eq!(llm.calls(), 1);
}

#[tokio::test]
async fn tool_round_trip_then_answer() {
    let llm = ScriptedCompletion::new(vec![
        tool_call("c1", "list_pil_themes", json!({})),
        Completion::text("There are twenty themes."),
    ]);
    let a = agent(llm.clone(), Arc::new(MemoryCaseStore::new()));
    let (tx, mut rx) = mpsc::unbounded_channel();

    let out = a.run(&[ChatMessage::user("themes?")], None, Some(&tx)).await.unwrap();

    assert_eq!(out.final_answer, "There are twenty themes.");
    assert_eq!(out.new_messages.len(), 3);
    assert_eq!(out.new_messages[1].role, Role::Tool);
    assert!(out.new_messages[1].content.contains("Renvoi"));

    let kinds: Vec<&str> = drain(&mut rx).iter().map(|e| e.kind()).collect();
    assert_eq!(kinds, vec!["tool", "tool_result", "token", "done"]);
}

#[tokio::test]
async fn unknown_tool_is_reported_inline() {
    let llm = ScriptedCompletion::new(vec![
        tool_call("c1", "delete_everything", json!({})),
        Completion::text("Sorry, I cannot do that."),
    ]);
    let a = agent(llm.clone(), Arc::new(MemoryCaseStore::new()));
    let (tx, mut rx) = mpsc::unbounded_channel();

    let out = a.run(&[ChatMessage::user("go")], None, Some(&tx)).await.unwrap();

    assert_eq!(out.stop, StopReason::Answered);
    let result = &out.new_messages[1];
    assert_eq!(result.tool_call_id.as_deref(), Some("c1"));
    assert!(result.content.contains("Tool 'delete_everything' is not available"));
    assert!(drain(&mut rx)
        .iter()
        .any(|e| matches!(e, ChatEvent::ToolResult { is_error: true, .. })));
}

#[tokio::test]
async fn endless_tool_calls_hit_the_cap() {
    let llm = FnCompletion::new(|_, n| Ok(tool_call(&format!("c{n}"), "list_pil_themes", json!({}))));
    let a = agent(llm.clone(), Arc::new(MemoryCaseStore::new()));
    let (tx, mut rx) = mpsc::unbounded_channel();

    let out = a.run(&[ChatMessage::user("loop")], None, Some(&tx)).await.unwrap();

    assert_eq!(out.stop, StopReason::MaxIterations);
    assert_eq!(out.final_answer, MAX_ITERATIONS_MESSAGE);
    assert_eq!(llm.calls(), 3);
    let last = drain(&mut rx).pop().unwrap();
    assert_eq!(last, ChatEvent::Error { message: MAX_ITERATIONS_MESSAGE.into() });
}

#[tokio::test]
async fn tool_error_does_not_abort() {
    let llm = ScriptedCompletion::new(vec![
        tool_call("c1", "get_case_analysis", json!({ "session_id": "missing" })),
        Completion::text("No such case."),
    ]);
    let a = agent(llm, Arc::new(MemoryCaseStore::new()));

    let out = a.run(&[ChatMessage::user("case?")], None, None).await.unwrap();
    assert!(out.new_messages[1].content.contains("no analysis session 'missing'"));
    assert_eq!(out.final_answer, "No such case.");
}

#[tokio::test]
async fn completion_failure_is_an_error() {
    let llm = ScriptedCompletion::new(vec![]);
    let a = agent(llm, Arc::new(MemoryCaseStore::new()));
    let err = a.run(&[ChatMessage::user("hi")], None, None).await.unwrap_err();
    assert!(matches!(err, ChatError::Completion(_)));
}

#[tokio::test]
async fn case_context_reaches_system_prompt() {
    // Echo the system prompt back as the answer.
    let llm = FnCompletion::new(|req, _| Ok(Completion::text(req.messages[0].content.clone())));
    let store: Arc<dyn CaseStore> = Arc::new(MemoryCaseStore::new());
    let mut state = CaseState::new("case-9", "BGE 140 III 1", "text", Some("Switzerland".into()));
    state.jurisdiction_family = JurisdictionFamily::CivilLaw;
    store.put(&state).await.unwrap();

    let convs = Arc::new(MemoryConversationStore::new());
    let service = ChatService::new(agent(llm.clone(), Arc::clone(&store)), convs.clone(), store);
    let reply = service
        .send("alice", None, "What is this case about?", Some("case-9"), None)
        .await
        .unwrap();

    assert!(reply.answer.starts_with("You are a test assistant."));
    assert!(reply.answer.contains("- Citation: BGE 140 III 1"));
    assert!(reply.answer.contains("Civil-law jurisdiction"));
    assert_eq!(reply.session_id.as_deref(), Some("case-9"));

    let conv = convs.get(reply.conversation_id, "alice").await.unwrap().unwrap();
    assert_eq!(conv.title, "What is this case about?");
    assert_eq!(conv.session_id.as_deref(), Some("case-9"));
}

// ── conversations ────────────────────────────────────────────────────────────

#[tokio::test]
async fn turns_are_persisted_and_replayed() {
    let llm = ScriptedCompletion::new(vec![
        tool_call("c1", "list_pil_themes", json!({})),
        Completion::text("Twenty."),
        Completion::text("Still twenty."),
    ]);
    let convs = Arc::new(MemoryConversationStore::new());
    let cases: Arc<dyn CaseStore> = Arc::new(MemoryCaseStore::new());
    let service = ChatService::new(agent(llm, Arc::clone(&cases)), convs.clone(), cases);

    let first = service.send("alice", None, "How many themes?", None, None).await.unwrap();
    let second = service
        .send("alice", Some(first.conversation_id), "And now?", None, None)
        .await
        .unwrap();
    assert_eq!(second.answer, "Still twenty.");

    let rows = convs.messages(first.conversation_id).await.unwrap();
    let roles: Vec<Role> = rows.iter().map(|r| r.role).collect();
    assert_eq!(
        roles,
        vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant, Role::User, Role::Assistant]
    );
    assert_eq!(rows[1].tool_name.as_deref(), Some("list_pil_themes"));
    assert_eq!(rows[1].tool_call_id.as_deref(), Some("c1"));
}

#[tokio::test]
async fn failed_turn_leaves_no_unanswered_user_row() {
    let llm = FnCompletion::new(|_, n| {
        if n == 0 {
            Err(anyhow::anyhow!("backend down"))
        } else {
            Ok(Completion::text("Back again."))
        }
    });
    let convs = Arc::new(MemoryConversationStore::new());
    let cases: Arc<dyn CaseStore> = Arc::new(MemoryCaseStore::new());
    let conv = convs.create("alice", "retry", None).await.unwrap();
    let service = ChatService::new(agent(llm.clone(), Arc::clone(&cases)), convs.clone(), cases);

    let err = service.send("alice", Some(conv.id), "hello?", None, None).await.unwrap_err();
    assert!(matches!(err, ChatError::Completion(_)));
    assert!(convs.messages(conv.id).await.unwrap().is_empty());

    service.send("alice", Some(conv.id), "hello?", None, None).await.unwrap();
    let roles: Vec<Role> = convs.messages(conv.id).await.unwrap().iter().map(|r| r.role).collect();
    assert_eq!(roles, vec![Role::User, Role::Assistant]);
    assert_eq!(llm.calls(), 2);
}

#[tokio::test]
async fn other_users_conversation_is_not_found() {
    let llm = ScriptedCompletion::new(vec![Completion::text("hi")]);
    let convs = Arc::new(MemoryConversationStore::new());
    let cases: Arc<dyn CaseStore> = Arc::new(MemoryCaseStore::new());
    let conv = convs.create("alice", "mine", None).await.unwrap();
    let service = ChatService::new(agent(llm.clone(), Arc::clone(&cases)), convs, cases);

    let err = service.send("mallory", Some(conv.id), "hello", None, None).await.unwrap_err();
    assert!(matches!(err, ChatError::ConversationNotFound(id) if id == conv.id));
    assert_eq!(llm.calls(), 0);
}

#[test]
fn rows_round_trip_tool_calls() {
    let assistant = ChatMessage {
        tool_calls: vec![
            ToolCall { id: "a".into(), name: "detect_jurisdiction".into(), arguments: json!({ "text": "t" }) },
            ToolCall { id: "b".into(), name: "list_pil_themes".into(), arguments: json!({}) },
        ],
        ..ChatMessage::assistant("Let me check.")
    };
    let messages = vec![
        ChatMessage::user("q"),
        assistant.clone(),
        ChatMessage::tool_result("a", "detect_jurisdiction", "{}"),
        ChatMessage::tool_result("b", "list_pil_themes", "[]"),
        ChatMessage::assistant("done"),
    ];
    let rows: Vec<StoredMessage> = rows_from_messages(&messages)
        .into_iter()
        .enumerate()
        .map(|(i, m)| StoredMessage {
            id: i as i64,
            conversation_id: 1,
            role: m.role,
            content: m.content,
            tool_name: m.tool_name,
            tool_call_id: m.tool_call_id,
            created_at: Utc::now(),
        })
        .collect();
    assert_eq!(rows.len(), 7);
    assert_eq!(history_from_rows(&rows), messages);
}

#[test]
fn orphan_tool_call_row_starts_assistant_message() {
    let rows = vec![
        row(1, Role::User, "q", None),
        row(2, Role::Assistant, "{}", Some(("list_pil_themes", "x"))),
    ];
    let history = history_from_rows(&rows);
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].content, "");
    assert_eq!(history[1].tool_calls[0].id, "x");
}

#[test]
fn registry_lookup() {
    let reg = ToolRegistry::new();
    assert!(reg.get("anything").is_none());
}
