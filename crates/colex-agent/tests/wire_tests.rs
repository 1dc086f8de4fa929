use std::collections::HashMap;

use colex_agent::backend_from_config;
use colex_agent::ollama::{ollama_message, OllamaChatResponse};
use colex_agent::openai::{request_body, wire_message, ChatResponse, StreamAccumulator};
use colex_core::config::Config;
use colex_core::types::{ChatMessage, CompletionRequest, ToolCall, ToolSpec};
use serde_json::json;

// ── request encoding ─────────────────────────────────────────────────────────

#[test]
fn assistant_tool_calls_are_encoded_as_functions() {
    let msg = ChatMessage {
        tool_calls: vec![ToolCall {
            id: "call_1".into(),
            name: "get_case_analysis".into(),
            arguments: json!({ "session_id": "case-1" }),
        }],
        ..ChatMessage::assistant("")
    };
    let v = wire_message(&msg);
    assert_eq!(v["role"], "assistant");
    assert!(v["content"].is_null());
    assert_eq!(v["tool_calls"][0]["type"], "function");
    assert_eq!(v["tool_calls"][0]["function"]["name"], "get_case_analysis");
    assert_eq!(v["tool_calls"][0]["function"]["arguments"], r#"{"session_id":"case-1"}"#);
}

#[test]
fn tool_results_carry_call_id() {
    let v = wire_message(&ChatMessage::tool_result("call_1", "list_pil_themes", "[]"));
    assert_eq!(v, json!({ "role": "tool", "tool_call_id": "call_1", "content": "[]" }));
}

#[test]
fn request_body_uses_default_model_and_optional_fields() {
    let req = CompletionRequest {
        messages: vec![ChatMessage::system("s"), ChatMessage::user("u")],
        ..Default::default()
    };
    let body = request_body(&req, "gpt-4o-mini", false);
    assert_eq!(body["model"], "gpt-4o-mini");
    assert_eq!(body["stream"], false);
    assert!(body.get("temperature").is_none());
    assert!(body.get("tools").is_none());
    assert_eq!(body["messages"][1], json!({ "role": "user", "content": "u" }));

    let req = CompletionRequest {
        messages: vec![ChatMessage::user("u")],
        temperature: Some(0.5),
        model: Some("other".into()),
        tools: vec![ToolSpec {
            name: "list_pil_themes".into(),
            description: "d".into(),
            parameters: json!({ "type": "object" }),
        }],
    };
    let body = request_body(&req, "gpt-4o-mini", true);
    assert_eq!(body["model"], "other");
    assert_eq!(body["temperature"], 0.5);
    assert_eq!(body["tools"][0]["function"]["name"], "list_pil_themes");
}

// ── response decoding ────────────────────────────────────────────────────────

#[test]
fn response_with_tool_calls() {
    let resp: ChatResponse = serde_json::from_value(json!({
        "choices": [{
            "message": {
                "role": "assistant",
                "content": null,
                "tool_calls": [{
                    "id": "call_9",
                    "type": "function",
                    "function": { "name": "detect_jurisdiction", "arguments": "{\"text\":\"abc\"}" }
                }]
            }
        }]
    }))
    .unwrap();
    let c = resp.into_completion().unwrap();
    assert_eq!(c.content, "");
    assert_eq!(c.tool_calls[0].id, "call_9");
    assert_eq!(c.tool_calls[0].arguments, json!({ "text": "abc" }));
}

#[test]
fn response_without_choices_is_an_error() {
    let resp: ChatResponse = serde_json::from_value(json!({ "choices": [] })).unwrap();
    assert!(resp.into_completion().is_err());
}

#[test]
fn stream_accumulates_content_and_tool_fragments() {
    let lines = [
        r#"data: {"choices":[{"delta":{"role":"assistant","content":"Civil"}}]}"#,
        r#"data: {"choices":[{"delta":{"content":"-law"}}]}"#,
        ": keep-alive",
        r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"list_pil_themes","arguments":"{"}}]}}]}"#,
        r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"}"}}]}}]}"#,
        "data: not json",
        "data: [DONE]",
    ];
    let mut acc = StreamAccumulator::default();
    let deltas: Vec<String> = lines.iter().filter_map(|l| acc.push_line(l)).collect();

    assert_eq!(deltas, vec!["Civil", "-law"]);
    assert!(acc.is_done());
    let c = acc.finish();
    assert_eq!(c.content, "Civil-law");
    assert_eq!(c.tool_calls.len(), 1);
    assert_eq!(c.tool_calls[0].name, "list_pil_themes");
    assert_eq!(c.tool_calls[0].arguments, json!({}));
}

// ── ollama ───────────────────────────────────────────────────────────────────

#[test]
fn ollama_message_keeps_object_arguments() {
    let msg = ChatMessage {
        tool_calls: vec![ToolCall {
            id: "x".into(),
            name: "list_pil_themes".into(),
            arguments: json!({}),
        }],
        ..ChatMessage::assistant("")
    };
    let v = serde_json::to_value(ollama_message(&msg)).unwrap();
    assert_eq!(v["tool_calls"][0]["function"]["arguments"], json!({}));

    let plain = serde_json::to_value(ollama_message(&ChatMessage::user("hi"))).unwrap();
    assert!(plain.get("tool_calls").is_none());
}

#[test]
fn ollama_response_numbers_tool_calls() {
    let resp: OllamaChatResponse = serde_json::from_value(json!({
        "message": {
            "role": "assistant",
            "content": "",
            "tool_calls": [
                { "function": { "name": "a", "arguments": {} } },
                { "function": { "name": "b", "arguments": { "x": 1 } } }
            ]
        },
        "done": true
    }))
    .unwrap();
    let c = resp.into_completion();
    assert_eq!(c.tool_calls[1].id, "call_1");
    assert_eq!(c.tool_calls[1].arguments, json!({ "x": 1 }));
}

#[test]
fn backend_follows_configuration() {
    let mut vars = HashMap::new();
    vars.insert("LLM_BACKEND".to_string(), "ollama".to_string());
    let config = Config::from_map(&vars).unwrap();
    assert_eq!(backend_from_config(&config).name(), "ollama");

    vars.insert("LLM_BACKEND".to_string(), "openai".to_string());
    vars.insert("OPENAI_API_KEY".to_string(), "sk-test".to_string());
    let config = Config::from_map(&vars).unwrap();
    assert_eq!(backend_from_config(&config).name(), "openai");
}
