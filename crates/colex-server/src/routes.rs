use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::{get, post},
    Router,
};
use colex_core::chat::ChatEvent;
use colex_core::error::{AnalysisError, ChatError};
use colex_core::types::{AnalysisReport, AnalyzeRequest};
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{BroadcastStream, UnboundedReceiverStream};
use tokio_stream::StreamExt;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::auth::AuthUser;
use crate::AppState;

// ── Errors ────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub(crate) struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub step: Option<&'static str>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            step: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = match self.step {
            Some(step) => json!({ "error": self.message, "step": step }),
            None => json!({ "error": self.message }),
        };
        (self.status, Json(body)).into_response()
    }
}

pub(crate) fn internal(e: impl std::fmt::Display) -> ApiError {
    tracing::error!("internal error: {e}");
    ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
}

impl From<AnalysisError> for ApiError {
    fn from(e: AnalysisError) -> Self {
        match e {
            AnalysisError::SessionNotFound(_) => Self::not_found(e.to_string()),
            AnalysisError::MissingCaseText(_) => Self::bad_request(e.to_string()),
            AnalysisError::StepFailed { step, .. } | AnalysisError::JurisdictionUnresolved { step } => {
                Self {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    message: e.to_string(),
                    step: Some(step),
                }
            }
            AnalysisError::Store(e) => internal(format!("{e:#}")),
        }
    }
}

impl From<ChatError> for ApiError {
    fn from(e: ChatError) -> Self {
        match e {
            ChatError::ConversationNotFound(_) => Self::not_found(e.to_string()),
            ChatError::Completion(_) => Self::new(StatusCode::BAD_GATEWAY, e.to_string()),
            ChatError::Store(e) => internal(format!("{e:#}")),
        }
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// ── Request body types ────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(crate) struct ChatBody {
    pub message: String,
    pub conversation_id: Option<i64>,
    pub session_id: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct CreateConversationBody {
    pub title: Option<String>,
    pub session_id: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct RenameBody {
    pub title: String,
}

#[derive(Deserialize)]
pub(crate) struct ToolCallsQuery {
    pub limit: Option<usize>,
    pub session_id: Option<String>,
}

// ── Router ────────────────────────────────────────────────────────────────

pub(crate) fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health
        .route("/api/health", get(health))
        // Analysis
        .route("/api/analyze", post(post_analyze))
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/:id", get(get_session).delete(delete_session))
        .route("/api/sessions/:id/export", get(export_session))
        // Chat
        .route("/api/tools", get(list_tools))
        .route("/api/chat", post(post_chat))
        .route("/api/chat/stream", post(post_chat_stream))
        // Conversations
        .route("/api/conversations", get(list_conversations).post(create_conversation))
        .route(
            "/api/conversations/:id",
            get(get_conversation)
                .patch(rename_conversation)
                .delete(delete_conversation),
        )
        .route("/api/conversations/:id/messages", get(get_conversation_messages))
        // Monitoring
        .route("/api/monitoring/tool-calls", get(get_tool_calls))
        .route("/api/monitoring/session/:id", get(get_session_activity))
        .route("/api/monitoring/live-status", get(get_live_status))
        .route("/api/monitoring/live-feed", get(sse_live_feed))
        // SSE logs
        .route("/api/logs", get(sse_logs))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn keep_alive() -> KeepAlive {
    KeepAlive::new()
        .interval(std::time::Duration::from_secs(15))
        .text("ping")
}

// ── Handlers ──────────────────────────────────────────────────────────────

async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "uptime_s": state.start_time.elapsed().as_secs(),
    }))
}

// Analysis

async fn post_analyze(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AnalyzeRequest>,
) -> ApiResult<AnalysisReport> {
    Ok(Json(state.orchestrator.analyze(req).await?))
}

async fn list_sessions(State(state): State<Arc<AppState>>) -> ApiResult<Value> {
    let sessions = state.orchestrator.list_sessions().await?;
    Ok(Json(json!(sessions)))
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<AnalysisReport> {
    Ok(Json(state.orchestrator.report(&id).await?))
}

async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.orchestrator.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn export_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Value> {
    let export = state.orchestrator.export(&id).await?;
    Ok(Json(json!(export)))
}

// Chat

async fn list_tools(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!(state.chat.tool_specs()))
}

async fn post_chat(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Json(body): Json<ChatBody>,
) -> ApiResult<Value> {
    if body.message.trim().is_empty() {
        return Err(ApiError::bad_request("message must not be empty"));
    }
    let reply = state
        .chat
        .send(&user, body.conversation_id, &body.message, body.session_id.as_deref(), None)
        .await?;
    Ok(Json(json!(reply)))
}

/// Runs the turn on a detached task: if the client goes away the turn still
/// finishes and is persisted.
async fn post_chat_stream(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Json(body): Json<ChatBody>,
) -> Result<Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>>, ApiError> {
    if body.message.trim().is_empty() {
        return Err(ApiError::bad_request("message must not be empty"));
    }
    let conversation = state
        .chat
        .open_conversation(&user, body.conversation_id, &body.message, body.session_id.as_deref())
        .await?;
    let conversation_id = conversation.id;

    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<ChatEvent>();
    tokio::spawn(async move {
        let result = state
            .chat
            .send(&user, Some(conversation_id), &body.message, body.session_id.as_deref(), Some(&tx))
            .await;
        match result {
            Ok(_) => {}
            // The agent has already reported completion failures on the stream.
            Err(ChatError::Completion(_)) => {}
            Err(e) => {
                tracing::error!(conversation_id, "chat stream failed: {e}");
                let _ = tx.send(ChatEvent::Error {
                    message: e.to_string(),
                });
            }
        }
    });

    let stream = UnboundedReceiverStream::new(rx).map(move |evt| {
        Ok::<_, Infallible>(
            Event::default()
                .event(evt.kind())
                .data(evt.to_json(conversation_id).to_string()),
        )
    });
    Ok(Sse::new(stream).keep_alive(keep_alive()))
}

// Conversations

async fn list_conversations(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
) -> ApiResult<Value> {
    let convs = state.chat.conversations().list(&user).await.map_err(internal)?;
    Ok(Json(json!(convs)))
}

async fn create_conversation(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Json(body): Json<CreateConversationBody>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let title = body
        .title
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| "New conversation".to_string());
    let conv = state
        .chat
        .conversations()
        .create(&user, &title, body.session_id.as_deref())
        .await
        .map_err(internal)?;
    Ok((StatusCode::CREATED, Json(json!(conv))))
}

async fn get_conversation(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(id): Path<i64>,
) -> ApiResult<Value> {
    let store = state.chat.conversations();
    let conv = store
        .get(id, &user)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found(format!("conversation not found: {id}")))?;
    let messages = store.messages(id).await.map_err(internal)?;
    Ok(Json(json!({ "conversation": conv, "messages": messages })))
}

async fn rename_conversation(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(id): Path<i64>,
    Json(body): Json<RenameBody>,
) -> ApiResult<Value> {
    if body.title.trim().is_empty() {
        return Err(ApiError::bad_request("title must not be empty"));
    }
    let conv = state
        .chat
        .conversations()
        .rename(id, &user, body.title.trim())
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found(format!("conversation not found: {id}")))?;
    Ok(Json(json!(conv)))
}

async fn delete_conversation(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    let deleted = state
        .chat
        .conversations()
        .delete(id, &user)
        .await
        .map_err(internal)?;
    if deleted {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(format!("conversation not found: {id}")))
    }
}

async fn get_conversation_messages(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(id): Path<i64>,
) -> ApiResult<Value> {
    let store = state.chat.conversations();
    if store.get(id, &user).await.map_err(internal)?.is_none() {
        return Err(ApiError::not_found(format!("conversation not found: {id}")));
    }
    let messages = store.messages(id).await.map_err(internal)?;
    Ok(Json(json!(messages)))
}

// Monitoring

async fn get_tool_calls(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ToolCallsQuery>,
) -> Json<Value> {
    let session = q.session_id.as_deref();
    let entries = state.exec_log.recent(q.limit.unwrap_or(100), session);
    let stats = state.exec_log.stats(session);
    Json(json!({ "entries": entries, "stats": stats }))
}

async fn get_session_activity(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Value> {
    let activity = state
        .exec_log
        .session_activity(&id)
        .ok_or_else(|| ApiError::not_found(format!("no activity for session {id}")))?;
    Ok(Json(json!(activity)))
}

async fn get_live_status(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!(state.exec_log.live_status(chrono::Utc::now())))
}

async fn sse_live_feed(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.exec_log.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|msg| match msg {
        Ok(entry) => Some(Ok(Event::default().data(json!(entry).to_string()))),
        _ => None,
    });
    Sse::new(stream).keep_alive(keep_alive())
}

// SSE logs: replays ring buffer history then streams live events

async fn sse_logs(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    // Subscribe before snapshotting ring to avoid race
    let live_rx = state.log_tx.subscribe();
    let history: Vec<String> = state
        .log_ring
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .iter()
        .cloned()
        .collect();
    tokio::spawn(async move {
        for line in history {
            if tx.send(line).is_err() {
                return;
            }
        }
        let mut live_rx = live_rx;
        loop {
            match live_rx.recv().await {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
    });
    let stream = UnboundedReceiverStream::new(rx)
        .map(|data| Ok::<_, Infallible>(Event::default().data(data)));
    Sse::new(stream).keep_alive(keep_alive())
}
