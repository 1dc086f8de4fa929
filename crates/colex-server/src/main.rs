mod auth;
mod logging;
mod routes;

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Instant,
};

use colex_core::{
    chat::{ChatAgent, ChatService},
    completion::CompletionService,
    config::Config,
    db::PgStore,
    exec_log::ExecutionLog,
    pipeline::{Orchestrator, PipelineEvent},
    store::{CaseStore, ConversationStore, MemoryCaseStore, MemoryConversationStore},
    tools::default_registry,
};
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::logging::BroadcastLayer;

// ── AppState ──────────────────────────────────────────────────────────────

pub struct AppState {
    pub config: Arc<Config>,
    pub orchestrator: Arc<Orchestrator>,
    pub chat: Arc<ChatService>,
    pub exec_log: Arc<ExecutionLog>,
    pub start_time: Instant,
    pub log_tx: broadcast::Sender<String>,
    pub log_ring: Arc<Mutex<VecDeque<String>>>,
}

impl AppState {
    /// Wire the orchestrator and chat service over the given backend and
    /// stores. Returns the pipeline event receiver for forwarding.
    pub fn build(
        config: Arc<Config>,
        completion: Arc<dyn CompletionService>,
        cases: Arc<dyn CaseStore>,
        conversations: Arc<dyn ConversationStore>,
        log_tx: broadcast::Sender<String>,
        log_ring: Arc<Mutex<VecDeque<String>>>,
    ) -> (Self, broadcast::Receiver<PipelineEvent>) {
        let exec_log = ExecutionLog::new(config.exec_log_capacity);
        let (orchestrator, pipeline_rx) = Orchestrator::new(
            Arc::clone(&cases),
            Arc::clone(&completion),
            Arc::clone(&exec_log),
            config.step_settings(),
        );

        let tools = default_registry(
            Arc::clone(&completion),
            Arc::clone(&cases),
            config.llm_temperature,
        );
        let agent = ChatAgent::new(completion, tools, config.chat_system_prompt())
            .with_max_iterations(config.chat_max_tool_iterations)
            .with_temperature(config.llm_temperature);
        let chat = ChatService::new(agent, conversations, cases);

        let state = Self {
            config,
            orchestrator: Arc::new(orchestrator),
            chat: Arc::new(chat),
            exec_log,
            start_time: Instant::now(),
            log_tx,
            log_ring,
        };
        (state, pipeline_rx)
    }
}

// ── main ──────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (log_tx, _log_rx) = broadcast::channel::<String>(256);
    let log_ring = Arc::new(Mutex::new(VecDeque::new()));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "colex_server=info,colex_core=info,colex_agent=info,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(BroadcastLayer {
            tx: log_tx.clone(),
            ring: Arc::clone(&log_ring),
        })
        .init();

    let config = Arc::new(Config::from_env()?);

    let completion = colex_agent::backend_from_config(&config);
    info!(
        backend = completion.name(),
        model = %config.llm_model,
        base_url = %config.llm_base_url,
        "completion backend selected"
    );

    let (cases, conversations) = if config.database_url.is_empty() {
        info!("DATABASE_URL not set, using in-memory stores");
        let cases: Arc<dyn CaseStore> = Arc::new(MemoryCaseStore::new());
        let conversations: Arc<dyn ConversationStore> = Arc::new(MemoryConversationStore::new());
        (cases, conversations)
    } else {
        let pg = Arc::new(PgStore::connect(&config.database_url)?);
        pg.migrate().await?;
        let cases: Arc<dyn CaseStore> = pg.clone();
        let conversations: Arc<dyn ConversationStore> = pg;
        (cases, conversations)
    };

    if !config.auth_enabled() {
        info!("JWT_SECRET not set, all requests run as the anonymous user");
    }

    let (state, pipeline_rx) = AppState::build(
        Arc::clone(&config),
        completion,
        cases,
        conversations,
        log_tx.clone(),
        log_ring,
    );

    // Forward pipeline events to the SSE log stream
    {
        let log_tx_fwd = log_tx.clone();
        tokio::spawn(async move {
            let mut rx = pipeline_rx;
            loop {
                match rx.recv().await {
                    Ok(evt) => {
                        let data = serde_json::json!({
                            "ts": chrono::Utc::now().timestamp(),
                            "level": "info",
                            "category": "pipeline",
                            "type": evt.kind(),
                            "session_id": evt.session_id(),
                            "message": evt.message(),
                        })
                        .to_string();
                        let _ = log_tx_fwd.send(data);
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(_) => break,
                }
            }
        });
    }

    let app = routes::router(Arc::new(state));

    let addr = format!("{}:{}", config.web_bind, config.web_port);
    info!("Listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
