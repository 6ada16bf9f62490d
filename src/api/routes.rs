//! Router, shared state and server lifecycle.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    response::{
        sse::{Event, KeepAlive, Sse},
        Json,
    },
    routing::{get, post},
    Router,
};
use futures::stream::Stream;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::assistant::SessionManager;
use crate::config::Config;
use crate::events::EventBus;
use crate::process::{ProcessRegistry, ServiceRunner, ShellExecutor};
use crate::quest::{ConversationStore, InMemoryConversationStore};
use crate::scheduler::{RuntimeTaskExecutor, Scheduler, TaskSnapshot};

use super::assistant as assistant_api;
use super::fs;
use super::processes;
use super::tasks;
use super::types::*;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    /// Token → process map shared by every component
    pub registry: ProcessRegistry,
    /// Push events for SSE subscribers
    pub events: EventBus,
    pub shell: ShellExecutor,
    pub services: ServiceRunner,
    pub assistant: SessionManager,
    pub conversations: Arc<dyn ConversationStore>,
    pub scheduler: Scheduler,
}

impl AppState {
    /// Wire every component around one registry and one event bus.
    pub fn new(config: Config) -> Self {
        let registry = ProcessRegistry::new();
        let events = EventBus::default();
        let shell = ShellExecutor::new(registry.clone());
        let services =
            ServiceRunner::new(registry.clone(), events.clone(), config.service_log_lines);
        let assistant =
            SessionManager::new(registry.clone(), events.clone(), config.cli_path.clone());
        let conversations: Arc<dyn ConversationStore> = Arc::new(InMemoryConversationStore::new());
        let executor = RuntimeTaskExecutor::new(
            shell.clone(),
            assistant.clone(),
            Arc::clone(&conversations),
        );
        let scheduler = Scheduler::new(
            Arc::new(executor),
            events.clone(),
            config.task_output_chars,
            Some(TaskSnapshot::new(config.tasks_snapshot_path())),
        );

        Self {
            config,
            registry,
            events,
            shell,
            services,
            assistant,
            conversations,
            scheduler,
        }
    }
}

/// Build the application router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/events", get(events))
        // Shell commands
        .route("/api/shell/run", post(processes::run_shell))
        .route("/api/shell/:token/kill", post(processes::kill_shell))
        // Background services
        .route(
            "/api/services",
            get(processes::list_services).post(processes::start_service),
        )
        .route("/api/services/:id/stop", post(processes::stop_service))
        .route("/api/services/:id/output", get(processes::service_output))
        // Assistant exchanges
        .route("/api/assistant/installed", get(assistant_api::installed))
        .route(
            "/api/assistant/:conversation_id/messages",
            post(assistant_api::send_message),
        )
        .route(
            "/api/assistant/:conversation_id/cancel",
            post(assistant_api::cancel),
        )
        .route(
            "/api/conversations/:id",
            get(assistant_api::get_conversation).put(assistant_api::put_conversation),
        )
        // Scheduled tasks
        .route("/api/tasks", get(tasks::list_tasks).post(tasks::create_task))
        .route(
            "/api/tasks/:id",
            get(tasks::get_task)
                .put(tasks::update_task)
                .delete(tasks::delete_task),
        )
        .route("/api/tasks/:id/enable", post(tasks::enable_task))
        .route("/api/tasks/:id/disable", post(tasks::disable_task))
        .route("/api/tasks/:id/seen", post(tasks::mark_task_seen))
        .route("/api/tasks/:id/run", post(tasks::run_task))
        // Local file system
        .route("/api/fs/home", get(fs::home))
        .route("/api/fs/list", get(fs::list))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let state = Arc::new(AppState::new(config.clone()));

    match state.scheduler.load().await {
        Ok(count) => tracing::debug!(count, "Scheduler snapshot loaded"),
        Err(e) => tracing::warn!("Ignoring unreadable scheduler snapshot: {}", e),
    }
    if config.scheduler_enabled {
        state.scheduler.start().await;
    } else {
        tracing::info!("Scheduler disabled; tasks will not fire");
    }

    if !state.assistant.is_installed() {
        tracing::warn!(
            cli_path = %config.cli_path,
            "Assistant CLI not found; assistant exchanges and prompt tasks will fail"
        );
    }

    let app = router(Arc::clone(&state));

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);

    let shutdown_state = Arc::clone(&state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal(shutdown_state).await;
        })
        .await?;

    Ok(())
}

/// Wait for SIGINT/SIGTERM, then stop timers and signal every live process.
async fn shutdown_signal(state: Arc<AppState>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, stopping scheduler and child processes...");
    state.scheduler.stop().await;
    let signalled = state.registry.signal_all();
    tracing::info!(signalled, "Graceful shutdown complete");
}

/// Health check endpoint.
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let processes = state.registry.snapshot();
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        running_processes: processes.len(),
        processes,
        scheduler_enabled: state.config.scheduler_enabled,
    })
}

/// Stream every push event as SSE. Event names follow
/// [`crate::events::QuestEvent::event_name`].
async fn events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.events.subscribe();

    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(ev) => match Event::default().event(ev.event_name()).json_data(&ev) {
                    Ok(sse) => yield Ok(sse),
                    Err(e) => tracing::warn!("Failed to encode event: {}", e),
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    let sse = Event::default()
                        .event("lagged")
                        .data(format!("{} events dropped", skipped));
                    yield Ok(sse);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    )
}
