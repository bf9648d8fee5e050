//! HTTP route handlers.
//!
//! The API is the supervisor-facing surface of the orchestration core:
//! task submission and inspection, capability listing, concurrent tool
//! batches, and the operator-gated outbox controls. The on-demand delivery
//! trigger reuses the same `deliver_once` entry point as the timer loop.

use std::sync::Arc;

use axum::middleware;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditTrail};
use crate::capabilities::SendEmailCapability;
use crate::config::{Config, EmailProvider};
use crate::error::CoreError;
use crate::executor::{FanOutExecutor, ToolCall, ToolResult};
use crate::outbox::transport::{ResendTransport, SmtpTransport, Transport};
use crate::outbox::{DeliveryReport, DeliveryWorker, OutboxItem, OutboxStore};
use crate::registry::{CapabilityInfo, CapabilityRegistry};
use crate::task::{Task, TaskMetadata, TaskStatus};
use crate::task_store::TaskStore;
use crate::worker::Worker;

use super::auth;

/// Outcome of one fire-and-forget worker run, reported to the monitoring
/// channel instead of being dropped on the floor.
#[derive(Debug)]
pub struct RunOutcome {
    pub task_id: Uuid,
    pub result: Result<TaskStatus, String>,
}

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub tasks: Arc<TaskStore>,
    pub audit: Arc<AuditTrail>,
    pub registry: Arc<CapabilityRegistry>,
    pub worker: Arc<Worker>,
    pub executor: FanOutExecutor,
    pub outbox: Arc<OutboxStore>,
    pub delivery: Arc<DeliveryWorker>,
    pub outcomes: tokio::sync::mpsc::UnboundedSender<RunOutcome>,
}

/// Pick the delivery backend from configuration. A `None` return means no
/// recognized provider; the delivery worker fails eligible items terminally.
fn build_transport(config: &Config) -> Option<Arc<dyn Transport>> {
    match config.email.provider {
        EmailProvider::Resend => {
            let api_key = config.email.resend_api_key.clone()?;
            Some(Arc::new(ResendTransport::new(
                api_key,
                config.email.from_address.clone(),
            )))
        }
        EmailProvider::Smtp => {
            let smtp = config.email.smtp.clone()?;
            Some(Arc::new(SmtpTransport::new(
                smtp.host,
                smtp.port,
                smtp.username,
                smtp.password,
                config.email.from_address.clone(),
                smtp.ehlo_hostname,
            )))
        }
        EmailProvider::None => None,
    }
}

/// Start the HTTP server and the background loops.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let tasks = Arc::new(TaskStore::new(config.tasks_path()));
    let audit = Arc::new(AuditTrail::new(config.audit_path()));
    let registry = Arc::new(CapabilityRegistry::new());
    let outbox = Arc::new(OutboxStore::new(config.outbox_path()));

    // Built-in capabilities, registered once at startup.
    registry
        .register(
            "email",
            "Queue an outbound email for retried delivery",
            Arc::new(SendEmailCapability::new(Arc::clone(&outbox))),
        )
        .await;

    let worker = Arc::new(Worker::new(
        Arc::clone(&tasks),
        Arc::clone(&audit),
        Arc::clone(&registry),
    ));
    let executor = FanOutExecutor::new(Arc::clone(&registry));

    let delivery = Arc::new(DeliveryWorker::new(
        Arc::clone(&outbox),
        build_transport(&config),
        config.email.delivery_config(),
    ));
    delivery.set_sending_enabled(config.email.enabled);

    // Periodic delivery loop, stopped between passes on shutdown.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(Arc::clone(&delivery).run(
        std::time::Duration::from_secs(config.email.delivery_interval_secs.max(1)),
        shutdown_rx,
    ));

    // Monitoring channel for fire-and-forget worker runs.
    let (outcomes_tx, mut outcomes_rx) = tokio::sync::mpsc::unbounded_channel::<RunOutcome>();
    tokio::spawn(async move {
        while let Some(outcome) = outcomes_rx.recv().await {
            match outcome.result {
                Ok(status) => {
                    tracing::info!(task_id = %outcome.task_id, ?status, "Background task finished")
                }
                Err(e) => {
                    tracing::error!(task_id = %outcome.task_id, "Background task failed: {}", e)
                }
            }
        }
    });

    let state = Arc::new(AppState {
        config: config.clone(),
        tasks,
        audit,
        registry,
        worker,
        executor,
        outbox,
        delivery,
        outcomes: outcomes_tx,
    });

    let public_routes = Router::new().route("/api/health", get(health));

    let protected_routes = Router::new()
        .route("/api/tasks", post(create_task))
        .route("/api/tasks", get(list_tasks))
        .route("/api/tasks/:id", get(get_task))
        .route("/api/tasks/:id/cancel", post(cancel_task))
        .route("/api/tasks/:id/audit", get(get_task_audit))
        .route("/api/capabilities", get(list_capabilities))
        .route("/api/tools/execute", post(execute_tools))
        // Outbox administration
        .route("/api/outbox", get(list_outbox))
        .route("/api/outbox/deliver", post(deliver_outbox))
        .route("/api/outbox/sending", post(set_sending))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::require_operator,
        ));

    let app = Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::clone(&state));

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            let _ = shutdown_tx.send(true);
        })
        .await?;

    Ok(())
}

/// Wait for ctrl-c or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

// ─────────────────────────────────────────────────────────────────────────────
// Request/Response Types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    #[serde(default = "default_supervisor")]
    pub supervisor: String,
    pub agent: String,
    pub action: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub metadata: Option<TaskMetadata>,
}

fn default_supervisor() -> String {
    "api".to_string()
}

#[derive(Debug, Serialize)]
pub struct CreateTaskResponse {
    pub id: Uuid,
    pub status: TaskStatus,
}

#[derive(Debug, Deserialize)]
pub struct ExecuteToolsRequest {
    #[serde(default = "default_supervisor")]
    pub supervisor: String,
    pub calls: Vec<ToolCall>,
}

#[derive(Debug, Deserialize)]
pub struct SetSendingRequest {
    pub enabled: bool,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub sending_enabled: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// GET /api/health - liveness probe.
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        sending_enabled: state.delivery.sending_enabled(),
    })
}

/// POST /api/tasks - submit a task and run it in the background.
async fn create_task(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<Json<CreateTaskResponse>, (StatusCode, String)> {
    if req.agent.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "Agent cannot be empty".to_string()));
    }

    let mut task = Task::new(req.supervisor, req.agent, req.action, req.payload);
    if let Some(metadata) = req.metadata {
        task.metadata = metadata;
    }

    let task = state
        .worker
        .submit(task)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    let id = task.id;

    // Deliberate fire-and-forget: the spawned run reports to the monitoring
    // channel, not to this request.
    let worker = Arc::clone(&state.worker);
    let outcomes = state.outcomes.clone();
    tokio::spawn(async move {
        let result = match worker.run(id).await {
            Ok(task) => Ok(task.status),
            Err(e) => Err(e.to_string()),
        };
        let _ = outcomes.send(RunOutcome { task_id: id, result });
    });

    Ok(Json(CreateTaskResponse {
        id,
        status: TaskStatus::Pending,
    }))
}

/// GET /api/tasks - all tasks, newest first.
async fn list_tasks(State(state): State<Arc<AppState>>) -> Json<Vec<Task>> {
    Json(state.tasks.list().await)
}

/// GET /api/tasks/:id
async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Task>, (StatusCode, String)> {
    state
        .tasks
        .get(id)
        .await
        .map(Json)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("Task {} not found", id)))
}

/// POST /api/tasks/:id/cancel - allowed only while pending.
async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Task>, (StatusCode, String)> {
    match state.worker.cancel(id).await {
        Ok(task) => Ok(Json(task)),
        Err(CoreError::TaskNotFound { .. }) => {
            Err((StatusCode::NOT_FOUND, format!("Task {} not found", id)))
        }
        Err(e @ CoreError::InvalidTransition { .. }) => {
            Err((StatusCode::CONFLICT, e.to_string()))
        }
        Err(e) => Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}

/// GET /api/tasks/:id/audit - lifecycle events for one task.
async fn get_task_audit(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<AuditEvent>>, (StatusCode, String)> {
    state
        .audit
        .events_for_task(id)
        .await
        .map(Json)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

/// GET /api/capabilities
async fn list_capabilities(State(state): State<Arc<AppState>>) -> Json<Vec<CapabilityInfo>> {
    Json(state.registry.list().await)
}

/// POST /api/tools/execute - run a batch of independent tool calls
/// concurrently; one result per call regardless of individual failures.
async fn execute_tools(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ExecuteToolsRequest>,
) -> Json<Vec<ToolResult>> {
    Json(state.executor.execute_batch(req.calls, &req.supervisor).await)
}

/// GET /api/outbox - the queued item list.
async fn list_outbox(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<OutboxItem>>, (StatusCode, String)> {
    state
        .outbox
        .load()
        .await
        .map(Json)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

/// POST /api/outbox/deliver - force one delivery pass now. Shares the pass
/// lock with the timer loop, so it can never overlap an in-flight pass.
async fn deliver_outbox(
    State(state): State<Arc<AppState>>,
) -> Result<Json<DeliveryReport>, (StatusCode, String)> {
    state
        .delivery
        .deliver_once()
        .await
        .map(Json)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

/// POST /api/outbox/sending - toggle the global sending switch.
async fn set_sending(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SetSendingRequest>,
) -> Json<serde_json::Value> {
    state.delivery.set_sending_enabled(req.enabled);
    Json(serde_json::json!({ "sending_enabled": req.enabled }))
}
