use crate::errors::{DaemonError, Result};
use crate::events::{QueueEvent, QueueState};
use crate::orchestrator::{ControlResponse, LastSuccess, QueueOrchestrator};
use crate::remote::mask_url;
use crate::spooler::PrinterInfo;
use crate::watcher::WatchSession;
use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Router,
};
use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::broadcast;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// HTTP API server state
#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<QueueOrchestrator>,
    /// Printer used when a start request names none
    pub default_printer: Option<String>,
    /// Bearer token used when a start request carries none
    pub default_token: Option<String>,
    /// Daemon start time for uptime calculation
    pub start_time: std::time::Instant,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct StartRequest {
    pub printer_name: Option<String>,
    pub token: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct StopRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ReprintRequest {
    pub printer_name: Option<String>,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub state: QueueState,
}

/// Snapshot of the queue for `GET /api/queue/state`
#[derive(Debug, Serialize)]
pub struct QueueSnapshot {
    pub state: QueueState,
    pub running: bool,
    pub printer_name: Option<String>,
    pub watching: Option<WatchSession>,
    pub last_success: Option<LastSuccessView>,
}

/// Last printed document with its link masked. Presigned URLs are
/// credentials and never leave the daemon.
#[derive(Debug, Serialize)]
pub struct LastSuccessView {
    pub document: String,
    pub filename: Option<String>,
    pub remote_id: Option<String>,
}

impl From<LastSuccess> for LastSuccessView {
    fn from(last: LastSuccess) -> Self {
        Self {
            document: mask_url(&last.url),
            filename: last.filename,
            remote_id: last.remote_id.map(|id| id.to_string()),
        }
    }
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub details: Option<String>,
}

impl IntoResponse for DaemonError {
    fn into_response(self) -> Response {
        let error_string = self.to_string();
        let (status, message) = match self {
            DaemonError::NoPrinter | DaemonError::NoPreviousJob => {
                (StatusCode::BAD_REQUEST, error_string.clone())
            }
            DaemonError::Config(msg) => (StatusCode::BAD_REQUEST, msg),
            DaemonError::Api { status, .. } => (
                StatusCode::BAD_GATEWAY,
                format!("Print queue API answered {}", status),
            ),
            DaemonError::Network(msg) => (StatusCode::BAD_GATEWAY, msg),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        let body = Json(ErrorResponse {
            error: message,
            details: Some(error_string),
        });

        (status, body).into_response()
    }
}

fn control_reply(response: ControlResponse) -> Response {
    let status = if response.success {
        StatusCode::OK
    } else {
        StatusCode::UNPROCESSABLE_ENTITY
    };
    (status, Json(response)).into_response()
}

/// POST /api/queue/start - Start (or restart) the queue loop
async fn handle_start(
    State(state): State<ApiState>,
    body: Option<Json<StartRequest>>,
) -> Result<Response> {
    let request = body.map(|Json(r)| r).unwrap_or_default();

    let printer = request
        .printer_name
        .filter(|p| !p.trim().is_empty())
        .or_else(|| state.default_printer.clone())
        .ok_or(DaemonError::NoPrinter)?;
    let token = request.token.or_else(|| state.default_token.clone());

    info!("Queue start requested for printer: {}", printer);
    Ok(control_reply(state.orchestrator.start(&printer, token).await))
}

/// POST /api/queue/stop - Stop the queue loop and any reprint
async fn handle_stop(State(state): State<ApiState>, body: Option<Json<StopRequest>>) -> Response {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let reason = request
        .reason
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| crate::orchestrator::reason::MANUAL_STOP.to_string());

    info!("Queue stop requested ({})", reason);
    control_reply(state.orchestrator.stop(&reason).await)
}

/// POST /api/queue/reprint-last - Print the last successful document again
async fn handle_reprint(
    State(state): State<ApiState>,
    body: Option<Json<ReprintRequest>>,
) -> Response {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let printer = request
        .printer_name
        .filter(|p| !p.trim().is_empty())
        .or_else(|| state.default_printer.clone());

    info!("Reprint of last document requested");
    control_reply(state.orchestrator.reprint_last(printer.as_deref()).await)
}

/// GET /api/queue/state - Current queue state
async fn handle_state(State(state): State<ApiState>) -> Json<QueueSnapshot> {
    let orchestrator = &state.orchestrator;
    Json(QueueSnapshot {
        state: orchestrator.state(),
        running: orchestrator.is_running().await,
        printer_name: orchestrator.printer_name().await,
        watching: orchestrator.watcher().current_session().await,
        last_success: orchestrator.last_success().map(LastSuccessView::from),
    })
}

/// GET /api/printers - Printers installed on the host
///
/// A failed lookup answers with an empty list so a picker can still render.
async fn handle_printers(State(state): State<ApiState>) -> Json<Vec<PrinterInfo>> {
    match state.orchestrator.printers().await {
        Ok(printers) => {
            debug!("Listed {} printers", printers.len());
            Json(printers)
        }
        Err(e) => {
            warn!("Printer lookup failed: {}", e);
            Json(Vec::new())
        }
    }
}

/// GET /api/health - Health check endpoint
async fn handle_health(State(state): State<ApiState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        state: state.orchestrator.state(),
    })
}

/// GET /api/events - Server-sent stream of queue events
async fn handle_events(
    State(state): State<ApiState>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    debug!("Event stream subscriber connected");
    let rx = state.orchestrator.events().subscribe();
    Sse::new(event_stream(rx)).keep_alive(KeepAlive::default())
}

fn event_stream(
    rx: broadcast::Receiver<QueueEvent>,
) -> impl Stream<Item = std::result::Result<Event, Infallible>> {
    stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let sse = Event::default()
                        .event(event_name(&event))
                        .json_data(&event)
                        .unwrap_or_else(|e| Event::default().comment(e.to_string()));
                    return Some((Ok(sse), rx));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Event stream subscriber lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
}

fn event_name(event: &QueueEvent) -> &'static str {
    match event {
        QueueEvent::QueueStateChanged { .. } => "queue_state_changed",
        QueueEvent::QueueLog { .. } => "queue_log",
        QueueEvent::JobStatusTick { .. } => "job_status_tick",
    }
}

/// Create HTTP API router
pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/api/health", get(handle_health))
        .route("/api/events", get(handle_events))
        .route("/api/printers", get(handle_printers))
        .route("/api/queue/state", get(handle_state))
        .route("/api/queue/start", post(handle_start))
        .route("/api/queue/stop", post(handle_stop))
        .route("/api/queue/reprint-last", post(handle_reprint))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(
                    CorsLayer::new()
                        .allow_origin(AllowOrigin::predicate(|origin, _| {
                            let o = origin.as_bytes();
                            o.starts_with(b"http://localhost")
                                || o.starts_with(b"https://localhost")
                                || o.starts_with(b"http://127.0.0.1")
                        }))
                        .allow_methods([
                            axum::http::Method::GET,
                            axum::http::Method::POST,
                            axum::http::Method::OPTIONS,
                        ])
                        .allow_headers(tower_http::cors::Any),
                ),
        )
        .with_state(state)
}

/// Start HTTP API server
pub async fn start_api_server(
    addr: &str,
    state: ApiState,
) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let router = create_router(state);

    info!("Starting HTTP API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, router).await.map_err(|e| {
        error!("HTTP API server error: {}", e);
        e.into()
    })
}
