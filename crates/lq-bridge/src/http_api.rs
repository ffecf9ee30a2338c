use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::State,
    middleware as axum_middleware,
    routing::{get, post},
    Json, Router,
};
use lq_core::protocol::{Event, EventFrame, Request};
use lq_core::shutdown::ShutdownSignal;
use lq_core::sink::EventSink;
use lq_telemetry::tracing_setup::request_id_middleware;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

use crate::api_error::ApiError;
use crate::dispatcher::{Dispatcher, HandlerDescriptor};
use crate::ws;

/// Shared state for every HTTP and WebSocket handler.
#[derive(Clone)]
pub struct AppState {
    /// `ping`, `terminal`, `stdin`, devnet control.
    pub dispatcher: Arc<Dispatcher>,
    /// File-tree operations behind `/editor`.
    pub editor: Arc<Dispatcher>,
    /// How long a one-shot dispatch waits for events.
    pub http_grace: Duration,
    pub shutdown: ShutdownSignal,
}

impl AppState {
    pub fn new(dispatcher: Dispatcher, editor: Dispatcher, http_grace: Duration) -> Self {
        Self {
            dispatcher: Arc::new(dispatcher),
            editor: Arc::new(editor),
            http_grace,
            shutdown: ShutdownSignal::new(),
        }
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }
}

/// Build the full router: `/api/v1/*` (CORS enabled), `/ws` and `/editor`.
pub fn api_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/dispatch", post(dispatch))
        .route("/api/v1/handlers", get(list_handlers))
        .layer(CorsLayer::permissive());

    Router::new()
        .merge(api)
        .route("/ws", get(ws::ws_handler))
        .route("/editor", get(ws::editor_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(axum_middleware::from_fn(request_id_middleware)),
        )
        .with_state(state)
}

/// GET /api/v1/health
async fn health() -> &'static str {
    "OK"
}

/// GET /api/v1/handlers
async fn list_handlers(State(state): State<AppState>) -> Json<Vec<HandlerDescriptor>> {
    Json(state.dispatcher.list())
}

/// POST /api/v1/dispatch
async fn dispatch(State(state): State<AppState>, body: Bytes) -> Result<Json<EventFrame>, ApiError> {
    let request = Request::parse_slice(&body).map_err(|_| ApiError::InvalidJson)?;
    debug!(kind = %request.kind, "one-shot dispatch");
    let frame = dispatch_once(state.dispatcher.clone(), request, state.http_grace).await?;
    Ok(Json(frame))
}

/// Run one request and pick a single event to answer with.
///
/// Returns the first `exit`/`error` event as soon as it arrives. Otherwise
/// waits up to `grace` (or until the handler and every session it started
/// have dropped the sink) and returns the last event seen, or a
/// "No response from handler" error when there was none.
pub async fn dispatch_once(
    dispatcher: Arc<Dispatcher>,
    request: Request,
    grace: Duration,
) -> Result<EventFrame, ApiError> {
    let (sink, rx) = EventSink::channel(None);
    let Request { kind, data, .. } = request;
    let task = tokio::spawn(async move {
        dispatcher.dispatch(&kind, data, &sink).await;
    });

    let deadline = tokio::time::Instant::now() + grace;
    let mut last = None;
    while let Ok(Ok(frame)) = tokio::time::timeout_at(deadline, rx.recv_async()).await {
        if frame.event.is_final() {
            return Ok(frame);
        }
        last = Some(frame);
    }

    if let Some(frame) = last {
        return Ok(frame);
    }
    if task.is_finished() {
        if let Err(e) = task.await {
            error!("dispatch task failed: {e}");
            return Err(ApiError::Internal("handler panicked".into()));
        }
    }
    Ok(EventFrame::bare(Event::error("No response from handler")))
}
