//! Axum-based HTTP server.

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::{
        IntoResponse, Response,
        sse::{Event as SseEvent, KeepAlive, Sse},
    },
    routing::{get, post},
};
use serde_json::json;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use storyforge_agent::RunHandle;
use storyforge_core::protocol::StreamingEvent;
use storyforge_core::types::AgentRequest;

use crate::gate::GateBusy;
use crate::state::GatewayState;

const STREAM_ROUTE: &str = "/v1/agent/stream";
const RUN_ROUTE: &str = "/v1/agent";

pub fn router(state: Arc<GatewayState>) -> Router {
    let app = Router::new()
        .route("/health", get(health_handler))
        .route(RUN_ROUTE, post(run_handler))
        .route(STREAM_ROUTE, post(stream_handler));

    #[cfg(feature = "metrics")]
    let app = app.route("/metrics", get(metrics_handler));

    app.layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive()),
    )
    .with_state(state)
}

/// Start the gateway HTTP server and serve until Ctrl+C.
pub async fn start_gateway(state: Arc<GatewayState>, port: u16) -> anyhow::Result<()> {
    let bind_addr = state.config.gateway_bind();
    let app = router(state);

    let addr = format!("{bind_addr}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Gateway listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "provider": state.engine.provider_id(),
        "model": state.engine.settings().model,
        "busy": state.gate.is_busy(),
        "runs": state.runs_total.load(Ordering::SeqCst),
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}

/// Stream one run as server-sent events, one SSE event per engine event.
async fn stream_handler(
    State(state): State<Arc<GatewayState>>,
    Json(request): Json<AgentRequest>,
) -> Response {
    if let Err(rejection) = validate(&request) {
        return rejection;
    }
    let permit = match state.gate.try_enter() {
        Ok(permit) => permit,
        Err(busy) => return busy_response(&busy),
    };

    let run = state.bump_runs();
    info!(run, user_id = %request.user_id, "Streaming agent run");
    let active = ActiveRun::start(STREAM_ROUTE);
    let RunHandle {
        events,
        outcome,
        cancel,
    } = state.engine.spawn(request);

    // Dropping the stream (client gone) cancels the run and releases the gate.
    let stream = async_stream::stream! {
        let _permit = permit;
        let _active = active;
        let _cancel_on_drop = cancel.drop_guard();

        let mut events = ReceiverStream::new(events);
        while let Some(event) = events.next().await {
            #[cfg(feature = "metrics")]
            crate::metrics::record_error_event(&event);
            yield Ok::<_, Infallible>(sse_event(&event));
        }
        match outcome.await {
            Ok(outcome) => debug!(run_id = %outcome.run_id, cancelled = outcome.cancelled, "Run stream finished"),
            Err(e) => error!(%e, "Agent run task failed"),
        }
    };

    Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(10))
                .text("keepalive"),
        )
        .into_response()
}

/// Run to completion and answer with every event plus the outcome.
async fn run_handler(
    State(state): State<Arc<GatewayState>>,
    Json(request): Json<AgentRequest>,
) -> Response {
    if let Err(rejection) = validate(&request) {
        return rejection;
    }
    let _permit = match state.gate.try_enter() {
        Ok(permit) => permit,
        Err(busy) => return busy_response(&busy),
    };

    let run = state.bump_runs();
    info!(run, user_id = %request.user_id, "Buffered agent run");
    let _active = ActiveRun::start(RUN_ROUTE);

    let handle = state.engine.spawn(request);
    let _cancel_on_drop = handle.cancel.clone().drop_guard();
    match handle.collect().await {
        Ok((events, outcome)) => {
            #[cfg(feature = "metrics")]
            events.iter().for_each(crate::metrics::record_error_event);
            Json(json!({
                "events": events,
                "outcome": outcome,
            }))
            .into_response()
        }
        Err(e) => {
            error!(%e, "Agent run task failed");
            #[cfg(feature = "metrics")]
            crate::metrics::record_error("run_task");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "internal", "message": e.to_string()})),
            )
                .into_response()
        }
    }
}

#[cfg(feature = "metrics")]
async fn metrics_handler(State(state): State<Arc<GatewayState>>) -> Response {
    match &state.prometheus {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

fn sse_event(event: &StreamingEvent) -> SseEvent {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    SseEvent::default().event(event.event_type.as_str()).data(data)
}

fn validate(request: &AgentRequest) -> Result<(), Response> {
    let problem = if request.user_id.trim().is_empty() {
        Some("userId must not be empty")
    } else if request.user_input.trim().is_empty() && request.operations.is_none() {
        Some("userInput must not be empty")
    } else {
        None
    };
    match problem {
        Some(message) => Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "invalid_request", "message": message})),
        )
            .into_response()),
        None => Ok(()),
    }
}

fn busy_response(busy: &GateBusy) -> Response {
    warn!(route = %busy.route, "Rejecting request, backend busy");
    #[cfg(feature = "metrics")]
    crate::metrics::record_gate_busy(&busy.route);
    (
        StatusCode::TOO_MANY_REQUESTS,
        [(header::RETRY_AFTER, "1")],
        Json(json!({"error": "backend_busy", "message": busy.to_string()})),
    )
        .into_response()
}

/// Bookkeeping for one admitted run; closes out when dropped.
struct ActiveRun {
    route: &'static str,
    started: Instant,
}

impl ActiveRun {
    fn start(route: &'static str) -> Self {
        #[cfg(feature = "metrics")]
        crate::metrics::record_run_start();
        Self {
            route,
            started: Instant::now(),
        }
    }
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        let elapsed = self.started.elapsed();
        debug!(route = self.route, elapsed_ms = elapsed.as_millis() as u64, "Run closed");
        #[cfg(feature = "metrics")]
        {
            crate::metrics::record_run_end();
            crate::metrics::record_request(self.route, elapsed.as_secs_f64());
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(%e, "Failed to listen for Ctrl+C, running until killed");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
