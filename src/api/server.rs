//! HTTP server
//!
//! The front door over the dispatch pipeline: query (JSON or SSE), health,
//! registry reload, and stats, assembled as an Axum router with CORS and
//! request tracing.

use axum::{
    extract::State,
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use super::middleware::auth_middleware;
use super::types::{error_envelope, status_for, HealthResponse, QueryRequest};
use crate::config::ServerConfig;
use crate::pipeline::{EventSink, Orchestrator};
use crate::types::QueryId;

/// Heartbeat interval on idle SSE streams.
const SSE_KEEP_ALIVE: Duration = Duration::from_secs(15);

/// Server errors, split so the binary can map bind failures to their own
/// exit code.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("server error: {0}")]
    Runtime(std::io::Error),
}

/// Shared handler state.
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    /// Agents file re-read by the reload endpoint.
    pub agents_path: PathBuf,
}

/// The HTTP API server.
pub struct HttpServer {
    config: ServerConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    pub fn new(config: ServerConfig, state: Arc<AppState>) -> Self {
        Self { config, state }
    }

    /// Assemble the router. Public for in-process testing.
    pub fn router(state: Arc<AppState>, enable_cors: bool) -> Router {
        let mut router = Router::new()
            .route("/v1/query", post(handle_query))
            .route("/health", get(handle_health))
            .route("/agents/reload", post(handle_reload))
            .route("/stats", get(handle_stats))
            .layer(axum::middleware::from_fn(auth_middleware))
            .with_state(state)
            .layer(TraceLayer::new_for_http());

        if enable_cors {
            router = router.layer(CorsLayer::permissive());
        }
        router
    }

    /// Bind and serve until a shutdown signal, then drain in-flight
    /// requests for at most `drain_grace`.
    pub async fn serve(self, drain_grace: Duration) -> Result<(), ServerError> {
        let addr = format!("{}:{}", self.config.bind_address, self.config.port);
        let listener = TcpListener::bind(&addr).await.map_err(|source| ServerError::Bind {
            addr: addr.clone(),
            source,
        })?;
        tracing::info!("conductor listening on {}", addr);

        let drained = Arc::new(tokio::sync::Notify::new());
        let signal = {
            let drained = drained.clone();
            async move {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!(
                    "shutdown signal received, draining in-flight requests (grace {:?})",
                    drain_grace
                );
                drained.notify_one();
            }
        };

        let router = Self::router(self.state, self.config.enable_cors);
        let server = async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(signal)
                .await
        };

        tokio::select! {
            result = server => result.map_err(ServerError::Runtime),
            _ = async {
                drained.notified().await;
                tokio::time::sleep(drain_grace).await;
            } => {
                tracing::warn!("drain grace elapsed, forcing shutdown");
                Ok(())
            }
        }
    }
}

async fn handle_query(
    State(state): State<Arc<AppState>>,
    Json(request): Json<QueryRequest>,
) -> Response {
    let query_id = QueryId::new();

    if request.stream {
        let buffer = state.orchestrator.config().stream_buffer;
        let (sink, rx) = EventSink::streaming(query_id.to_string(), buffer);
        let orchestrator = state.orchestrator.clone();
        let envelope = request.envelope;
        tokio::spawn(async move {
            // The outcome reaches the client through the terminal event;
            // the error side is already logged by the pipeline.
            let _ = orchestrator.process(query_id, envelope, None, &sink).await;
        });

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| {
                let sse = Event::default().event(event.event.name()).json_data(&event);
                (sse, rx)
            })
        });
        return Sse::new(stream)
            .keep_alive(KeepAlive::new().interval(SSE_KEEP_ALIVE))
            .into_response();
    }

    let sink = EventSink::discard(query_id.to_string());
    match state
        .orchestrator
        .process(query_id, request.envelope, None, &sink)
        .await
    {
        Ok(envelope) => (StatusCode::OK, Json(envelope)).into_response(),
        Err(error) => {
            let status = status_for(&error);
            (status, Json(error_envelope(query_id, &error))).into_response()
        }
    }
}

async fn handle_health(State(state): State<Arc<AppState>>) -> Response {
    let snapshot = state.orchestrator.registry().snapshot();
    let open_circuits = state.orchestrator.breakers().open_circuits();
    let enabled = snapshot.list_enabled();
    let healthy = enabled
        .iter()
        .filter(|entry| !open_circuits.contains(&entry.descriptor.name))
        .count();

    let (status, code) = if healthy == 0 {
        ("unhealthy", StatusCode::SERVICE_UNAVAILABLE)
    } else if healthy < enabled.len() {
        ("degraded", StatusCode::OK)
    } else {
        ("healthy", StatusCode::OK)
    };

    (
        code,
        Json(HealthResponse {
            status: status.to_string(),
            registered_agents: snapshot.len(),
            open_circuits,
        }),
    )
        .into_response()
}

async fn handle_reload(State(state): State<Arc<AppState>>) -> Response {
    let descriptors = match crate::config::load_agents(&state.agents_path) {
        Ok(descriptors) => descriptors,
        Err(error) => {
            tracing::error!("reload failed reading agents file: {}", error);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": error.to_string()})),
            )
                .into_response();
        }
    };
    match state.orchestrator.registry().reload(descriptors) {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(error) => {
            tracing::error!("reload failed: {}", error);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": error.to_string()})),
            )
                .into_response()
        }
    }
}

async fn handle_stats(State(state): State<Arc<AppState>>) -> Response {
    Json(state.orchestrator.metrics().snapshot()).into_response()
}
