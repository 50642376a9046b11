//! HTTP gateway for ClawLoop.
//!
//! - `GET /health`, `GET /ready`: liveness probes
//! - `POST /api/chat`: run one turn and stream it back as server-sent events
//!
//! Chat turns run on the fixed `gateway`/`chat` channel pair. The handler
//! subscribes to that pair's deltas before the turn starts, forwards them as
//! `delta` events, and once the turn returns it unsubscribes, drains the
//! forwarder, and writes a single terminal `done` or `error` event.

use axum::extract::{DefaultBodyLimit, State};
use axum::http::{Method, StatusCode, header};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};

use clawloop_agent::AgentLoop;
use clawloop_config::GatewayConfig;
use clawloop_core::bus::StreamFilter;

pub const GATEWAY_CHANNEL: &str = "gateway";
pub const GATEWAY_CHAT: &str = "chat";
pub const DEFAULT_SESSION_KEY: &str = "gateway:chat";

const SUBSCRIBER_BUFFER: usize = 200;
const EVENT_BUFFER: usize = 256;

/// Shared application state for the gateway.
#[derive(Clone)]
pub struct GatewayState {
    pub agent: Arc<AgentLoop>,
}

impl GatewayState {
    pub fn new(agent: Arc<AgentLoop>) -> Self {
        Self { agent }
    }
}

/// Build the Axum router with all gateway routes.
pub fn build_router(state: GatewayState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/api/chat", post(chat_handler))
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer(cors)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the gateway until `shutdown` flips to true.
pub async fn serve(
    config: &GatewayConfig,
    state: GatewayState,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "Gateway listening");

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
            info!("Gateway shutting down");
        })
        .await
}

// --- Handlers ---

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn ready_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ready",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    #[serde(default)]
    message: String,
    #[serde(default, rename = "sessionKey")]
    session_key: Option<String>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// One SSE frame of a chat stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ChatEvent {
    Delta { delta: String, done: bool },
    Done { response: String },
    Error { error: String },
}

impl ChatEvent {
    fn name(&self) -> &'static str {
        match self {
            ChatEvent::Delta { .. } => "delta",
            ChatEvent::Done { .. } => "done",
            ChatEvent::Error { .. } => "error",
        }
    }

    fn to_sse(&self) -> SseEvent {
        let data = serde_json::to_string(self).unwrap_or_default();
        SseEvent::default().event(self.name()).data(data)
    }
}

/// `POST /api/chat`: run a turn, streaming deltas and a terminal event.
async fn chat_handler(
    State(state): State<GatewayState>,
    Json(payload): Json<ChatRequest>,
) -> Result<
    Sse<impl tokio_stream::Stream<Item = Result<SseEvent, Infallible>>>,
    (StatusCode, Json<ErrorResponse>),
> {
    if payload.message.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "message is required".into(),
            }),
        ));
    }

    let session_key = payload
        .session_key
        .filter(|key| !key.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_SESSION_KEY.to_string());
    info!(session = %session_key, "Chat request");

    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    tokio::spawn(run_chat(state.agent, payload.message, session_key, tx));

    let stream = ReceiverStream::new(rx).map(|event: ChatEvent| Ok(event.to_sse()));
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// Drive one chat turn. Dropping the response stream cancels the turn.
async fn run_chat(
    agent: Arc<AgentLoop>,
    message: String,
    session_key: String,
    tx: mpsc::Sender<ChatEvent>,
) {
    let bus = agent.bus().clone();
    let mut subscription = bus.add_stream_subscriber(
        StreamFilter::chat(GATEWAY_CHANNEL, GATEWAY_CHAT),
        SUBSCRIBER_BUFFER,
    );
    let subscriber_id = subscription.id();

    let forward_tx = tx.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(delta) = subscription.recv().await {
            let event = ChatEvent::Delta {
                delta: delta.delta,
                done: delta.done,
            };
            if forward_tx.send(event).await.is_err() {
                break;
            }
        }
        subscription.dropped()
    });

    let result = tokio::select! {
        result = agent.process_direct_with_channel(&message, &session_key, GATEWAY_CHANNEL, GATEWAY_CHAT) => Some(result),
        _ = tx.closed() => None,
    };

    bus.remove_stream_subscriber(subscriber_id);
    let dropped = forwarder.await.unwrap_or(0);
    if dropped > 0 {
        warn!(session = %session_key, dropped, "Slow client, stream deltas dropped");
    }

    let event = match result {
        Some(Ok(response)) => ChatEvent::Done { response },
        Some(Err(e)) => ChatEvent::Error {
            error: e.to_string(),
        },
        None => {
            debug!(session = %session_key, "Client disconnected, turn cancelled");
            return;
        }
    };
    let _ = tx.send(event).await;
}
