// redwall/src/proxy/mod.rs
//
// HTTP surface of the daemon: the two proxied provider routes, the health
// probe, and the subscriber websocket. Request bodies are capped at 10 MB
// and forwarded verbatim past that gate.

pub mod forwarder;
pub mod interceptor;
pub mod ws;

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{DefaultBodyLimit, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;

use crate::engine::SecurityPipeline;
use crate::events::AlertSignal;
use crate::sink::broadcast::SubscriberRegistry;
use crate::sink::store::EventStore;

pub use forwarder::Forwarder;

pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

pub type AlertQueue = mpsc::UnboundedSender<AlertSignal>;

#[derive(Clone)]
pub struct AppState {
    pub store:       Arc<EventStore>,
    pub pipeline:    Arc<SecurityPipeline>,
    pub registry:    Arc<SubscriberRegistry>,
    pub forwarder:   Arc<Forwarder>,
    pub alerts:      AlertQueue,
    pub started:     Instant,
    pub upgrade_url: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(interceptor::intercept))
        .route("/v1/messages", post(interceptor::intercept))
        .route("/health", get(health))
        .route("/ws", get(ws::subscribe))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "uptime": state.started.elapsed().as_secs(),
    }))
}
