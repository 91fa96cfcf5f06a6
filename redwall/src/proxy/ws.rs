// redwall/src/proxy/ws.rs
//
// Subscriber channel: GET /ws?key=<tenant_key>. The key check happens before
// the upgrade; after it, the socket task drains its registry mailbox toward
// the client and feeds pong receipts back for the heartbeat.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::debug;

use crate::proxy::AppState;
use crate::sink::broadcast::OutFrame;

#[derive(Deserialize)]
pub struct SubscribeParams {
    key: Option<String>,
}

pub async fn subscribe(
    State(state): State<AppState>,
    Query(params): Query<SubscribeParams>,
    upgrade: WebSocketUpgrade,
) -> Response {
    let Some(key) = params.key else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    let tenant = match state.store.tenant_by_key(&key).await {
        Ok(Some(tenant)) if !tenant.blocked => tenant,
        _ => return StatusCode::UNAUTHORIZED.into_response(),
    };

    upgrade.on_upgrade(move |socket| serve_subscriber(socket, state, tenant.id))
}

async fn serve_subscriber(mut socket: WebSocket, state: AppState, tenant_id: String) {
    let (sub_id, mut mailbox) = state.registry.subscribe(&tenant_id);
    debug!("ws subscriber {} online for tenant {}", sub_id, tenant_id);

    loop {
        tokio::select! {
            frame = mailbox.recv() => {
                let Some(frame) = frame else {
                    // Deregistered (heartbeat expiry or publish failure).
                    break;
                };
                let outgoing = match frame {
                    OutFrame::Event(text) => Message::Text(text),
                    OutFrame::Ping        => Message::Ping(Vec::new()),
                };
                if socket.send(outgoing).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Pong(_))) => state.registry.record_pong(&tenant_id, sub_id),
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.registry.unsubscribe(&tenant_id, sub_id);
    debug!("ws subscriber {} gone from tenant {}", sub_id, tenant_id);
}
