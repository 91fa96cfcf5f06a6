// redwall/src/proxy/interceptor.rs
//
// The request state machine:
//
//   AUTH → AGENT_CHECK → QUOTA_CHECK → FORWARD → ACCOUNT → PERSIST_INITIAL
//        → ANALYZE → PERSIST_FINAL → PUBLISH → RESPOND
//
// Auth and quota answer the client directly. Past those gates the path is
// fail-open: any failure before headers go out triggers one raw re-forward
// without analysis, and only if that also dies does the client see 502.
// Streamed responses flush upstream headers immediately; accounting and
// scoring run detached once the last chunk lands, so a mid-stream disconnect
// never loses the event.

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};

use crate::error::{proxy_error_response, ProxyError};
use crate::events::{AlertSignal, LoggedEvent, SecurityDecision, Tenant};
use crate::pricing;
use crate::proxy::forwarder::{ForwardBody, ForwardOutcome};
use crate::proxy::AppState;

pub const KEY_HEADER: &str = "x-redteamingai-key";
pub const AGENT_HEADER: &str = "x-agent-id";
const EVENT_ID_HEADER: &str = "x-redteamingai-event-id";
const RISK_SCORE_HEADER: &str = "x-redteamingai-risk-score";

const ALERT_RISK_THRESHOLD: u8 = 50;

pub async fn intercept(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri.path().to_string();

    // AUTH — header first, JSON body field as fallback.
    let api_key = headers
        .get(KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .or_else(|| body_api_key(&body));
    let Some(api_key) = api_key else {
        return ProxyError::AuthMissing.into_response();
    };
    let tenant = match state.store.tenant_by_key(&api_key).await {
        Ok(Some(t)) if !t.blocked => t,
        Ok(_) => return ProxyError::AuthInvalid.into_response(),
        Err(e) => {
            warn!("tenant lookup failed: {}", e);
            return ProxyError::AuthInvalid.into_response();
        }
    };

    // AGENT_CHECK
    let agent_id = headers
        .get(AGENT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    if let Some(agent) = &agent_id {
        match state.store.is_agent_blocked(&tenant.id, agent).await {
            Ok(true) => return ProxyError::AgentBlocked.into_response(),
            Ok(false) => {}
            Err(e) => warn!("agent block check failed: {}", e),
        }
    }

    // QUOTA_CHECK — current calendar month.
    match state.store.events_this_month(&tenant.id).await {
        Ok(count) if count >= tenant.monthly_limit => {
            return ProxyError::QuotaExceeded { upgrade_url: state.upgrade_url.clone() }
                .into_response();
        }
        Ok(_) => {}
        Err(e) => warn!("quota check failed: {}", e),
    }

    // FORWARD .. RESPOND, fail-open on any failure before headers are sent.
    match scored_exchange(&state, &path, &tenant, agent_id.as_deref(), body.clone()).await {
        Ok(response) => response,
        Err(err) => {
            warn!("scored path failed ({}); relaying raw upstream response", err);
            match state.forwarder.forward(&path, body, false).await {
                Ok(outcome) => {
                    let bytes = match outcome.body {
                        ForwardBody::Buffered(bytes) => bytes,
                        ForwardBody::Streamed { .. } => Bytes::new(),
                    };
                    let mut response = Response::new(Body::from(bytes));
                    *response.status_mut() = outcome.status;
                    *response.headers_mut() = outcome.headers;
                    response
                }
                Err(e) => {
                    error!("raw re-forward also failed: {}", e);
                    proxy_error_response()
                }
            }
        }
    }
}

async fn scored_exchange(
    state: &AppState,
    path: &str,
    tenant: &Tenant,
    agent_id: Option<&str>,
    body: Bytes,
) -> Result<Response, ProxyError> {
    let outcome = state.forwarder.forward(path, body.clone(), true).await?;

    match outcome {
        ForwardOutcome {
            status,
            headers,
            latency_ms,
            body: ForwardBody::Buffered(bytes),
            ..
        } => {
            let raw_response = String::from_utf8_lossy(&bytes).into_owned();
            let skeleton = build_event(tenant, agent_id, &body, &raw_response, latency_ms);

            // PERSIST_INITIAL → ANALYZE → PERSIST_FINAL → PUBLISH
            let event = state.store.insert_event(skeleton).await?;
            let decision = state.pipeline.evaluate(&event).await;
            state.store.update_security_result(event.id, &decision).await?;
            publish_and_alert(state, event, &decision);

            if decision.blocked {
                return Ok(blocked_response(decision.event_id, &decision));
            }
            let mut response = Response::new(Body::from(bytes));
            *response.status_mut() = status;
            *response.headers_mut() = headers;
            response
                .headers_mut()
                .insert(EVENT_ID_HEADER, HeaderValue::from(decision.event_id));
            response
                .headers_mut()
                .insert(RISK_SCORE_HEADER, HeaderValue::from(decision.risk_score as u16));
            Ok(response)
        }

        ForwardOutcome {
            status,
            headers,
            latency_ms,
            body: ForwardBody::Streamed { body: stream_body, collected },
            ..
        } => {
            // Headers go out now; scoring happens after the last chunk, on a
            // task that survives the client connection.
            let state = state.clone();
            let tenant = tenant.clone();
            let agent_id = agent_id.map(|s| s.to_string());
            tokio::spawn(async move {
                let raw_response = collected.await.unwrap_or_default();
                let skeleton =
                    build_event(&tenant, agent_id.as_deref(), &body, &raw_response, latency_ms);

                let event = match state.store.insert_event(skeleton).await {
                    Ok(event) => event,
                    Err(e) => {
                        error!("post-stream persist failed, event lost: {}", e);
                        return;
                    }
                };
                let decision = state.pipeline.evaluate(&event).await;
                if let Err(e) = state.store.update_security_result(event.id, &decision).await {
                    error!("post-stream security update failed: {}", e);
                    return;
                }

                // The bytes are already gone; contain the agent for next time.
                if decision.blocked {
                    info!(
                        "streamed event {} scored blocked (risk {}); containing agent",
                        event.id, decision.risk_score
                    );
                    if let Some(agent) = &agent_id {
                        if let Err(e) = state
                            .store
                            .block_agent(&tenant.id, agent, "auto-contained after streamed block")
                            .await
                        {
                            warn!("agent containment failed: {}", e);
                        }
                    }
                }
                publish_and_alert(&state, event, &decision);
            });

            let mut response = Response::new(stream_body);
            *response.status_mut() = status;
            *response.headers_mut() = headers;
            Ok(response)
        }
    }
}

/// ACCOUNT — usage, cost, hashes; risk stays 0 until analysis lands.
fn build_event(
    tenant: &Tenant,
    agent_id: Option<&str>,
    raw_body: &Bytes,
    raw_response: &str,
    latency_ms: u64,
) -> LoggedEvent {
    let request: Option<Value> = serde_json::from_slice(raw_body).ok();
    let model = request
        .as_ref()
        .and_then(|v| v.get("model"))
        .and_then(|m| m.as_str())
        .map(|s| s.to_string())
        .or_else(|| {
            serde_json::from_str::<Value>(raw_response)
                .ok()
                .and_then(|v| v.get("model").and_then(|m| m.as_str()).map(String::from))
        })
        .unwrap_or_else(|| "unknown".to_string());

    let (prompt_tokens, completion_tokens) = extract_usage(raw_response);
    let tool_names = extract_tool_names(request.as_ref());

    let mut hasher = Sha256::new();
    hasher.update(raw_body);
    let request_hash = hex::encode(hasher.finalize());

    LoggedEvent {
        id: 0,
        timestamp: Utc::now(),
        tenant_id: tenant.id.clone(),
        agent_id: agent_id.map(|s| s.to_string()),
        cost_usd: pricing::cost(&model, prompt_tokens, completion_tokens),
        model,
        prompt_tokens,
        completion_tokens,
        latency_ms,
        tool_names,
        request_hash,
        response_preview: raw_response.chars().take(256).collect(),
        risk_score: 0,
        blocked: false,
        flags: vec![],
        raw_request: String::from_utf8_lossy(raw_body).into_owned(),
        raw_response: raw_response.to_string(),
    }
}

/// PUBLISH, plus the alert hand-off for blocked or high-risk calls.
/// Subscribers only ever see the scored event.
fn publish_and_alert(state: &AppState, mut event: LoggedEvent, decision: &SecurityDecision) {
    event.risk_score = decision.risk_score;
    event.blocked = decision.blocked;
    event.flags = decision.flags.clone();

    state.registry.publish(&event.tenant_id, &event);

    if decision.blocked || decision.risk_score > ALERT_RISK_THRESHOLD {
        let _ = state.alerts.send(AlertSignal {
            event_id:   event.id,
            tenant_id:  event.tenant_id.clone(),
            risk_score: decision.risk_score,
            blocked:    decision.blocked,
            flags:      decision.flags.clone(),
        });
    }
}

fn blocked_response(event_id: i64, decision: &SecurityDecision) -> Response {
    (
        StatusCode::FORBIDDEN,
        Json(json!({
            "error": "request blocked by security policy",
            "eventId": event_id,
            "riskScore": decision.risk_score,
            "flags": decision.flags,
        })),
    )
        .into_response()
}

fn body_api_key(body: &Bytes) -> Option<String> {
    serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|v| v.get("apiKey").and_then(|k| k.as_str()).map(String::from))
}

/// `prompt_tokens`/`input_tokens` and `completion_tokens`/`output_tokens`,
/// zero when absent or unreadable.
fn extract_usage(raw_response: &str) -> (u32, u32) {
    let Ok(value) = serde_json::from_str::<Value>(raw_response) else {
        return (0, 0);
    };
    let usage = match value.get("usage") {
        Some(usage) => usage,
        None => return (0, 0),
    };
    let read = |a: &str, b: &str| {
        usage
            .get(a)
            .or_else(|| usage.get(b))
            .and_then(|n| n.as_u64())
            .unwrap_or(0) as u32
    };
    (
        read("prompt_tokens", "input_tokens"),
        read("completion_tokens", "output_tokens"),
    )
}

/// Requested tool names: top-level tool definitions plus tool calls embedded
/// in messages. Duplicates are kept; per-event counts feed the anomaly rules.
fn extract_tool_names(request: Option<&Value>) -> Vec<String> {
    let Some(request) = request else {
        return Vec::new();
    };
    let mut names = Vec::new();

    if let Some(tools) = request.get("tools").and_then(|t| t.as_array()) {
        for tool in tools {
            let name = tool
                .get("name")
                .and_then(|n| n.as_str())
                .or_else(|| {
                    tool.get("function")
                        .and_then(|f| f.get("name"))
                        .and_then(|n| n.as_str())
                });
            if let Some(name) = name {
                names.push(name.to_string());
            }
        }
    }

    if let Some(messages) = request.get("messages").and_then(|m| m.as_array()) {
        for message in messages {
            if let Some(calls) = message.get("tool_calls").and_then(|c| c.as_array()) {
                for call in calls {
                    let name = call
                        .get("function")
                        .and_then(|f| f.get("name"))
                        .and_then(|n| n.as_str())
                        .or_else(|| call.get("name").and_then(|n| n.as_str()));
                    if let Some(name) = name {
                        names.push(name.to_string());
                    }
                }
            }
        }
    }

    names
}
