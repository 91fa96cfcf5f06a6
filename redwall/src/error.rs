// redwall/src/error.rs
//
// Failure kinds the interceptor can surface to a client, plus the JSON error
// body shape `{error, code, ...}`. Every other component degrades to an
// empty result and a log line; only the interceptor answers with errors.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("API key required")]
    AuthMissing,

    #[error("invalid API key")]
    AuthInvalid,

    #[error("agent is blocked for this tenant")]
    AgentBlocked,

    #[error("monthly event limit reached")]
    QuotaExceeded { upgrade_url: String },

    #[error("no upstream provider for path {0}")]
    UnsupportedProvider(String),

    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),

    #[error("persistence failure: {0}")]
    Persistence(anyhow::Error),
}

impl From<anyhow::Error> for ProxyError {
    fn from(e: anyhow::Error) -> Self {
        Self::Persistence(e)
    }
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::AuthMissing | Self::AuthInvalid => StatusCode::UNAUTHORIZED,
            Self::AgentBlocked                    => StatusCode::FORBIDDEN,
            Self::QuotaExceeded { .. }            => StatusCode::TOO_MANY_REQUESTS,
            Self::UnsupportedProvider(_)
            | Self::Upstream(_)
            | Self::Persistence(_)                => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::AuthMissing             => "AUTH_REQUIRED",
            Self::AuthInvalid             => "AUTH_INVALID",
            Self::AgentBlocked            => "AGENT_BLOCKED",
            Self::QuotaExceeded { .. }    => "PLAN_LIMIT",
            Self::UnsupportedProvider(_)
            | Self::Upstream(_)
            | Self::Persistence(_)        => "PROXY_ERROR",
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let mut body = json!({ "error": self.to_string(), "code": self.code() });
        if let Self::QuotaExceeded { upgrade_url } = &self {
            body["upgradeUrl"] = json!(upgrade_url);
        }
        (self.status(), Json(body)).into_response()
    }
}

/// Fixed 502 answer when both the scored path and the raw re-forward failed.
pub fn proxy_error_response() -> Response {
    (
        StatusCode::BAD_GATEWAY,
        Json(json!({ "error": "upstream proxying failed", "code": "PROXY_ERROR" })),
    )
        .into_response()
}
