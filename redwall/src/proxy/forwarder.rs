// redwall/src/proxy/forwarder.rs
//
// Provider dispatch and byte-accurate passthrough.
//
// Exact path match picks the upstream; the original body bytes go out
// verbatim. Responses come back either buffered (fully read, end-to-end
// latency) or streamed: status and headers are flushed at the first upstream
// chunk, every chunk is copied to the client and teed into a buffer, and the
// recorded latency is first-byte time. The tee task is detached: a client
// that hangs up stops the copy but the collected text still reaches the
// accounting path.

use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, StatusCode};
use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::error::ProxyError;

const OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";
const ANTHROPIC_MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

const STREAM_CHANNEL_DEPTH: usize = 32;

pub struct Forwarder {
    client:        reqwest::Client,
    openai_url:    String,
    anthropic_url: String,
    openai_key:    Option<String>,
    anthropic_key: Option<String>,
}

/// Full raw text of a streamed body, delivered after the last chunk.
pub type CollectedBody = oneshot::Receiver<String>;

pub enum ForwardBody {
    Buffered(Bytes),
    Streamed { body: Body, collected: CollectedBody },
}

pub struct ForwardOutcome {
    pub status:     StatusCode,
    pub headers:    HeaderMap,
    pub latency_ms: u64,
    pub streamed:   bool,
    pub body:       ForwardBody,
}

impl Forwarder {
    pub fn new(openai_key: Option<String>, anthropic_key: Option<String>) -> Self {
        Self {
            client:        reqwest::Client::new(),
            openai_url:    OPENAI_CHAT_URL.to_string(),
            anthropic_url: ANTHROPIC_MESSAGES_URL.to_string(),
            openai_key,
            anthropic_key,
        }
    }

    /// Point the provider endpoints somewhere else (local test doubles).
    pub fn with_endpoints(mut self, openai_url: &str, anthropic_url: &str) -> Self {
        self.openai_url = openai_url.to_string();
        self.anthropic_url = anthropic_url.to_string();
        self
    }

    /// Deliver the provider call. `client_sink` says whether a streamed body
    /// can be handed back to a waiting client connection.
    pub async fn forward(
        &self,
        path: &str,
        raw_body: Bytes,
        client_sink: bool,
    ) -> Result<ForwardOutcome, ProxyError> {
        let started = Instant::now();
        let request = self.provider_request(path)?.body(raw_body.clone());

        let wants_stream = client_sink && request_asks_for_stream(&raw_body);
        let response = request.send().await?;

        let status = StatusCode::from_u16(response.status().as_u16())
            .unwrap_or(StatusCode::BAD_GATEWAY);
        let headers = copy_headers(response.headers());

        let sse = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.contains("text/event-stream"))
            .unwrap_or(false);

        if client_sink && (sse || wants_stream) {
            let mut stream = response.bytes_stream();
            // Peek one chunk: an empty body falls through to the buffered
            // path, and its arrival is the first-byte latency mark.
            match stream.next().await {
                Some(Ok(first)) => {
                    let latency_ms = started.elapsed().as_millis() as u64;
                    let (body, collected) = tee_stream(first, stream);
                    return Ok(ForwardOutcome {
                        status,
                        headers,
                        latency_ms,
                        streamed: true,
                        body: ForwardBody::Streamed { body, collected },
                    });
                }
                Some(Err(e)) => return Err(ProxyError::Upstream(e)),
                None => {
                    return Ok(ForwardOutcome {
                        status,
                        headers,
                        latency_ms: started.elapsed().as_millis() as u64,
                        streamed: false,
                        body: ForwardBody::Buffered(Bytes::new()),
                    })
                }
            }
        }

        let bytes = response.bytes().await?;
        Ok(ForwardOutcome {
            status,
            headers,
            latency_ms: started.elapsed().as_millis() as u64,
            streamed: false,
            body: ForwardBody::Buffered(bytes),
        })
    }

    fn provider_request(&self, path: &str) -> Result<reqwest::RequestBuilder, ProxyError> {
        match path {
            "/v1/chat/completions" => {
                let mut req = self
                    .client
                    .post(&self.openai_url)
                    .header(reqwest::header::CONTENT_TYPE, "application/json");
                if let Some(key) = &self.openai_key {
                    req = req.bearer_auth(key);
                }
                Ok(req)
            }
            "/v1/messages" => {
                let mut req = self
                    .client
                    .post(&self.anthropic_url)
                    .header(reqwest::header::CONTENT_TYPE, "application/json")
                    .header("anthropic-version", ANTHROPIC_VERSION);
                if let Some(key) = &self.anthropic_key {
                    req = req.header("x-api-key", key);
                }
                Ok(req)
            }
            other => Err(ProxyError::UnsupportedProvider(other.to_string())),
        }
    }
}

/// Copy-through chunks while teeing them into a buffer; the concatenated
/// text is delivered once the upstream stream ends.
fn tee_stream(
    first: Bytes,
    mut rest: impl futures_util::Stream<Item = Result<Bytes, reqwest::Error>> + Unpin + Send + 'static,
) -> (Body, CollectedBody) {
    let (chunk_tx, chunk_rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(STREAM_CHANNEL_DEPTH);
    let (done_tx, done_rx) = oneshot::channel::<String>();

    tokio::spawn(async move {
        let mut collected: Vec<u8> = Vec::with_capacity(first.len());
        collected.extend_from_slice(&first);
        let mut client_gone = chunk_tx.send(Ok(first)).await.is_err();

        while let Some(next) = rest.next().await {
            match next {
                Ok(chunk) => {
                    collected.extend_from_slice(&chunk);
                    if !client_gone && chunk_tx.send(Ok(chunk)).await.is_err() {
                        // Client hung up: stop copying, keep what arrived.
                        client_gone = true;
                        break;
                    }
                }
                Err(e) => {
                    debug!("upstream stream ended with error: {}", e);
                    if !client_gone {
                        let _ = chunk_tx
                            .send(Err(std::io::Error::new(std::io::ErrorKind::Other, e)))
                            .await;
                    }
                    break;
                }
            }
        }
        let _ = done_tx.send(String::from_utf8_lossy(&collected).into_owned());
    });

    (Body::from_stream(ReceiverStream::new(chunk_rx)), done_rx)
}

/// The parsed request body opted into streaming (`"stream": true`).
fn request_asks_for_stream(raw_body: &Bytes) -> bool {
    serde_json::from_slice::<serde_json::Value>(raw_body)
        .ok()
        .and_then(|v| v.get("stream").and_then(|s| s.as_bool()))
        .unwrap_or(false)
}

/// Upstream headers minus hop-by-hop framing the proxy re-derives.
fn copy_headers(upstream: &reqwest::header::HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in upstream.iter() {
        if *name == reqwest::header::TRANSFER_ENCODING {
            continue;
        }
        if let (Ok(n), Ok(v)) = (
            axum::http::HeaderName::from_bytes(name.as_str().as_bytes()),
            axum::http::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            out.insert(n, v);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_opt_in_is_read_from_the_body() {
        assert!(request_asks_for_stream(&Bytes::from_static(
            b"{\"model\":\"gpt-4o\",\"stream\":true}"
        )));
        assert!(!request_asks_for_stream(&Bytes::from_static(
            b"{\"model\":\"gpt-4o\",\"stream\":false}"
        )));
        assert!(!request_asks_for_stream(&Bytes::from_static(b"{}")));
        assert!(!request_asks_for_stream(&Bytes::from_static(b"not json")));
    }

    #[test]
    fn unknown_paths_have_no_provider() {
        let fwd = Forwarder::new(None, None);
        assert!(matches!(
            fwd.provider_request("/v1/embeddings"),
            Err(ProxyError::UnsupportedProvider(_))
        ));
        assert!(fwd.provider_request("/v1/chat/completions").is_ok());
        assert!(fwd.provider_request("/v1/messages").is_ok());
    }

    #[tokio::test]
    async fn tee_preserves_chunk_order_and_concatenation() {
        let chunks: Vec<Result<Bytes, reqwest::Error>> = vec![
            Ok(Bytes::from_static(b"data: two\n\n")),
            Ok(Bytes::from_static(b"data: three\n\n")),
        ];
        let rest = futures_util::stream::iter(chunks);
        let (body, collected) = tee_stream(Bytes::from_static(b"data: one\n\n"), Box::pin(rest));

        let delivered = axum::body::to_bytes(body, usize::MAX).await.unwrap();
        assert_eq!(&delivered[..], b"data: one\n\ndata: two\n\ndata: three\n\n");

        let text = collected.await.unwrap();
        assert_eq!(text, "data: one\n\ndata: two\n\ndata: three\n\n");
    }

    #[tokio::test]
    async fn tee_survives_a_dropped_client() {
        let chunks: Vec<Result<Bytes, reqwest::Error>> = vec![
            Ok(Bytes::from_static(b"second")),
            Ok(Bytes::from_static(b"third")),
        ];
        let rest = futures_util::stream::iter(chunks);
        let (body, collected) = tee_stream(Bytes::from_static(b"first"), Box::pin(rest));
        drop(body);

        // The collected text still arrives with at least the teed prefix.
        let text = collected.await.unwrap();
        assert!(text.starts_with("first"));
    }
}
