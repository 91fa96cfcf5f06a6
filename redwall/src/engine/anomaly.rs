// redwall/src/engine/anomaly.rs
//
// Heuristic anomaly rules over the event plus its agent's sliding window.
// Each rule emits at most one flag; scores are additive and capped at 100.
// Two rules (file_exfiltration, credential_access) hard-block regardless of
// the numeric score.

use std::sync::OnceLock;

use regex::Regex;

use crate::events::{AnomalyReport, LoggedEvent};
use crate::state::window::WindowStore;

const BLOCK_THRESHOLD: u8 = 80;

const W_FREQUENCY_SECS: i64 = 300; // 5 min
const W_BURST_SECS: i64 = 10;
const W_FAILURE_SECS: i64 = 600; // 10 min

const MAX_CALLS_5MIN: usize = 20;
const MAX_CALLS_BURST: usize = 5;
const MAX_PAYLOAD_BYTES: usize = 51_200;
const MAX_COST_USD: f64 = 0.50;
const MAX_FILE_TOOL_CALLS: usize = 10;
const MAX_ERRORS_10MIN: usize = 5;
const MAX_DISTINCT_TOOLS: usize = 8;

static EXTERNAL_NETWORK_RE: OnceLock<Regex> = OnceLock::new();
static CREDENTIAL_RE: OnceLock<Regex> = OnceLock::new();
static RECURSIVE_SPAWN_RE: OnceLock<Regex> = OnceLock::new();
static ERROR_RESPONSE_RE: OnceLock<Regex> = OnceLock::new();

fn external_network_re() -> &'static Regex {
    EXTERNAL_NETWORK_RE
        .get_or_init(|| Regex::new(r"(?i)http|fetch|request|webhook").expect("static regex"))
}

fn credential_re() -> &'static Regex {
    CREDENTIAL_RE.get_or_init(|| {
        Regex::new(r"(?i)secret|password|api.?key|token|credential").expect("static regex")
    })
}

fn recursive_spawn_re() -> &'static Regex {
    RECURSIVE_SPAWN_RE.get_or_init(|| Regex::new(r"(?i)agent|delegate|spawn").expect("static regex"))
}

fn error_response_re() -> &'static Regex {
    ERROR_RESPONSE_RE
        .get_or_init(|| Regex::new(r"(?i)error|fail(ed|ure)?|exception").expect("static regex"))
}

/// An upstream response counts as an error when it reads like one or is a
/// JSON document carrying an `error` field.
pub fn is_error_response(raw_response: &str) -> bool {
    if error_response_re().is_match(raw_response) {
        return true;
    }
    serde_json::from_str::<serde_json::Value>(raw_response)
        .ok()
        .map(|v| v.get("error").is_some())
        .unwrap_or(false)
}

pub async fn analyze(event: &LoggedEvent, store: &WindowStore) -> AnomalyReport {
    let window = store.record(
        &event.tenant_id,
        event.agent_id.as_deref(),
        event.timestamp,
        &event.tool_names,
        is_error_response(&event.raw_response),
    );
    let window = window.read();

    let mut score: u32 = 0;
    let mut flags: Vec<String> = Vec::new();
    let mut hard_block = false;

    if window.calls_within(W_FREQUENCY_SECS) > MAX_CALLS_5MIN {
        score += 40;
        flags.push("high_frequency".into());
    }
    if window.calls_within(W_BURST_SECS) > MAX_CALLS_BURST {
        score += 35;
        flags.push("burst_spike".into());
    }
    if event.raw_request.len() > MAX_PAYLOAD_BYTES {
        score += 25;
        flags.push("large_payload".into());
    }
    if event.cost_usd > MAX_COST_USD {
        score += 30;
        flags.push("excessive_cost".into());
    }

    let file_tool_calls = event
        .tool_names
        .iter()
        .filter(|name| *name == "file_read" || *name == "list_directory")
        .count();
    if file_tool_calls > MAX_FILE_TOOL_CALLS {
        score += 50;
        flags.push("file_exfiltration".into());
        hard_block = true;
    }
    if event.tool_names.iter().any(|n| external_network_re().is_match(n)) {
        score += 45;
        flags.push("external_network".into());
    }
    if event.tool_names.iter().any(|n| credential_re().is_match(n)) {
        score += 60;
        flags.push("credential_access".into());
        hard_block = true;
    }
    if event.tool_names.iter().any(|n| recursive_spawn_re().is_match(n)) {
        score += 35;
        flags.push("recursive_spawn".into());
    }
    if window.errors_within(W_FAILURE_SECS) > MAX_ERRORS_10MIN {
        score += 30;
        flags.push("repeated_failures".into());
    }
    if window.distinct_tools() > MAX_DISTINCT_TOOLS {
        score += 45;
        flags.push("tool_enumeration".into());
    }

    let score = score.min(100) as u8;
    AnomalyReport {
        score,
        flags,
        should_block: score >= BLOCK_THRESHOLD || hard_block,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn event(tools: &[&str]) -> LoggedEvent {
        LoggedEvent {
            id: 0,
            timestamp: Utc::now(),
            tenant_id: "t".into(),
            agent_id: Some("a".into()),
            model: "gpt-4o".into(),
            prompt_tokens: 10,
            completion_tokens: 10,
            cost_usd: 0.001,
            latency_ms: 5,
            tool_names: tools.iter().map(|s| s.to_string()).collect(),
            request_hash: String::new(),
            response_preview: String::new(),
            risk_score: 0,
            blocked: false,
            flags: vec![],
            raw_request: "{}".into(),
            raw_response: "{\"ok\":true}".into(),
        }
    }

    #[tokio::test]
    async fn clean_event_scores_zero() {
        let store = WindowStore::new();
        let report = analyze(&event(&[]), &store).await;
        assert_eq!(report.score, 0);
        assert!(report.flags.is_empty());
        assert!(!report.should_block);
    }

    #[tokio::test]
    async fn credential_tool_hard_blocks() {
        let store = WindowStore::new();
        let report = analyze(&event(&["read_api_key"]), &store).await;
        assert!(report.flags.contains(&"credential_access".to_string()));
        assert!(report.should_block);
    }

    #[tokio::test]
    async fn file_tool_fanout_hard_blocks() {
        let store = WindowStore::new();
        let tools: Vec<&str> = std::iter::repeat("file_read").take(11).collect();
        let report = analyze(&event(&tools), &store).await;
        assert!(report.flags.contains(&"file_exfiltration".to_string()));
        assert!(report.should_block);
    }

    #[tokio::test]
    async fn ten_file_calls_stay_under_the_line() {
        let store = WindowStore::new();
        let tools: Vec<&str> = std::iter::repeat("list_directory").take(10).collect();
        let report = analyze(&event(&tools), &store).await;
        assert!(!report.flags.contains(&"file_exfiltration".to_string()));
    }

    #[tokio::test]
    async fn burst_flag_on_sixth_call() {
        let store = WindowStore::new();
        for _ in 0..5 {
            analyze(&event(&[]), &store).await;
        }
        let report = analyze(&event(&[]), &store).await;
        assert!(report.flags.contains(&"burst_spike".to_string()));
        assert!(!report.should_block);
    }

    #[tokio::test]
    async fn tool_patterns_flag_without_blocking() {
        let store = WindowStore::new();
        let report = analyze(&event(&["fetch_url", "spawn_agent"]), &store).await;
        assert!(report.flags.contains(&"external_network".to_string()));
        assert!(report.flags.contains(&"recursive_spawn".to_string()));
        assert!(!report.should_block);
    }

    #[tokio::test]
    async fn large_payload_and_cost_flags() {
        let store = WindowStore::new();
        let mut ev = event(&[]);
        ev.raw_request = "x".repeat(60_000);
        ev.cost_usd = 0.75;
        let report = analyze(&ev, &store).await;
        assert!(report.flags.contains(&"large_payload".to_string()));
        assert!(report.flags.contains(&"excessive_cost".to_string()));
    }

    #[tokio::test]
    async fn repeated_failures_flag() {
        let store = WindowStore::new();
        let mut ev = event(&[]);
        ev.raw_response = "{\"error\":{\"message\":\"rate limited\"}}".into();
        for _ in 0..5 {
            analyze(&ev, &store).await;
        }
        let report = analyze(&ev, &store).await;
        assert!(report.flags.contains(&"repeated_failures".to_string()));
    }

    #[tokio::test]
    async fn tool_enumeration_flag() {
        let store = WindowStore::new();
        // Nine distinct, none matching the name-pattern rules.
        let tools = ["a", "b", "c", "d", "e", "f", "g", "h", "i"];
        let report = analyze(&event(&tools), &store).await;
        assert!(report.flags.contains(&"tool_enumeration".to_string()));
    }

    #[test]
    fn error_classification() {
        assert!(is_error_response("Request FAILED with status 500"));
        assert!(is_error_response("{\"error\":\"bad key\"}"));
        assert!(is_error_response("unhandled exception in worker"));
        assert!(!is_error_response("{\"choices\":[{\"text\":\"hi\"}]}"));
    }
}
