// redwall/src/events.rs
//
// Shared domain types flowing through redwall.
// LoggedEvent rows and the wire frames serialize camelCase; the dashboard
// and the read-side API consume them as-is.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Intercepted call ──────────────────────────────────────────────────────────

/// One intercepted provider call. Inserted once with risk=0/blocked=false,
/// then updated exactly once after analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggedEvent {
    pub id:                i64,
    pub timestamp:         DateTime<Utc>,
    pub tenant_id:         String,
    pub agent_id:          Option<String>,
    pub model:             String,
    pub prompt_tokens:     u32,
    pub completion_tokens: u32,
    pub cost_usd:          f64,
    pub latency_ms:        u64,
    pub tool_names:        Vec<String>,   // requested tools, duplicates kept
    pub request_hash:      String,        // hex SHA-256 of the raw body
    pub response_preview:  String,        // first 256 chars of the raw response
    pub risk_score:        u8,
    pub blocked:           bool,
    pub flags:             Vec<String>,
    pub raw_request:       String,
    pub raw_response:      String,
}

/// Tenant record, read-only in the hot path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tenant {
    pub id:            String,
    pub api_key:       String,
    pub monthly_limit: u32,
    pub blocked:       bool,
}

// ── Policy rules ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum PolicyAction { Allow, Block, Alert }

impl PolicyAction {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ALLOW" => Some(Self::Allow),
            "BLOCK" => Some(Self::Block),
            "ALERT" => Some(Self::Alert),
            _ => None,
        }
    }
}

impl std::fmt::Display for PolicyAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Allow => write!(f, "ALLOW"),
            Self::Block => write!(f, "BLOCK"),
            Self::Alert => write!(f, "ALERT"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity { Low, Medium, High, Critical }

impl Severity {
    /// Contribution to the policy engine score.
    pub fn score(self) -> u8 {
        match self {
            Self::Low      => 10,
            Self::Medium   => 20,
            Self::High     => 30,
            Self::Critical => 40,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "LOW"      => Some(Self::Low),
            "MEDIUM"   => Some(Self::Medium),
            "HIGH"     => Some(Self::High),
            "CRITICAL" => Some(Self::Critical),
            _ => None,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low      => write!(f, "LOW"),
            Self::Medium   => write!(f, "MEDIUM"),
            Self::High     => write!(f, "HIGH"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Tenant-owned rule; `condition` is source text for the restricted evaluator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRule {
    pub id:          i64,
    pub tenant_id:   String,
    pub name:        String,
    pub description: String,
    pub condition:   String,
    pub action:      PolicyAction,
    pub severity:    Severity,
    pub enabled:     bool,
    pub hits:        u64,
    pub created_at:  DateTime<Utc>,
}

// ── Engine outputs ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnomalyReport {
    pub score:        u8,
    pub flags:        Vec<String>,
    pub should_block: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScanLayer { Phrase, Regex, Structural }

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchedPattern {
    pub name:         String,
    pub layer:        ScanLayer,
    pub confidence:   u8,
    pub matched_text: String,   // truncated to 180 chars
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InjectionReport {
    pub score:      u8,
    pub confidence: u8,
    pub detected:   bool,
    pub patterns:   Vec<MatchedPattern>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViolatedRule {
    pub id:       i64,
    pub name:     String,
    pub action:   PolicyAction,
    pub severity: Severity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyReport {
    pub score:      u8,
    pub action:     PolicyAction,
    pub violations: Vec<ViolatedRule>,
}

impl Default for PolicyReport {
    fn default() -> Self {
        Self { score: 0, action: PolicyAction::Allow, violations: Vec::new() }
    }
}

/// Combined result of the three engines for one event. Never persisted
/// standalone; its fields are projected into the LoggedEvent update.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityDecision {
    pub event_id:      i64,
    pub risk_score:    u8,
    pub blocked:       bool,
    pub flags:         Vec<String>,
    pub anomaly:       AnomalyReport,
    pub injection:     InjectionReport,
    pub policy:        PolicyReport,
    pub processing_ms: u64,
}

// ── Alert hand-off ────────────────────────────────────────────────────────────

/// Queued toward the external alert dispatcher when an event is blocked or
/// scores above 50. Delivery guarantees are that collaborator's concern.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertSignal {
    pub event_id:   i64,
    pub tenant_id:  String,
    pub risk_score: u8,
    pub blocked:    bool,
    pub flags:      Vec<String>,
}
