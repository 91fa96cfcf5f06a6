// redwall/src/engine/policy.rs
//
// Tenant policy evaluation. Enabled rules are loaded from the store on first
// use and cached for five minutes; a stale or missing entry reloads before
// evaluation. Every condition runs in the sandbox with a 10 ms cap; a rule
// that faults simply does not match.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::engine::sandbox::{self, Context, Value};
use crate::events::{LoggedEvent, PolicyAction, PolicyReport, PolicyRule, ViolatedRule};
use crate::sink::store::EventStore;

pub const RULE_CACHE_TTL: Duration = Duration::from_secs(300);
pub const RULE_TIME_BUDGET: Duration = Duration::from_millis(10);

struct CachedRules {
    loaded_at: Instant,
    rules:     Arc<Vec<PolicyRule>>,
}

pub struct PolicyEngine {
    store: Arc<EventStore>,
    cache: DashMap<String, CachedRules>,
}

impl PolicyEngine {
    pub fn new(store: Arc<EventStore>) -> Self {
        Self { store, cache: DashMap::new() }
    }

    /// Enabled rules for a tenant, from cache when fresh. Readers always see
    /// either the prior rule set or the fully-loaded new one.
    async fn rules_for(&self, tenant_id: &str) -> Arc<Vec<PolicyRule>> {
        if let Some(entry) = self.cache.get(tenant_id) {
            if entry.loaded_at.elapsed() < RULE_CACHE_TTL {
                return entry.rules.clone();
            }
        }

        match self.store.enabled_rules(tenant_id).await {
            Ok(rules) => {
                let rules = Arc::new(rules);
                self.cache.insert(
                    tenant_id.to_string(),
                    CachedRules { loaded_at: Instant::now(), rules: rules.clone() },
                );
                rules
            }
            Err(e) => {
                warn!("rule load failed for tenant {}: {}", tenant_id, e);
                // Serve the stale set if one exists; otherwise no rules.
                self.cache
                    .get(tenant_id)
                    .map(|entry| entry.rules.clone())
                    .unwrap_or_else(|| Arc::new(Vec::new()))
            }
        }
    }

    pub fn invalidate(&self, tenant_id: &str) {
        self.cache.remove(tenant_id);
    }

    pub async fn evaluate(&self, event: &LoggedEvent) -> PolicyReport {
        let rules = self.rules_for(&event.tenant_id).await;
        if rules.is_empty() {
            return PolicyReport::default();
        }

        let ctx = condition_context(event);
        let mut violations: Vec<ViolatedRule> = Vec::new();
        let mut score: u32 = 0;
        let mut action = PolicyAction::Allow;

        for rule in rules.iter() {
            let matched = match sandbox::matches(&rule.condition, &ctx, RULE_TIME_BUDGET) {
                Ok(m) => m,
                Err(fault) => {
                    debug!("rule `{}` (#{}) did not evaluate: {}", rule.name, rule.id, fault);
                    false
                }
            };
            if !matched {
                continue;
            }

            score += rule.severity.score() as u32;
            if rule.action == PolicyAction::Block {
                action = PolicyAction::Block;
            } else if rule.action == PolicyAction::Alert && action != PolicyAction::Block {
                action = PolicyAction::Alert;
            }
            violations.push(ViolatedRule {
                id:       rule.id,
                name:     rule.name.clone(),
                action:   rule.action,
                severity: rule.severity,
            });
        }

        if !violations.is_empty() {
            let ids: Vec<i64> = violations.iter().map(|v| v.id).collect();
            if let Err(e) = self.store.bump_rule_hits(&ids).await {
                warn!("rule hit-count update failed: {}", e);
            }
        }

        PolicyReport { score: score.min(100) as u8, action, violations }
    }
}

/// The bound names a condition can see. The pre-parsed tool list is shared
/// with the scanner's extraction pass rather than re-read from the body.
fn condition_context(event: &LoggedEvent) -> Context {
    let tools = Value::List(
        event
            .tool_names
            .iter()
            .map(|t| Value::Str(t.clone()))
            .collect(),
    );
    let agent = event
        .agent_id
        .as_ref()
        .map(|a| Value::Str(a.clone()))
        .unwrap_or(Value::Null);

    let mut obj = HashMap::new();
    obj.insert("model".to_string(), Value::Str(event.model.clone()));
    obj.insert("cost".to_string(), Value::Num(event.cost_usd));
    obj.insert("promptTokens".to_string(), Value::Num(event.prompt_tokens as f64));
    obj.insert(
        "completionTokens".to_string(),
        Value::Num(event.completion_tokens as f64),
    );
    obj.insert("latencyMs".to_string(), Value::Num(event.latency_ms as f64));
    obj.insert("agentId".to_string(), agent.clone());
    obj.insert("tools".to_string(), tools.clone());

    Context::new()
        .bind("event", Value::Obj(obj))
        .bind("tools", tools)
        .bind("model", Value::Str(event.model.clone()))
        .bind("cost", Value::Num(event.cost_usd))
        .bind("agentId", agent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Severity;
    use chrono::Utc;
    use tempfile::TempDir;

    fn event(cost: f64, tools: &[&str]) -> LoggedEvent {
        LoggedEvent {
            id: 1,
            timestamp: Utc::now(),
            tenant_id: "t".into(),
            agent_id: Some("a".into()),
            model: "gpt-4o".into(),
            prompt_tokens: 100,
            completion_tokens: 100,
            cost_usd: cost,
            latency_ms: 10,
            tool_names: tools.iter().map(|s| s.to_string()).collect(),
            request_hash: String::new(),
            response_preview: String::new(),
            risk_score: 0,
            blocked: false,
            flags: vec![],
            raw_request: "{}".into(),
            raw_response: "{}".into(),
        }
    }

    async fn engine_with_rules(
        dir: &TempDir,
        rules: &[(&str, &str, PolicyAction, Severity)],
    ) -> PolicyEngine {
        let store = Arc::new(
            EventStore::open(dir.path().join("test.db").to_str().unwrap()).unwrap(),
        );
        store.create_tenant("t", "key-t", 100_000).await.unwrap();
        for (name, condition, action, severity) in rules {
            store
                .create_rule("t", name, "", condition, *action, *severity)
                .await
                .unwrap();
        }
        PolicyEngine::new(store)
    }

    #[tokio::test]
    async fn block_rule_matches_on_cost() {
        let dir = TempDir::new().unwrap();
        let engine = engine_with_rules(
            &dir,
            &[("expensive calls", "cost > 0.50", PolicyAction::Block, Severity::High)],
        )
        .await;

        let report = engine.evaluate(&event(0.75, &[])).await;
        assert_eq!(report.action, PolicyAction::Block);
        assert_eq!(report.score, 30);
        assert_eq!(report.violations.len(), 1);
        assert_eq!(report.violations[0].name, "expensive calls");
    }

    #[tokio::test]
    async fn non_matching_rules_allow() {
        let dir = TempDir::new().unwrap();
        let engine = engine_with_rules(
            &dir,
            &[("expensive calls", "cost > 0.50", PolicyAction::Block, Severity::High)],
        )
        .await;

        let report = engine.evaluate(&event(0.10, &[])).await;
        assert_eq!(report.action, PolicyAction::Allow);
        assert_eq!(report.score, 0);
        assert!(report.violations.is_empty());
    }

    #[tokio::test]
    async fn alert_does_not_override_block() {
        let dir = TempDir::new().unwrap();
        let engine = engine_with_rules(
            &dir,
            &[
                ("warn on tools", "tools.length > 0", PolicyAction::Alert, Severity::Low),
                ("block files", "tools.includes(\"file_read\")", PolicyAction::Block, Severity::Critical),
            ],
        )
        .await;

        let report = engine.evaluate(&event(0.01, &["file_read"])).await;
        assert_eq!(report.action, PolicyAction::Block);
        assert_eq!(report.score, 50);
        assert_eq!(report.violations.len(), 2);
    }

    #[tokio::test]
    async fn faulting_rule_never_matches_or_starves_others() {
        let dir = TempDir::new().unwrap();
        let engine = engine_with_rules(
            &dir,
            &[
                ("runaway", "while(true){}", PolicyAction::Block, Severity::Critical),
                ("expensive calls", "cost > 0.50", PolicyAction::Alert, Severity::Medium),
            ],
        )
        .await;

        let report = engine.evaluate(&event(0.75, &[])).await;
        assert_eq!(report.action, PolicyAction::Alert);
        assert_eq!(report.violations.len(), 1);
        assert_eq!(report.violations[0].name, "expensive calls");
    }

    #[tokio::test]
    async fn disabled_rules_are_never_evaluated() {
        let dir = TempDir::new().unwrap();
        let engine = engine_with_rules(
            &dir,
            &[("expensive calls", "cost > 0.50", PolicyAction::Block, Severity::High)],
        )
        .await;
        let rule_id = engine.store.enabled_rules("t").await.unwrap()[0].id;
        engine.store.set_rule_enabled(rule_id, false).await.unwrap();
        engine.invalidate("t");

        let report = engine.evaluate(&event(0.75, &[])).await;
        assert_eq!(report.action, PolicyAction::Allow);
        assert!(report.violations.is_empty());
    }

    #[tokio::test]
    async fn matches_bump_hit_counters() {
        let dir = TempDir::new().unwrap();
        let engine = engine_with_rules(
            &dir,
            &[("expensive calls", "cost > 0.50", PolicyAction::Alert, Severity::Low)],
        )
        .await;

        engine.evaluate(&event(0.75, &[])).await;
        engine.evaluate(&event(0.80, &[])).await;

        let rules = engine.store.enabled_rules("t").await.unwrap();
        assert_eq!(rules[0].hits, 2);
    }
}
