// redwall/src/engine/combine.rs
//
// Weighted blend of the three engine scores into one risk figure, plus the
// disjunctive block decision. Scores are always computed in full even when
// one engine already mandates a block, so telemetry stays complete.

use crate::events::{
    AnomalyReport, InjectionReport, PolicyAction, PolicyReport, SecurityDecision,
};

const W_ANOMALY: f64 = 0.35;
const W_INJECTION: f64 = 0.45;
const W_POLICY: f64 = 0.20;

const INJECTION_BLOCK_CONFIDENCE: u8 = 80;

fn clamp_score(raw: f64) -> f64 {
    if !raw.is_finite() {
        return 0.0;
    }
    raw.clamp(0.0, 100.0)
}

pub fn combine(
    event_id: i64,
    anomaly: AnomalyReport,
    injection: InjectionReport,
    policy: PolicyReport,
    processing_ms: u64,
) -> SecurityDecision {
    let risk = W_ANOMALY * clamp_score(anomaly.score as f64)
        + W_INJECTION * clamp_score(injection.score as f64)
        + W_POLICY * clamp_score(policy.score as f64);
    let risk_score = risk.round().clamp(0.0, 100.0) as u8;

    let blocked = anomaly.should_block
        || injection.confidence >= INJECTION_BLOCK_CONFIDENCE
        || policy.action == PolicyAction::Block;

    // Deduplicated union, first-seen order: anomaly flags, then scanner
    // pattern names, then violated rule names.
    let mut flags: Vec<String> = Vec::new();
    let mut push = |name: &str, flags: &mut Vec<String>| {
        if !flags.iter().any(|f| f == name) {
            flags.push(name.to_string());
        }
    };
    for flag in &anomaly.flags {
        push(flag, &mut flags);
    }
    for pattern in &injection.patterns {
        push(&pattern.name, &mut flags);
    }
    for violation in &policy.violations {
        push(&violation.name, &mut flags);
    }

    SecurityDecision {
        event_id,
        risk_score,
        blocked,
        flags,
        anomaly,
        injection,
        policy,
        processing_ms,
    }
}
