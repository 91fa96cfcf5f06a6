// redwall/src/engine/mod.rs
//
// The three-engine security pipeline. Anomaly and injection are pure reads
// over the event (anomaly also appends to its own agent window); policy pulls
// cached rules. All three fan out concurrently and the combiner folds their
// reports into one SecurityDecision.

pub mod anomaly;
pub mod combine;
pub mod injection;
pub mod policy;
pub mod sandbox;

use std::sync::Arc;
use std::time::Instant;

use crate::events::{LoggedEvent, SecurityDecision};
use crate::sink::store::EventStore;
use crate::state::window::WindowStore;

pub struct SecurityPipeline {
    windows: Arc<WindowStore>,
    policy:  policy::PolicyEngine,
}

impl SecurityPipeline {
    pub fn new(windows: Arc<WindowStore>, store: Arc<EventStore>) -> Self {
        Self { windows, policy: policy::PolicyEngine::new(store) }
    }

    /// Score one event. Never fails; engines degrade to empty reports.
    pub async fn evaluate(&self, event: &LoggedEvent) -> SecurityDecision {
        let started = Instant::now();

        let (anomaly, injection, policy) = tokio::join!(
            anomaly::analyze(event, &self.windows),
            injection::scan(event),
            self.policy.evaluate(event),
        );

        combine::combine(
            event.id,
            anomaly,
            injection,
            policy,
            started.elapsed().as_millis() as u64,
        )
    }
}
