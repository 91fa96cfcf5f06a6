// redwall/src/state/window.rs
//
// Per-(tenant, agent) sliding windows behind a sharded concurrent map.
// DashMap keeps window lookups lock-free across tasks; each window is a
// single mutable region serialized by its own RwLock.
//
//   - call / error timestamps: VecDeque, time-bounded
//   - observed tools: (timestamp, name) pairs, same retention
//   - eviction sweep: every 60 s, drops entries older than 10 min and
//     removes windows with no remaining call timestamps
//
// Agent ids are namespaced by tenant; calls without an agent id land in a
// reserved per-tenant "anonymous" bucket.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::debug;

pub const W_RETENTION_SECS: i64 = 600; // 10 min
pub const SWEEP_INTERVAL_SECS: u64 = 60;

pub const ANONYMOUS_AGENT: &str = "anonymous";

// ── Window key ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct WindowKey {
    pub tenant_id: String,
    pub agent_id:  String,
}

impl WindowKey {
    pub fn new(tenant_id: &str, agent_id: Option<&str>) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            agent_id:  agent_id.unwrap_or(ANONYMOUS_AGENT).to_string(),
        }
    }
}

// ── Per-agent window ──────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct AgentWindow {
    pub call_timestamps:  VecDeque<DateTime<Utc>>,
    pub error_timestamps: VecDeque<DateTime<Utc>>,
    pub observed_tools:   VecDeque<(DateTime<Utc>, String)>,
}

impl AgentWindow {
    pub fn record(&mut self, now: DateTime<Utc>, tools: &[String], is_error: bool) {
        self.call_timestamps.push_back(now);
        for tool in tools {
            self.observed_tools.push_back((now, tool.clone()));
        }
        if is_error {
            self.error_timestamps.push_back(now);
        }
    }

    pub fn calls_within(&self, seconds: i64) -> usize {
        let cutoff = Utc::now() - Duration::seconds(seconds);
        self.call_timestamps.iter().filter(|t| **t >= cutoff).count()
    }

    pub fn errors_within(&self, seconds: i64) -> usize {
        let cutoff = Utc::now() - Duration::seconds(seconds);
        self.error_timestamps.iter().filter(|t| **t >= cutoff).count()
    }

    pub fn distinct_tools(&self) -> usize {
        self.observed_tools
            .iter()
            .map(|(_, name)| name.as_str())
            .collect::<HashSet<_>>()
            .len()
    }

    /// Drop everything older than the retention horizon.
    pub fn expire_old(&mut self, now: DateTime<Utc>) {
        let cutoff = now - Duration::seconds(W_RETENTION_SECS);
        while self.call_timestamps.front().map(|t| *t < cutoff).unwrap_or(false) {
            self.call_timestamps.pop_front();
        }
        while self.error_timestamps.front().map(|t| *t < cutoff).unwrap_or(false) {
            self.error_timestamps.pop_front();
        }
        while self.observed_tools.front().map(|(t, _)| *t < cutoff).unwrap_or(false) {
            self.observed_tools.pop_front();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.call_timestamps.is_empty()
    }
}

// ── Store ─────────────────────────────────────────────────────────────────────

pub struct WindowStore {
    windows: DashMap<WindowKey, Arc<RwLock<AgentWindow>>>,
    pub total_events: AtomicU64,
}

impl WindowStore {
    pub fn new() -> Self {
        Self { windows: DashMap::new(), total_events: AtomicU64::new(0) }
    }

    /// Record one call into its window and return a handle for rule reads.
    pub fn record(
        &self,
        tenant_id: &str,
        agent_id: Option<&str>,
        now: DateTime<Utc>,
        tools: &[String],
        is_error: bool,
    ) -> Arc<RwLock<AgentWindow>> {
        self.total_events.fetch_add(1, Ordering::Relaxed);
        let window = self
            .windows
            .entry(WindowKey::new(tenant_id, agent_id))
            .or_default()
            .clone();
        window.write().record(now, tools, is_error);
        window
    }

    pub fn get(&self, tenant_id: &str, agent_id: Option<&str>) -> Option<Arc<RwLock<AgentWindow>>> {
        self.windows
            .get(&WindowKey::new(tenant_id, agent_id))
            .map(|w| w.clone())
    }

    pub fn n_windows(&self) -> usize {
        self.windows.len()
    }

    /// One eviction pass: prune every window, then drop the empty ones.
    pub fn sweep(&self, now: DateTime<Utc>) {
        for entry in self.windows.iter() {
            entry.value().write().expire_old(now);
        }
        let before = self.windows.len();
        self.windows.retain(|_, w| !w.read().is_empty());
        let removed = before - self.windows.len();
        if removed > 0 {
            debug!("window sweep removed {} idle windows", removed);
        }
    }

    pub async fn eviction_loop(self: Arc<Self>) {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(SWEEP_INTERVAL_SECS));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            self.sweep(Utc::now());
        }
    }
}

impl Default for WindowStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs_ago(n: i64) -> DateTime<Utc> {
        Utc::now() - Duration::seconds(n)
    }

    #[test]
    fn anonymous_bucket_is_per_tenant() {
        let store = WindowStore::new();
        store.record("t1", None, Utc::now(), &[], false);
        store.record("t2", None, Utc::now(), &[], false);
        assert_eq!(store.n_windows(), 2);
        assert_eq!(store.get("t1", None).unwrap().read().calls_within(60), 1);
    }

    #[test]
    fn counts_respect_cutoffs() {
        let store = WindowStore::new();
        let w = store.record("t", Some("a"), secs_ago(30), &[], true);
        w.write().record(secs_ago(5), &["file_read".into()], false);
        w.write().record(Utc::now(), &["file_read".into(), "shell".into()], false);

        let w = w.read();
        assert_eq!(w.calls_within(10), 2);
        assert_eq!(w.calls_within(60), 3);
        assert_eq!(w.errors_within(600), 1);
        assert_eq!(w.distinct_tools(), 2);
    }

    #[test]
    fn sweep_prunes_and_removes_empty_windows() {
        let store = WindowStore::new();
        let now = Utc::now();

        // One stale window, one with a fresh call.
        store.record("t", Some("stale"), now - Duration::seconds(700), &["x".into()], true);
        store.record("t", Some("live"), now - Duration::seconds(700), &[], false);
        store
            .get("t", Some("live"))
            .unwrap()
            .write()
            .record(now, &[], false);

        store.sweep(now);

        assert!(store.get("t", Some("stale")).is_none());
        let live = store.get("t", Some("live")).unwrap();
        let live = live.read();
        assert_eq!(live.call_timestamps.len(), 1);
        assert_eq!(live.error_timestamps.len(), 0);
    }

    #[test]
    fn tools_expire_with_retention() {
        let store = WindowStore::new();
        let now = Utc::now();
        let w = store.record("t", Some("a"), now - Duration::seconds(700), &["old_tool".into()], false);
        w.write().record(now, &["new_tool".into()], false);
        w.write().expire_old(now);
        assert_eq!(w.read().distinct_tools(), 1);
    }
}
