// redwall/src/sink/broadcast.rs
//
// Live event fan-out. Each subscriber owns a bounded mailbox; publish is a
// non-blocking try_send, and a subscriber whose mailbox is full or whose
// channel is gone is dropped on the spot. The registry shard lock is never
// held across an await.
//
// Heartbeat: every 30 s each subscriber gets a ping frame and a 10 s pong
// deadline; missing the deadline force-closes and deregisters it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::events::LoggedEvent;

pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;
pub const PONG_DEADLINE_SECS: u64 = 10;
const MAILBOX_DEPTH: usize = 64;

/// Frames pushed toward one subscriber's socket task.
#[derive(Debug, Clone, PartialEq)]
pub enum OutFrame {
    Event(String), // pre-serialized {"type":"event","payload":...}
    Ping,
}

struct Subscriber {
    tx:            mpsc::Sender<OutFrame>,
    pending_since: Option<Instant>,
}

pub struct SubscriberRegistry {
    subscribers: DashMap<String, HashMap<u64, Subscriber>>,
    next_id:     AtomicU64,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self { subscribers: DashMap::new(), next_id: AtomicU64::new(1) }
    }

    /// Register a subscriber for a tenant; returns its id and mailbox.
    pub fn subscribe(&self, tenant_id: &str) -> (u64, mpsc::Receiver<OutFrame>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(MAILBOX_DEPTH);
        self.subscribers
            .entry(tenant_id.to_string())
            .or_default()
            .insert(id, Subscriber { tx, pending_since: None });
        debug!("subscriber {} joined tenant {}", id, tenant_id);
        (id, rx)
    }

    pub fn unsubscribe(&self, tenant_id: &str, id: u64) {
        if let Some(mut entry) = self.subscribers.get_mut(tenant_id) {
            entry.remove(&id);
        }
        self.subscribers
            .remove_if(tenant_id, |_, subs| subs.is_empty());
    }

    /// A pong arrived for this subscriber; clear its deadline.
    pub fn record_pong(&self, tenant_id: &str, id: u64) {
        if let Some(mut entry) = self.subscribers.get_mut(tenant_id) {
            if let Some(sub) = entry.get_mut(&id) {
                sub.pending_since = None;
            }
        }
    }

    /// Best-effort delivery of a finalized event to every open subscriber of
    /// the tenant. Failing subscribers are dropped.
    pub fn publish(&self, tenant_id: &str, event: &LoggedEvent) {
        let Some(mut entry) = self.subscribers.get_mut(tenant_id) else {
            return;
        };
        let frame = json!({ "type": "event", "payload": event }).to_string();

        let mut dead: Vec<u64> = Vec::new();
        for (id, sub) in entry.iter() {
            if sub.tx.try_send(OutFrame::Event(frame.clone())).is_err() {
                dead.push(*id);
            }
        }
        for id in &dead {
            entry.remove(id);
            warn!("dropped unresponsive subscriber {} of tenant {}", id, tenant_id);
        }
    }

    /// One heartbeat pass: expire subscribers past their pong deadline, then
    /// ping the rest and arm their deadlines.
    pub fn heartbeat_pass(&self, now: Instant) {
        for mut entry in self.subscribers.iter_mut() {
            let mut dead: Vec<u64> = Vec::new();
            for (id, sub) in entry.iter_mut() {
                let expired = sub
                    .pending_since
                    .map(|since| now.duration_since(since).as_secs() >= PONG_DEADLINE_SECS)
                    .unwrap_or(false);
                if expired || sub.tx.try_send(OutFrame::Ping).is_err() {
                    dead.push(*id);
                    continue;
                }
                if sub.pending_since.is_none() {
                    sub.pending_since = Some(now);
                }
            }
            for id in &dead {
                entry.remove(id);
                debug!("heartbeat expired subscriber {}", id);
            }
        }
    }

    pub fn n_subscribers(&self) -> usize {
        self.subscribers.iter().map(|entry| entry.len()).sum()
    }

    pub async fn heartbeat_loop(self: std::sync::Arc<Self>) {
        let mut tick =
            tokio::time::interval(std::time::Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            self.heartbeat_pass(Instant::now());
        }
    }
}

impl Default for SubscriberRegistry {
    fn default() -> Self {
        Self::new()
    }
}
