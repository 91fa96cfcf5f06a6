// redwall/src/main.rs
//
// Daemon entry point: wires the store, window state, pipeline, registry and
// forwarder into one AppState, spawns the background loops (window eviction,
// subscriber heartbeat, stats line, alert drain), then serves the proxy.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use redwall::config::Config;
use redwall::engine::SecurityPipeline;
use redwall::events::AlertSignal;
use redwall::proxy::{self, AppState, Forwarder};
use redwall::sink::broadcast::SubscriberRegistry;
use redwall::sink::store::EventStore;
use redwall::state::window::WindowStore;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("redwall=info".parse()?),
        )
        .compact()
        .init();

    let config = Config::parse();
    let started = Instant::now();

    let store = Arc::new(EventStore::open(&config.database_path)?);
    let windows = Arc::new(WindowStore::new());
    let pipeline = Arc::new(SecurityPipeline::new(windows.clone(), store.clone()));
    let registry = Arc::new(SubscriberRegistry::new());
    let forwarder = Arc::new(Forwarder::new(
        config.openai_api_key.clone(),
        config.anthropic_api_key.clone(),
    ));
    let (alert_tx, alert_rx) = mpsc::unbounded_channel::<AlertSignal>();

    let state = AppState {
        store,
        pipeline,
        registry: registry.clone(),
        forwarder,
        alerts: alert_tx,
        started,
        upgrade_url: config.upgrade_url.clone(),
    };

    info!(
        "redwall starting on :{} (db={}, openai_key={}, anthropic_key={})",
        config.port,
        config.database_path,
        config.openai_api_key.is_some(),
        config.anthropic_api_key.is_some(),
    );

    tokio::spawn(windows.clone().eviction_loop());
    tokio::spawn(registry.clone().heartbeat_loop());
    tokio::spawn(stats_loop(windows, registry, started));
    tokio::spawn(alert_drain(alert_rx));

    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    axum::serve(listener, proxy::router(state)).await?;
    Ok(())
}

async fn stats_loop(
    windows: Arc<WindowStore>,
    registry: Arc<SubscriberRegistry>,
    started: Instant,
) {
    let mut tick = tokio::time::interval(std::time::Duration::from_secs(30));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tick.tick().await; // immediate first tick carries no information
    loop {
        tick.tick().await;
        let events = windows
            .total_events
            .load(std::sync::atomic::Ordering::Relaxed);
        info!(
            "uptime={}s events={} windows={} subscribers={}",
            started.elapsed().as_secs(),
            events,
            windows.n_windows(),
            registry.n_subscribers(),
        );
    }
}

/// Hand-off point for the external alert dispatcher. Until one is attached,
/// queued signals are surfaced in the log and dropped.
async fn alert_drain(mut rx: mpsc::UnboundedReceiver<AlertSignal>) {
    while let Some(alert) = rx.recv().await {
        warn!(
            "alert queued: event={} tenant={} risk={} blocked={} flags={:?}",
            alert.event_id, alert.tenant_id, alert.risk_score, alert.blocked, alert.flags,
        );
    }
}
