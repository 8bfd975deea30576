use anyhow::{Context, Result};
use device_manager::registry::build_managers;
use device_manager::{ManagerContext, StaticSearcher};
use devgate::command::CommandDispatcher;
use devgate::config::GatewayConfig;
use devgate::discovery::DiscoveryRegistry;
use devgate::event::{BroadcastEventSink, DeviceEvent, EventSink, FanOutSink, LoggingEventSink};
use devgate::lifecycle::ServiceLifecycle;
use devgate::offline::OfflineMarker;
use devgate::state::{DeviceStateProcessor, LastSeen};
use devgate::storage::DeviceStore;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Events buffered per broadcast subscriber before it starts lagging
const EVENT_BUFFER: usize = 1024;

/// Counts events by kind until cancelled, for the shutdown summary.
async fn tally_events(
    mut events: broadcast::Receiver<DeviceEvent>,
    cancel: CancellationToken,
) -> BTreeMap<String, u64> {
    let mut counts = BTreeMap::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = events.recv() => match received {
                Ok(event) => *counts.entry(format!("{:?}", event.kind)).or_insert(0) += 1,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped = skipped, "Event tally fell behind");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
    counts
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "devgate=info,device_manager=info".into()),
        )
        .init();

    info!("devgate starting...");

    let config = GatewayConfig::from_env().context("Failed to load configuration")?;
    info!(
        database = %config.storage.database,
        static_devices = config.discovery.static_devices.len(),
        "Configuration loaded"
    );

    let store = Arc::new(
        DeviceStore::new(&config.storage.database).context("Failed to open device store")?,
    );
    let events = Arc::new(BroadcastEventSink::new(EVENT_BUFFER));
    let tally_cancel = CancellationToken::new();
    let tally = tokio::spawn(tally_events(events.subscribe(), tally_cancel.clone()));
    let logging: Arc<dyn EventSink> = Arc::new(LoggingEventSink);
    let published: Arc<dyn EventSink> = events;
    let sink: Arc<dyn EventSink> = Arc::new(FanOutSink::new(vec![logging, published]));
    let dispatcher = Arc::new(CommandDispatcher::new());
    let last_seen = LastSeen::new();

    // State processor first: every manager waits for it
    let processor = DeviceStateProcessor::new(
        Arc::clone(&store),
        Arc::clone(&sink),
        Arc::clone(&dispatcher),
        last_seen.clone(),
        config.processor_config(),
    );
    processor.start()?;

    let offline = Arc::new(OfflineMarker::new(
        Arc::clone(&store),
        Arc::clone(&dispatcher),
        last_seen,
        Arc::clone(&sink),
        config.offline.offline_config(),
    ));
    let offline_service = ServiceLifecycle::new("offline-marker");
    {
        let offline = Arc::clone(&offline);
        offline_service.start(move |cancel| async move { offline.run(cancel).await })?;
    }

    let searcher = Arc::new(StaticSearcher::new(config.discovery.static_announcements()));
    let registry = Arc::new(DiscoveryRegistry::new(
        searcher,
        config.discovery.discovery_config(),
    ));

    let ctx = ManagerContext {
        snapshots: processor.sender(),
        dispatcher: Arc::clone(&dispatcher),
        offline: Arc::clone(&offline),
        processor: processor.watch(),
        worker: config.worker.worker_config(),
        startup_timeout: Duration::from_secs(10),
    };
    let managers = build_managers(&config.families, &ctx);
    for manager in &managers {
        manager.register_discovery(&registry);
        manager
            .start()
            .await
            .with_context(|| format!("Failed to start {} manager", manager.name()))?;
    }
    info!(managers = managers.len(), "Device managers started");

    let discovery_service = ServiceLifecycle::new("discovery");
    {
        let registry = Arc::clone(&registry);
        discovery_service.start(move |cancel| async move { registry.run(cancel).await })?;
    }

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl_c signal")?;
    info!("Shutdown signal received");

    // Producers first, then the consumers they feed
    discovery_service.stop().await;
    for manager in &managers {
        manager.stop().await;
    }
    offline_service.stop().await;
    processor.stop().await;

    tally_cancel.cancel();
    match tally.await {
        Ok(counts) => info!(events = ?counts, "Device events this run"),
        Err(e) => warn!(error = %e, "Event tally task failed"),
    }
    info!("devgate stopped");

    Ok(())
}
