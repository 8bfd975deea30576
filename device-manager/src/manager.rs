//! Family managers - One composition object per device family.
//!
//! A family only describes how to recognize, identify and talk to its devices
//! ([`DeviceFamily`]). [`FamilyManager`] supplies everything else: the
//! announcement queue, the connector map, the poll loop and the command
//! executor.

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use devgate::command::{CommandDispatcher, CommandExecutor, ExecutorHandle};
use devgate::connector::DeviceConnector;
use devgate::device::DeviceState;
use devgate::discovery::{DiscoveryRegistry, ServiceAnnouncement};
use devgate::lifecycle::{ServiceLifecycle, ServiceWatch};
use devgate::offline::OfflineMarker;
use devgate::worker::{AsyncQueueWorker, QueueHandler, QueueSender, WorkerConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Capability the daemon sees for every family.
#[async_trait]
pub trait DeviceManager: Send + Sync {
    fn name(&self) -> &str;

    /// Detection ids of the devices with a live connector.
    fn list_devices(&self) -> Vec<String>;

    /// Claims this family's announcements in the discovery registry.
    fn register_discovery(&self, registry: &DiscoveryRegistry);

    /// Starts the manager's services. Fails if the state processor is not running.
    async fn start(&self) -> Result<()>;

    async fn stop(&self);
}

/// Family-specific behaviour plugged into a [`FamilyManager`].
#[async_trait]
pub trait DeviceFamily: Send + Sync + 'static {
    type Connector: DeviceConnector + 'static;

    /// Family name (e.g., "plug")
    fn name(&self) -> &str;

    /// Discovery priority; lower numbers are asked first.
    fn priority(&self) -> i32;

    fn matches(&self, announcement: &ServiceAnnouncement) -> bool;

    /// Key under which announcements are grouped into one connector.
    fn device_key(&self, announcement: &ServiceAnnouncement) -> String;

    /// Builds a connector for a device seen for the first time.
    ///
    /// Device I/O, here and in the connector, goes through `commands` so one
    /// family never talks to its devices concurrently. Returns `None` when the
    /// device cannot be reached yet; the next announcement will try again.
    async fn create_connector(
        &self,
        announcement: &ServiceAnnouncement,
        commands: ExecutorHandle,
    ) -> Option<Arc<Self::Connector>>;

    /// Folds an announcement into an existing connector. A returned snapshot
    /// is sent to the state processor.
    fn absorb(
        &self,
        connector: &Self::Connector,
        announcement: &ServiceAnnouncement,
    ) -> Option<DeviceState>;

    /// How often connectors are polled. `None` disables polling.
    fn poll_interval(&self) -> Option<Duration>;
}

/// Shared core services handed to every manager.
#[derive(Clone)]
pub struct ManagerContext {
    /// Input queue of the state processor
    pub snapshots: QueueSender<DeviceState>,
    pub dispatcher: Arc<CommandDispatcher>,
    pub offline: Arc<OfflineMarker>,
    /// State processor lifecycle, waited on before starting
    pub processor: ServiceWatch,
    pub worker: WorkerConfig,
    pub startup_timeout: Duration,
}

type ConnectorMap<C> = Arc<DashMap<String, Arc<C>>>;

/// Manager for one family: announcement intake, connector map, poll loop
/// and serial command execution.
pub struct FamilyManager<F: DeviceFamily> {
    family: Arc<F>,
    ctx: ManagerContext,
    announcements: Arc<AsyncQueueWorker<ServiceAnnouncement>>,
    connectors: ConnectorMap<F::Connector>,
    executor: CommandExecutor,
    intake: ServiceLifecycle,
    poller: ServiceLifecycle,
}

impl<F: DeviceFamily> FamilyManager<F> {
    pub fn new(family: F, ctx: ManagerContext) -> Self {
        let name = family.name().to_string();
        Self {
            announcements: Arc::new(AsyncQueueWorker::new(
                format!("{}-announcements", name),
                ctx.worker.clone(),
            )),
            executor: CommandExecutor::new(name.clone(), ctx.worker.clone()),
            intake: ServiceLifecycle::new(format!("{}-intake", name)),
            poller: ServiceLifecycle::new(format!("{}-poller", name)),
            connectors: Arc::new(DashMap::new()),
            family: Arc::new(family),
            ctx,
        }
    }

    /// Queues an announcement as if discovery had routed it here.
    pub fn accept(&self, announcement: ServiceAnnouncement) {
        self.announcements.accept(announcement);
    }

    pub fn family(&self) -> &F {
        &self.family
    }
}

#[async_trait]
impl<F: DeviceFamily> DeviceManager for FamilyManager<F> {
    fn name(&self) -> &str {
        self.family.name()
    }

    fn list_devices(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .connectors
            .iter()
            .map(|entry| entry.value().device_id().to_string())
            .collect();
        ids.sort();
        ids
    }

    fn register_discovery(&self, registry: &DiscoveryRegistry) {
        let family = Arc::clone(&self.family);
        registry.register(
            self.family.priority(),
            move |announcement| family.matches(announcement),
            Arc::new(self.announcements.sender()),
        );
        info!(family = %self.family.name(), priority = self.family.priority(), "Registered for discovery");
    }

    async fn start(&self) -> Result<()> {
        let name = self.family.name().to_string();
        self.ctx
            .processor
            .wait_until_running(self.ctx.startup_timeout)
            .await
            .with_context(|| format!("{} manager cannot start", name))?;

        self.executor.start()?;

        let intake: Arc<dyn QueueHandler<ServiceAnnouncement>> = Arc::new(Intake {
            family: Arc::clone(&self.family),
            connectors: Arc::clone(&self.connectors),
            snapshots: self.ctx.snapshots.clone(),
            dispatcher: Arc::clone(&self.ctx.dispatcher),
            commands: self.executor.handle(),
        });
        let announcements = Arc::clone(&self.announcements);
        self.intake
            .start(move |cancel| async move { announcements.run(intake, cancel).await })?;

        if let Some(interval) = self.family.poll_interval() {
            let connectors = Arc::clone(&self.connectors);
            let snapshots = self.ctx.snapshots.clone();
            let offline = Arc::clone(&self.ctx.offline);
            self.poller.start(move |cancel| {
                poll_loop(connectors, interval, snapshots, offline, cancel)
            })?;
        }

        info!(family = %name, "Device manager started");
        Ok(())
    }

    async fn stop(&self) {
        self.poller.stop().await;
        self.intake.stop().await;
        self.executor.stop().await;

        for entry in self.connectors.iter() {
            self.ctx.dispatcher.unregister(entry.value().device_id());
        }
        info!(family = %self.family.name(), "Device manager stopped");
    }
}

/// Turns claimed announcements into connectors and snapshots.
struct Intake<F: DeviceFamily> {
    family: Arc<F>,
    connectors: ConnectorMap<F::Connector>,
    snapshots: QueueSender<DeviceState>,
    dispatcher: Arc<CommandDispatcher>,
    commands: ExecutorHandle,
}

#[async_trait]
impl<F: DeviceFamily> QueueHandler<ServiceAnnouncement> for Intake<F> {
    async fn handle(&self, announcement: ServiceAnnouncement) -> Result<()> {
        let key = self.family.device_key(&announcement);
        let existing = self
            .connectors
            .get(&key)
            .map(|entry| Arc::clone(entry.value()));

        if let Some(connector) = existing {
            if let Some(snapshot) = self.family.absorb(&connector, &announcement) {
                self.snapshots.accept(snapshot);
            }
            return Ok(());
        }

        let Some(connector) = self
            .family
            .create_connector(&announcement, self.commands.clone())
            .await
        else {
            debug!(family = %self.family.name(), key = %key, "Device not reachable yet");
            return Ok(());
        };

        if !connector.connect().await {
            warn!(family = %self.family.name(), key = %key, "Failed to connect to new device");
            return Ok(());
        }

        info!(
            family = %self.family.name(),
            key = %key,
            detection_id = %connector.device_id(),
            "New device connector"
        );
        self.connectors.insert(key, Arc::clone(&connector));
        self.dispatcher.register(connector.clone());

        // Families that learn nothing from announcements report through a poll
        let snapshot = match self.family.absorb(&connector, &announcement) {
            Some(snapshot) => Some(snapshot),
            None => connector.poll().await,
        };
        if let Some(snapshot) = snapshot {
            self.snapshots.accept(snapshot);
        }
        Ok(())
    }
}

async fn poll_loop<C: DeviceConnector + 'static>(
    connectors: ConnectorMap<C>,
    interval: Duration,
    snapshots: QueueSender<DeviceState>,
    offline: Arc<OfflineMarker>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                // Copy out so no map shard is locked across device I/O
                let live: Vec<Arc<C>> = connectors.iter().map(|e| Arc::clone(e.value())).collect();
                for connector in live {
                    if cancel.is_cancelled() {
                        break;
                    }
                    if let Some(snapshot) = connector.poll().await {
                        snapshots.accept(snapshot);
                    }
                    if !connector.is_connected() {
                        if let Err(e) = offline.mark_offline(connector.device_id()).await {
                            warn!(
                                detection_id = %connector.device_id(),
                                error = %format!("{:#}", e),
                                "Failed to mark unreachable device offline"
                            );
                        }
                    }
                }
            }
        }
    }
    Ok(())
}
