use super::LastSeen;
use crate::command::{Command, CommandDispatcher, CommandResult};
use crate::device::{ApplianceDetector, Device, DeviceState, Relay};
use crate::event::{DeviceEvent, EventKind, EventSink};
use crate::lifecycle::{LifecycleError, ServiceLifecycle, ServiceWatch};
use crate::storage::DeviceStore;
use crate::worker::{AsyncQueueWorker, QueueHandler, QueueSender, WorkerConfig};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Clone, Debug)]
pub struct ProcessorConfig {
    pub worker: WorkerConfig,
    /// How long an automatic relay-open waits for its result before giving up
    pub command_timeout: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            worker: WorkerConfig::default(),
            command_timeout: Duration::from_secs(30),
        }
    }
}

/// Result of diffing one snapshot.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DiffOutcome {
    /// Events emitted, in the order they were detected
    pub events: Vec<DeviceEvent>,
    /// Whether the device record was written
    pub persisted: bool,
}

impl DiffOutcome {
    pub fn kinds(&self) -> Vec<EventKind> {
        self.events.iter().map(|e| e.kind).collect()
    }
}

/// Everything decided inside the transaction, acted on after commit.
struct DiffPlan {
    device: Device,
    events: Vec<(EventKind, Option<HashMap<String, String>>)>,
    persisted: bool,
    /// Detector flip time for which `ON_TOO_LONG` fires now
    on_too_long: Option<DateTime<Utc>>,
    open_relay: bool,
}

struct DiffEngine {
    store: Arc<DeviceStore>,
    sink: Arc<dyn EventSink>,
    dispatcher: Arc<CommandDispatcher>,
    last_seen: LastSeen,
    /// detection_id -> detector flip time already reported as on too long
    on_too_long_sent: DashMap<String, DateTime<Utc>>,
    command_timeout: Duration,
}

impl DiffEngine {
    fn process(&self, snapshot: &DeviceState) -> Result<DiffOutcome> {
        let detection_id = snapshot.detection_id.as_str();
        self.last_seen.record(detection_id, snapshot.timestamp);

        let already_sent = self
            .on_too_long_sent
            .get(detection_id)
            .map(|entry| *entry.value());

        let plan = self
            .store
            .exec(|tx| {
                let existing = tx.find(detection_id)?;
                let mut plan = diff(existing, snapshot, already_sent);
                if plan.persisted {
                    tx.save(&mut plan.device)?;
                }
                Ok(plan)
            })
            .with_context(|| format!("Failed to apply snapshot for device {}", detection_id))?;

        // Committed: only now do side effects become visible
        if let Some(flipped_at) = plan.on_too_long {
            self.on_too_long_sent
                .insert(detection_id.to_string(), flipped_at);
        }

        let events: Vec<DeviceEvent> = plan
            .events
            .into_iter()
            .map(|(kind, data)| DeviceEvent::new(&plan.device, kind, data))
            .collect();
        for event in &events {
            self.sink.accept(event.clone());
        }

        if plan.open_relay {
            self.open_relay(detection_id);
        }

        if plan.persisted || !events.is_empty() {
            debug!(
                detection_id = %detection_id,
                persisted = plan.persisted,
                events = events.len(),
                "Snapshot applied"
            );
        }

        Ok(DiffOutcome {
            events,
            persisted: plan.persisted,
        })
    }

    /// Fire-and-forget: the result is only logged.
    fn open_relay(&self, detection_id: &str) {
        info!(detection_id = %detection_id, "Appliance on too long, opening relay");
        let ticket = self.dispatcher.dispatch(detection_id, Command::OpenRelay);

        if let Some(result) = ticket.immediate() {
            log_auto_open(detection_id, result);
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(detection_id = %detection_id, "No runtime to await relay open result");
            return;
        };
        let detection_id = detection_id.to_string();
        let timeout = self.command_timeout;
        runtime.spawn(async move {
            let result = ticket.wait(timeout).await;
            log_auto_open(&detection_id, result);
        });
    }
}

fn log_auto_open(detection_id: &str, result: CommandResult) {
    if result == CommandResult::Success {
        info!(detection_id = %detection_id, "Relay opened");
    } else {
        warn!(detection_id = %detection_id, result = ?result, "Automatic relay open did not succeed");
    }
}

/// The diff proper. Pure: decides events and the new record without I/O.
///
/// The snapshot timestamp is used as "now" for flips and the on-too-long check.
fn diff(
    existing: Option<Device>,
    snapshot: &DeviceState,
    on_too_long_sent: Option<DateTime<Utc>>,
) -> DiffPlan {
    let at = snapshot.timestamp;
    let mut events = Vec::new();

    // Identity and connectivity
    let (mut device, mut changed) = match existing {
        None => {
            events.push((EventKind::NewDevice, Some(snapshot.details.clone())));
            (Device::from_snapshot(snapshot), true)
        }
        Some(mut device) => {
            let mut changed = false;
            if device.connected != snapshot.connected {
                device.connected = snapshot.connected;
                let kind = if snapshot.connected {
                    EventKind::Connected
                } else {
                    EventKind::ConnectionLost
                };
                events.push((kind, None));
                changed = true;
            }
            if device.details != snapshot.details {
                device.details = snapshot.details.clone();
                events.push((EventKind::DetailsChanged, Some(snapshot.details.clone())));
                changed = true;
            }
            (device, changed)
        }
    };

    // Relay: first observation is stored silently
    if let Some(closed) = snapshot.relay_closed {
        match device.relay.as_mut() {
            None => {
                device.relay = Some(Relay::new(closed, at));
                changed = true;
            }
            Some(relay) => {
                if relay.set_closed(closed, at) {
                    let kind = if closed {
                        EventKind::RelayClosed
                    } else {
                        EventKind::RelayOpened
                    };
                    events.push((kind, None));
                    changed = true;
                }
            }
        }
    }

    // Appliance detection
    let mut on_too_long = None;
    let mut open_relay = false;
    if let Some(watts) = snapshot.instantaneous_watts {
        match device.appliance_detector.as_mut() {
            None => {
                device.appliance_detector = Some(ApplianceDetector::new(watts, at));
                changed = true;
            }
            Some(detector) => {
                if detector.observe(watts, at) {
                    let kind = if detector.on {
                        EventKind::ApplianceOn
                    } else {
                        EventKind::ApplianceOff
                    };
                    events.push((kind, None));
                    changed = true;
                }
            }
        }

        if let Some(detector) = &device.appliance_detector {
            if detector.is_on_too_long(at) && on_too_long_sent != Some(detector.last_state_change) {
                events.push((EventKind::OnTooLong, None));
                on_too_long = Some(detector.last_state_change);
                open_relay = device.relay.is_some();
            }
        }
    }

    DiffPlan {
        device,
        events,
        persisted: changed,
        on_too_long,
        open_relay,
    }
}

#[async_trait]
impl QueueHandler<DeviceState> for DiffEngine {
    async fn handle(&self, snapshot: DeviceState) -> Result<()> {
        // Errors are logged by the worker; the snapshot is dropped
        self.process(&snapshot).map(|_| ())
    }
}

/// Serial consumer of device snapshots.
///
/// Persists each diff inside one transaction, emits events to the sink only
/// after commit, and asks the dispatcher to open the relay of an appliance
/// that has been on too long. A snapshot whose transaction fails is dropped
/// without events; the next snapshot re-diffs against what was committed.
pub struct DeviceStateProcessor {
    engine: Arc<DiffEngine>,
    worker: Arc<AsyncQueueWorker<DeviceState>>,
    lifecycle: ServiceLifecycle,
}

impl DeviceStateProcessor {
    pub fn new(
        store: Arc<DeviceStore>,
        sink: Arc<dyn EventSink>,
        dispatcher: Arc<CommandDispatcher>,
        last_seen: LastSeen,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            engine: Arc::new(DiffEngine {
                store,
                sink,
                dispatcher,
                last_seen,
                on_too_long_sent: DashMap::new(),
                command_timeout: config.command_timeout,
            }),
            worker: Arc::new(AsyncQueueWorker::new("device-state", config.worker)),
            lifecycle: ServiceLifecycle::new("device-state-processor"),
        }
    }

    /// Queues a snapshot for diffing. Never blocks.
    pub fn accept(&self, snapshot: DeviceState) {
        self.worker.accept(snapshot);
    }

    /// Producer handle for family managers.
    pub fn sender(&self) -> QueueSender<DeviceState> {
        self.worker.sender()
    }

    pub fn queue_depth(&self) -> usize {
        self.worker.depth()
    }

    pub fn last_seen(&self) -> &LastSeen {
        &self.engine.last_seen
    }

    /// Diffs one snapshot immediately, bypassing the queue.
    ///
    /// Callers must not run this concurrently with the started processor.
    pub fn handle_snapshot(&self, snapshot: &DeviceState) -> Result<DiffOutcome> {
        self.engine.process(snapshot)
    }

    pub fn start(&self) -> Result<(), LifecycleError> {
        let worker = Arc::clone(&self.worker);
        let handler: Arc<dyn QueueHandler<DeviceState>> = self.engine.clone();
        self.lifecycle
            .start(move |cancel| async move { worker.run(handler, cancel).await })
    }

    pub async fn stop(&self) {
        self.lifecycle.stop().await;
    }

    pub fn watch(&self) -> ServiceWatch {
        self.lifecycle.watch()
    }
}
