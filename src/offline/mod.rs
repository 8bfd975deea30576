//! Absence detection for devices that silently stop reporting.

use crate::command::CommandDispatcher;
use crate::device::Device;
use crate::event::{DeviceEvent, EventKind, EventSink};
use crate::state::LastSeen;
use crate::storage::DeviceStore;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Clone, Debug)]
pub struct OfflineConfig {
    /// Delay before the first sweep
    pub initial_delay: Duration,
    /// Time between sweeps
    pub period: Duration,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(60),
            period: Duration::from_secs(30),
        }
    }
}

/// Marks connected devices offline once they have been silent for longer
/// than their connector's offline delay.
///
/// A device with no live connector registered is marked offline on the next
/// sweep. A device not seen since startup is measured from the marker's start
/// time.
pub struct OfflineMarker {
    store: Arc<DeviceStore>,
    dispatcher: Arc<CommandDispatcher>,
    last_seen: LastSeen,
    sink: Arc<dyn EventSink>,
    config: OfflineConfig,
    started_at: DateTime<Utc>,
    /// Serializes the sweep and the immediate path
    marking: Mutex<()>,
}

impl OfflineMarker {
    pub fn new(
        store: Arc<DeviceStore>,
        dispatcher: Arc<CommandDispatcher>,
        last_seen: LastSeen,
        sink: Arc<dyn EventSink>,
        config: OfflineConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            last_seen,
            sink,
            config,
            started_at: Utc::now(),
            marking: Mutex::new(()),
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Sweeps after the initial delay, then once per period, until cancelled.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(self.config.initial_delay) => {}
        }

        let mut interval = tokio::time::interval(self.config.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    // A panic in one sweep must not end the loop
                    if AssertUnwindSafe(self.sweep(Utc::now())).catch_unwind().await.is_err() {
                        error!("Offline sweep panicked, continuing");
                    }
                }
            }
        }

        info!("Offline marker stopped");
        Ok(())
    }

    /// Checks every connected device against `now`. Returns how many were marked offline.
    pub async fn sweep(&self, now: DateTime<Utc>) -> usize {
        let _marking = self.marking.lock().await;

        let connected = match self.store.exec(|tx| tx.list_connected()) {
            Ok(devices) => devices,
            Err(e) => {
                error!(error = %format!("{:#}", e), "Offline sweep could not list devices");
                return 0;
            }
        };

        let mut marked = 0;
        for device in connected {
            let id = device.detection_id.as_str();
            if !self.is_overdue(id, now) {
                continue;
            }
            match self.mark(id) {
                Ok(true) => marked += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(detection_id = %id, error = %format!("{:#}", e), "Failed to mark device offline");
                }
            }
        }

        if marked > 0 {
            info!(marked = marked, "Offline sweep marked devices offline");
        }
        marked
    }

    /// Marks a device offline right away, e.g. after a failed poll.
    ///
    /// Returns false when the device is unknown or already offline; no event
    /// is emitted in that case.
    pub async fn mark_offline(&self, detection_id: &str) -> Result<bool> {
        let _marking = self.marking.lock().await;
        self.mark(detection_id)
    }

    fn is_overdue(&self, detection_id: &str, now: DateTime<Utc>) -> bool {
        let Some(delay) = self.dispatcher.offline_delay(detection_id) else {
            debug!(detection_id = %detection_id, "No live connector, treating as offline");
            return true;
        };

        let baseline = self
            .last_seen
            .get(detection_id)
            .unwrap_or(self.started_at);

        // Negative elapsed (clock skew, future timestamps) is never overdue
        match (now - baseline).to_std() {
            Ok(elapsed) => elapsed > delay,
            Err(_) => false,
        }
    }

    fn mark(&self, detection_id: &str) -> Result<bool> {
        let marked: Option<Device> = self
            .store
            .exec(|tx| {
                let Some(mut device) = tx.find(detection_id)? else {
                    return Ok(None);
                };
                if !device.connected {
                    return Ok(None);
                }
                device.connected = false;
                tx.save(&mut device)?;
                Ok(Some(device))
            })
            .with_context(|| format!("Failed to mark device {} offline", detection_id))?;

        let Some(device) = marked else {
            return Ok(false);
        };

        info!(detection_id = %detection_id, "Device marked offline");
        self.sink
            .accept(DeviceEvent::new(&device, EventKind::ConnectionLost, None));
        Ok(true)
    }
}
