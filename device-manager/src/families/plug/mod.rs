//! HTTP/JSON smart plugs with a switchable relay and a power meter.

pub mod api;

use self::api::{PlugClient, PlugError, PlugStatus};
use crate::manager::DeviceFamily;
use async_trait::async_trait;
use devgate::command::{Command, CommandResult, CommandTicket, ExecutorHandle};
use devgate::connector::DeviceConnector;
use devgate::device::{DeviceState, FRIENDLY_NAME};
use devgate::discovery::ServiceAnnouncement;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

/// Service type prefix advertised by plugs
pub const PLUG_SERVICE_PREFIX: &str = "urn:devgate:device:plug:";

pub const PLUG_PRIORITY: i32 = 10;

pub struct PlugFamily {
    poll_interval: Duration,
    offline_delay: Duration,
    request_timeout: Duration,
}

impl PlugFamily {
    pub fn new(poll_interval: Duration, offline_delay: Duration, request_timeout: Duration) -> Self {
        Self {
            poll_interval,
            offline_delay,
            request_timeout,
        }
    }
}

#[async_trait]
impl DeviceFamily for PlugFamily {
    type Connector = PlugConnector;

    fn name(&self) -> &str {
        "plug"
    }

    fn priority(&self) -> i32 {
        PLUG_PRIORITY
    }

    fn matches(&self, announcement: &ServiceAnnouncement) -> bool {
        announcement.service_type.starts_with(PLUG_SERVICE_PREFIX)
    }

    fn device_key(&self, announcement: &ServiceAnnouncement) -> String {
        announcement.serial_number.clone()
    }

    async fn create_connector(
        &self,
        announcement: &ServiceAnnouncement,
        commands: ExecutorHandle,
    ) -> Option<Arc<PlugConnector>> {
        let client = match PlugClient::new(announcement.location.clone(), self.request_timeout) {
            Ok(client) => client,
            Err(e) => {
                warn!(location = %announcement.location, error = %e, "Failed to build plug client");
                return None;
            }
        };

        // The MAC is the detection id, so it must be known before registering
        let probe = client.clone();
        let status = match commands
            .run(format!("probe {}", announcement.location), async move {
                probe.status().await
            })
            .await?
        {
            Ok(status) => status,
            Err(e) => {
                debug!(location = %announcement.location, error = %e, "Plug did not answer");
                return None;
            }
        };

        Some(Arc::new(PlugConnector::new(
            client,
            &status,
            announcement.serial_number.clone(),
            self.offline_delay,
            commands,
        )))
    }

    fn absorb(
        &self,
        _connector: &PlugConnector,
        _announcement: &ServiceAnnouncement,
    ) -> Option<DeviceState> {
        // Plugs report through polling
        None
    }

    fn poll_interval(&self) -> Option<Duration> {
        Some(self.poll_interval)
    }
}

/// Live handle to one plug. Every request (status reads and relay commands)
/// goes through the family's executor so a plug never sees overlapping requests.
pub struct PlugConnector {
    mac: String,
    serial_number: String,
    client: PlugClient,
    offline_delay: Duration,
    commands: ExecutorHandle,
    connected: AtomicBool,
    name: Mutex<String>,
}

impl PlugConnector {
    pub fn new(
        client: PlugClient,
        status: &PlugStatus,
        serial_number: String,
        offline_delay: Duration,
        commands: ExecutorHandle,
    ) -> Self {
        Self {
            mac: status.mac.clone(),
            serial_number,
            client,
            offline_delay,
            commands,
            connected: AtomicBool::new(true),
            name: Mutex::new(status.name.clone()),
        }
    }

    /// Reads the status on the executor and records reachability.
    ///
    /// `None` means the executor dropped the read, which says nothing about the plug.
    async fn read_status(&self) -> Option<Result<PlugStatus, PlugError>> {
        let client = self.client.clone();
        let result = self
            .commands
            .run(format!("{} status", self.mac), async move { client.status().await })
            .await?;
        self.record(&result);
        Some(result)
    }

    fn record(&self, result: &Result<PlugStatus, PlugError>) {
        match result {
            Ok(status) => {
                self.connected.store(true, Ordering::SeqCst);
                *self.name.lock().unwrap_or_else(PoisonError::into_inner) = status.name.clone();
            }
            Err(e) => {
                if self.connected.swap(false, Ordering::SeqCst) {
                    warn!(detection_id = %self.mac, error = %e, "Plug stopped answering");
                }
            }
        }
    }
}

#[async_trait]
impl DeviceConnector for PlugConnector {
    fn device_id(&self) -> &str {
        &self.mac
    }

    fn device_details(&self) -> HashMap<String, String> {
        let mut details = HashMap::new();
        details.insert(
            FRIENDLY_NAME.to_string(),
            self.name.lock().unwrap_or_else(PoisonError::into_inner).clone(),
        );
        details.insert("mac".to_string(), self.mac.clone());
        details.insert("serialNumber".to_string(), self.serial_number.clone());
        details.insert("location".to_string(), self.client.location().to_string());
        details
    }

    async fn connect(&self) -> bool {
        matches!(self.read_status().await, Some(Ok(_)))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn offline_delay(&self) -> Duration {
        self.offline_delay
    }

    async fn poll(&self) -> Option<DeviceState> {
        let status = self.read_status().await?.ok()?;
        Some(
            DeviceState::new(self.mac.clone(), self.device_details(), true)
                .with_relay(status.relay)
                .with_watts(status.watts),
        )
    }

    fn dispatch(&self, command: Command) -> CommandTicket {
        let closed = match command {
            Command::OpenRelay => false,
            Command::CloseRelay => true,
        };
        let client = self.client.clone();
        let mac = self.mac.clone();

        self.commands
            .submit(format!("{} {}", self.mac, command), async move {
                match client.set_relay(closed).await {
                    Ok(status) if status.relay == closed => CommandResult::Success,
                    Ok(_) => {
                        warn!(detection_id = %mac, "Plug acknowledged but relay did not switch");
                        CommandResult::DeviceError
                    }
                    Err(PlugError::Transport(e)) => {
                        warn!(detection_id = %mac, error = %e, "Relay command failed");
                        CommandResult::CommsFailed
                    }
                    Err(e) => {
                        warn!(detection_id = %mac, error = %e, "Plug rejected relay command");
                        CommandResult::DeviceError
                    }
                }
            })
    }
}
