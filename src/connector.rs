//! Per-device connector contract implemented by each device family.

use crate::command::{Command, CommandResult, CommandTicket};
use crate::device::DeviceState;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// Live handle to one physical device.
///
/// Transient I/O failures stay inside the connector: `connect` returns false,
/// `poll` returns `None` or a snapshot with `connected = false`. Nothing here
/// returns an error into the core.
#[async_trait]
pub trait DeviceConnector: Send + Sync {
    /// Detection id of the device this connector talks to.
    fn device_id(&self) -> &str;

    fn device_details(&self) -> HashMap<String, String>;

    /// Establishes (or re-establishes) contact with the device.
    async fn connect(&self) -> bool;

    fn is_connected(&self) -> bool;

    /// How long the device may stay silent before the offline marker
    /// considers it gone.
    fn offline_delay(&self) -> Duration;

    /// Fetches a fresh snapshot. `None` means no snapshot was produced.
    async fn poll(&self) -> Option<DeviceState>;

    /// Starts executing a command. Devices without actuation keep the default.
    fn dispatch(&self, command: Command) -> CommandTicket {
        let _ = command;
        CommandTicket::Ready(CommandResult::NotSupported)
    }
}
