//! In-crate test doubles.

use crate::command::{Command, CommandResult, CommandTicket};
use crate::connector::DeviceConnector;
use crate::device::DeviceState;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Connector that records commands and answers them with a fixed result.
pub(crate) struct FakeConnector {
    id: String,
    connected: AtomicBool,
    offline_delay: Duration,
    result: CommandResult,
    commands: Mutex<Vec<Command>>,
}

impl FakeConnector {
    pub(crate) fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            connected: AtomicBool::new(true),
            offline_delay: Duration::from_secs(60),
            result: CommandResult::Success,
            commands: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn with_offline_delay(mut self, delay: Duration) -> Self {
        self.offline_delay = delay;
        self
    }

    pub(crate) fn with_result(mut self, result: CommandResult) -> Self {
        self.result = result;
        self
    }

    pub(crate) fn commands(&self) -> Vec<Command> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeviceConnector for FakeConnector {
    fn device_id(&self) -> &str {
        &self.id
    }

    fn device_details(&self) -> HashMap<String, String> {
        HashMap::new()
    }

    async fn connect(&self) -> bool {
        self.connected.store(true, Ordering::SeqCst);
        true
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn offline_delay(&self) -> Duration {
        self.offline_delay
    }

    async fn poll(&self) -> Option<DeviceState> {
        None
    }

    fn dispatch(&self, command: Command) -> CommandTicket {
        self.commands.lock().unwrap().push(command);
        let (tx, ticket) = CommandTicket::pending();
        let _ = tx.send(self.result);
        ticket
    }
}
