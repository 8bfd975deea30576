//! Outbound command path: typed commands, results and the dispatcher that
//! routes them to live connectors.

mod dispatcher;
mod executor;

pub use dispatcher::CommandDispatcher;
pub use executor::{CommandExecutor, ExecutorHandle};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::oneshot;

/// Actuation request for a device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    OpenRelay,
    CloseRelay,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::OpenRelay => write!(f, "open_relay"),
            Command::CloseRelay => write!(f, "close_relay"),
        }
    }
}

/// Outcome of a command. Failures are values, not errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandResult {
    None,
    /// Still running when the caller stopped waiting
    Pending,
    NotSupported,
    Success,
    DeviceNotFound,
    CommsFailed,
    DeviceError,
    ConnectorError,
}

/// Future-style handle to a command result.
#[derive(Debug)]
pub enum CommandTicket {
    /// Result known at dispatch time (e.g., unknown device)
    Ready(CommandResult),
    /// Executing; the connector sends the result when done
    InFlight(oneshot::Receiver<CommandResult>),
}

impl CommandTicket {
    /// Creates a ticket plus the sender that completes it.
    pub fn pending() -> (oneshot::Sender<CommandResult>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, CommandTicket::InFlight(rx))
    }

    /// Result if it is already known, without waiting.
    pub fn immediate(&self) -> Option<CommandResult> {
        match self {
            CommandTicket::Ready(result) => Some(*result),
            CommandTicket::InFlight(_) => None,
        }
    }

    /// Waits up to `timeout` for the result.
    ///
    /// Timing out yields [`CommandResult::Pending`]; the command keeps running.
    /// A connector that drops the ticket without answering yields
    /// [`CommandResult::ConnectorError`].
    pub async fn wait(self, timeout: Duration) -> CommandResult {
        match self {
            CommandTicket::Ready(result) => result,
            CommandTicket::InFlight(rx) => match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => CommandResult::ConnectorError,
                Err(_) => CommandResult::Pending,
            },
        }
    }
}
