// Device model, snapshots and semantic events
pub mod device;
pub mod event;

// Queue worker and service lifecycle primitives
pub mod lifecycle;
pub mod worker;

// Transactional device storage
pub mod storage;

// Device connector contract and command path
pub mod command;
pub mod connector;

// Discovery dispatch registry
pub mod discovery;

// State diffing and absence detection
pub mod offline;
pub mod state;

// Gateway configuration
pub mod config;

#[cfg(test)]
pub(crate) mod testing;

pub use command::{Command, CommandDispatcher, CommandResult, CommandTicket};
pub use connector::DeviceConnector;
pub use device::{ApplianceDetector, Device, DeviceState, Relay};
pub use event::{DeviceEvent, EventKind, EventSink};
