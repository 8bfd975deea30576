//! Device state diffing.
//!
//! Snapshots from discovery and polling go through one queue and are diffed
//! one at a time against the persisted device, so no two diffs ever run
//! concurrently.

mod last_seen;
mod processor;

pub use last_seen::LastSeen;
pub use processor::{DeviceStateProcessor, DiffOutcome, ProcessorConfig};
