//! devgate device manager - Device families built on the devgate core.
//!
//! Each family (generic catch-all, HTTP smart plugs) plugs into the core
//! through a [`FamilyManager`], which owns the family's announcement queue,
//! its live connectors, its poll loop and its serial command executor.
//!
//! # Architecture
//!
//! ```text
//!        Searcher (network or static)
//!                  ↓
//! ┌─────────────────────────────────────────┐
//! │       Discovery Registry                 │
//! │  - Periodic root + general queries       │
//! │  - First matching family claims it       │
//! └─────────────────────────────────────────┘
//!                  ↓
//! ┌─────────────────────────────────────────┐
//! │       Family Manager (one per family)    │
//! │  - Create / update connectors            │
//! │  - Poll connectors                       │
//! │  - Serialize device commands             │
//! └─────────────────────────────────────────┘
//!                  ↓ snapshots
//! ┌─────────────────────────────────────────┐
//! │       Device State Processor             │
//! │  - Diff against persisted device         │
//! │  - Emit events after commit              │
//! └─────────────────────────────────────────┘
//!                  ↓
//!             Event sinks
//! ```
//!
//! # Core Types
//!
//! - [`DeviceManager`] - What the daemon starts, stops and registers
//! - [`DeviceFamily`] - What a family must provide to get a manager
//! - [`StaticSearcher`] - Replays configured announcements

pub mod families;
pub mod manager;
pub mod registry;
pub mod searcher;

pub use families::{GenericFamily, PlugFamily};
pub use manager::{DeviceFamily, DeviceManager, FamilyManager, ManagerContext};
pub use searcher::StaticSearcher;
