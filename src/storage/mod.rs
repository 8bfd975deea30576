//! Transactional device storage using SQLite.
//!
//! Every read and write of persisted device state goes through
//! [`DeviceStore::exec`], which runs the caller's closure inside one
//! transaction.

mod store;

pub use store::{DeviceStore, DeviceTx};
