//! Device families shipped with the gateway.

pub mod generic;
pub mod plug;

pub use generic::{GenericConnector, GenericFamily};
pub use plug::{PlugConnector, PlugFamily};
