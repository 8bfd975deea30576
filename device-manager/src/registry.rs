//! Family registry - The families the daemon runs.

use crate::families::{GenericFamily, PlugFamily};
use crate::manager::{DeviceManager, FamilyManager, ManagerContext};
use devgate::config::FamilySettings;
use std::sync::Arc;
use std::time::Duration;

/// Returns a manager for every built-in family, most specific first.
pub fn build_managers(
    settings: &FamilySettings,
    ctx: &ManagerContext,
) -> Vec<Arc<dyn DeviceManager>> {
    let plug = PlugFamily::new(
        Duration::from_secs(settings.plug.poll_interval_secs),
        Duration::from_secs(settings.plug.offline_delay_secs),
        Duration::from_secs(settings.plug.request_timeout_secs),
    );
    let generic = GenericFamily::new(Duration::from_secs(settings.generic.offline_delay_secs));

    vec![
        Arc::new(FamilyManager::new(plug, ctx.clone())),
        Arc::new(FamilyManager::new(generic, ctx.clone())),
    ]
}
