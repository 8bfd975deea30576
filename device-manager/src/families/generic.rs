//! Catch-all family for anything no specific family claimed.
//!
//! Announcements are grouped purely by remote address. Address bindings are
//! never re-validated or expired, so a device whose address is reassigned
//! is merged with whatever answers at that address next.

use crate::manager::DeviceFamily;
use async_trait::async_trait;
use devgate::command::ExecutorHandle;
use devgate::connector::DeviceConnector;
use devgate::device::DeviceState;
use devgate::discovery::ServiceAnnouncement;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Weakest priority, so every specific family is asked first
pub const GENERIC_PRIORITY: i32 = i32::MAX;

pub struct GenericFamily {
    offline_delay: Duration,
}

impl GenericFamily {
    pub fn new(offline_delay: Duration) -> Self {
        Self { offline_delay }
    }
}

#[async_trait]
impl DeviceFamily for GenericFamily {
    type Connector = GenericConnector;

    fn name(&self) -> &str {
        "generic"
    }

    fn priority(&self) -> i32 {
        GENERIC_PRIORITY
    }

    fn matches(&self, _announcement: &ServiceAnnouncement) -> bool {
        true
    }

    fn device_key(&self, announcement: &ServiceAnnouncement) -> String {
        announcement.remote_address.clone()
    }

    async fn create_connector(
        &self,
        announcement: &ServiceAnnouncement,
        _commands: ExecutorHandle,
    ) -> Option<Arc<GenericConnector>> {
        Some(Arc::new(GenericConnector::new(
            announcement.remote_address.clone(),
            self.offline_delay,
        )))
    }

    fn absorb(
        &self,
        connector: &GenericConnector,
        announcement: &ServiceAnnouncement,
    ) -> Option<DeviceState> {
        connector.observe(announcement);
        Some(connector.snapshot())
    }

    fn poll_interval(&self) -> Option<Duration> {
        None
    }
}

#[derive(Default)]
struct Observed {
    service_types: BTreeSet<String>,
    serial_numbers: BTreeSet<String>,
    location: String,
}

/// Everything heard from one address. Read-only: no actuation.
pub struct GenericConnector {
    address: String,
    offline_delay: Duration,
    observed: Mutex<Observed>,
}

impl GenericConnector {
    pub fn new(address: String, offline_delay: Duration) -> Self {
        Self {
            address,
            offline_delay,
            observed: Mutex::new(Observed::default()),
        }
    }

    fn observe(&self, announcement: &ServiceAnnouncement) {
        let mut observed = self.observed.lock().unwrap_or_else(PoisonError::into_inner);
        observed
            .service_types
            .insert(announcement.service_type.clone());
        observed
            .serial_numbers
            .insert(announcement.serial_number.clone());
        observed.location = announcement.location.clone();
    }

    fn snapshot(&self) -> DeviceState {
        DeviceState::new(self.address.clone(), self.device_details(), true)
    }
}

#[async_trait]
impl DeviceConnector for GenericConnector {
    fn device_id(&self) -> &str {
        &self.address
    }

    fn device_details(&self) -> HashMap<String, String> {
        let observed = self.observed.lock().unwrap_or_else(PoisonError::into_inner);
        let mut details = HashMap::new();
        details.insert("remoteAddress".to_string(), self.address.clone());
        details.insert("location".to_string(), observed.location.clone());
        details.insert(
            "serviceTypes".to_string(),
            observed.service_types.iter().cloned().collect::<Vec<_>>().join(","),
        );
        details.insert(
            "serialNumbers".to_string(),
            observed.serial_numbers.iter().cloned().collect::<Vec<_>>().join(","),
        );
        details
    }

    async fn connect(&self) -> bool {
        true
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn offline_delay(&self) -> Duration {
        self.offline_delay
    }

    async fn poll(&self) -> Option<DeviceState> {
        Some(self.snapshot())
    }
}
