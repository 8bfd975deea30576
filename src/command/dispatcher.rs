use super::{Command, CommandResult, CommandTicket};
use crate::connector::DeviceConnector;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Routes commands to live connectors by detection id.
///
/// The map holds routing references only; persisted device state never comes
/// from here. Family managers register a connector when they create it and
/// unregister it when they drop it.
#[derive(Default)]
pub struct CommandDispatcher {
    connectors: DashMap<String, Arc<dyn DeviceConnector>>,
}

impl CommandDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connector under its own device id, replacing any previous one.
    pub fn register(&self, connector: Arc<dyn DeviceConnector>) {
        let id = connector.device_id().to_string();
        if self.connectors.insert(id.clone(), connector).is_some() {
            debug!(detection_id = %id, "Replaced connector registration");
        } else {
            info!(detection_id = %id, "Connector registered");
        }
    }

    pub fn unregister(&self, detection_id: &str) -> Option<Arc<dyn DeviceConnector>> {
        self.connectors
            .remove(detection_id)
            .map(|(_, connector)| connector)
    }

    pub fn get(&self, detection_id: &str) -> Option<Arc<dyn DeviceConnector>> {
        self.connectors
            .get(detection_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.connectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }

    /// Offline delay reported by the device's live connector, if one is registered.
    pub fn offline_delay(&self, detection_id: &str) -> Option<Duration> {
        self.connectors
            .get(detection_id)
            .map(|entry| entry.value().offline_delay())
    }

    /// Forwards a command to the device's connector.
    ///
    /// Unknown devices resolve to [`CommandResult::DeviceNotFound`] without
    /// waiting. No timeout is applied here; callers choose their own through
    /// [`CommandTicket::wait`].
    pub fn dispatch(&self, detection_id: &str, command: Command) -> CommandTicket {
        // Clone out of the map so the shard lock is not held across the connector call
        let Some(connector) = self.get(detection_id) else {
            warn!(detection_id = %detection_id, command = %command, "Command for unknown device");
            return CommandTicket::Ready(CommandResult::DeviceNotFound);
        };

        debug!(detection_id = %detection_id, command = %command, "Dispatching command");
        connector.dispatch(command)
    }

    /// Dispatches and waits up to `timeout`; a timeout yields [`CommandResult::Pending`].
    pub async fn dispatch_and_wait(
        &self,
        detection_id: &str,
        command: Command,
        timeout: Duration,
    ) -> CommandResult {
        self.dispatch(detection_id, command).wait(timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeConnector;

    #[test]
    fn test_unknown_device_resolves_synchronously() {
        let dispatcher = CommandDispatcher::new();
        let ticket = dispatcher.dispatch("nobody", Command::OpenRelay);
        assert_eq!(ticket.immediate(), Some(CommandResult::DeviceNotFound));
    }

    #[tokio::test]
    async fn test_dispatch_reaches_registered_connector() {
        let dispatcher = CommandDispatcher::new();
        let connector = Arc::new(FakeConnector::new("plug-1"));
        dispatcher.register(connector.clone());

        let result = dispatcher
            .dispatch_and_wait("plug-1", Command::CloseRelay, Duration::from_secs(1))
            .await;

        assert_eq!(result, CommandResult::Success);
        assert_eq!(connector.commands(), vec![Command::CloseRelay]);
    }

    #[tokio::test]
    async fn test_default_dispatch_not_supported() {
        struct ReadOnly;

        #[async_trait::async_trait]
        impl DeviceConnector for ReadOnly {
            fn device_id(&self) -> &str {
                "sensor"
            }
            fn device_details(&self) -> std::collections::HashMap<String, String> {
                Default::default()
            }
            async fn connect(&self) -> bool {
                true
            }
            fn is_connected(&self) -> bool {
                true
            }
            fn offline_delay(&self) -> Duration {
                Duration::from_secs(60)
            }
            async fn poll(&self) -> Option<crate::device::DeviceState> {
                None
            }
        }

        let dispatcher = CommandDispatcher::new();
        dispatcher.register(Arc::new(ReadOnly));
        let result = dispatcher
            .dispatch_and_wait("sensor", Command::OpenRelay, Duration::from_secs(1))
            .await;
        assert_eq!(result, CommandResult::NotSupported);
    }

    #[test]
    fn test_unregister_and_offline_delay() {
        let dispatcher = CommandDispatcher::new();
        dispatcher.register(Arc::new(
            FakeConnector::new("meter").with_offline_delay(Duration::from_secs(90)),
        ));

        assert_eq!(dispatcher.len(), 1);
        assert_eq!(dispatcher.offline_delay("meter"), Some(Duration::from_secs(90)));

        assert!(dispatcher.unregister("meter").is_some());
        assert!(dispatcher.is_empty());
        assert_eq!(dispatcher.offline_delay("meter"), None);
    }
}
