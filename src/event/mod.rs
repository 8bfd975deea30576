use crate::device::Device;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

mod sinks;

pub use sinks::{BroadcastEventSink, FanOutSink, LoggingEventSink, RecordingSink};

/// Semantic change detected on a device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    NewDevice,
    Connected,
    ConnectionLost,
    DetailsChanged,
    RelayClosed,
    RelayOpened,
    ApplianceOn,
    ApplianceOff,
    OnTooLong,
}

/// DeviceEvent is produced by the state processor and the offline marker and
/// handed to an [`EventSink`]. Events are not persisted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceEvent {
    pub detection_id: String,

    pub friendly_name: String,

    #[serde(rename = "event")]
    pub kind: EventKind,

    /// Optional event payload (e.g., the new details map)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<HashMap<String, String>>,
}

impl DeviceEvent {
    pub fn new(device: &Device, kind: EventKind, data: Option<HashMap<String, String>>) -> Self {
        Self {
            detection_id: device.detection_id.clone(),
            friendly_name: device.friendly_name().to_string(),
            kind,
            data,
        }
    }
}

/// Consumer of device events.
///
/// Fire-and-forget. Implementations must not stall: the state processor calls
/// `accept` inline and imposes no timeout.
pub trait EventSink: Send + Sync {
    fn accept(&self, event: DeviceEvent);
}
