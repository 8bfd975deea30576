use super::{DeviceEvent, EventKind, EventSink};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::info;

/// Writes every event to the log.
#[derive(Debug, Default)]
pub struct LoggingEventSink;

impl EventSink for LoggingEventSink {
    fn accept(&self, event: DeviceEvent) {
        info!(
            detection_id = %event.detection_id,
            friendly_name = %event.friendly_name,
            event = ?event.kind,
            data = ?event.data,
            "Device event"
        );
    }
}

/// Publishes events on a broadcast channel for in-process subscribers.
pub struct BroadcastEventSink {
    tx: broadcast::Sender<DeviceEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastEventSink {
    fn accept(&self, event: DeviceEvent) {
        // No subscribers is fine
        let _ = self.tx.send(event);
    }
}

/// Forwards each event to every wrapped sink, in order.
#[derive(Default)]
pub struct FanOutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanOutSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: Arc<dyn EventSink>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl EventSink for FanOutSink {
    fn accept(&self, event: DeviceEvent) {
        let Some((last, rest)) = self.sinks.split_last() else {
            return;
        };
        for sink in rest {
            sink.accept(event.clone());
        }
        last.accept(event);
    }
}

/// Keeps every event in memory. Used by tests and diagnostics.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<DeviceEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DeviceEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events().into_iter().map(|e| e.kind).collect()
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl EventSink for RecordingSink {
    fn accept(&self, event: DeviceEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}
