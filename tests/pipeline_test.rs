// Integration tests for the snapshot → diff → offline → command path

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use devgate::command::{Command, CommandDispatcher, CommandResult, CommandTicket};
use devgate::connector::DeviceConnector;
use devgate::device::DeviceState;
use devgate::event::{EventKind, EventSink, RecordingSink};
use devgate::offline::{OfflineConfig, OfflineMarker};
use devgate::state::{DeviceStateProcessor, LastSeen, ProcessorConfig};
use devgate::storage::DeviceStore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Meter with a relay that remembers the commands it was sent.
struct TestMeter {
    id: String,
    commands: Mutex<Vec<Command>>,
}

impl TestMeter {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            commands: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl DeviceConnector for TestMeter {
    fn device_id(&self) -> &str {
        &self.id
    }

    fn device_details(&self) -> HashMap<String, String> {
        HashMap::from([("friendlyName".to_string(), "Freezer".to_string())])
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

    async fn poll(&self) -> Option<DeviceState> {
        None
    }

    fn dispatch(&self, command: Command) -> CommandTicket {
        self.commands.lock().unwrap().push(command);
        CommandTicket::Ready(CommandResult::Success)
    }
}

fn snapshot(meter: &TestMeter, connected: bool) -> DeviceState {
    DeviceState::new(meter.device_id(), meter.device_details(), connected)
}

async fn wait_for_events(sink: &RecordingSink, count: usize) -> Vec<EventKind> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while sink.kinds().len() < count && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    sink.kinds()
}

#[tokio::test]
async fn test_silent_device_goes_offline_and_comes_back() {
    let store = Arc::new(DeviceStore::in_memory().unwrap());
    let sink = Arc::new(RecordingSink::new());
    let event_sink: Arc<dyn EventSink> = sink.clone();
    let dispatcher = Arc::new(CommandDispatcher::new());
    let last_seen = LastSeen::new();

    let processor = DeviceStateProcessor::new(
        store.clone(),
        event_sink.clone(),
        dispatcher.clone(),
        last_seen.clone(),
        ProcessorConfig::default(),
    );
    let marker = OfflineMarker::new(
        store.clone(),
        dispatcher.clone(),
        last_seen.clone(),
        event_sink,
        OfflineConfig::default(),
    );
    processor.start().unwrap();

    let meter = Arc::new(TestMeter::new("meter-7"));
    dispatcher.register(meter.clone());

    processor.accept(snapshot(&meter, true));
    assert_eq!(wait_for_events(&sink, 1).await, vec![EventKind::NewDevice]);

    let seen = last_seen.get("meter-7").unwrap();
    assert_eq!(marker.sweep(seen + ChronoDuration::seconds(30)).await, 0);
    assert_eq!(marker.sweep(seen + ChronoDuration::seconds(61)).await, 1);
    assert_eq!(marker.sweep(seen + ChronoDuration::seconds(90)).await, 0);

    processor.accept(snapshot(&meter, true));
    assert_eq!(
        wait_for_events(&sink, 3).await,
        vec![
            EventKind::NewDevice,
            EventKind::ConnectionLost,
            EventKind::Connected
        ]
    );

    processor.stop().await;
}

#[tokio::test]
async fn test_state_survives_restart() {
    let temp_dir = tempfile::tempdir().unwrap();
    let db_path = temp_dir.path().join("devices.db");
    let meter = TestMeter::new("meter-8");

    {
        let store = Arc::new(DeviceStore::new(&db_path).unwrap());
        let sink: Arc<dyn EventSink> = Arc::new(RecordingSink::new());
        let processor = DeviceStateProcessor::new(
            store,
            sink,
            Arc::new(CommandDispatcher::new()),
            LastSeen::new(),
            ProcessorConfig::default(),
        );
        let outcome = processor
            .handle_snapshot(&snapshot(&meter, true).with_relay(true).with_watts(80.0))
            .unwrap();
        assert_eq!(outcome.kinds(), vec![EventKind::NewDevice]);
    }

    let store = Arc::new(DeviceStore::new(&db_path).unwrap());
    let sink: Arc<dyn EventSink> = Arc::new(RecordingSink::new());
    let processor = DeviceStateProcessor::new(
        store,
        sink,
        Arc::new(CommandDispatcher::new()),
        LastSeen::new(),
        ProcessorConfig::default(),
    );

    let outcome = processor
        .handle_snapshot(&snapshot(&meter, true).with_relay(false).with_watts(80.0))
        .unwrap();
    assert_eq!(outcome.kinds(), vec![EventKind::RelayOpened]);
}

#[tokio::test]
async fn test_auto_open_reaches_connector() {
    let store = Arc::new(DeviceStore::in_memory().unwrap());
    let sink = Arc::new(RecordingSink::new());
    let event_sink: Arc<dyn EventSink> = sink.clone();
    let dispatcher = Arc::new(CommandDispatcher::new());
    let processor = DeviceStateProcessor::new(
        store.clone(),
        event_sink,
        dispatcher.clone(),
        LastSeen::new(),
        ProcessorConfig::default(),
    );

    let meter = Arc::new(TestMeter::new("meter-9"));
    dispatcher.register(meter.clone());

    let start = Utc::now();
    processor
        .handle_snapshot(&snapshot(&meter, true).at(start).with_relay(true).with_watts(150.0))
        .unwrap();
    store
        .exec(|tx| {
            let mut device = tx.find("meter-9")?.unwrap();
            device.appliance_detector.as_mut().unwrap().max_on_seconds = 60;
            tx.save(&mut device)
        })
        .unwrap();

    let late = snapshot(&meter, true)
        .at(start + ChronoDuration::seconds(120))
        .with_relay(true)
        .with_watts(150.0);
    let outcome = processor.handle_snapshot(&late).unwrap();

    assert_eq!(outcome.kinds(), vec![EventKind::OnTooLong]);
    assert_eq!(*meter.commands.lock().unwrap(), vec![Command::OpenRelay]);
}
