use super::*;
use chrono::{Duration, TimeZone};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

#[test]
fn test_friendly_name_falls_back_to_detection_id() {
    let mut details = HashMap::new();
    let snapshot = DeviceState::new("aa:bb:cc", details.clone(), true);
    assert_eq!(Device::from_snapshot(&snapshot).friendly_name(), "aa:bb:cc");

    details.insert(FRIENDLY_NAME.to_string(), "Dryer".to_string());
    let snapshot = DeviceState::new("aa:bb:cc", details, true);
    assert_eq!(Device::from_snapshot(&snapshot).friendly_name(), "Dryer");
}

#[test]
fn test_from_snapshot_leaves_relay_and_detector_unset() {
    let snapshot = DeviceState::new("plug-1", HashMap::new(), true)
        .with_relay(true)
        .with_watts(40.0);
    let device = Device::from_snapshot(&snapshot);

    assert!(device.id.is_none());
    assert!(device.connected);
    assert!(device.relay.is_none());
    assert!(device.appliance_detector.is_none());
}

#[test]
fn test_relay_stamps_only_on_flip() {
    let mut relay = Relay::new(true, t0());

    assert!(!relay.set_closed(true, t0() + Duration::seconds(10)));
    assert_eq!(relay.last_state_change, t0());

    assert!(relay.set_closed(false, t0() + Duration::seconds(20)));
    assert!(!relay.closed);
    assert_eq!(relay.last_state_change, t0() + Duration::seconds(20));
}

#[test]
fn test_detector_defaults_and_threshold() {
    let detector = ApplianceDetector::new(5.0, t0());
    assert_eq!(detector.min_watts, 5.0);
    assert_eq!(detector.off_delay_secs, 0);
    assert_eq!(detector.max_on_seconds, 0);
    assert!(detector.on, "reading equal to threshold counts as on");

    let detector = ApplianceDetector::new(4.9, t0());
    assert!(!detector.on);
}

#[test]
fn test_detector_observe_flips() {
    let mut detector = ApplianceDetector::new(0.0, t0());

    assert!(!detector.observe(1.0, t0() + Duration::seconds(1)));
    assert_eq!(detector.last_state_change, t0());

    assert!(detector.observe(120.0, t0() + Duration::seconds(2)));
    assert!(detector.on);
    assert_eq!(detector.last_state_change, t0() + Duration::seconds(2));

    assert!(detector.observe(0.5, t0() + Duration::seconds(3)));
    assert!(!detector.on);
}

#[test]
fn test_on_too_long() {
    let mut detector = ApplianceDetector::new(100.0, t0());

    // Unlimited by default
    assert!(!detector.is_on_too_long(t0() + Duration::hours(10)));

    detector.max_on_seconds = 60;
    assert!(!detector.is_on_too_long(t0() + Duration::seconds(60)));
    assert!(detector.is_on_too_long(t0() + Duration::seconds(61)));

    detector.observe(0.0, t0() + Duration::seconds(62));
    assert!(!detector.is_on_too_long(t0() + Duration::hours(1)));
}
