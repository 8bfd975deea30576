//! Device snapshots and persisted device records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

#[cfg(test)]
mod tests;

/// Detail key holding a human-readable device name.
pub const FRIENDLY_NAME: &str = "friendlyName";

/// Point-in-time observation of a device, produced by a connector on every
/// poll or discovery event. Never mutated after creation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    /// Stable natural key of the physical device (e.g., a MAC address)
    pub detection_id: String,

    /// When the observation was made
    pub timestamp: DateTime<Utc>,

    /// Family-specific descriptive fields
    pub details: HashMap<String, String>,

    pub connected: bool,

    /// Present only for devices that meter power
    pub instantaneous_watts: Option<f64>,

    /// Present only for devices with a switchable relay
    pub relay_closed: Option<bool>,
}

impl DeviceState {
    pub fn new(
        detection_id: impl Into<String>,
        details: HashMap<String, String>,
        connected: bool,
    ) -> Self {
        Self {
            detection_id: detection_id.into(),
            timestamp: Utc::now(),
            details,
            connected,
            instantaneous_watts: None,
            relay_closed: None,
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_watts(mut self, watts: f64) -> Self {
        self.instantaneous_watts = Some(watts);
        self
    }

    pub fn with_relay(mut self, closed: bool) -> Self {
        self.relay_closed = Some(closed);
        self
    }
}

/// Persisted device record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Storage surrogate key, `None` until first saved
    pub id: Option<i64>,
    pub detection_id: String,
    pub connected: bool,
    pub details: HashMap<String, String>,
    pub relay: Option<Relay>,
    pub appliance_detector: Option<ApplianceDetector>,
}

impl Device {
    /// Builds the record for a device observed for the first time.
    ///
    /// Relay and appliance state are attached separately so their first
    /// observation goes through the same code path as later ones.
    pub fn from_snapshot(snapshot: &DeviceState) -> Self {
        Self {
            id: None,
            detection_id: snapshot.detection_id.clone(),
            connected: snapshot.connected,
            details: snapshot.details.clone(),
            relay: None,
            appliance_detector: None,
        }
    }

    /// Name shown in events: the `friendlyName` detail, else the detection id.
    pub fn friendly_name(&self) -> &str {
        self.details
            .get(FRIENDLY_NAME)
            .map(String::as_str)
            .filter(|name| !name.is_empty())
            .unwrap_or(&self.detection_id)
    }
}

/// Switchable relay owned by a device.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Relay {
    pub closed: bool,
    /// Stamped only when `closed` actually flips
    pub last_state_change: DateTime<Utc>,
}

impl Relay {
    pub fn new(closed: bool, at: DateTime<Utc>) -> Self {
        Self {
            closed,
            last_state_change: at,
        }
    }

    /// Applies an observed relay position. Returns true if it flipped.
    pub fn set_closed(&mut self, closed: bool, at: DateTime<Utc>) -> bool {
        if self.closed == closed {
            return false;
        }
        self.closed = closed;
        self.last_state_change = at;
        true
    }
}

/// Infers whether an attached load is running from wattage readings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApplianceDetector {
    pub min_watts: f64,
    /// Persisted but not enforced: on/off is a pure threshold test
    pub off_delay_secs: u32,
    /// 0 means unlimited
    pub max_on_seconds: u32,
    pub on: bool,
    /// Stamped only when `on` actually flips
    pub last_state_change: DateTime<Utc>,
}

impl ApplianceDetector {
    pub const DEFAULT_MIN_WATTS: f64 = 5.0;

    /// Creates a detector with default thresholds, evaluated against `watts`.
    pub fn new(watts: f64, at: DateTime<Utc>) -> Self {
        let min_watts = Self::DEFAULT_MIN_WATTS;
        Self {
            min_watts,
            off_delay_secs: 0,
            max_on_seconds: 0,
            on: watts >= min_watts,
            last_state_change: at,
        }
    }

    /// Re-evaluates on/off for a wattage reading. Returns true if it flipped.
    pub fn observe(&mut self, watts: f64, at: DateTime<Utc>) -> bool {
        let on = watts >= self.min_watts;
        if on == self.on {
            return false;
        }
        if self.off_delay_secs > 0 {
            warn!(
                off_delay_secs = self.off_delay_secs,
                "Appliance off delay is not implemented, using plain threshold"
            );
        }
        self.on = on;
        self.last_state_change = at;
        true
    }

    /// True when the appliance has been on for longer than `max_on_seconds`.
    pub fn is_on_too_long(&self, now: DateTime<Utc>) -> bool {
        if !self.on || self.max_on_seconds == 0 {
            return false;
        }
        let elapsed = now - self.last_state_change;
        elapsed > chrono::Duration::seconds(i64::from(self.max_on_seconds))
    }
}
