use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;

/// Latest snapshot timestamp per device since startup.
///
/// Shared between the state processor (writer) and the offline marker (reader).
/// Not persisted.
#[derive(Clone, Default)]
pub struct LastSeen {
    inner: Arc<DashMap<String, DateTime<Utc>>>,
}

impl LastSeen {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a sighting. Out-of-order timestamps never move the value back.
    pub fn record(&self, detection_id: &str, at: DateTime<Utc>) {
        self.inner
            .entry(detection_id.to_string())
            .and_modify(|seen| {
                if at > *seen {
                    *seen = at;
                }
            })
            .or_insert(at);
    }

    pub fn get(&self, detection_id: &str) -> Option<DateTime<Utc>> {
        self.inner.get(detection_id).map(|entry| *entry.value())
    }

    pub fn forget(&self, detection_id: &str) {
        self.inner.remove(detection_id);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
