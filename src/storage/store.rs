use crate::device::{ApplianceDetector, Device, Relay};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, error};

/// Device storage backed by SQLite.
///
/// # Schema
/// ```sql
/// CREATE TABLE devices (
///     id INTEGER PRIMARY KEY AUTOINCREMENT,
///     detection_id TEXT UNIQUE NOT NULL,
///     connected INTEGER NOT NULL,
///     details_json TEXT NOT NULL
/// );
/// CREATE TABLE relays (
///     device_id INTEGER PRIMARY KEY REFERENCES devices(id) ON DELETE CASCADE,
///     closed INTEGER NOT NULL,
///     last_state_change TEXT NOT NULL      -- RFC 3339
/// );
/// CREATE TABLE appliance_detectors (
///     device_id INTEGER PRIMARY KEY REFERENCES devices(id) ON DELETE CASCADE,
///     min_watts REAL NOT NULL,
///     off_delay_secs INTEGER NOT NULL,
///     max_on_seconds INTEGER NOT NULL,
///     is_on INTEGER NOT NULL,
///     last_state_change TEXT NOT NULL      -- RFC 3339
/// );
/// ```
///
/// The connection is wrapped in a Mutex, so transactions are fully serialized.
pub struct DeviceStore {
    conn: Mutex<Connection>,
}

impl DeviceStore {
    /// Opens (or creates) the database and ensures the tables exist.
    ///
    /// Pass `":memory:"` for a throwaway store.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open device DB at {}", path.display()))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.create_tables()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        Self::new(":memory:")
    }

    fn create_tables(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
            CREATE TABLE IF NOT EXISTS devices (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                detection_id TEXT UNIQUE NOT NULL,
                connected    INTEGER NOT NULL,
                details_json TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS relays (
                device_id         INTEGER PRIMARY KEY REFERENCES devices(id) ON DELETE CASCADE,
                closed            INTEGER NOT NULL,
                last_state_change TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS appliance_detectors (
                device_id         INTEGER PRIMARY KEY REFERENCES devices(id) ON DELETE CASCADE,
                min_watts         REAL NOT NULL,
                off_delay_secs    INTEGER NOT NULL,
                max_on_seconds    INTEGER NOT NULL,
                is_on             INTEGER NOT NULL,
                last_state_change TEXT NOT NULL
            );",
        )
        .context("Failed to create device tables")?;
        Ok(())
    }

    /// Runs `f` inside a single transaction.
    ///
    /// Commits when `f` returns `Ok`; rolls back and returns the error when `f`
    /// fails or the commit itself fails.
    pub fn exec<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&DeviceTx<'_>) -> Result<T>,
    {
        let mut conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = conn
            .transaction()
            .context("Failed to begin transaction")?;

        let result = f(&DeviceTx { conn: &tx });

        match result {
            Ok(value) => {
                if let Err(e) = tx.commit() {
                    error!(error = %e, "Transaction commit failed, rolled back");
                    return Err(e).context("Failed to commit transaction");
                }
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback() {
                    error!(error = %rollback_err, "Transaction rollback failed");
                }
                error!(error = %format!("{:#}", e), "Transaction rolled back");
                Err(e)
            }
        }
    }

    /// Raw SQL for tests that need to break the schema or install triggers.
    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.execute_batch(sql).context("Failed to execute batch")
    }
}

/// Handle to an open transaction. Only valid inside [`DeviceStore::exec`].
pub struct DeviceTx<'a> {
    conn: &'a Connection,
}

impl DeviceTx<'_> {
    /// Loads a device with its relay and appliance detector.
    pub fn find(&self, detection_id: &str) -> Result<Option<Device>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, detection_id, connected, details_json
                 FROM devices WHERE detection_id = ?1",
                params![detection_id],
                read_device_row,
            )
            .optional()
            .context("Failed to query device")?;

        match row {
            Some(row) => Ok(Some(self.hydrate(row)?)),
            None => Ok(None),
        }
    }

    /// Returns every device currently marked connected.
    pub fn list_connected(&self) -> Result<Vec<Device>> {
        self.list_where("WHERE connected = 1")
    }

    /// Returns every device, ordered by surrogate id.
    pub fn list_all(&self) -> Result<Vec<Device>> {
        self.list_where("")
    }

    fn list_where(&self, clause: &str) -> Result<Vec<Device>> {
        let sql = format!(
            "SELECT id, detection_id, connected, details_json FROM devices {} ORDER BY id ASC",
            clause
        );
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare device list")?;
        let rows = stmt
            .query_map([], read_device_row)
            .context("Failed to list devices")?;

        let mut devices = Vec::new();
        for row in rows {
            let row = row.context("Failed to read device row")?;
            devices.push(self.hydrate(row)?);
        }
        Ok(devices)
    }

    /// Inserts or updates a device together with its relay and detector.
    ///
    /// Assigns `device.id` on first save. A missing relay or detector deletes
    /// any previously stored one.
    pub fn save(&self, device: &mut Device) -> Result<()> {
        let details_json =
            serde_json::to_string(&device.details).context("Failed to serialize details")?;

        let id = match device.id {
            Some(id) => {
                self.conn
                    .execute(
                        "UPDATE devices SET connected = ?1, details_json = ?2 WHERE id = ?3",
                        params![device.connected, details_json, id],
                    )
                    .context("Failed to update device")?;
                id
            }
            None => {
                self.conn
                    .execute(
                        "INSERT INTO devices (detection_id, connected, details_json)
                         VALUES (?1, ?2, ?3)",
                        params![device.detection_id, device.connected, details_json],
                    )
                    .context("Failed to insert device")?;
                let id = self.conn.last_insert_rowid();
                device.id = Some(id);
                id
            }
        };

        match &device.relay {
            Some(relay) => {
                self.conn
                    .execute(
                        "INSERT INTO relays (device_id, closed, last_state_change)
                         VALUES (?1, ?2, ?3)
                         ON CONFLICT(device_id) DO UPDATE SET
                            closed = excluded.closed,
                            last_state_change = excluded.last_state_change",
                        params![id, relay.closed, relay.last_state_change.to_rfc3339()],
                    )
                    .context("Failed to save relay")?;
            }
            None => {
                self.conn
                    .execute("DELETE FROM relays WHERE device_id = ?1", params![id])
                    .context("Failed to delete relay")?;
            }
        }

        match &device.appliance_detector {
            Some(detector) => {
                self.conn
                    .execute(
                        "INSERT INTO appliance_detectors
                            (device_id, min_watts, off_delay_secs, max_on_seconds, is_on, last_state_change)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                         ON CONFLICT(device_id) DO UPDATE SET
                            min_watts = excluded.min_watts,
                            off_delay_secs = excluded.off_delay_secs,
                            max_on_seconds = excluded.max_on_seconds,
                            is_on = excluded.is_on,
                            last_state_change = excluded.last_state_change",
                        params![
                            id,
                            detector.min_watts,
                            detector.off_delay_secs,
                            detector.max_on_seconds,
                            detector.on,
                            detector.last_state_change.to_rfc3339(),
                        ],
                    )
                    .context("Failed to save appliance detector")?;
            }
            None => {
                self.conn
                    .execute(
                        "DELETE FROM appliance_detectors WHERE device_id = ?1",
                        params![id],
                    )
                    .context("Failed to delete appliance detector")?;
            }
        }

        debug!(detection_id = %device.detection_id, id = id, "Device saved");
        Ok(())
    }

    fn hydrate(&self, row: DeviceRow) -> Result<Device> {
        let details: HashMap<String, String> = serde_json::from_str(&row.details_json)
            .with_context(|| format!("Failed to parse details for device {}", row.detection_id))?;

        let relay = self
            .conn
            .query_row(
                "SELECT closed, last_state_change FROM relays WHERE device_id = ?1",
                params![row.id],
                |r| Ok((r.get::<_, bool>(0)?, r.get::<_, String>(1)?)),
            )
            .optional()
            .context("Failed to query relay")?
            .map(|(closed, changed)| -> Result<Relay> {
                Ok(Relay {
                    closed,
                    last_state_change: parse_timestamp(&changed)?,
                })
            })
            .transpose()?;

        let appliance_detector = self
            .conn
            .query_row(
                "SELECT min_watts, off_delay_secs, max_on_seconds, is_on, last_state_change
                 FROM appliance_detectors WHERE device_id = ?1",
                params![row.id],
                |r| {
                    Ok((
                        r.get::<_, f64>(0)?,
                        r.get::<_, u32>(1)?,
                        r.get::<_, u32>(2)?,
                        r.get::<_, bool>(3)?,
                        r.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query appliance detector")?
            .map(
                |(min_watts, off_delay_secs, max_on_seconds, on, changed)| -> Result<ApplianceDetector> {
                    Ok(ApplianceDetector {
                        min_watts,
                        off_delay_secs,
                        max_on_seconds,
                        on,
                        last_state_change: parse_timestamp(&changed)?,
                    })
                },
            )
            .transpose()?;

        Ok(Device {
            id: Some(row.id),
            detection_id: row.detection_id,
            connected: row.connected,
            details,
            relay,
            appliance_detector,
        })
    }
}

struct DeviceRow {
    id: i64,
    detection_id: String,
    connected: bool,
    details_json: String,
}

fn read_device_row(row: &Row<'_>) -> rusqlite::Result<DeviceRow> {
    Ok(DeviceRow {
        id: row.get(0)?,
        detection_id: row.get(1)?,
        connected: row.get(2)?,
        details_json: row.get(3)?,
    })
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Failed to parse timestamp '{}'", value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceState;
    use chrono::TimeZone;

    fn sample_device(detection_id: &str, connected: bool) -> Device {
        let mut details = HashMap::new();
        details.insert("friendlyName".to_string(), "Washer".to_string());
        Device::from_snapshot(&DeviceState::new(detection_id, details, connected))
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 8, 30, 15).unwrap() + chrono::Duration::milliseconds(250)
    }

    #[test]
    fn test_save_and_find_round_trip() {
        let store = DeviceStore::in_memory().unwrap();
        let mut device = sample_device("aa:01", true);
        device.relay = Some(Relay::new(true, t0()));
        let mut detector = ApplianceDetector::new(50.0, t0());
        detector.max_on_seconds = 3600;
        device.appliance_detector = Some(detector);

        store.exec(|tx| tx.save(&mut device)).unwrap();
        assert!(device.id.is_some());

        let loaded = store.exec(|tx| tx.find("aa:01")).unwrap().unwrap();
        assert_eq!(loaded, device);
    }

    #[test]
    fn test_find_unknown_device() {
        let store = DeviceStore::in_memory().unwrap();
        assert!(store.exec(|tx| tx.find("missing")).unwrap().is_none());
    }

    #[test]
    fn test_update_keeps_surrogate_id_and_removes_children() {
        let store = DeviceStore::in_memory().unwrap();
        let mut device = sample_device("aa:02", true);
        device.relay = Some(Relay::new(false, t0()));
        store.exec(|tx| tx.save(&mut device)).unwrap();
        let id = device.id;

        device.connected = false;
        device.relay = None;
        store.exec(|tx| tx.save(&mut device)).unwrap();

        let loaded = store.exec(|tx| tx.find("aa:02")).unwrap().unwrap();
        assert_eq!(loaded.id, id);
        assert!(!loaded.connected);
        assert!(loaded.relay.is_none());
    }

    #[test]
    fn test_list_connected_filters() {
        let store = DeviceStore::in_memory().unwrap();
        store
            .exec(|tx| {
                tx.save(&mut sample_device("on-1", true))?;
                tx.save(&mut sample_device("off-1", false))?;
                tx.save(&mut sample_device("on-2", true))
            })
            .unwrap();

        let connected = store.exec(|tx| tx.list_connected()).unwrap();
        let ids: Vec<&str> = connected.iter().map(|d| d.detection_id.as_str()).collect();
        assert_eq!(ids, vec!["on-1", "on-2"]);

        assert_eq!(store.exec(|tx| tx.list_all()).unwrap().len(), 3);
    }

    #[test]
    fn test_failed_closure_rolls_back() {
        let store = DeviceStore::in_memory().unwrap();

        let result: Result<()> = store.exec(|tx| {
            tx.save(&mut sample_device("doomed", true))?;
            anyhow::bail!("diff failed halfway")
        });
        assert!(result.is_err());

        assert!(store.exec(|tx| tx.find("doomed")).unwrap().is_none());
    }

    #[test]
    fn test_duplicate_detection_id_rejected() {
        let store = DeviceStore::in_memory().unwrap();
        store.exec(|tx| tx.save(&mut sample_device("dup", true))).unwrap();

        let result = store.exec(|tx| tx.save(&mut sample_device("dup", true)));
        assert!(result.is_err());
    }

    #[test]
    fn test_persists_across_reopen() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("devices.db");

        {
            let store = DeviceStore::new(&db_path).unwrap();
            store.exec(|tx| tx.save(&mut sample_device("kept", true))).unwrap();
        }

        let store = DeviceStore::new(&db_path).unwrap();
        let loaded = store.exec(|tx| tx.find("kept")).unwrap().unwrap();
        assert_eq!(loaded.friendly_name(), "Washer");
    }
}
