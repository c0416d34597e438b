//! Presence and alert persistence.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_derive::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::alert::{AlertObserver, PendingAlert};
use crate::error::{Error, Result};
use crate::track::TrackingId;

pub type LogId = u64;
pub type AlertId = u64;

/// Storage backend for presence history and alert audit records.
///
/// Failures are reported, never retried; callers log them and carry on.
pub trait PresenceStore: Send + Sync {
    fn log_entry(
        &self,
        tracking_id: TrackingId,
        source_id: &str,
        external_identity: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<LogId>;

    /// Closes the open presence record. Returns `false` if there was none.
    fn log_exit(&self, tracking_id: TrackingId, source_id: &str, at: DateTime<Utc>) -> Result<bool>;

    fn record_alert(
        &self,
        tracking_id: TrackingId,
        external_identity: Option<&str>,
        departed_at: DateTime<Utc>,
        timeout_minutes: i64,
    ) -> Result<AlertId>;

    fn acknowledge_alert(&self, alert_id: AlertId) -> Result<bool>;
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Present,
    Left,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct PresenceRecord {
    pub id: LogId,
    pub tracking_id: TrackingId,
    pub source_id: String,
    pub external_identity: Option<String>,
    pub entry_time: DateTime<Utc>,
    pub exit_time: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub status: PresenceStatus,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct AlertRecord {
    pub id: AlertId,
    pub tracking_id: TrackingId,
    pub external_identity: Option<String>,
    pub departed_at: DateTime<Utc>,
    pub timeout_minutes: i64,
    pub created_at: DateTime<Utc>,
    pub acknowledged: bool,
    pub acknowledged_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Records {
    presences: Vec<PresenceRecord>,
    alerts: Vec<AlertRecord>,
}

/// In-process store.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<Records>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open presence records, optionally of a single source.
    pub fn active_presences(&self, source_id: Option<&str>) -> Vec<PresenceRecord> {
        self.records
            .lock()
            .presences
            .iter()
            .filter(|p| p.status == PresenceStatus::Present)
            .filter(|p| source_id.map_or(true, |s| p.source_id == s))
            .cloned()
            .collect()
    }

    /// Most recent entries first.
    pub fn presence_history(&self, limit: usize) -> Vec<PresenceRecord> {
        let records = self.records.lock();
        records.presences.iter().rev().take(limit).cloned().collect()
    }

    pub fn alerts(&self) -> Vec<AlertRecord> {
        self.records.lock().alerts.clone()
    }

    pub fn unacknowledged_alerts(&self) -> Vec<AlertRecord> {
        self.records
            .lock()
            .alerts
            .iter()
            .filter(|a| !a.acknowledged)
            .cloned()
            .collect()
    }
}

impl PresenceStore for MemoryStore {
    fn log_entry(
        &self,
        tracking_id: TrackingId,
        source_id: &str,
        external_identity: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<LogId> {
        let mut records = self.records.lock();
        let id = records.presences.len() as LogId + 1;

        records.presences.push(PresenceRecord {
            id,
            tracking_id,
            source_id: source_id.to_string(),
            external_identity: external_identity.map(str::to_string),
            entry_time: at,
            exit_time: None,
            duration_seconds: None,
            status: PresenceStatus::Present,
        });

        Ok(id)
    }

    fn log_exit(&self, tracking_id: TrackingId, source_id: &str, at: DateTime<Utc>) -> Result<bool> {
        let mut records = self.records.lock();

        let open = records.presences.iter_mut().rev().find(|p| {
            p.tracking_id == tracking_id
                && p.source_id == source_id
                && p.status == PresenceStatus::Present
        });

        match open {
            Some(record) => {
                record.exit_time = Some(at);
                record.duration_seconds = Some((at - record.entry_time).num_seconds());
                record.status = PresenceStatus::Left;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn record_alert(
        &self,
        tracking_id: TrackingId,
        external_identity: Option<&str>,
        departed_at: DateTime<Utc>,
        timeout_minutes: i64,
    ) -> Result<AlertId> {
        let mut records = self.records.lock();
        let id = records.alerts.len() as AlertId + 1;

        records.alerts.push(AlertRecord {
            id,
            tracking_id,
            external_identity: external_identity.map(str::to_string),
            departed_at,
            timeout_minutes,
            created_at: Utc::now(),
            acknowledged: false,
            acknowledged_at: None,
        });

        Ok(id)
    }

    fn acknowledge_alert(&self, alert_id: AlertId) -> Result<bool> {
        let mut records = self.records.lock();

        match records.alerts.iter_mut().find(|a| a.id == alert_id) {
            Some(alert) if !alert.acknowledged => {
                alert.acknowledged = true;
                alert.acknowledged_at = Some(Utc::now());
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(Error::Persistence(format!("no alert record {}", alert_id))),
        }
    }
}

/// Appends one JSON line per triggered alert.
pub struct AlertLog {
    writer: Mutex<BufWriter<File>>,
}

impl AlertLog {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;

        tracing::info!(path = %path.as_ref().display(), "Writing alert log");

        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }
}

impl AlertObserver for AlertLog {
    fn on_alert(&self, alert: &PendingAlert) -> Result<()> {
        let mut writer = self.writer.lock();

        serde_json::to_writer(&mut *writer, alert)?;
        writer.write_all(b"\n")?;
        writer.flush()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn entry_and_exit_close_the_record() {
        let store = MemoryStore::new();
        let t0 = Utc::now();

        assert_eq!(store.log_entry(1, "cam1", None, t0).unwrap(), 1);
        store.log_entry(2, "cam2", Some("alice"), t0).unwrap();
        assert_eq!(store.active_presences(None).len(), 2);
        assert_eq!(store.active_presences(Some("cam2")).len(), 1);

        assert!(store.log_exit(1, "cam1", t0 + Duration::seconds(90)).unwrap());
        assert!(!store.log_exit(1, "cam1", t0 + Duration::seconds(95)).unwrap());

        let history = store.presence_history(10);
        assert_eq!(history.len(), 2);
        let closed = history.iter().find(|p| p.tracking_id == 1).unwrap();
        assert_eq!(closed.status, PresenceStatus::Left);
        assert_eq!(closed.duration_seconds, Some(90));
    }

    #[test]
    fn alert_records_and_acknowledgement() {
        let store = MemoryStore::new();
        let id = store.record_alert(7, Some("bob"), Utc::now(), 20).unwrap();

        assert_eq!(store.unacknowledged_alerts().len(), 1);
        assert!(store.acknowledge_alert(id).unwrap());
        assert!(!store.acknowledge_alert(id).unwrap());
        assert!(store.unacknowledged_alerts().is_empty());
        assert!(matches!(store.acknowledge_alert(99), Err(Error::Persistence(_))));
    }
}
