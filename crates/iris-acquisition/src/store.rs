//! Persistence collaborator.
//!
//! The device row is the source of truth for "is a job running"; the
//! measurement records are append-only.

use chrono::{DateTime, Local};
use iris_common::error::{AcqError, AcqResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tracing::debug;

/// One reference channel and the equipment scored against it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceChannel {
    /// Reference id.
    pub id: u64,
    /// Equipment names.
    pub eq: Vec<String>,
}

/// Score of one equipment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EquipmentScore {
    /// Equipment name.
    pub eq: String,
    /// Score value.
    pub value: u32,
}

/// Scores of all equipment of one reference channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceScore {
    /// Reference id.
    pub id: u64,
    /// Per-equipment scores.
    pub values: Vec<EquipmentScore>,
}

/// Whether cycles follow each other automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeasureMode {
    /// Automatic repetition.
    #[default]
    Auto,
    /// Manual mode.
    Manual,
}

impl MeasureMode {
    /// Mode for the `auto` flag of a start request.
    pub fn from_auto(auto: bool) -> Self {
        if auto {
            Self::Auto
        } else {
            Self::Manual
        }
    }
}

/// One job: repeated measurement cycles for a single device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeasurementJob {
    /// `{sn}_{YYYYmmddHHMMSS}`.
    pub job_id: String,
    /// Device serial number.
    pub sn: String,
    /// Reference channels, in request order.
    pub refs: Vec<ReferenceChannel>,
    /// Automatic or manual mode.
    pub mode: MeasureMode,
    /// Pause between cycles.
    pub interval: Duration,
    /// Target number of cycles.
    pub repeat: u32,
    /// Tags copied onto every record.
    pub tags: Vec<String>,
}

/// Device row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Serial number.
    pub sn: String,
    /// Set while a job runs.
    pub running: bool,
    /// Last job started on the device.
    pub job_id: Option<String>,
    /// Reference channels of the last job.
    pub refs: Vec<ReferenceChannel>,
    /// Mode of the last job.
    pub mode: MeasureMode,
    /// Interval of the last job.
    pub interval: Duration,
    /// Target repeat count of the last job.
    pub repeat: u32,
    /// Tags of the last job.
    pub tags: Vec<String>,
    /// Cycles recorded by the last job.
    pub count: u32,
}

impl DeviceRecord {
    /// Idle device without job history.
    pub fn new(sn: impl Into<String>) -> Self {
        Self {
            sn: sn.into(),
            running: false,
            job_id: None,
            refs: Vec::new(),
            mode: MeasureMode::default(),
            interval: Duration::ZERO,
            repeat: 0,
            tags: Vec::new(),
            count: 0,
        }
    }
}

/// One persisted measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRecord {
    /// Record id assigned by the store.
    pub id: u64,
    /// Job that produced the record.
    pub job_id: String,
    /// Device serial number.
    pub sn: String,
    /// Time the record was taken.
    pub timestamp: DateTime<Local>,
    /// Sample file name.
    pub file_name: String,
    /// Scores per reference channel.
    pub score: Vec<ReferenceScore>,
    /// Job tags.
    pub tags: Vec<String>,
}

impl MeasurementRecord {
    /// All score values, flattened in reference then equipment order.
    pub fn score_values(&self) -> Vec<u32> {
        self.score
            .iter()
            .flat_map(|r| r.values.iter().map(|v| v.value))
            .collect()
    }
}

/// Operations the acquisition layer needs from persistence.
pub trait MeasurementStore: Send + Sync {
    /// Device row for `sn`.
    ///
    /// # Errors
    ///
    /// Returns [`AcqError::DeviceNotFound`] for an unknown device.
    fn device(&self, sn: &str) -> AcqResult<DeviceRecord>;

    /// Every device row.
    fn devices(&self) -> AcqResult<Vec<DeviceRecord>>;

    /// Mark the device running with `job` and reset its count.
    fn set_job_started(&self, sn: &str, job: &MeasurementJob) -> AcqResult<()>;

    /// Clear the device's running flag.
    fn set_job_stopped(&self, sn: &str) -> AcqResult<()>;

    /// Increment the device's count and return the new value.
    fn increment_count(&self, sn: &str) -> AcqResult<u32>;

    /// Append a record; the record's id is assigned by the store and returned.
    fn insert_measurement(&self, record: MeasurementRecord) -> AcqResult<u64>;

    /// Every record in insertion order.
    fn measurements(&self) -> AcqResult<Vec<MeasurementRecord>>;

    /// Records of one job in insertion order.
    fn measurements_for_job(&self, job_id: &str) -> AcqResult<Vec<MeasurementRecord>> {
        Ok(self
            .measurements()?
            .into_iter()
            .filter(|r| r.job_id == job_id)
            .collect())
    }
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    devices: RwLock<HashMap<String, DeviceRecord>>,
    records: RwLock<Vec<MeasurementRecord>>,
    next_id: AtomicU64,
    insert_failure: RwLock<Option<String>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store knowing the given devices.
    pub fn with_devices<I, S>(serials: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let store = Self::new();
        for sn in serials {
            store.register_device(sn);
        }
        store
    }

    /// Add an idle device; an existing row is left untouched.
    pub fn register_device(&self, sn: impl Into<String>) {
        let sn = sn.into();
        self.devices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(sn.clone())
            .or_insert_with(|| DeviceRecord::new(sn));
    }

    /// Make every following insert fail with `message` (`None` restores
    /// normal operation).
    pub fn fail_inserts(&self, message: Option<&str>) {
        *self
            .insert_failure
            .write()
            .unwrap_or_else(PoisonError::into_inner) = message.map(str::to_string);
    }

    fn update_device<T>(&self, sn: &str, f: impl FnOnce(&mut DeviceRecord) -> T) -> AcqResult<T> {
        let mut devices = self.devices.write().unwrap_or_else(PoisonError::into_inner);
        let device = devices
            .get_mut(sn)
            .ok_or_else(|| AcqError::DeviceNotFound { sn: sn.to_string() })?;
        Ok(f(device))
    }
}

impl MeasurementStore for MemoryStore {
    fn device(&self, sn: &str) -> AcqResult<DeviceRecord> {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(sn)
            .cloned()
            .ok_or_else(|| AcqError::DeviceNotFound { sn: sn.to_string() })
    }

    fn devices(&self) -> AcqResult<Vec<DeviceRecord>> {
        let mut devices: Vec<DeviceRecord> = self
            .devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        devices.sort_by(|a, b| a.sn.cmp(&b.sn));
        Ok(devices)
    }

    fn set_job_started(&self, sn: &str, job: &MeasurementJob) -> AcqResult<()> {
        self.update_device(sn, |device| {
            device.running = true;
            device.job_id = Some(job.job_id.clone());
            device.refs = job.refs.clone();
            device.mode = job.mode;
            device.interval = job.interval;
            device.repeat = job.repeat;
            device.tags = job.tags.clone();
            device.count = 0;
        })?;
        debug!(sn, job = %job.job_id, "Device marked running");
        Ok(())
    }

    fn set_job_stopped(&self, sn: &str) -> AcqResult<()> {
        self.update_device(sn, |device| device.running = false)?;
        debug!(sn, "Device marked stopped");
        Ok(())
    }

    fn increment_count(&self, sn: &str) -> AcqResult<u32> {
        self.update_device(sn, |device| {
            device.count += 1;
            device.count
        })
    }

    fn insert_measurement(&self, mut record: MeasurementRecord) -> AcqResult<u64> {
        if let Some(message) = self
            .insert_failure
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            return Err(AcqError::Persistence(message));
        }

        record.id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let id = record.id;
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
        Ok(id)
    }

    fn measurements(&self) -> AcqResult<Vec<MeasurementRecord>> {
        Ok(self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(sn: &str) -> MeasurementJob {
        MeasurementJob {
            job_id: format!("{sn}_20240101000000"),
            sn: sn.into(),
            refs: vec![ReferenceChannel {
                id: 7,
                eq: vec!["EQ1".into()],
            }],
            mode: MeasureMode::Auto,
            interval: Duration::from_secs(1),
            repeat: 3,
            tags: vec!["a,b".into()],
        }
    }

    fn record(job_id: &str, sn: &str) -> MeasurementRecord {
        MeasurementRecord {
            id: 0,
            job_id: job_id.into(),
            sn: sn.into(),
            timestamp: Local::now(),
            file_name: format!("{job_id}.txt"),
            score: Vec::new(),
            tags: Vec::new(),
        }
    }

    #[test]
    fn test_unknown_device() {
        let store = MemoryStore::new();
        assert_eq!(
            store.device("404").unwrap_err(),
            AcqError::DeviceNotFound { sn: "404".into() }
        );
        assert!(store.set_job_stopped("404").is_err());
    }

    #[test]
    fn test_job_lifecycle_on_device_row() {
        let store = MemoryStore::with_devices(["1001"]);
        store.set_job_started("1001", &job("1001")).unwrap();

        let device = store.device("1001").unwrap();
        assert!(device.running);
        assert_eq!(device.repeat, 3);
        assert_eq!(device.count, 0);

        assert_eq!(store.increment_count("1001").unwrap(), 1);
        assert_eq!(store.increment_count("1001").unwrap(), 2);

        store.set_job_stopped("1001").unwrap();
        let device = store.device("1001").unwrap();
        assert!(!device.running);
        assert_eq!(device.job_id.as_deref(), Some("1001_20240101000000"));

        // Restart resets the count
        store.set_job_started("1001", &job("1001")).unwrap();
        assert_eq!(store.device("1001").unwrap().count, 0);
    }

    #[test]
    fn test_records_get_ids_and_filter_by_job() {
        let store = MemoryStore::with_devices(["1001", "1002"]);
        assert_eq!(store.insert_measurement(record("j1", "1001")).unwrap(), 1);
        assert_eq!(store.insert_measurement(record("j2", "1002")).unwrap(), 2);
        assert_eq!(store.insert_measurement(record("j1", "1001")).unwrap(), 3);

        let j1 = store.measurements_for_job("j1").unwrap();
        assert_eq!(j1.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 3]);
    }

    #[test]
    fn test_insert_failure() {
        let store = MemoryStore::with_devices(["1001"]);
        store.fail_inserts(Some("disk full"));
        assert_eq!(
            store.insert_measurement(record("j1", "1001")).unwrap_err(),
            AcqError::Persistence("disk full".into())
        );
        store.fail_inserts(None);
        assert!(store.insert_measurement(record("j1", "1001")).is_ok());
    }

    #[test]
    fn test_register_is_idempotent() {
        let store = MemoryStore::with_devices(["1001"]);
        store.set_job_started("1001", &job("1001")).unwrap();
        store.register_device("1001");
        assert!(store.device("1001").unwrap().running);
        assert_eq!(store.devices().unwrap().len(), 1);
    }

    #[test]
    fn test_record_serializes_scores() {
        let mut rec = record("j1", "1001");
        rec.score = vec![ReferenceScore {
            id: 7,
            values: vec![EquipmentScore {
                eq: "EQ1".into(),
                value: 42,
            }],
        }];
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["score"][0]["values"][0]["value"], 42);
        assert_eq!(rec.score_values(), vec![42]);
    }
}
