//! Device telemetry as seen by the classifier: raw readings, the current
//! phase per device and the append-only classification history.
//!
//! [`TelemetryStore`] is the document-store contract. The service runs on
//! [`mongo::MongoStore`]; tests and demos use [`memory::InMemoryStore`].

use crate::classification::PhaseEstimate;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use time::OffsetDateTime;

pub mod memory;
pub mod mongo;

/// One ingested sensor sample. Measurements that were absent or null in the
/// stored document are simply not present in `measurements`.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub device_id: String,
    pub timestamp: OffsetDateTime,
    pub measurements: BTreeMap<String, f64>,
}

impl Reading {
    pub fn new(device_id: impl Into<String>, timestamp: OffsetDateTime) -> Self {
        Self {
            device_id: device_id.into(),
            timestamp,
            measurements: BTreeMap::new(),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: f64) -> Self {
        self.measurements.insert(name.into(), value);
        self
    }

    pub fn measurement(&self, name: &str) -> Option<f64> {
        self.measurements.get(name).copied()
    }
}

/// Last known phase of a device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceState {
    pub device_id: String,
    pub phase: String,
    pub updated_at: OffsetDateTime,
}

/// One row of classification history.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationRecord {
    pub device_id: String,
    pub phase: String,
    pub probabilities: Vec<f64>,
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("query failed: {0}")]
    Query(String),
    #[error("malformed document: {0}")]
    Malformed(String),
}

/// Each call is atomic on its own; nothing couples the history append to the
/// state upsert.
#[async_trait]
pub trait TelemetryStore: Send + Sync + fmt::Debug {
    /// Distinct device ids that have ever reported a reading.
    async fn devices(&self) -> Result<Vec<String>, StoreError>;

    /// Readings for `device_id` at or after `since`, oldest first.
    async fn readings_since(
        &self,
        device_id: &str,
        since: OffsetDateTime,
    ) -> Result<Vec<Reading>, StoreError>;

    async fn last_phase(&self, device_id: &str) -> Result<Option<String>, StoreError>;

    /// Insert or overwrite the device's current phase.
    async fn set_last_phase(
        &self,
        device_id: &str,
        phase: &str,
        at: OffsetDateTime,
    ) -> Result<(), StoreError>;

    async fn append_classification(
        &self,
        device_id: &str,
        estimate: &PhaseEstimate,
        at: OffsetDateTime,
    ) -> Result<(), StoreError>;
}
