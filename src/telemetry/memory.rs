use crate::classification::PhaseEstimate;
use crate::telemetry::{ClassificationRecord, DeviceState, Reading, StoreError, TelemetryStore};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Mutex, MutexGuard};
use time::OffsetDateTime;

#[derive(Debug, Default)]
struct Inner {
    readings: Vec<Reading>,
    states: BTreeMap<String, DeviceState>,
    history: Vec<ClassificationRecord>,
    failing_devices: HashSet<String>,
    listing_fails: bool,
}

/// Store kept entirely in memory.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_readings(readings: Vec<Reading>) -> Self {
        let store = Self::new();
        if let Ok(mut inner) = store.inner.lock() {
            inner.readings = readings;
        }
        store
    }

    pub fn insert_reading(&self, reading: Reading) -> Result<(), StoreError> {
        self.lock()?.readings.push(reading);
        Ok(())
    }

    pub fn seed_state(&self, device_id: &str, phase: &str, at: OffsetDateTime) -> Result<(), StoreError> {
        self.lock()?.states.insert(
            device_id.to_string(),
            DeviceState {
                device_id: device_id.to_string(),
                phase: phase.to_string(),
                updated_at: at,
            },
        );
        Ok(())
    }

    /// Makes every reading query for `device_id` fail.
    pub fn fail_queries_for(&self, device_id: &str) -> Result<(), StoreError> {
        self.lock()?.failing_devices.insert(device_id.to_string());
        Ok(())
    }

    /// Makes `devices()` fail until cleared.
    pub fn fail_device_listing(&self, fail: bool) -> Result<(), StoreError> {
        self.lock()?.listing_fails = fail;
        Ok(())
    }

    pub fn state(&self, device_id: &str) -> Result<Option<DeviceState>, StoreError> {
        Ok(self.lock()?.states.get(device_id).cloned())
    }

    pub fn history(&self) -> Result<Vec<ClassificationRecord>, StoreError> {
        Ok(self.lock()?.history.clone())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Unavailable("in-memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl TelemetryStore for InMemoryStore {
    async fn devices(&self) -> Result<Vec<String>, StoreError> {
        let inner = self.lock()?;
        if inner.listing_fails {
            return Err(StoreError::Unavailable("injected listing failure".to_string()));
        }
        let devices: BTreeSet<&str> = inner
            .readings
            .iter()
            .map(|reading| reading.device_id.as_str())
            .collect();
        Ok(devices.into_iter().map(str::to_string).collect())
    }

    async fn readings_since(
        &self,
        device_id: &str,
        since: OffsetDateTime,
    ) -> Result<Vec<Reading>, StoreError> {
        let inner = self.lock()?;
        if inner.failing_devices.contains(device_id) {
            return Err(StoreError::Query(format!("injected failure for {device_id}")));
        }
        let mut readings: Vec<Reading> = inner
            .readings
            .iter()
            .filter(|reading| reading.device_id == device_id && reading.timestamp >= since)
            .cloned()
            .collect();
        readings.sort_by_key(|reading| reading.timestamp);
        Ok(readings)
    }

    async fn last_phase(&self, device_id: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .lock()?
            .states
            .get(device_id)
            .map(|state| state.phase.clone()))
    }

    async fn set_last_phase(
        &self,
        device_id: &str,
        phase: &str,
        at: OffsetDateTime,
    ) -> Result<(), StoreError> {
        self.lock()?.states.insert(
            device_id.to_string(),
            DeviceState {
                device_id: device_id.to_string(),
                phase: phase.to_string(),
                updated_at: at,
            },
        );
        Ok(())
    }

    async fn append_classification(
        &self,
        device_id: &str,
        estimate: &PhaseEstimate,
        at: OffsetDateTime,
    ) -> Result<(), StoreError> {
        self.lock()?.history.push(ClassificationRecord {
            device_id: device_id.to_string(),
            phase: estimate.phase.clone(),
            probabilities: estimate.probabilities.clone(),
            timestamp: at,
        });
        Ok(())
    }
}
