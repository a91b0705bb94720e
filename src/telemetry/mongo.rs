//! MongoDB-backed [`TelemetryStore`].
//!
//! Collection and field names match the documents the ingestion API and
//! the dashboard already read and write.

use crate::classification::PhaseEstimate;
use crate::config::StoreSettings;
use crate::telemetry::{Reading, StoreError, TelemetryStore};
use async_trait::async_trait;
use futures::TryStreamExt;
use bson::{Bson, DateTime, Document, doc};
use mongodb::{Client, Collection};
use time::OffsetDateTime;
use tracing::{debug, warn};

const FIELD_DEVICE: &str = "id_dispositivo";
const FIELD_TIME: &str = "tiempo";
const FIELD_PHASE: &str = "fase";
const FIELD_PROBABILITIES: &str = "proba";
const FIELD_TIMESTAMP: &str = "timestamp";
const FIELD_CURRENT_PHASE: &str = "fase_actual";
const FIELD_UPDATED_AT: &str = "fecha";

/// Document keys that never hold a measurement.
const NON_MEASUREMENT_FIELDS: [&str; 4] = ["_id", FIELD_DEVICE, FIELD_TIME, "manual"];

#[derive(Debug, Clone)]
pub struct MongoStore {
    readings: Collection<Document>,
    history: Collection<Document>,
    state: Collection<Document>,
}

impl MongoStore {
    /// Connects and pings the database; any failure here is fatal for the
    /// service.
    pub async fn connect(settings: &StoreSettings) -> Result<Self, StoreError> {
        let client = Client::with_uri_str(&settings.uri)
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        let database = client.database(&settings.database);
        database
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;

        Ok(Self {
            readings: database.collection(&settings.readings_collection),
            history: database.collection(&settings.history_collection),
            state: database.collection(&settings.state_collection),
        })
    }
}

impl From<mongodb::error::Error> for StoreError {
    fn from(err: mongodb::error::Error) -> Self {
        StoreError::Query(err.to_string())
    }
}

#[async_trait]
impl TelemetryStore for MongoStore {
    async fn devices(&self) -> Result<Vec<String>, StoreError> {
        let values = self.readings.distinct(FIELD_DEVICE, doc! {}).await?;
        let mut devices = Vec::with_capacity(values.len());
        for value in values {
            match value {
                Bson::String(device) => devices.push(device),
                other => debug!(value = %other, "Ignoring non-string device id"),
            }
        }
        Ok(devices)
    }

    async fn readings_since(
        &self,
        device_id: &str,
        since: OffsetDateTime,
    ) -> Result<Vec<Reading>, StoreError> {
        let filter = doc! {
            FIELD_DEVICE: device_id,
            FIELD_TIME: { "$gte": to_bson_datetime(since) },
        };
        let documents: Vec<Document> = self
            .readings
            .find(filter)
            .sort(doc! { FIELD_TIME: 1 })
            .await?
            .try_collect()
            .await?;

        let mut readings = Vec::with_capacity(documents.len());
        for document in &documents {
            match reading_from_document(document) {
                Ok(reading) => readings.push(reading),
                Err(err) => warn!(device = device_id, error = %err, "Skipping reading"),
            }
        }
        Ok(readings)
    }

    async fn last_phase(&self, device_id: &str) -> Result<Option<String>, StoreError> {
        let document = self.state.find_one(doc! { FIELD_DEVICE: device_id }).await?;
        Ok(document.and_then(|doc| doc.get_str(FIELD_CURRENT_PHASE).ok().map(str::to_string)))
    }

    async fn set_last_phase(
        &self,
        device_id: &str,
        phase: &str,
        at: OffsetDateTime,
    ) -> Result<(), StoreError> {
        self.state
            .update_one(
                doc! { FIELD_DEVICE: device_id },
                doc! { "$set": { FIELD_CURRENT_PHASE: phase, FIELD_UPDATED_AT: to_bson_datetime(at) } },
            )
            .upsert(true)
            .await?;
        Ok(())
    }

    async fn append_classification(
        &self,
        device_id: &str,
        estimate: &PhaseEstimate,
        at: OffsetDateTime,
    ) -> Result<(), StoreError> {
        self.history
            .insert_one(doc! {
                FIELD_DEVICE: device_id,
                FIELD_PHASE: estimate.phase.as_str(),
                FIELD_PROBABILITIES: estimate.probabilities.clone(),
                FIELD_TIMESTAMP: to_bson_datetime(at),
            })
            .await?;
        Ok(())
    }
}

/// Maps a stored reading document. Numeric fields become measurements;
/// nulls and non-numeric values are left out.
pub fn reading_from_document(document: &Document) -> Result<Reading, StoreError> {
    let device_id = document
        .get_str(FIELD_DEVICE)
        .map_err(|_| StoreError::Malformed(format!("missing {FIELD_DEVICE}")))?;
    // Ingestion stores BSON dates; the `$gte` filter never matches other types.
    let timestamp = match document.get(FIELD_TIME) {
        Some(Bson::DateTime(value)) => value.to_time_0_3(),
        _ => {
            return Err(StoreError::Malformed(format!(
                "missing or non-date {FIELD_TIME}"
            )));
        }
    };

    let mut reading = Reading::new(device_id, timestamp);
    for (key, value) in document {
        if NON_MEASUREMENT_FIELDS.contains(&key.as_str()) {
            continue;
        }
        let number = match value {
            Bson::Double(v) => Some(*v),
            Bson::Int32(v) => Some(f64::from(*v)),
            Bson::Int64(v) => Some(*v as f64),
            _ => None,
        };
        if let Some(number) = number.filter(|n| n.is_finite()) {
            reading.measurements.insert(key.clone(), number);
        }
    }
    Ok(reading)
}

fn to_bson_datetime(at: OffsetDateTime) -> DateTime {
    DateTime::from_time_0_3(at)
}
