//! Turns a device's reading history into the fixed-length window the model
//! consumes.
//!
//! Raw hour-of-day jumps from 23.99 to 0 at midnight, so it is replaced by a
//! sine/cosine pair on the 24 hour circle.

use crate::telemetry::Reading;
use serde::Deserialize;
use std::f64::consts::TAU;
use thiserror::Error;
use time::{OffsetDateTime, UtcOffset};

/// Number of timesteps in every window.
pub const SEQUENCE_LENGTH: usize = 48;

pub const HOUR_SIN: &str = "hour_sin";
pub const HOUR_COS: &str = "hour_cos";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum WindowError {
    #[error("not enough readings: need {required}, have {available}")]
    InsufficientData { required: usize, available: usize },
    #[error("missing value for {field} at {timestamp}")]
    InvalidData {
        field: String,
        timestamp: OffsetDateTime,
    },
}

/// Pre-fitted robust scaling: `(x - center) / scale` per column.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RobustScaler {
    pub center: Vec<f64>,
    pub scale: Vec<f64>,
}

impl RobustScaler {
    pub fn identity(width: usize) -> Self {
        Self {
            center: vec![0.0; width],
            scale: vec![1.0; width],
        }
    }

    pub fn width(&self) -> usize {
        self.center.len()
    }

    pub fn is_consistent(&self) -> bool {
        self.center.len() == self.scale.len()
            && self
                .center
                .iter()
                .chain(self.scale.iter())
                .all(|value| value.is_finite())
    }

    /// A zero scale (constant column at fit time) leaves the column unscaled.
    pub fn transform_row(&self, row: &mut [f64]) {
        for ((value, center), scale) in row.iter_mut().zip(&self.center).zip(&self.scale) {
            let scale = if *scale == 0.0 { 1.0 } else { *scale };
            *value = (*value - center) / scale;
        }
    }
}

/// `SEQUENCE_LENGTH` rows of scaled features, oldest first.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureWindow {
    rows: Vec<Vec<f64>>,
    width: usize,
}

impl FeatureWindow {
    pub fn rows(&self) -> &[Vec<f64>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn width(&self) -> usize {
        self.width
    }

    #[cfg(test)]
    pub(crate) fn from_rows(rows: Vec<Vec<f64>>) -> Self {
        let width = rows.first().map(Vec::len).unwrap_or(0);
        Self { rows, width }
    }
}

#[derive(Debug, Clone)]
pub struct FeaturePreparer {
    features: Vec<String>,
    scaler: RobustScaler,
    sequence_length: usize,
}

impl FeaturePreparer {
    pub fn new(features: Vec<String>, scaler: RobustScaler) -> Self {
        Self {
            features,
            scaler,
            sequence_length: SEQUENCE_LENGTH,
        }
    }

    pub fn features(&self) -> &[String] {
        &self.features
    }

    pub fn sequence_length(&self) -> usize {
        self.sequence_length
    }

    /// Builds the window from the most recent readings. `readings` may come
    /// in any order.
    pub fn prepare(&self, readings: &[Reading]) -> Result<FeatureWindow, WindowError> {
        if readings.len() < self.sequence_length {
            return Err(WindowError::InsufficientData {
                required: self.sequence_length,
                available: readings.len(),
            });
        }

        let mut ordered: Vec<&Reading> = readings.iter().collect();
        ordered.sort_by_key(|reading| reading.timestamp);
        let recent = &ordered[ordered.len() - self.sequence_length..];

        let mut rows = Vec::with_capacity(self.sequence_length);
        for reading in recent {
            let mut row = self.feature_row(reading)?;
            self.scaler.transform_row(&mut row);
            rows.push(row);
        }

        Ok(FeatureWindow {
            rows,
            width: self.features.len(),
        })
    }

    fn feature_row(&self, reading: &Reading) -> Result<Vec<f64>, WindowError> {
        let hour = hour_of_day(reading.timestamp);
        let mut row = Vec::with_capacity(self.features.len());
        for feature in &self.features {
            let value = match feature.as_str() {
                HOUR_SIN => Some((TAU * hour / 24.0).sin()),
                HOUR_COS => Some((TAU * hour / 24.0).cos()),
                name => reading.measurement(name).filter(|value| value.is_finite()),
            };
            let value = value.ok_or_else(|| WindowError::InvalidData {
                field: feature.clone(),
                timestamp: reading.timestamp,
            })?;
            row.push(value);
        }
        Ok(row)
    }
}

/// Hours since UTC midnight, minute resolution, in `[0, 24)`.
pub fn hour_of_day(timestamp: OffsetDateTime) -> f64 {
    let utc = timestamp.to_offset(UtcOffset::UTC);
    f64::from(utc.hour()) + f64::from(utc.minute()) / 60.0
}
