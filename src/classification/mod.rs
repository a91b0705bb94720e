//! Growth-phase classification: feature windows, the sequence model, label
//! decoding and the periodic scheduler that drives them.

use crate::telemetry::Reading;
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;
use tracing::warn;

pub mod features;
pub mod gru_v1;
pub mod model;
pub mod scheduler;

use features::{FeaturePreparer, FeatureWindow, RobustScaler, WindowError};
use gru_v1::{GruV1Model, GruV1Params};
use model::{LabelDecoder, PhaseModel, argmax};

/// Classifier output for one device at one instant.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseEstimate {
    pub phase: String,
    pub class_index: usize,
    pub probabilities: Vec<f64>,
}

/// Every pre-trained transform, in one JSON document.
#[derive(Debug, Deserialize)]
pub struct ArtifactFile {
    pub model: String,
    pub features: Vec<String>,
    #[serde(default)]
    pub scaler: Option<RobustScaler>,
    pub labels: Vec<String>,
    pub params: serde_json::Value,
}

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("failed to read model artifact: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse model artifact: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid model artifact: {0}")]
    Invalid(String),
}

// Model Factory
pub fn create_model(artifact: &ArtifactFile) -> Result<Box<dyn PhaseModel>, ArtifactError> {
    match artifact.model.as_str() {
        "gru_v1" => {
            let params: GruV1Params = serde_json::from_value(artifact.params.clone())?;
            Ok(Box::new(GruV1Model::new(params, artifact.features.len())?))
        }
        other => Err(ArtifactError::Invalid(format!("unknown model: {other}"))),
    }
}

pub fn load_classifier_from_path(path: impl AsRef<Path>) -> Result<PhaseClassifier, ArtifactError> {
    let contents = std::fs::read_to_string(path)?;
    let artifact: ArtifactFile = serde_json::from_str(&contents)?;
    classifier_from_artifact(artifact)
}

pub fn classifier_from_artifact(artifact: ArtifactFile) -> Result<PhaseClassifier, ArtifactError> {
    if artifact.features.is_empty() {
        return Err(ArtifactError::Invalid("no features listed".to_string()));
    }

    let width = artifact.features.len();
    let scaler = match artifact.scaler.clone() {
        Some(scaler) if scaler.width() == width && scaler.is_consistent() => scaler,
        Some(scaler) => {
            return Err(ArtifactError::Invalid(format!(
                "scaler covers {} columns with {} scales, expected {width} finite columns",
                scaler.center.len(),
                scaler.scale.len()
            )));
        }
        None => RobustScaler::identity(width),
    };

    let model = create_model(&artifact)?;
    if model.input_width() != width {
        return Err(ArtifactError::Invalid(format!(
            "model expects {} inputs, {width} features listed",
            model.input_width()
        )));
    }
    if model.class_count() != artifact.labels.len() {
        warn!(
            classes = model.class_count(),
            labels = artifact.labels.len(),
            "Label table does not cover every model class"
        );
    }

    Ok(PhaseClassifier::new(
        FeaturePreparer::new(artifact.features, scaler),
        model,
        LabelDecoder::new(artifact.labels),
    ))
}

/// Feature preparation, inference and label decoding behind one call.
#[derive(Debug)]
pub struct PhaseClassifier {
    preparer: FeaturePreparer,
    model: Box<dyn PhaseModel>,
    labels: LabelDecoder,
}

impl PhaseClassifier {
    pub fn new(preparer: FeaturePreparer, model: Box<dyn PhaseModel>, labels: LabelDecoder) -> Self {
        Self {
            preparer,
            model,
            labels,
        }
    }

    pub fn preparer(&self) -> &FeaturePreparer {
        &self.preparer
    }

    pub fn classify(&self, readings: &[Reading]) -> Result<PhaseEstimate, WindowError> {
        let window = self.preparer.prepare(readings)?;
        Ok(self.classify_window(&window))
    }

    /// An index without a label is reported as its decimal string; the
    /// estimate is still usable for transition tracking.
    pub fn classify_window(&self, window: &FeatureWindow) -> PhaseEstimate {
        let probabilities = self.model.predict(window);
        let class_index = argmax(&probabilities);
        let phase = match self.labels.decode(class_index) {
            Ok(label) => label.to_string(),
            Err(err) => {
                warn!(error = %err, "Falling back to raw class index");
                class_index.to_string()
            }
        };

        PhaseEstimate {
            phase,
            class_index,
            probabilities,
        }
    }
}
