//! Phase model trait.
//!
//! A model maps one [`FeatureWindow`] to a probability per class. Models are
//! selected via the `model` field of the artifact file and loaded at startup.

use crate::classification::features::FeatureWindow;
use thiserror::Error;

pub trait PhaseModel: Send + Sync + std::fmt::Debug {
    /// Class probabilities for `window`; non-negative, summing to ~1.
    fn predict(&self, window: &FeatureWindow) -> Vec<f64>;

    /// Number of input columns per timestep.
    fn input_width(&self) -> usize;

    /// Length of the vector returned by [`PhaseModel::predict`].
    fn class_count(&self) -> usize;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no label for class index {index} ({known} labels known)")]
pub struct DecodeFailure {
    pub index: usize,
    pub known: usize,
}

/// Class index to phase label table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelDecoder {
    labels: Vec<String>,
}

impl LabelDecoder {
    pub fn new(labels: Vec<String>) -> Self {
        Self { labels }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn decode(&self, index: usize) -> Result<&str, DecodeFailure> {
        self.labels
            .get(index)
            .map(String::as_str)
            .ok_or(DecodeFailure {
                index,
                known: self.labels.len(),
            })
    }
}

/// Index of the largest probability; ties resolve to the lowest index.
pub fn argmax(values: &[f64]) -> usize {
    let mut best = 0;
    for (index, value) in values.iter().enumerate() {
        if *value > values[best] {
            best = index;
        }
    }
    best
}

/// Numerically stable softmax.
pub fn softmax(logits: &[f64]) -> Vec<f64> {
    let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = logits.iter().map(|logit| (logit - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|value| value / sum).collect()
}
