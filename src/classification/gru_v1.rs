//! Single-layer GRU followed by a dense softmax head.
//!
//! Gate layout follows the common `[reset, update, new]` stacking:
//!
//! ```text
//! r  = sigmoid(W_ir x + b_ir + W_hr h + b_hr)
//! z  = sigmoid(W_iz x + b_iz + W_hz h + b_hz)
//! n  = tanh(W_in x + b_in + r * (W_hn h + b_hn))
//! h' = (1 - z) * n + z * h
//! ```
//!
//! The final hidden state feeds `softmax(dense_weight h + dense_bias)`.

use crate::classification::ArtifactError;
use crate::classification::features::FeatureWindow;
use crate::classification::model::{PhaseModel, softmax};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct GruV1Params {
    pub hidden_size: usize,
    /// 3H rows of F columns.
    pub weight_ih: Vec<Vec<f64>>,
    /// 3H rows of H columns.
    pub weight_hh: Vec<Vec<f64>>,
    pub bias_ih: Vec<f64>,
    pub bias_hh: Vec<f64>,
    /// C rows of H columns.
    pub dense_weight: Vec<Vec<f64>>,
    pub dense_bias: Vec<f64>,
}

#[derive(Debug)]
pub struct GruV1Model {
    params: GruV1Params,
    input_width: usize,
}

impl GruV1Model {
    pub fn new(params: GruV1Params, input_width: usize) -> Result<Self, ArtifactError> {
        validate(&params, input_width)?;
        Ok(Self {
            params,
            input_width,
        })
    }

    fn step(&self, input: &[f64], hidden: &[f64]) -> Vec<f64> {
        let size = self.params.hidden_size;
        let gates_input = affine(&self.params.weight_ih, input, &self.params.bias_ih);
        let gates_hidden = affine(&self.params.weight_hh, hidden, &self.params.bias_hh);

        (0..size)
            .map(|j| {
                let reset = sigmoid(gates_input[j] + gates_hidden[j]);
                let update = sigmoid(gates_input[size + j] + gates_hidden[size + j]);
                let candidate =
                    (gates_input[2 * size + j] + reset * gates_hidden[2 * size + j]).tanh();
                (1.0 - update) * candidate + update * hidden[j]
            })
            .collect()
    }
}

impl PhaseModel for GruV1Model {
    fn predict(&self, window: &FeatureWindow) -> Vec<f64> {
        let mut hidden = vec![0.0; self.params.hidden_size];
        for row in window.rows() {
            hidden = self.step(row, &hidden);
        }
        let logits = affine(&self.params.dense_weight, &hidden, &self.params.dense_bias);
        softmax(&logits)
    }

    fn input_width(&self) -> usize {
        self.input_width
    }

    fn class_count(&self) -> usize {
        self.params.dense_bias.len()
    }
}

fn affine(weights: &[Vec<f64>], input: &[f64], bias: &[f64]) -> Vec<f64> {
    weights
        .iter()
        .zip(bias)
        .map(|(row, b)| row.iter().zip(input).map(|(w, x)| w * x).sum::<f64>() + b)
        .collect()
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

fn validate(params: &GruV1Params, input_width: usize) -> Result<(), ArtifactError> {
    let hidden = params.hidden_size;
    if hidden == 0 {
        return Err(invalid("hidden_size must be positive"));
    }
    check_matrix("weight_ih", &params.weight_ih, 3 * hidden, input_width)?;
    check_matrix("weight_hh", &params.weight_hh, 3 * hidden, hidden)?;
    check_vector("bias_ih", &params.bias_ih, 3 * hidden)?;
    check_vector("bias_hh", &params.bias_hh, 3 * hidden)?;

    let classes = params.dense_bias.len();
    if classes == 0 {
        return Err(invalid("dense_bias must not be empty"));
    }
    check_matrix("dense_weight", &params.dense_weight, classes, hidden)?;
    check_vector("dense_bias", &params.dense_bias, classes)?;
    Ok(())
}

fn check_matrix(
    name: &str,
    matrix: &[Vec<f64>],
    rows: usize,
    cols: usize,
) -> Result<(), ArtifactError> {
    if matrix.len() != rows {
        return Err(invalid(&format!(
            "{name}: expected {rows} rows, found {}",
            matrix.len()
        )));
    }
    for (index, row) in matrix.iter().enumerate() {
        if row.len() != cols {
            return Err(invalid(&format!(
                "{name}: row {index} has {} columns, expected {cols}",
                row.len()
            )));
        }
        if row.iter().any(|value| !value.is_finite()) {
            return Err(invalid(&format!("{name}: row {index} has non-finite values")));
        }
    }
    Ok(())
}

fn check_vector(name: &str, vector: &[f64], len: usize) -> Result<(), ArtifactError> {
    if vector.len() != len {
        return Err(invalid(&format!(
            "{name}: expected {len} values, found {}",
            vector.len()
        )));
    }
    if vector.iter().any(|value| !value.is_finite()) {
        return Err(invalid(&format!("{name}: non-finite values")));
    }
    Ok(())
}

fn invalid(message: &str) -> ArtifactError {
    ArtifactError::Invalid(format!("gru_v1 {message}"))
}
