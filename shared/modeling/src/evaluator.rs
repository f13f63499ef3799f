use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use orchestra_core::{ArchitectureDescriptor, list_architectures};

use crate::codec::TensorMap;

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("failed to read dataset file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to decode dataset file: {0}")]
    Decode(#[from] postcard::Error),

    #[error("weights are missing tensor {0}")]
    MissingTensor(String),

    #[error("dataset feature dim {dataset} does not match architecture input {input}")]
    DimensionMismatch { dataset: usize, input: usize },
}

/// Held-out evaluation split: `samples` is row-major `n x feature_dim`,
/// labels are class indices.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EvalDataset {
    pub feature_dim: usize,
    pub samples: Vec<f32>,
    pub labels: Vec<u32>,
}

impl EvalDataset {
    pub fn from_file(path: &Path) -> Result<Self, EvalError> {
        let bytes = std::fs::read(path)?;
        Ok(postcard::from_bytes(&bytes)?)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Server-side evaluation of aggregated weights on held-out data.
///
/// Datasets are loaded per architecture key from `<key>.heldout` files in
/// the configured data directory. Architectures without a dataset simply
/// report no server-side metrics; the coordinator falls back to the
/// device-reported averages.
pub struct Evaluator {
    datasets: HashMap<String, EvalDataset>,
}

impl Evaluator {
    pub fn empty() -> Self {
        Evaluator {
            datasets: HashMap::new(),
        }
    }

    pub fn from_dir(dir: &Path) -> Self {
        let mut datasets = HashMap::new();
        for arch in list_architectures() {
            let path = dir.join(format!("{}.heldout", arch.key));
            if !path.exists() {
                continue;
            }
            match EvalDataset::from_file(&path) {
                Ok(dataset) => {
                    info!(
                        architecture = arch.key,
                        samples = dataset.len(),
                        "loaded held-out evaluation dataset"
                    );
                    datasets.insert(arch.key.to_string(), dataset);
                }
                Err(err) => {
                    warn!(architecture = arch.key, "failed to load held-out dataset: {err:#}");
                }
            }
        }
        Evaluator { datasets }
    }

    #[cfg(test)]
    pub fn with_dataset(key: &str, dataset: EvalDataset) -> Self {
        Evaluator {
            datasets: HashMap::from([(key.to_string(), dataset)]),
        }
    }

    pub fn has_dataset(&self, architecture: &str) -> bool {
        self.datasets.contains_key(architecture)
    }

    /// Forward pass over the held-out split, returning `(loss, accuracy)`,
    /// or `None` when no dataset is loaded for the architecture.
    pub fn evaluate(
        &self,
        descriptor: &ArchitectureDescriptor,
        weights: &TensorMap,
    ) -> Result<Option<(f64, f64)>, EvalError> {
        let Some(dataset) = self.datasets.get(descriptor.key) else {
            return Ok(None);
        };

        let layers = descriptor.dense_layers();
        let input_dim = layers.first().map(|l| l.input_dim).unwrap_or(0);
        if dataset.feature_dim != input_dim {
            return Err(EvalError::DimensionMismatch {
                dataset: dataset.feature_dim,
                input: input_dim,
            });
        }

        let n = dataset.len();
        let mut correct = 0usize;
        let mut loss_sum = 0.0f64;

        for i in 0..n {
            let mut activations: Vec<f32> =
                dataset.samples[i * dataset.feature_dim..(i + 1) * dataset.feature_dim].to_vec();

            for (layer_idx, layer) in layers.iter().enumerate() {
                let w = weights
                    .get(layer.weight)
                    .ok_or_else(|| EvalError::MissingTensor(layer.weight.to_string()))?;
                let b = weights
                    .get(layer.bias)
                    .ok_or_else(|| EvalError::MissingTensor(layer.bias.to_string()))?;

                let mut out = Vec::with_capacity(layer.output_dim);
                for row in 0..layer.output_dim {
                    let mut acc = b[row];
                    let row_weights = &w[row * layer.input_dim..(row + 1) * layer.input_dim];
                    for (x, wv) in activations.iter().zip(row_weights) {
                        acc += x * wv;
                    }
                    // ReLU between layers; the last layer stays as logits.
                    if layer_idx + 1 < layers.len() {
                        acc = acc.max(0.0);
                    }
                    out.push(acc);
                }
                activations = out;
            }

            let label = dataset.labels[i] as usize;
            let (loss, predicted) = softmax_cross_entropy(&activations, label);
            loss_sum += loss;
            if predicted == label {
                correct += 1;
            }
        }

        Ok(Some((loss_sum / n as f64, correct as f64 / n as f64)))
    }
}

fn softmax_cross_entropy(logits: &[f32], label: usize) -> (f64, usize) {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exp_sum: f64 = logits.iter().map(|&l| ((l - max) as f64).exp()).sum();
    let correct_prob = ((logits[label] - max) as f64).exp() / exp_sum;
    let loss = -correct_prob.max(1e-12).ln();

    let predicted = logits
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i)
        .unwrap_or(0);
    (loss, predicted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use orchestra_core::get_architecture;

    // Weights that route feature 0 to class 0 and feature 1 to class 1
    // through the mnist-shaped chain, so the forward pass is computable by
    // hand.
    fn toy_weights() -> TensorMap {
        let mut hidden_weight = vec![0.0f32; 128 * 784];
        // First hidden unit copies feature 0, second copies feature 1.
        hidden_weight[0] = 1.0;
        hidden_weight[784 + 1] = 1.0;

        let mut output_weight = vec![0.0f32; 10 * 128];
        // Class 0 reads hidden unit 0, class 1 reads hidden unit 1.
        output_weight[0] = 1.0;
        output_weight[128 + 1] = 1.0;

        TensorMap::from([
            ("hidden_weight".to_string(), hidden_weight),
            ("hidden_bias".to_string(), vec![0.0; 128]),
            ("output_weight".to_string(), output_weight),
            ("output_bias".to_string(), vec![0.0; 10]),
        ])
    }

    fn toy_dataset() -> EvalDataset {
        // Two samples: feature 0 hot (class 0) and feature 1 hot (class 1).
        let mut samples = vec![0.0f32; 2 * 784];
        samples[0] = 4.0;
        samples[784 + 1] = 4.0;
        EvalDataset {
            feature_dim: 784,
            samples,
            labels: vec![0, 1],
        }
    }

    #[test]
    fn evaluate_computes_accuracy_and_loss() {
        let evaluator = Evaluator::with_dataset("mnist", toy_dataset());
        let descriptor = get_architecture("mnist").unwrap();

        let (loss, accuracy) = evaluator
            .evaluate(descriptor, &toy_weights())
            .unwrap()
            .unwrap();
        assert_relative_eq!(accuracy, 1.0);

        // Logits per sample: one class at 4.0, nine at 0.0.
        let expected = -(4.0f64.exp() / (4.0f64.exp() + 9.0)).ln();
        assert_relative_eq!(loss, expected, max_relative = 1e-6);
    }

    #[test]
    fn missing_dataset_reports_none() {
        let evaluator = Evaluator::empty();
        let descriptor = get_architecture("mnist").unwrap();
        assert!(evaluator
            .evaluate(descriptor, &toy_weights())
            .unwrap()
            .is_none());
    }

    #[test]
    fn dimension_mismatch_rejected() {
        let dataset = EvalDataset {
            feature_dim: 3,
            samples: vec![0.0; 3],
            labels: vec![0],
        };
        let evaluator = Evaluator::with_dataset("mnist", dataset);
        let descriptor = get_architecture("mnist").unwrap();
        assert!(matches!(
            evaluator.evaluate(descriptor, &toy_weights()),
            Err(EvalError::DimensionMismatch { .. })
        ));
    }
}
