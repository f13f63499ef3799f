use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use orchestra_core::ArchitectureDescriptor;

use crate::codec::TensorMap;

/// Seed for reproducible initial weights; a recreated model blob for the
/// same architecture is byte-identical.
const INIT_SEED: u64 = 0;

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("model container decode failed: {0}")]
    Decode(#[from] postcard::Error),

    #[error("tensor {name} expects {expected} values, got {actual}")]
    ShapeMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct ContainerTensor {
    name: String,
    shape: Vec<u32>,
    values: Vec<f32>,
}

/// The on-wire model blob: architecture key, embedded optimizer learning
/// rate, and the updatable parameter tensors in descriptor order.
///
/// The coordinator treats this as an opaque serializer; only
/// extract/inject/set-learning-rate symmetry is relied upon.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelContainer {
    pub architecture: String,
    pub learning_rate: f64,
    tensors: Vec<ContainerTensor>,
}

impl ModelContainer {
    pub fn from_bytes(blob: &[u8]) -> Result<Self, ContainerError> {
        Ok(postcard::from_bytes(blob)?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ContainerError> {
        Ok(postcard::to_stdvec(self)?)
    }

    pub fn weights(&self) -> TensorMap {
        self.tensors
            .iter()
            .map(|t| (t.name.clone(), t.values.clone()))
            .collect()
    }

    /// Replace matching tensors, leaving others untouched. Unknown names in
    /// `weights` are ignored; a length mismatch on a known tensor is an
    /// error.
    pub fn set_weights(&mut self, weights: &TensorMap) -> Result<(), ContainerError> {
        for tensor in &mut self.tensors {
            if let Some(values) = weights.get(&tensor.name) {
                let expected: usize = tensor.shape.iter().map(|&d| d as usize).product();
                if values.len() != expected {
                    return Err(ContainerError::ShapeMismatch {
                        name: tensor.name.clone(),
                        expected,
                        actual: values.len(),
                    });
                }
                tensor.values = values.clone();
            }
        }
        Ok(())
    }
}

/// Extract every updatable parameter tensor from a model blob.
pub fn extract_weights(blob: &[u8]) -> Result<TensorMap, ContainerError> {
    Ok(ModelContainer::from_bytes(blob)?.weights())
}

/// Replace matching tensors in a model blob, returning the new blob.
pub fn inject_weights(blob: &[u8], weights: &TensorMap) -> Result<Vec<u8>, ContainerError> {
    let mut container = ModelContainer::from_bytes(blob)?;
    container.set_weights(weights)?;
    container.to_bytes()
}

/// Rewrite the embedded optimizer learning rate.
pub fn set_learning_rate(blob: &[u8], learning_rate: f64) -> Result<Vec<u8>, ContainerError> {
    let mut container = ModelContainer::from_bytes(blob)?;
    container.learning_rate = learning_rate;
    container.to_bytes()
}

/// Build the initial model blob for an architecture: He-uniform weights
/// from a fixed seed, zero biases.
pub fn build_initial_container(
    descriptor: &ArchitectureDescriptor,
    learning_rate: f64,
) -> Result<Vec<u8>, ContainerError> {
    let mut rng = ChaCha8Rng::seed_from_u64(INIT_SEED);
    let tensors = descriptor
        .tensors
        .iter()
        .map(|spec| {
            let values = if spec.shape.len() == 1 {
                vec![0.0; spec.element_count()]
            } else {
                let fan_in = spec.shape[1] as f64;
                let limit = (6.0 / fan_in).sqrt() as f32;
                (0..spec.element_count())
                    .map(|_| rng.random_range(-limit..limit))
                    .collect()
            };
            ContainerTensor {
                name: spec.name.to_string(),
                shape: spec.shape.iter().map(|&d| d as u32).collect(),
                values,
            }
        })
        .collect();

    ModelContainer {
        architecture: descriptor.key.to_string(),
        learning_rate,
        tensors,
    }
    .to_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestra_core::get_architecture;

    fn mnist_blob() -> Vec<u8> {
        build_initial_container(get_architecture("mnist").unwrap(), 0.01).unwrap()
    }

    #[test]
    fn initial_container_is_deterministic() {
        assert_eq!(mnist_blob(), mnist_blob());
    }

    #[test]
    fn initial_biases_are_zero_and_weights_are_not() {
        let weights = extract_weights(&mnist_blob()).unwrap();
        assert!(weights["hidden_bias"].iter().all(|&v| v == 0.0));
        assert!(weights["hidden_weight"].iter().any(|&v| v != 0.0));
        assert_eq!(weights["hidden_weight"].len(), 128 * 784);
    }

    #[test]
    fn inject_extract_symmetry() {
        let blob = mnist_blob();
        let weights = extract_weights(&blob).unwrap();
        let reinjected = inject_weights(&blob, &weights).unwrap();
        assert_eq!(extract_weights(&reinjected).unwrap(), weights);
    }

    #[test]
    fn inject_leaves_unmentioned_tensors_untouched() {
        let blob = mnist_blob();
        let before = extract_weights(&blob).unwrap();

        let update = TensorMap::from([("output_bias".to_string(), vec![9.0; 10])]);
        let after = extract_weights(&inject_weights(&blob, &update).unwrap()).unwrap();

        assert_eq!(after["output_bias"], vec![9.0; 10]);
        assert_eq!(after["hidden_weight"], before["hidden_weight"]);
    }

    #[test]
    fn inject_rejects_wrong_length() {
        let update = TensorMap::from([("output_bias".to_string(), vec![1.0; 3])]);
        assert!(matches!(
            inject_weights(&mnist_blob(), &update),
            Err(ContainerError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn learning_rate_round_trips() {
        let blob = set_learning_rate(&mnist_blob(), 0.0042).unwrap();
        assert_eq!(ModelContainer::from_bytes(&blob).unwrap().learning_rate, 0.0042);
    }
}
