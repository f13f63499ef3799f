use crate::error::OrchestraError;

/// Shape and name of one updatable parameter tensor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TensorSpec {
    pub name: &'static str,
    pub shape: &'static [usize],
}

impl TensorSpec {
    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }
}

/// One dense layer derived from a weight/bias tensor pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DenseLayer {
    pub weight: &'static str,
    pub bias: &'static str,
    pub input_dim: usize,
    pub output_dim: usize,
}

/// Static description of a supported model architecture. The descriptor is
/// the authoritative source for valid tensor names, their order and shapes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArchitectureDescriptor {
    pub key: &'static str,
    pub name: &'static str,
    pub input_shape: &'static [usize],
    pub num_classes: usize,
    pub tensors: &'static [TensorSpec],
}

impl ArchitectureDescriptor {
    pub fn tensor_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.tensors.iter().map(|t| t.name)
    }

    pub fn tensor(&self, name: &str) -> Option<&TensorSpec> {
        self.tensors.iter().find(|t| t.name == name)
    }

    pub fn total_parameters(&self) -> usize {
        self.tensors.iter().map(|t| t.element_count()).sum()
    }

    /// The dense chain in forward order. Tensors are laid out as
    /// consecutive `<layer>_weight` / `<layer>_bias` pairs with weight
    /// shape `(output, input)`.
    pub fn dense_layers(&self) -> Vec<DenseLayer> {
        self.tensors
            .chunks(2)
            .filter_map(|pair| match pair {
                [w, b] if w.shape.len() == 2 && b.shape.len() == 1 => Some(DenseLayer {
                    weight: w.name,
                    bias: b.name,
                    input_dim: w.shape[1],
                    output_dim: w.shape[0],
                }),
                _ => None,
            })
            .collect()
    }
}

static MNIST: ArchitectureDescriptor = ArchitectureDescriptor {
    key: "mnist",
    name: "MNIST Classifier (784\u{2192}128\u{2192}10)",
    input_shape: &[1, 28, 28],
    num_classes: 10,
    tensors: &[
        TensorSpec {
            name: "hidden_weight",
            shape: &[128, 784],
        },
        TensorSpec {
            name: "hidden_bias",
            shape: &[128],
        },
        TensorSpec {
            name: "output_weight",
            shape: &[10, 128],
        },
        TensorSpec {
            name: "output_bias",
            shape: &[10],
        },
    ],
};

static CIFAR10: ArchitectureDescriptor = ArchitectureDescriptor {
    key: "cifar10",
    name: "CIFAR-10 Classifier (3072\u{2192}256\u{2192}128\u{2192}10)",
    input_shape: &[3, 32, 32],
    num_classes: 10,
    tensors: &[
        TensorSpec {
            name: "hidden1_weight",
            shape: &[256, 3072],
        },
        TensorSpec {
            name: "hidden1_bias",
            shape: &[256],
        },
        TensorSpec {
            name: "hidden2_weight",
            shape: &[128, 256],
        },
        TensorSpec {
            name: "hidden2_bias",
            shape: &[128],
        },
        TensorSpec {
            name: "output_weight",
            shape: &[10, 128],
        },
        TensorSpec {
            name: "output_bias",
            shape: &[10],
        },
    ],
};

static REGISTRY: &[&ArchitectureDescriptor] = &[&MNIST, &CIFAR10];

pub fn get_architecture(key: &str) -> Result<&'static ArchitectureDescriptor, OrchestraError> {
    REGISTRY
        .iter()
        .find(|a| a.key == key)
        .copied()
        .ok_or_else(|| OrchestraError::invalid_argument(format!("unknown architecture {key:?}")))
}

pub fn list_architectures() -> &'static [&'static ArchitectureDescriptor] {
    REGISTRY
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_lookup() {
        assert_eq!(get_architecture("mnist").unwrap().num_classes, 10);
        assert_eq!(get_architecture("cifar10").unwrap().tensors.len(), 6);
        assert!(get_architecture("resnet50").is_err());
    }

    #[test]
    fn mnist_dense_chain() {
        let layers = get_architecture("mnist").unwrap().dense_layers();
        assert_eq!(layers.len(), 2);
        assert_eq!(layers[0].input_dim, 784);
        assert_eq!(layers[0].output_dim, 128);
        assert_eq!(layers[1].weight, "output_weight");
        assert_eq!(layers[1].output_dim, 10);
    }

    #[test]
    fn parameter_counts_match_shapes() {
        let mnist = get_architecture("mnist").unwrap();
        assert_eq!(mnist.total_parameters(), 128 * 784 + 128 + 10 * 128 + 10);

        let cifar = get_architecture("cifar10").unwrap();
        assert_eq!(
            cifar.total_parameters(),
            256 * 3072 + 256 + 128 * 256 + 128 + 10 * 128 + 10
        );
    }
}
