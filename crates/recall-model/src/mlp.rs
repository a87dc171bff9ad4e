//! Tower projection: a configurable stack of dense layers.
//!
//! Each tower of the scorer optionally projects its concatenated input
//! through a small MLP. The stack is described by a [`MlpConfig`]
//! builder; [`TowerMlp::from_units`] covers the common case of ReLU
//! between hidden layers and a linear output.
//!
//! # Example
//!
//! ```
//! use recall_model::mlp::{ActivationType, MlpConfig};
//! use recall_model::tensor::Tensor;
//!
//! let mlp = MlpConfig::new(4)
//!     .add_layer(8, ActivationType::ReLU)
//!     .add_layer(2, ActivationType::None)
//!     .build()
//!     .unwrap();
//! let out = mlp.forward(&Tensor::zeros(&[3, 4])).unwrap();
//! assert_eq!(out.shape(), &[3, 2]);
//! ```

use crate::dense::Dense;
use crate::error::{ModelError, Result};
use crate::init::{TruncatedNormal, DEFAULT_SEED};
use crate::tensor::Tensor;

/// Activation applied after a dense layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationType {
    /// `max(0, x)`.
    ReLU,
    /// `1 / (1 + e^-x)`.
    Sigmoid,
    /// Identity.
    None,
}

impl ActivationType {
    /// Applies the activation to a scalar.
    pub fn apply(&self, x: f32) -> f32 {
        match self {
            ActivationType::ReLU => x.max(0.0),
            ActivationType::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            ActivationType::None => x,
        }
    }

    /// Applies the activation element-wise.
    pub fn activate(&self, input: &Tensor) -> Tensor {
        match self {
            ActivationType::None => input.clone(),
            other => input.map(|v| other.apply(v)),
        }
    }
}

/// Builder for a [`TowerMlp`].
#[derive(Debug, Clone)]
pub struct MlpConfig {
    input_dim: usize,
    layers: Vec<(usize, ActivationType)>,
    seed: u64,
}

impl MlpConfig {
    /// Starts a stack that consumes `input_dim`-wide rows.
    pub fn new(input_dim: usize) -> Self {
        Self {
            input_dim,
            layers: Vec::new(),
            seed: DEFAULT_SEED,
        }
    }

    /// Appends a dense layer of `units` outputs followed by `activation`.
    pub fn add_layer(mut self, units: usize, activation: ActivationType) -> Self {
        self.layers.push((units, activation));
        self
    }

    /// Seeds the weight initialization.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Validates the stack and initializes its parameters.
    pub fn build(self) -> Result<TowerMlp> {
        if self.input_dim == 0 {
            return Err(ModelError::InvalidLayer {
                message: "mlp input_dim must be positive".to_string(),
            });
        }
        for (i, (units, _)) in self.layers.iter().enumerate() {
            if *units == 0 {
                return Err(ModelError::InvalidLayer {
                    message: format!("mlp layer {} has zero units", i),
                });
            }
        }

        let mut layers = Vec::with_capacity(self.layers.len());
        let mut width = self.input_dim;
        for (i, (units, activation)) in self.layers.into_iter().enumerate() {
            let mut init =
                TruncatedNormal::for_dim_seeded(width, self.seed.wrapping_add(i as u64));
            layers.push((Dense::new(width, units, &mut init), activation));
            width = units;
        }
        Ok(TowerMlp {
            input_dim: self.input_dim,
            output_dim: width,
            layers,
        })
    }
}

/// A stack of dense layers with activations, or the identity when empty.
#[derive(Debug, Clone)]
pub struct TowerMlp {
    input_dim: usize,
    output_dim: usize,
    layers: Vec<(Dense, ActivationType)>,
}

impl TowerMlp {
    /// Builds the tower shape used by the scorer: ReLU between hidden
    /// layers and a linear final layer. Empty `units` yields the
    /// identity.
    pub fn from_units(input_dim: usize, units: &[usize], seed: u64) -> Result<Self> {
        let mut config = MlpConfig::new(input_dim).with_seed(seed);
        for (i, &width) in units.iter().enumerate() {
            let activation = if i + 1 == units.len() {
                ActivationType::None
            } else {
                ActivationType::ReLU
            };
            config = config.add_layer(width, activation);
        }
        config.build()
    }

    /// Runs the stack over a `[batch, input_dim]` tensor.
    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        if self.layers.is_empty() {
            if input.ndim() != 2 || input.shape()[1] != self.input_dim {
                return Err(ModelError::ShapeMismatch {
                    expected: vec![input.shape().first().copied().unwrap_or(0), self.input_dim],
                    actual: input.shape().to_vec(),
                });
            }
            return Ok(input.clone());
        }
        let mut current = input.clone();
        for (layer, activation) in &self.layers {
            current = activation.activate(&layer.forward(&current)?);
        }
        Ok(current)
    }

    /// Width of the rows the stack consumes.
    #[inline]
    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    /// Width of the rows the stack produces.
    #[inline]
    pub fn output_dim(&self) -> usize {
        self.output_dim
    }

    /// Number of dense layers.
    #[inline]
    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// All parameters in order: weights then bias per layer.
    pub fn parameters(&self) -> Vec<&Tensor> {
        self.layers
            .iter()
            .flat_map(|(layer, _)| layer.parameters())
            .collect()
    }

    /// Mutable view of all parameters, same order as
    /// [`TowerMlp::parameters`].
    pub fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        self.layers
            .iter_mut()
            .flat_map(|(layer, _)| layer.parameters_mut())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_stack_is_identity() {
        let mlp = MlpConfig::new(3).build().unwrap();
        assert_eq!(mlp.output_dim(), 3);
        let input = Tensor::from_data(&[2, 3], vec![1.0, -2.0, 3.0, 0.0, 5.0, -6.0]).unwrap();
        assert_eq!(mlp.forward(&input).unwrap(), input);
    }

    #[test]
    fn stack_chains_layers_and_activations() {
        let mlp = MlpConfig::new(4)
            .add_layer(8, ActivationType::ReLU)
            .add_layer(2, ActivationType::None)
            .build()
            .unwrap();
        assert_eq!(mlp.input_dim(), 4);
        assert_eq!(mlp.output_dim(), 2);
        assert_eq!(mlp.layer_count(), 2);
        assert_eq!(mlp.parameters().len(), 4);

        let out = mlp.forward(&Tensor::ones(&[5, 4])).unwrap();
        assert_eq!(out.shape(), &[5, 2]);
    }

    #[test]
    fn from_units_uses_relu_then_linear() {
        let mlp = TowerMlp::from_units(4, &[8, 2], 1).unwrap();
        assert_eq!(mlp.output_dim(), 2);
        // Negative inputs must still produce finite output through ReLU.
        let input = Tensor::from_data(&[1, 4], vec![-1.0, -2.0, -3.0, -4.0]).unwrap();
        let out = mlp.forward(&input).unwrap();
        assert!(out.data().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn same_seed_same_parameters() {
        let a = TowerMlp::from_units(4, &[8], 9).unwrap();
        let b = TowerMlp::from_units(4, &[8], 9).unwrap();
        let input = Tensor::ones(&[2, 4]);
        assert_eq!(a.forward(&input).unwrap(), b.forward(&input).unwrap());
    }

    #[test]
    fn zero_units_rejected() {
        let err = MlpConfig::new(4)
            .add_layer(0, ActivationType::ReLU)
            .build()
            .unwrap_err();
        assert!(matches!(err, ModelError::InvalidLayer { .. }));
    }

    #[test]
    fn wrong_input_width_rejected() {
        let mlp = MlpConfig::new(4)
            .add_layer(2, ActivationType::None)
            .build()
            .unwrap();
        let err = mlp.forward(&Tensor::zeros(&[2, 5])).unwrap_err();
        assert!(matches!(err, ModelError::ShapeMismatch { .. }));
    }

    #[test]
    fn activations_apply() {
        assert_eq!(ActivationType::ReLU.apply(-3.0), 0.0);
        assert_eq!(ActivationType::ReLU.apply(3.0), 3.0);
        assert_eq!(ActivationType::None.apply(-3.0), -3.0);
        let mid = ActivationType::Sigmoid.apply(0.0);
        assert!((mid - 0.5).abs() < 1e-6);
    }
}
