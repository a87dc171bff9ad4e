//! Fully connected layer: `y = xW + b`.

use crate::error::{ModelError, Result};
use crate::init::Initializer;
use crate::tensor::Tensor;

/// A fully connected layer over the trailing axis of a 2D input.
#[derive(Debug, Clone, PartialEq)]
pub struct Dense {
    weights: Tensor,
    bias: Tensor,
}

impl Dense {
    /// Creates a layer with initialized weights and zero bias.
    ///
    /// # Panics
    ///
    /// Panics when either dimension is zero.
    pub fn new(input_dim: usize, output_dim: usize, init: &mut dyn Initializer) -> Self {
        assert!(input_dim > 0, "input_dim must be positive");
        assert!(output_dim > 0, "output_dim must be positive");
        let mut weights = Tensor::zeros(&[input_dim, output_dim]);
        for row in weights.data_mut().chunks_mut(output_dim) {
            row.copy_from_slice(&init.initialize(output_dim));
        }
        Self {
            weights,
            bias: Tensor::zeros(&[output_dim]),
        }
    }

    /// Creates a layer from explicit parameters.
    ///
    /// `weights` must be `[input_dim, output_dim]` and `bias` must be
    /// `[output_dim]`.
    pub fn from_weights(weights: Tensor, bias: Tensor) -> Result<Self> {
        if weights.ndim() != 2 {
            return Err(ModelError::InvalidLayer {
                message: format!("dense weights must be 2D, got shape {:?}", weights.shape()),
            });
        }
        if bias.shape() != [weights.shape()[1]] {
            return Err(ModelError::ShapeMismatch {
                expected: vec![weights.shape()[1]],
                actual: bias.shape().to_vec(),
            });
        }
        Ok(Self { weights, bias })
    }

    /// Input width.
    #[inline]
    pub fn input_dim(&self) -> usize {
        self.weights.shape()[0]
    }

    /// Output width.
    #[inline]
    pub fn output_dim(&self) -> usize {
        self.weights.shape()[1]
    }

    /// Applies the layer to a `[batch, input_dim]` tensor.
    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        if input.ndim() != 2 || input.shape()[1] != self.input_dim() {
            return Err(ModelError::ShapeMismatch {
                expected: vec![input.shape().first().copied().unwrap_or(0), self.input_dim()],
                actual: input.shape().to_vec(),
            });
        }
        Ok(input.matmul(&self.weights).add(&self.bias))
    }

    /// The layer's parameters: weights then bias.
    pub fn parameters(&self) -> Vec<&Tensor> {
        vec![&self.weights, &self.bias]
    }

    /// Mutable view of the layer's parameters: weights then bias.
    pub fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        vec![&mut self.weights, &mut self.bias]
    }
}
