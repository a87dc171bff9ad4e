//! Self-attention pooling for sequence features.
//!
//! A split feature produces `[batch, seq_len, dim]` embeddings. The
//! `attention` combine mode reduces that to `[batch, dim]` with
//! multi-head self-attention over the positions, layer normalization,
//! and a dense projection of the flattened sequence back to the
//! embedding width. The whole block is deterministic given its
//! parameters; there is no sampling at inference time.

use crate::dense::Dense;
use crate::error::{ModelError, Result};
use crate::init::{Initializer, TruncatedNormal};
use crate::tensor::Tensor;

/// Attention heads used by the pooling block.
pub const NUM_HEADS: usize = 2;

/// Width of the per-head query/key/value projections.
pub const KEY_DIM: usize = 32;

const NORM_EPS: f32 = 1e-5;

/// Normalizes the trailing axis to zero mean and unit variance, then
/// applies a learned scale and shift.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerNorm {
    gamma: Tensor,
    beta: Tensor,
}

impl LayerNorm {
    /// Creates a normalization over a trailing axis of width `dim`.
    ///
    /// # Panics
    ///
    /// Panics when `dim` is zero.
    pub fn new(dim: usize) -> Self {
        assert!(dim > 0, "dim must be positive");
        Self {
            gamma: Tensor::ones(&[dim]),
            beta: Tensor::zeros(&[dim]),
        }
    }

    /// Normalizes every trailing-axis row of the input.
    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let dim = self.gamma.shape()[0];
        if input.ndim() == 0 || input.shape()[input.ndim() - 1] != dim {
            return Err(ModelError::ShapeMismatch {
                expected: vec![dim],
                actual: input.shape().to_vec(),
            });
        }
        let mut out = input.clone();
        for row in out.data_mut().chunks_mut(dim) {
            let mean = row.iter().sum::<f32>() / dim as f32;
            let var = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / dim as f32;
            let denom = (var + NORM_EPS).sqrt();
            for (j, v) in row.iter_mut().enumerate() {
                *v = self.gamma.data()[j] * ((*v - mean) / denom) + self.beta.data()[j];
            }
        }
        Ok(out)
    }

    /// The learned scale and shift.
    pub fn parameters(&self) -> Vec<&Tensor> {
        vec![&self.gamma, &self.beta]
    }

    /// Mutable view of the learned scale and shift.
    pub fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        vec![&mut self.gamma, &mut self.beta]
    }
}

#[derive(Debug, Clone, PartialEq)]
struct AttentionHead {
    query: Tensor,
    key: Tensor,
    value: Tensor,
}

/// Multi-head self-attention pooling from `[batch, seq_len, dim]` down
/// to `[batch, dim]`.
#[derive(Debug, Clone)]
pub struct AttentionPooling {
    seq_len: usize,
    dim: usize,
    heads: Vec<AttentionHead>,
    output: Dense,
    norm: LayerNorm,
    project: Dense,
}

impl AttentionPooling {
    /// Creates a pooling block for sequences of `seq_len` positions of
    /// `dim`-wide embeddings, with parameters drawn from `seed`.
    pub fn new(seq_len: usize, dim: usize, seed: u64) -> Result<Self> {
        if seq_len == 0 || dim == 0 {
            return Err(ModelError::InvalidLayer {
                message: format!(
                    "attention pooling needs positive dimensions, got seq_len {} dim {}",
                    seq_len, dim
                ),
            });
        }

        let mut head_init = TruncatedNormal::for_dim_seeded(dim, seed);
        let heads = (0..NUM_HEADS)
            .map(|_| AttentionHead {
                query: projection(dim, KEY_DIM, &mut head_init),
                key: projection(dim, KEY_DIM, &mut head_init),
                value: projection(dim, KEY_DIM, &mut head_init),
            })
            .collect();

        let mut output_init =
            TruncatedNormal::for_dim_seeded(NUM_HEADS * KEY_DIM, seed.wrapping_add(1));
        let output = Dense::new(NUM_HEADS * KEY_DIM, dim, &mut output_init);

        let mut project_init =
            TruncatedNormal::for_dim_seeded(seq_len * dim, seed.wrapping_add(2));
        let project = Dense::new(seq_len * dim, dim, &mut project_init);

        Ok(Self {
            seq_len,
            dim,
            heads,
            output,
            norm: LayerNorm::new(dim),
            project,
        })
    }

    /// Sequence positions the block was built for.
    #[inline]
    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    /// Embedding width in and out.
    #[inline]
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Pools a `[batch, seq_len, dim]` tensor to `[batch, dim]`.
    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        if input.ndim() != 3
            || input.shape()[1] != self.seq_len
            || input.shape()[2] != self.dim
        {
            return Err(ModelError::ShapeMismatch {
                expected: vec![input.shape().first().copied().unwrap_or(0), self.seq_len, self.dim],
                actual: input.shape().to_vec(),
            });
        }

        let batch = input.shape()[0];
        let scale = 1.0 / (KEY_DIM as f32).sqrt();
        let mut pooled = Vec::with_capacity(batch * self.dim);
        for b in 0..batch {
            let row = input.slice_rows(b, b + 1).reshape(&[self.seq_len, self.dim]);

            let mut head_outputs = Vec::with_capacity(self.heads.len());
            for head in &self.heads {
                let queries = row.matmul(&head.query);
                let keys = row.matmul(&head.key);
                let values = row.matmul(&head.value);
                let scores = softmax_rows(&queries.matmul(&keys.transpose()).scale(scale));
                head_outputs.push(scores.matmul(&values));
            }

            let concat = concat_columns(&head_outputs);
            let projected = self.output.forward(&concat)?;
            let normed = self.norm.forward(&projected)?;
            let flat = normed.reshape(&[1, self.seq_len * self.dim]);
            pooled.extend_from_slice(self.project.forward(&flat)?.data());
        }
        Tensor::from_data(&[batch, self.dim], pooled)
    }

    /// All parameters: query/key/value per head, then the output
    /// projection, layer norm, and flatten projection.
    pub fn parameters(&self) -> Vec<&Tensor> {
        let mut params = Vec::new();
        for head in &self.heads {
            params.push(&head.query);
            params.push(&head.key);
            params.push(&head.value);
        }
        params.extend(self.output.parameters());
        params.extend(self.norm.parameters());
        params.extend(self.project.parameters());
        params
    }

    /// Mutable view of all parameters, same order as
    /// [`AttentionPooling::parameters`].
    pub fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        let mut params = Vec::new();
        for head in &mut self.heads {
            params.push(&mut head.query);
            params.push(&mut head.key);
            params.push(&mut head.value);
        }
        params.extend(self.output.parameters_mut());
        params.extend(self.norm.parameters_mut());
        params.extend(self.project.parameters_mut());
        params
    }
}

fn projection(rows: usize, cols: usize, init: &mut TruncatedNormal) -> Tensor {
    let mut matrix = Tensor::zeros(&[rows, cols]);
    for row in matrix.data_mut().chunks_mut(cols) {
        row.copy_from_slice(&init.initialize(cols));
    }
    matrix
}

fn softmax_rows(scores: &Tensor) -> Tensor {
    let cols = scores.shape()[1];
    let mut out = scores.clone();
    for row in out.data_mut().chunks_mut(cols) {
        let max = row.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
        let mut total = 0.0;
        for v in row.iter_mut() {
            *v = (*v - max).exp();
            total += *v;
        }
        for v in row.iter_mut() {
            *v /= total;
        }
    }
    out
}

fn concat_columns(parts: &[Tensor]) -> Tensor {
    let rows = parts[0].shape()[0];
    let total: usize = parts.iter().map(|p| p.shape()[1]).sum();
    let mut out = Tensor::zeros(&[rows, total]);
    let data = out.data_mut();
    for r in 0..rows {
        let mut offset = r * total;
        for part in parts {
            let width = part.shape()[1];
            data[offset..offset + width].copy_from_slice(&part.data()[r * width..(r + 1) * width]);
            offset += width;
        }
    }
    out
}
