//! The two-tower dot-product scorer.
//!
//! Each tower turns a [`FeatureBatch`] into one embedding per record:
//! per-feature lookup and combine in schema order, concatenation,
//! dense features appended as extra columns, then the tower's
//! projection stack. The score of a record is the dot product of its
//! two tower embeddings plus the global bias and the per-side
//! embedding biases, passed through a sigmoid unless the loss is
//! squared error.
//!
//! Candidate-export tooling calls [`TwoTowerScorer::user_embedding`]
//! and [`TwoTowerScorer::post_embedding`]; both run the exact tower
//! pass scoring runs, so exported vectors reproduce served scores
//! bit for bit.

use crate::embedding::{EmbeddingStore, EmbeddingTableState};
use crate::error::{ModelError, Result};
use crate::init::DEFAULT_SEED;
use crate::mlp::{ActivationType, TowerMlp};
use crate::tensor::Tensor;
use rand::rngs::StdRng;
use rand::Rng;
use recall_core::{Config, LossKind, Tower};
use recall_data::FeatureBatch;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

/// Version tag carried by [`ModelState`].
pub const STATE_VERSION: u32 = 1;

/// Probability floor used when clamping sigmoid outputs in the
/// cross-entropy loss.
const LOSS_EPSILON: f32 = 1e-7;

/// One tower's output for a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct TowerOutput {
    /// `[batch, dim]` tower embeddings.
    pub embedding: Tensor,
    /// `[batch, 1]` sum of the per-feature embedding biases.
    pub bias: Tensor,
}

/// The loss of one batch, split into its terms.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossBreakdown {
    /// Mean cross-entropy or squared error over the batch.
    pub task: f32,
    /// L1/L2 penalty over the embedding tables.
    pub regularization: f32,
    /// `task + regularization`.
    pub total: f32,
}

/// Persisted scorer parameters: every embedding table plus the dense
/// parameters by name (`user_mlp.0.weights`, `attention.terms.3`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelState {
    /// Format version, checked on restore.
    pub version: u32,
    /// The learnable scalar added to every score.
    pub global_bias: f32,
    /// Embedding tables in arena order.
    pub tables: Vec<EmbeddingTableState>,
    /// Flattened dense parameters by name.
    pub dense: BTreeMap<String, Vec<f32>>,
}

/// Scores user/post pairs with two feature towers and a dot product.
///
/// The scorer borrows its [`EmbeddingStore`] immutably while scoring;
/// parameter updates go through [`TwoTowerScorer::embedding_store_mut`]
/// and [`TwoTowerScorer::dense_parameters_mut`] between steps.
pub struct TwoTowerScorer {
    store: EmbeddingStore,
    user_mlp: TowerMlp,
    post_mlp: TowerMlp,
    user_embedding_features: Vec<String>,
    post_embedding_features: Vec<String>,
    user_dense_features: Vec<String>,
    post_dense_features: Vec<String>,
    global_bias: f32,
    loss: LossKind,
    l1: f32,
    l2: f32,
    dropout: Option<f32>,
}

impl TwoTowerScorer {
    /// Builds the scorer for a configuration with the default seed.
    ///
    /// # Example
    ///
    /// ```
    /// use recall_core::Config;
    /// use recall_model::TwoTowerScorer;
    ///
    /// let config = Config::from_yaml_str(r#"
    /// epochs: 1
    /// global_batch_size: 2
    /// label: clicked
    /// format: csv
    /// model:
    ///   features:
    ///     user_id: { type: embedding_lookup, belongs_to: user, hash: true,
    ///                vocab_size: 100, embedding_dim: 4 }
    ///     post_id: { type: embedding_lookup, belongs_to: post, hash: true,
    ///                vocab_size: 100, embedding_dim: 4 }
    /// dataset_features:
    ///   user_id: { type: str }
    ///   post_id: { type: str }
    ///   clicked: { type: int }
    /// "#).unwrap();
    ///
    /// let scorer = TwoTowerScorer::new(&config).unwrap();
    /// assert_eq!(scorer.output_dim(), 4);
    /// ```
    pub fn new(config: &Config) -> Result<Self> {
        Self::with_seed(config, DEFAULT_SEED)
    }

    /// Builds the scorer with an explicit seed. The same configuration
    /// and seed reproduce every parameter exactly.
    pub fn with_seed(config: &Config, seed: u64) -> Result<Self> {
        config.validate()?;
        let store = EmbeddingStore::from_config_seeded(config, seed)?;

        let (user_embedding_features, user_dense_features, user_input) =
            tower_features(config, Tower::User)?;
        let (post_embedding_features, post_dense_features, post_input) =
            tower_features(config, Tower::Post)?;

        let user_mlp = TowerMlp::from_units(
            user_input,
            &config.model.user_linear_units,
            seed.wrapping_add(1_000),
        )?;
        let post_mlp = TowerMlp::from_units(
            post_input,
            &config.model.post_linear_units,
            seed.wrapping_add(2_000),
        )?;
        if user_mlp.output_dim() != post_mlp.output_dim() {
            return Err(ModelError::TowerMismatch {
                user: user_mlp.output_dim(),
                post: post_mlp.output_dim(),
            });
        }

        info!(
            output_dim = user_mlp.output_dim(),
            tables = store.num_tables(),
            loss = ?config.model.loss,
            "two-tower scorer ready"
        );

        Ok(Self {
            store,
            user_mlp,
            post_mlp,
            user_embedding_features,
            post_embedding_features,
            user_dense_features,
            post_dense_features,
            global_bias: 0.0,
            loss: config.model.loss,
            l1: config.model.l1_regularization,
            l2: config.model.l2_regularization,
            dropout: config.model.dropout,
        })
    }

    /// Runs one tower over a batch without dropout. This is the
    /// inference pass: the same batch always produces the same output.
    pub fn tower(&self, batch: &FeatureBatch, tower: Tower) -> Result<TowerOutput> {
        self.tower_inner(batch, tower, None)
    }

    /// Runs one tower with dropout applied to the embedding
    /// concatenation, for a training step driven by `rng`.
    pub fn tower_training(
        &self,
        batch: &FeatureBatch,
        tower: Tower,
        rng: &mut StdRng,
    ) -> Result<TowerOutput> {
        self.tower_inner(batch, tower, Some(rng))
    }

    fn tower_inner(
        &self,
        batch: &FeatureBatch,
        tower: Tower,
        dropout_rng: Option<&mut StdRng>,
    ) -> Result<TowerOutput> {
        let (embedding_features, dense_features, mlp) = match tower {
            Tower::User => (
                &self.user_embedding_features,
                &self.user_dense_features,
                &self.user_mlp,
            ),
            Tower::Post => (
                &self.post_embedding_features,
                &self.post_dense_features,
                &self.post_mlp,
            ),
        };

        let batch_size = batch.batch_size();
        let mut parts: Vec<Tensor> = Vec::with_capacity(embedding_features.len());
        let mut bias = Tensor::zeros(&[batch_size, 1]);
        for name in embedding_features {
            let indices = batch
                .indices(name)
                .ok_or_else(|| ModelError::MissingFeature {
                    feature: name.clone(),
                })?;
            let (embeddings, row_bias) = self.store.lookup(name, indices)?;
            let (combined, combined_bias) = self.store.combine(name, &embeddings, &row_bias)?;
            parts.push(combined);
            bias = bias.add(&combined_bias);
        }

        let mut input = concat_columns(batch_size, &parts);
        if let Some(rng) = dropout_rng {
            if let Some(rate) = self.dropout.filter(|r| *r > 0.0) {
                // Inverted dropout: survivors are rescaled so the
                // inference pass needs no correction.
                let keep = 1.0 - rate;
                for value in input.data_mut() {
                    if rng.gen::<f32>() < rate {
                        *value = 0.0;
                    } else {
                        *value /= keep;
                    }
                }
            }
        }

        if !dense_features.is_empty() {
            let mut with_dense = vec![input];
            for name in dense_features {
                let values = batch
                    .dense(name)
                    .ok_or_else(|| ModelError::MissingFeature {
                        feature: name.clone(),
                    })?;
                with_dense.push(Tensor::from_data(&[batch_size, 1], values.to_vec())?);
            }
            input = concat_columns(batch_size, &with_dense);
        }

        let embedding = mlp.forward(&input)?;
        Ok(TowerOutput { embedding, bias })
    }

    /// Export entry point for the user tower. Runs the exact pass
    /// [`TwoTowerScorer::score`] runs.
    pub fn user_embedding(&self, batch: &FeatureBatch) -> Result<TowerOutput> {
        self.tower(batch, Tower::User)
    }

    /// Export entry point for the post tower. Runs the exact pass
    /// [`TwoTowerScorer::score`] runs.
    pub fn post_embedding(&self, batch: &FeatureBatch) -> Result<TowerOutput> {
        self.tower(batch, Tower::Post)
    }

    /// Scores every record in a batch. Returns a `[batch]` tensor of
    /// sigmoid probabilities, or raw scores when the loss is squared
    /// error.
    pub fn score(&self, batch: &FeatureBatch) -> Result<Tensor> {
        let user = self.tower(batch, Tower::User)?;
        let post = self.tower(batch, Tower::Post)?;
        self.score_towers(&user, &post)
    }

    /// Scores precomputed tower outputs, the serving path over exported
    /// embeddings.
    pub fn score_towers(&self, user: &TowerOutput, post: &TowerOutput) -> Result<Tensor> {
        if user.embedding.shape() != post.embedding.shape() {
            return Err(ModelError::ShapeMismatch {
                expected: user.embedding.shape().to_vec(),
                actual: post.embedding.shape().to_vec(),
            });
        }
        let batch = user.embedding.shape()[0];
        let dim = user.embedding.shape()[1];
        if user.bias.numel() != batch || post.bias.numel() != batch {
            return Err(ModelError::ShapeMismatch {
                expected: vec![batch, 1],
                actual: user.bias.shape().to_vec(),
            });
        }

        let mut scores = Vec::with_capacity(batch);
        for row in 0..batch {
            let u = &user.embedding.data()[row * dim..(row + 1) * dim];
            let p = &post.embedding.data()[row * dim..(row + 1) * dim];
            let dot: f32 = u.iter().zip(p).map(|(a, b)| a * b).sum();
            scores.push(dot + self.global_bias + user.bias.data()[row] + post.bias.data()[row]);
        }
        let raw = Tensor::from_data(&[batch], scores)?;
        Ok(self.activation().activate(&raw))
    }

    /// The loss of a batch against its labels, with the regularization
    /// term broken out.
    pub fn loss(&self, batch: &FeatureBatch) -> Result<LossBreakdown> {
        let scores = self.score(batch)?;
        let labels = batch.labels();
        let task = match self.loss {
            LossKind::Bce => {
                let mut sum = 0.0;
                for (p, y) in scores.data().iter().zip(labels) {
                    let p = p.clamp(LOSS_EPSILON, 1.0 - LOSS_EPSILON);
                    sum -= y * p.ln() + (1.0 - y) * (1.0 - p).ln();
                }
                sum / labels.len() as f32
            }
            LossKind::Mse => {
                let sum: f32 = scores
                    .data()
                    .iter()
                    .zip(labels)
                    .map(|(p, y)| (p - y) * (p - y))
                    .sum();
                sum / labels.len() as f32
            }
        };
        let regularization = self.store.l1_l2_loss(self.l1, self.l2);
        Ok(LossBreakdown {
            task,
            regularization,
            total: task + regularization,
        })
    }

    fn activation(&self) -> ActivationType {
        match self.loss {
            LossKind::Bce => ActivationType::Sigmoid,
            LossKind::Mse => ActivationType::None,
        }
    }

    /// The embedding store backing both towers.
    pub fn embedding_store(&self) -> &EmbeddingStore {
        &self.store
    }

    /// Mutable store access for parameter updates between steps.
    pub fn embedding_store_mut(&mut self) -> &mut EmbeddingStore {
        &mut self.store
    }

    /// The learnable scalar added to every score.
    pub fn global_bias(&self) -> f32 {
        self.global_bias
    }

    /// Mutable access to the global bias.
    pub fn global_bias_mut(&mut self) -> &mut f32 {
        &mut self.global_bias
    }

    /// Width of the tower embeddings.
    pub fn output_dim(&self) -> usize {
        self.user_mlp.output_dim()
    }

    /// Dense (non-table) parameters: the user projection, the post
    /// projection, then the attention poolers.
    pub fn dense_parameters(&self) -> Vec<&Tensor> {
        let mut params = self.user_mlp.parameters();
        params.extend(self.post_mlp.parameters());
        for (_, pooler) in self.store.poolers() {
            params.extend(pooler.parameters());
        }
        params
    }

    /// Mutable view of the dense parameters, in the same order.
    pub fn dense_parameters_mut(&mut self) -> Vec<&mut Tensor> {
        let mut params = self.user_mlp.parameters_mut();
        params.extend(self.post_mlp.parameters_mut());
        for (_, pooler) in self.store.poolers_mut() {
            params.extend(pooler.parameters_mut());
        }
        params
    }

    /// Extracts every parameter for export or checkpointing.
    pub fn state(&self) -> ModelState {
        let mut dense = BTreeMap::new();
        collect_mlp("user_mlp", &self.user_mlp, &mut dense);
        collect_mlp("post_mlp", &self.post_mlp, &mut dense);
        for (feature, pooler) in self.store.poolers() {
            for (i, param) in pooler.parameters().into_iter().enumerate() {
                dense.insert(format!("attention.{feature}.{i}"), param.data().to_vec());
            }
        }
        ModelState {
            version: STATE_VERSION,
            global_bias: self.global_bias,
            tables: self.store.state(),
            dense,
        }
    }

    /// Restores every parameter from a persisted state. The state's
    /// version and geometry must match this scorer's configuration.
    pub fn load_state(&mut self, state: &ModelState) -> Result<()> {
        if state.version != STATE_VERSION {
            return Err(ModelError::StateMismatch {
                name: "model".to_string(),
                reason: format!(
                    "state version {} but this build reads {}",
                    state.version, STATE_VERSION
                ),
            });
        }
        self.store.load_state(&state.tables)?;
        restore_mlp("user_mlp", &mut self.user_mlp, &state.dense)?;
        restore_mlp("post_mlp", &mut self.post_mlp, &state.dense)?;
        for (feature, pooler) in self.store.poolers_mut() {
            for (i, param) in pooler.parameters_mut().into_iter().enumerate() {
                copy_param(&format!("attention.{feature}.{i}"), param, &state.dense)?;
            }
        }
        self.global_bias = state.global_bias;
        Ok(())
    }
}

/// Embedding and dense feature names of one tower, in schema order,
/// plus the tower's MLP input width.
fn tower_features(config: &Config, tower: Tower) -> Result<(Vec<String>, Vec<String>, usize)> {
    let mut embedding = Vec::new();
    let mut dense = Vec::new();
    let mut input_dim = 0;
    for (name, feature) in config.features_for(tower) {
        if feature.is_dense() {
            dense.push(name.to_string());
            input_dim += 1;
        } else {
            input_dim += config
                .embedding_dim_of(name)
                .ok_or_else(|| ModelError::UnknownFeature {
                    feature: name.to_string(),
                })?;
            embedding.push(name.to_string());
        }
    }
    Ok((embedding, dense, input_dim))
}

fn concat_columns(rows: usize, parts: &[Tensor]) -> Tensor {
    let total: usize = parts.iter().map(|p| p.shape()[1]).sum();
    let mut out = Tensor::zeros(&[rows, total]);
    let data = out.data_mut();
    let mut offset = 0;
    for part in parts {
        assert_eq!(part.shape()[0], rows, "concat parts must share the batch size");
        let width = part.shape()[1];
        for row in 0..rows {
            data[row * total + offset..row * total + offset + width]
                .copy_from_slice(&part.data()[row * width..(row + 1) * width]);
        }
        offset += width;
    }
    out
}

fn collect_mlp(prefix: &str, mlp: &TowerMlp, dense: &mut BTreeMap<String, Vec<f32>>) {
    for (index, param) in mlp.parameters().into_iter().enumerate() {
        let layer = index / 2;
        let kind = if index % 2 == 0 { "weights" } else { "bias" };
        dense.insert(format!("{prefix}.{layer}.{kind}"), param.data().to_vec());
    }
}

fn restore_mlp(
    prefix: &str,
    mlp: &mut TowerMlp,
    dense: &BTreeMap<String, Vec<f32>>,
) -> Result<()> {
    let mut params = mlp.parameters_mut();
    for (index, param) in params.iter_mut().enumerate() {
        let layer = index / 2;
        let kind = if index % 2 == 0 { "weights" } else { "bias" };
        copy_param(&format!("{prefix}.{layer}.{kind}"), param, dense)?;
    }
    Ok(())
}

fn copy_param(
    name: &str,
    param: &mut Tensor,
    dense: &BTreeMap<String, Vec<f32>>,
) -> Result<()> {
    let values = dense.get(name).ok_or_else(|| ModelError::StateMismatch {
        name: name.to_string(),
        reason: "missing from state".to_string(),
    })?;
    if values.len() != param.numel() {
        return Err(ModelError::StateMismatch {
            name: name.to_string(),
            reason: format!(
                "{} values for a parameter of {}",
                values.len(),
                param.numel()
            ),
        });
    }
    param.data_mut().copy_from_slice(values);
    Ok(())
}
