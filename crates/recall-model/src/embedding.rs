//! Embedding tables, the table registry, and sequence combining.
//!
//! Every embedding feature resolves to one table in an arena owned by
//! the [`EmbeddingStore`]. Features that set `reuse_embedding` resolve
//! to the owning feature's [`TableId`], so a shared table is the same
//! object, not an equal copy: an update through one feature is visible
//! through every feature bound to it.
//!
//! Table sizing follows the feature's index space. A feature with a
//! vocabulary of `vocab_size` rows and `num_oov_buckets` buckets gets
//! `vocab_size + num_oov_buckets` rows; a hash feature maps straight
//! into `[0, vocab_size)` and gets exactly `vocab_size` rows.

use crate::attention::AttentionPooling;
use crate::error::{ModelError, Result};
use crate::init::{Initializer, TruncatedNormal};
use crate::tensor::Tensor;
use recall_core::{CombineMode, Config, EmbeddingBackendKind};
use recall_data::IndexMatrix;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

/// Handle to one table in the store's arena.
///
/// Two features that share a table hold the same id, which makes reuse
/// observable: `store.table_id("a") == store.table_id("b")`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TableId(usize);

/// Persisted parameters of one table, split into weights and bias
/// regardless of the backend layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingTableState {
    /// Name of the owning feature.
    pub name: String,
    /// Number of rows.
    pub rows: usize,
    /// Embedding width.
    pub dim: usize,
    /// Row-major `[rows, dim]` embedding weights.
    pub weights: Vec<f32>,
    /// Per-row bias, `rows` values.
    pub bias: Vec<f32>,
}

#[derive(Debug, Clone)]
enum TableParams {
    /// Separate weight matrix and bias column.
    PerFeature { weights: Tensor, bias: Tensor },
    /// One fused `[rows, dim + 1]` matrix whose last column is the bias.
    Unified { fused: Tensor },
}

/// One embedding table: `rows` vectors of `dim` values plus a per-row
/// bias.
#[derive(Debug, Clone)]
pub struct EmbeddingTable {
    name: String,
    rows: usize,
    dim: usize,
    params: TableParams,
}

impl EmbeddingTable {
    fn new(
        name: &str,
        rows: usize,
        dim: usize,
        backend: EmbeddingBackendKind,
        seed: u64,
    ) -> Self {
        let mut init = TruncatedNormal::for_dim_seeded(dim, seed);
        let params = match backend {
            EmbeddingBackendKind::PerFeature => {
                let mut weights = Tensor::zeros(&[rows, dim]);
                for row in weights.data_mut().chunks_mut(dim) {
                    row.copy_from_slice(&init.initialize(dim));
                }
                TableParams::PerFeature {
                    weights,
                    bias: Tensor::zeros(&[rows, 1]),
                }
            }
            EmbeddingBackendKind::Unified => {
                let mut fused = Tensor::zeros(&[rows, dim + 1]);
                for row in fused.data_mut().chunks_mut(dim + 1) {
                    row[..dim].copy_from_slice(&init.initialize(dim));
                }
                TableParams::Unified { fused }
            }
        };
        Self {
            name: name.to_string(),
            rows,
            dim,
            params,
        }
    }

    /// Name of the owning feature.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of rows.
    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Embedding width.
    #[inline]
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// The embedding vector of one row.
    ///
    /// # Panics
    ///
    /// Panics when `row` is out of range.
    pub fn embedding_row(&self, row: usize) -> &[f32] {
        assert!(row < self.rows, "row {} outside {} rows", row, self.rows);
        match &self.params {
            TableParams::PerFeature { weights, .. } => {
                &weights.data()[row * self.dim..(row + 1) * self.dim]
            }
            TableParams::Unified { fused } => {
                let stride = self.dim + 1;
                &fused.data()[row * stride..row * stride + self.dim]
            }
        }
    }

    /// Mutable view of one row's embedding vector.
    ///
    /// # Panics
    ///
    /// Panics when `row` is out of range.
    pub fn embedding_row_mut(&mut self, row: usize) -> &mut [f32] {
        assert!(row < self.rows, "row {} outside {} rows", row, self.rows);
        let dim = self.dim;
        match &mut self.params {
            TableParams::PerFeature { weights, .. } => {
                &mut weights.data_mut()[row * dim..(row + 1) * dim]
            }
            TableParams::Unified { fused } => {
                let stride = dim + 1;
                &mut fused.data_mut()[row * stride..row * stride + dim]
            }
        }
    }

    /// The bias of one row.
    ///
    /// # Panics
    ///
    /// Panics when `row` is out of range.
    pub fn bias_value(&self, row: usize) -> f32 {
        assert!(row < self.rows, "row {} outside {} rows", row, self.rows);
        match &self.params {
            TableParams::PerFeature { bias, .. } => bias.data()[row],
            TableParams::Unified { fused } => fused.data()[row * (self.dim + 1) + self.dim],
        }
    }

    /// Mutable access to the bias of one row.
    ///
    /// # Panics
    ///
    /// Panics when `row` is out of range.
    pub fn bias_value_mut(&mut self, row: usize) -> &mut f32 {
        assert!(row < self.rows, "row {} outside {} rows", row, self.rows);
        let dim = self.dim;
        match &mut self.params {
            TableParams::PerFeature { bias, .. } => &mut bias.data_mut()[row],
            TableParams::Unified { fused } => &mut fused.data_mut()[row * (dim + 1) + dim],
        }
    }

    fn l1_l2(&self, l1: f32, l2: f32) -> f32 {
        let penalty = |values: &[f32]| -> f32 {
            values.iter().map(|w| l1 * w.abs() + l2 * w * w).sum()
        };
        match &self.params {
            TableParams::PerFeature { weights, bias } => {
                penalty(weights.data()) + penalty(bias.data())
            }
            TableParams::Unified { fused } => penalty(fused.data()),
        }
    }

    /// Extracts the persisted form, splitting fused parameters back into
    /// weights and bias.
    pub fn state(&self) -> EmbeddingTableState {
        let (weights, bias) = match &self.params {
            TableParams::PerFeature { weights, bias } => {
                (weights.data().to_vec(), bias.data().to_vec())
            }
            TableParams::Unified { fused } => {
                let stride = self.dim + 1;
                let mut weights = Vec::with_capacity(self.rows * self.dim);
                let mut bias = Vec::with_capacity(self.rows);
                for row in fused.data().chunks(stride) {
                    weights.extend_from_slice(&row[..self.dim]);
                    bias.push(row[self.dim]);
                }
                (weights, bias)
            }
        };
        EmbeddingTableState {
            name: self.name.clone(),
            rows: self.rows,
            dim: self.dim,
            weights,
            bias,
        }
    }

    /// Restores parameters from a persisted state. The state's geometry
    /// must match; its backend of origin does not matter.
    pub fn load_state(&mut self, state: &EmbeddingTableState) -> Result<()> {
        if state.rows != self.rows || state.dim != self.dim {
            return Err(ModelError::StateMismatch {
                name: self.name.clone(),
                reason: format!(
                    "table is {}x{}, state is {}x{}",
                    self.rows, self.dim, state.rows, state.dim
                ),
            });
        }
        if state.weights.len() != self.rows * self.dim || state.bias.len() != self.rows {
            return Err(ModelError::StateMismatch {
                name: self.name.clone(),
                reason: format!(
                    "state holds {} weights and {} biases for a {}x{} table",
                    state.weights.len(),
                    state.bias.len(),
                    self.rows,
                    self.dim
                ),
            });
        }
        match &mut self.params {
            TableParams::PerFeature { weights, bias } => {
                weights.data_mut().copy_from_slice(&state.weights);
                bias.data_mut().copy_from_slice(&state.bias);
            }
            TableParams::Unified { fused } => {
                let dim = self.dim;
                for (row, chunk) in fused.data_mut().chunks_mut(dim + 1).enumerate() {
                    chunk[..dim].copy_from_slice(&state.weights[row * dim..(row + 1) * dim]);
                    chunk[dim] = state.bias[row];
                }
            }
        }
        Ok(())
    }
}

struct Binding {
    table: TableId,
    pooler: Option<AttentionPooling>,
}

/// The arena of embedding tables plus the feature bindings over them.
pub struct EmbeddingStore {
    tables: Vec<EmbeddingTable>,
    registry: HashMap<String, TableId>,
    bindings: BTreeMap<String, Binding>,
}

impl EmbeddingStore {
    /// Builds the store for a configuration with the default seed.
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::from_config_seeded(config, crate::init::DEFAULT_SEED)
    }

    /// Builds the store with an explicit seed. Rebuilding from the same
    /// configuration and seed reproduces every table and id exactly.
    pub fn from_config_seeded(config: &Config, seed: u64) -> Result<Self> {
        config.validate()?;

        let backend = config.model.embedding_backend;
        let mut tables: Vec<EmbeddingTable> = Vec::new();
        let mut registry: HashMap<String, TableId> = HashMap::new();
        let mut bindings: BTreeMap<String, Binding> = BTreeMap::new();
        let mut next_seed = seed;

        for (name, feature) in config.embedding_features() {
            let owner = config
                .table_owner(name)
                .ok_or_else(|| ModelError::UnknownFeature {
                    feature: name.to_string(),
                })?;
            let id = match registry.get(owner) {
                Some(&id) => id,
                None => {
                    let rows =
                        config
                            .index_space_of(name)
                            .ok_or_else(|| ModelError::UnknownFeature {
                                feature: name.to_string(),
                            })?;
                    let dim =
                        config
                            .embedding_dim_of(name)
                            .ok_or_else(|| ModelError::UnknownFeature {
                                feature: name.to_string(),
                            })?;
                    let id = TableId(tables.len());
                    let table_seed = next_seed;
                    next_seed = next_seed.wrapping_add(1);
                    tables.push(EmbeddingTable::new(owner, rows, dim, backend, table_seed));
                    registry.insert(owner.to_string(), id);
                    debug!(table = owner, rows, dim, backend = ?backend, "embedding table created");
                    id
                }
            };

            let pooler = match feature.combine_mode {
                CombineMode::Sum => None,
                CombineMode::Attention => {
                    let pooler_seed = next_seed;
                    next_seed = next_seed.wrapping_add(1);
                    Some(AttentionPooling::new(
                        feature.width(),
                        tables[id.0].dim(),
                        pooler_seed,
                    )?)
                }
            };
            bindings.insert(name.to_string(), Binding { table: id, pooler });
        }

        info!(
            tables = tables.len(),
            features = bindings.len(),
            "embedding store ready"
        );
        Ok(Self {
            tables,
            registry,
            bindings,
        })
    }

    /// Builds the store and restores persisted table parameters.
    pub fn from_state(config: &Config, states: &[EmbeddingTableState]) -> Result<Self> {
        let mut store = Self::from_config(config)?;
        store.load_state(states)?;
        Ok(store)
    }

    /// The table a feature is bound to.
    pub fn table_id(&self, feature: &str) -> Option<TableId> {
        self.bindings.get(feature).map(|b| b.table)
    }

    /// A table by id.
    ///
    /// # Panics
    ///
    /// Panics when `id` does not come from this store.
    pub fn table(&self, id: TableId) -> &EmbeddingTable {
        &self.tables[id.0]
    }

    /// Mutable access to a table, the optimizer's write path between
    /// scoring steps.
    ///
    /// # Panics
    ///
    /// Panics when `id` does not come from this store.
    pub fn table_mut(&mut self, id: TableId) -> &mut EmbeddingTable {
        &mut self.tables[id.0]
    }

    /// Number of distinct tables.
    pub fn num_tables(&self) -> usize {
        self.tables.len()
    }

    /// Feature names bound in the store, in name order.
    pub fn features(&self) -> impl Iterator<Item = &str> {
        self.bindings.keys().map(|k| k.as_str())
    }

    /// Attention poolers by feature name, in name order.
    pub fn poolers(&self) -> impl Iterator<Item = (&str, &AttentionPooling)> {
        self.bindings
            .iter()
            .filter_map(|(name, b)| b.pooler.as_ref().map(|p| (name.as_str(), p)))
    }

    /// Mutable view of the attention poolers, in name order.
    pub fn poolers_mut(&mut self) -> impl Iterator<Item = (&str, &mut AttentionPooling)> {
        self.bindings
            .iter_mut()
            .filter_map(|(name, b)| b.pooler.as_mut().map(|p| (name.as_str(), p)))
    }

    /// Looks up a feature's index matrix.
    ///
    /// Returns the `[batch, width, dim]` embeddings and the
    /// `[batch, width, 1]` biases of the addressed rows.
    pub fn lookup(&self, feature: &str, indices: &IndexMatrix) -> Result<(Tensor, Tensor)> {
        let binding = self
            .bindings
            .get(feature)
            .ok_or_else(|| ModelError::UnknownFeature {
                feature: feature.to_string(),
            })?;
        let table = &self.tables[binding.table.0];

        let batch = indices.rows();
        let width = indices.width();
        let mut embeddings = Vec::with_capacity(batch * width * table.dim());
        let mut bias = Vec::with_capacity(batch * width);
        for &index in indices.data() {
            let row = usize::try_from(index).ok().filter(|&r| r < table.rows());
            let row = row.ok_or_else(|| ModelError::IndexOutOfRange {
                feature: feature.to_string(),
                index,
                rows: table.rows(),
            })?;
            embeddings.extend_from_slice(table.embedding_row(row));
            bias.push(table.bias_value(row));
        }

        Ok((
            Tensor::from_data(&[batch, width, table.dim()], embeddings)?,
            Tensor::from_data(&[batch, width, 1], bias)?,
        ))
    }

    /// Reduces looked-up `[batch, width, dim]` embeddings to
    /// `[batch, dim]` using the feature's combine mode. The bias always
    /// reduces by sum.
    pub fn combine(
        &self,
        feature: &str,
        embeddings: &Tensor,
        bias: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        let binding = self
            .bindings
            .get(feature)
            .ok_or_else(|| ModelError::UnknownFeature {
                feature: feature.to_string(),
            })?;
        if embeddings.ndim() != 3 {
            return Err(ModelError::ShapeMismatch {
                expected: vec![0, 0, 0],
                actual: embeddings.shape().to_vec(),
            });
        }
        if bias.shape() != [embeddings.shape()[0], embeddings.shape()[1], 1] {
            return Err(ModelError::ShapeMismatch {
                expected: vec![embeddings.shape()[0], embeddings.shape()[1], 1],
                actual: bias.shape().to_vec(),
            });
        }

        let combined = match binding.pooler.as_ref() {
            Some(pooler) => pooler.forward(embeddings)?,
            None => embeddings.sum_axis(1),
        };
        Ok((combined, bias.sum_axis(1)))
    }

    /// The regularization term over every table parameter, bias
    /// included: `sum(l1 * |w| + l2 * w^2)`.
    pub fn l1_l2_loss(&self, l1: f32, l2: f32) -> f32 {
        if l1 == 0.0 && l2 == 0.0 {
            return 0.0;
        }
        self.tables.iter().map(|t| t.l1_l2(l1, l2)).sum()
    }

    /// Persisted states of every table, in arena order.
    pub fn state(&self) -> Vec<EmbeddingTableState> {
        self.tables.iter().map(|t| t.state()).collect()
    }

    /// Restores table parameters by name.
    pub fn load_state(&mut self, states: &[EmbeddingTableState]) -> Result<()> {
        for state in states {
            let id = self
                .registry
                .get(&state.name)
                .copied()
                .ok_or_else(|| ModelError::StateMismatch {
                    name: state.name.clone(),
                    reason: "no table with this name".to_string(),
                })?;
            self.tables[id.0].load_state(state)?;
        }
        Ok(())
    }
}
