//! Seeded parameter initializers.
//!
//! Every learnable parameter in the engine is initialized from an
//! explicit seed so that rebuilding a model from the same configuration
//! reproduces it exactly. Embedding weights use a truncated normal with
//! `stddev = 1 / sqrt(dim)`; bias columns start at zero.
//!
//! # Example
//!
//! ```
//! use recall_model::init::{Initializer, TruncatedNormal};
//!
//! let mut init = TruncatedNormal::for_dim(16);
//! let row = init.initialize(16);
//! assert_eq!(row.len(), 16);
//! ```

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

/// Seed used when no explicit seed is given.
pub const DEFAULT_SEED: u64 = 42;

/// Generates initial values for parameter rows.
///
/// Implementations own their random state, so initialization order is
/// part of the contract: the same initializer asked for the same
/// sequence of rows produces the same values.
pub trait Initializer {
    /// Produces one row of `dim` initial values.
    fn initialize(&mut self, dim: usize) -> Vec<f32>;

    /// Name of this initializer, for logging.
    fn name(&self) -> &str;
}

/// Normal samples with values past two standard deviations resampled.
#[derive(Debug, Clone)]
pub struct TruncatedNormal {
    stddev: f32,
    rng: StdRng,
}

impl TruncatedNormal {
    /// Creates an initializer seeded with [`DEFAULT_SEED`].
    ///
    /// # Panics
    ///
    /// Panics if `stddev` is not positive.
    pub fn new(stddev: f32) -> Self {
        Self::with_seed(stddev, DEFAULT_SEED)
    }

    /// Creates an initializer with an explicit seed.
    ///
    /// # Panics
    ///
    /// Panics if `stddev` is not positive.
    pub fn with_seed(stddev: f32, seed: u64) -> Self {
        assert!(stddev > 0.0, "stddev ({}) must be positive", stddev);
        Self {
            stddev,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// The conventional embedding scale: `stddev = 1 / sqrt(dim)`.
    pub fn for_dim(dim: usize) -> Self {
        Self::new(1.0 / (dim.max(1) as f32).sqrt())
    }

    /// [`TruncatedNormal::for_dim`] with an explicit seed.
    pub fn for_dim_seeded(dim: usize, seed: u64) -> Self {
        Self::with_seed(1.0 / (dim.max(1) as f32).sqrt(), seed)
    }

    /// The standard deviation before truncation.
    pub fn stddev(&self) -> f32 {
        self.stddev
    }
}

impl Initializer for TruncatedNormal {
    fn initialize(&mut self, dim: usize) -> Vec<f32> {
        let normal = Normal::new(0.0, self.stddev as f64)
            .expect("failed to create normal distribution");
        let bound = 2.0 * self.stddev;
        (0..dim)
            .map(|_| loop {
                let value = normal.sample(&mut self.rng) as f32;
                if value >= -bound && value <= bound {
                    return value;
                }
            })
            .collect()
    }

    fn name(&self) -> &str {
        "truncated_normal"
    }
}

/// Initializes every value to zero. Used for bias columns.
#[derive(Debug, Clone, Copy, Default)]
pub struct Zeros;

impl Initializer for Zeros {
    fn initialize(&mut self, dim: usize) -> Vec<f32> {
        vec![0.0; dim]
    }

    fn name(&self) -> &str {
        "zeros"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zeros_initializer() {
        let mut init = Zeros;
        assert_eq!(init.initialize(4), vec![0.0; 4]);
        assert_eq!(init.name(), "zeros");
    }

    #[test]
    fn truncated_normal_stays_within_two_stddev() {
        let mut init = TruncatedNormal::new(0.1);
        let values = init.initialize(1000);
        assert_eq!(values.len(), 1000);
        for &v in &values {
            assert!(v.abs() <= 0.2, "value {} outside truncation bound", v);
        }
    }

    #[test]
    fn same_seed_reproduces_the_stream() {
        let mut a = TruncatedNormal::with_seed(0.05, 7);
        let mut b = TruncatedNormal::with_seed(0.05, 7);
        assert_eq!(a.initialize(32), b.initialize(32));
        // A second row continues the stream, not a restart.
        assert_ne!(a.initialize(32), TruncatedNormal::with_seed(0.05, 7).initialize(32));
    }

    #[test]
    fn for_dim_scales_by_root_dim() {
        let init = TruncatedNormal::for_dim(16);
        assert!((init.stddev() - 0.25).abs() < 1e-6);
    }

    #[test]
    #[should_panic(expected = "stddev")]
    fn zero_stddev_rejected() {
        TruncatedNormal::new(0.0);
    }
}
