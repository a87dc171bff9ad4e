//! A minimal row-major tensor.
//!
//! The scorer only ever needs dense `f32` tensors of rank one to three,
//! so this module carries exactly the operations the model layers use
//! and nothing more. Shape errors on the data boundary
//! ([`Tensor::from_data`]) are returned; shape errors between internal
//! operations are programmer errors and panic.
//!
//! # Example
//!
//! ```
//! use recall_model::tensor::Tensor;
//!
//! let a = Tensor::from_data(&[2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
//! let b = Tensor::from_data(&[3, 2], vec![1.0, 0.0, 0.0, 1.0, 1.0, 0.0]).unwrap();
//! let c = a.matmul(&b);
//! assert_eq!(c.shape(), &[2, 2]);
//! assert_eq!(c.data(), &[4.0, 2.0, 10.0, 5.0]);
//! ```

use crate::error::{ModelError, Result};

/// A dense row-major tensor of `f32` values.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Tensor {
    /// Creates a tensor filled with zeros.
    pub fn zeros(shape: &[usize]) -> Self {
        let numel = shape.iter().product();
        Self {
            shape: shape.to_vec(),
            data: vec![0.0; numel],
        }
    }

    /// Creates a tensor filled with ones.
    pub fn ones(shape: &[usize]) -> Self {
        let numel = shape.iter().product();
        Self {
            shape: shape.to_vec(),
            data: vec![1.0; numel],
        }
    }

    /// Creates a tensor from row-major data.
    ///
    /// Fails when `data` does not hold exactly the number of values the
    /// shape requires.
    pub fn from_data(shape: &[usize], data: Vec<f32>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(ModelError::Shape {
                shape: shape.to_vec(),
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            shape: shape.to_vec(),
            data,
        })
    }

    /// The tensor's shape.
    #[inline]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of axes.
    #[inline]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Total number of values.
    #[inline]
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// The raw row-major data.
    #[inline]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Mutable access to the raw row-major data.
    #[inline]
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Matrix product of two rank-2 tensors.
    ///
    /// # Panics
    ///
    /// Panics unless `self` is `[m, k]` and `other` is `[k, n]`.
    pub fn matmul(&self, other: &Tensor) -> Tensor {
        assert_eq!(self.ndim(), 2, "matmul needs a 2D left operand");
        assert_eq!(other.ndim(), 2, "matmul needs a 2D right operand");
        let (m, k) = (self.shape[0], self.shape[1]);
        let (k2, n) = (other.shape[0], other.shape[1]);
        assert_eq!(k, k2, "inner dimensions differ: {} vs {}", k, k2);

        let mut data = vec![0.0; m * n];
        for i in 0..m {
            for l in 0..k {
                let a = self.data[i * k + l];
                let row = &other.data[l * n..(l + 1) * n];
                let out = &mut data[i * n..(i + 1) * n];
                for (o, &b) in out.iter_mut().zip(row) {
                    *o += a * b;
                }
            }
        }
        Tensor {
            shape: vec![m, n],
            data,
        }
    }

    /// Transpose of a rank-2 tensor.
    ///
    /// # Panics
    ///
    /// Panics unless `self` is 2D.
    pub fn transpose(&self) -> Tensor {
        assert_eq!(self.ndim(), 2, "transpose needs a 2D tensor");
        let (m, n) = (self.shape[0], self.shape[1]);
        let mut data = vec![0.0; m * n];
        for i in 0..m {
            for j in 0..n {
                data[j * m + i] = self.data[i * n + j];
            }
        }
        Tensor {
            shape: vec![n, m],
            data,
        }
    }

    /// Element-wise sum, broadcasting `other` over the leading axes when
    /// its shape matches a suffix of `self`'s.
    ///
    /// # Panics
    ///
    /// Panics when the shapes are neither equal nor suffix-compatible.
    pub fn add(&self, other: &Tensor) -> Tensor {
        if self.shape == other.shape {
            let data = self
                .data
                .iter()
                .zip(other.data.iter())
                .map(|(a, b)| a + b)
                .collect();
            return Tensor {
                shape: self.shape.clone(),
                data,
            };
        }
        let suffix_len = other.numel();
        let suffix_matches = other.ndim() <= self.ndim()
            && self.shape[self.ndim() - other.ndim()..] == other.shape[..];
        assert!(
            suffix_matches,
            "cannot broadcast {:?} onto {:?}",
            other.shape, self.shape
        );
        let mut data = self.data.clone();
        for chunk in data.chunks_mut(suffix_len) {
            for (a, b) in chunk.iter_mut().zip(other.data.iter()) {
                *a += b;
            }
        }
        Tensor {
            shape: self.shape.clone(),
            data,
        }
    }

    /// Multiplies every value by a scalar.
    pub fn scale(&self, scalar: f32) -> Tensor {
        Tensor {
            shape: self.shape.clone(),
            data: self.data.iter().map(|v| v * scalar).collect(),
        }
    }

    /// Applies a function to every value.
    pub fn map<F>(&self, f: F) -> Tensor
    where
        F: Fn(f32) -> f32,
    {
        Tensor {
            shape: self.shape.clone(),
            data: self.data.iter().map(|&v| f(v)).collect(),
        }
    }

    /// Sums out one axis, dropping it from the shape.
    ///
    /// # Panics
    ///
    /// Panics when `axis` is out of bounds.
    pub fn sum_axis(&self, axis: usize) -> Tensor {
        assert!(axis < self.ndim(), "axis {} out of bounds", axis);
        let outer: usize = self.shape[..axis].iter().product();
        let len = self.shape[axis];
        let inner: usize = self.shape[axis + 1..].iter().product();

        let mut shape = self.shape.clone();
        shape.remove(axis);
        let mut data = vec![0.0; outer * inner];
        for o in 0..outer {
            for l in 0..len {
                let src = (o * len + l) * inner;
                let dst = o * inner;
                for i in 0..inner {
                    data[dst + i] += self.data[src + i];
                }
            }
        }
        Tensor { shape, data }
    }

    /// Returns the same data under a new shape.
    ///
    /// # Panics
    ///
    /// Panics when the new shape holds a different number of values.
    pub fn reshape(&self, shape: &[usize]) -> Tensor {
        let expected: usize = shape.iter().product();
        assert_eq!(
            expected,
            self.numel(),
            "cannot reshape {:?} into {:?}",
            self.shape,
            shape
        );
        Tensor {
            shape: shape.to_vec(),
            data: self.data.clone(),
        }
    }

    /// Slices `[start, end)` along the leading axis.
    ///
    /// # Panics
    ///
    /// Panics on an empty shape or an out-of-bounds range.
    pub fn slice_rows(&self, start: usize, end: usize) -> Tensor {
        assert!(!self.shape.is_empty(), "cannot slice a 0D tensor");
        assert!(
            start <= end && end <= self.shape[0],
            "row range {}..{} out of bounds for {} rows",
            start,
            end,
            self.shape[0]
        );
        let inner: usize = self.shape[1..].iter().product();
        let mut shape = self.shape.clone();
        shape[0] = end - start;
        Tensor {
            shape,
            data: self.data[start * inner..end * inner].to_vec(),
        }
    }
}
