use crate::error::{EngineError, Result};
use rayon::prelude::*;

/// Block size for the cache-blocked transpose. Chosen for the small L1
/// caches of the slow 32-bit machines this engine targets.
const TRANSPOSE_BLOCK: usize = 8;

/// A 2-D matrix of `f32` values in row-major layout.
///
/// The shape `(0, cols)` is legal and denotes an empty matrix with a known
/// column width; it is produced only by [`Tensor::empty`] and serves as the
/// initial state of the attention cache. Every other constructor rejects
/// zero dimensions.
///
/// Invariant: `rows * cols == data.len()`.
#[derive(Clone, PartialEq)]
pub struct Tensor {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl Tensor {
    /// Creates a zero-initialized `rows x cols` matrix.
    pub fn new(rows: usize, cols: usize) -> Result<Self> {
        if rows == 0 {
            return Err(EngineError::InvalidInput(
                "matrix number of rows cannot be zero".to_string(),
            ));
        }
        if cols == 0 {
            return Err(EngineError::InvalidInput(
                "matrix number of columns cannot be zero".to_string(),
            ));
        }
        let data = alloc_zeroed(rows, cols)?;
        Ok(Self { rows, cols, data })
    }

    /// Creates the `(0, cols)` empty matrix used to seed the attention cache.
    pub fn empty(cols: usize) -> Self {
        debug_assert!(cols > 0, "empty matrix still needs a column width");
        Self {
            rows: 0,
            cols,
            data: Vec::new(),
        }
    }

    /// Builds a matrix from row-major data; the length must match the shape.
    pub fn from_vec(rows: usize, cols: usize, data: Vec<f32>) -> Result<Self> {
        if rows == 0 || cols == 0 {
            return Err(EngineError::InvalidInput(
                "matrix dimensions cannot be zero".to_string(),
            ));
        }
        if data.len() != rows * cols {
            return Err(EngineError::InvalidInput(format!(
                "data length {} does not match shape {}x{}",
                data.len(),
                rows,
                cols
            )));
        }
        Ok(Self { rows, cols, data })
    }

    /// The `n x n` identity matrix.
    pub fn identity(n: usize) -> Result<Self> {
        let mut res = Self::new(n, n)?;
        for i in 0..n {
            res.data[i * n + i] = 1.0;
        }
        Ok(res)
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Row-major backing storage.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Bounds-checked element read.
    pub fn at(&self, i: usize, j: usize) -> Result<f32> {
        self.check_index(i, j)?;
        Ok(self.data[i * self.cols + j])
    }

    /// Bounds-checked mutable element access.
    pub fn at_mut(&mut self, i: usize, j: usize) -> Result<&mut f32> {
        self.check_index(i, j)?;
        Ok(&mut self.data[i * self.cols + j])
    }

    /// One row as a slice.
    pub fn row(&self, i: usize) -> Result<&[f32]> {
        if i >= self.rows {
            return Err(EngineError::Index(format!(
                "row {} out of range for matrix with {} rows",
                i, self.rows
            )));
        }
        Ok(&self.data[i * self.cols..(i + 1) * self.cols])
    }

    fn check_index(&self, i: usize, j: usize) -> Result<()> {
        if i >= self.rows || j >= self.cols {
            return Err(EngineError::Index(format!(
                "element ({}, {}) out of range for {}x{} matrix",
                i, j, self.rows, self.cols
            )));
        }
        Ok(())
    }

    /// Matrix-matrix product. Requires `self.cols == other.rows`.
    ///
    /// Rows of the output are computed in parallel; the inner loops walk both
    /// operands row-major so the traversal stays cache friendly.
    pub fn matmul(&self, other: &Tensor) -> Result<Tensor> {
        if self.cols != other.rows {
            return Err(EngineError::InvalidInput(format!(
                "matrix product dimensions do not match: {}x{} * {}x{}",
                self.rows, self.cols, other.rows, other.cols
            )));
        }
        let mut res = Tensor::new(self.rows, other.cols)?;
        let (k, n) = (self.cols, other.cols);

        res.data
            .par_chunks_mut(n)
            .enumerate()
            .for_each(|(i, out_row)| {
                let lhs_row = &self.data[i * k..(i + 1) * k];
                for (kk, &a) in lhs_row.iter().enumerate() {
                    let rhs_row = &other.data[kk * n..(kk + 1) * n];
                    for (out, &b) in out_row.iter_mut().zip(rhs_row) {
                        *out += a * b;
                    }
                }
            });

        Ok(res)
    }

    /// Element-wise addition with broadcasting.
    pub fn add(&self, other: &Tensor) -> Result<Tensor> {
        self.broadcast_combine(other, |a, b| a + b)
    }

    /// Element-wise subtraction with broadcasting.
    pub fn sub(&self, other: &Tensor) -> Result<Tensor> {
        self.broadcast_combine(other, |a, b| a - b)
    }

    /// Element-wise division with broadcasting.
    pub fn div(&self, other: &Tensor) -> Result<Tensor> {
        self.broadcast_combine(other, |a, b| a / b)
    }

    /// Combines `self` with `other`, which must be same-shape `[r,c]`, a row
    /// vector `[1,c]` (broadcast down the rows), or a column vector `[r,1]`
    /// (broadcast across the columns). Any other shape is invalid.
    fn broadcast_combine(&self, other: &Tensor, f: impl Fn(f32, f32) -> f32) -> Result<Tensor> {
        if other.rows == 1 && self.cols != other.cols {
            return Err(EngineError::InvalidInput(
                "unable to broadcast, matrix columns do not match".to_string(),
            ));
        }
        if other.cols == 1 && self.rows != other.rows {
            return Err(EngineError::InvalidInput(
                "unable to broadcast, matrix rows do not match".to_string(),
            ));
        }
        if other.rows != 1 && self.rows != other.rows {
            return Err(EngineError::InvalidInput(
                "matrix rows do not match".to_string(),
            ));
        }
        if other.cols != 1 && self.cols != other.cols {
            return Err(EngineError::InvalidInput(
                "matrix columns do not match".to_string(),
            ));
        }

        let mut res = Tensor::new(self.rows, self.cols)?;
        if self.rows == other.rows && self.cols == other.cols {
            for ((out, &a), &b) in res.data.iter_mut().zip(&self.data).zip(&other.data) {
                *out = f(a, b);
            }
        } else if other.rows == 1 {
            for (out_row, lhs_row) in res
                .data
                .chunks_mut(self.cols)
                .zip(self.data.chunks(self.cols))
            {
                for ((out, &a), &b) in out_row.iter_mut().zip(lhs_row).zip(&other.data) {
                    *out = f(a, b);
                }
            }
        } else {
            for ((out_row, lhs_row), &b) in res
                .data
                .chunks_mut(self.cols)
                .zip(self.data.chunks(self.cols))
                .zip(&other.data)
            {
                for (out, &a) in out_row.iter_mut().zip(lhs_row) {
                    *out = f(a, b);
                }
            }
        }
        Ok(res)
    }

    /// Element-wise exponential.
    pub fn exp(&self) -> Result<Tensor> {
        let mut res = self.clone();
        res.data.iter_mut().for_each(|v| *v = v.exp());
        Ok(res)
    }

    /// Sum reduction. `dim = 0` collapses the rows into a `[1, c]` result,
    /// `dim = 1` collapses the columns into `[r, 1]`.
    pub fn sum(&self, dim: usize) -> Result<Tensor> {
        self.reduce(dim, 0.0, |acc, v| acc + v)
    }

    /// Max reduction over `dim` (same result shapes as [`Tensor::sum`]).
    pub fn max(&self, dim: usize) -> Result<Tensor> {
        self.reduce(dim, f32::NEG_INFINITY, |acc, v| acc.max(v))
    }

    fn reduce(&self, dim: usize, init: f32, f: impl Fn(f32, f32) -> f32) -> Result<Tensor> {
        if dim > 1 {
            return Err(EngineError::InvalidInput(format!(
                "invalid matrix dimension: {dim}"
            )));
        }
        if dim == 0 {
            let mut res = Tensor::new(1, self.cols)?;
            res.data.fill(init);
            for row in self.data.chunks(self.cols) {
                for (acc, &v) in res.data.iter_mut().zip(row) {
                    *acc = f(*acc, v);
                }
            }
            Ok(res)
        } else {
            let mut res = Tensor::new(self.rows, 1)?;
            for (acc, row) in res.data.iter_mut().zip(self.data.chunks(self.cols)) {
                *acc = row.iter().fold(init, |a, &v| f(a, v));
            }
            Ok(res)
        }
    }

    /// In-place multiplication by a scalar.
    pub fn scale(&mut self, alpha: f32) {
        self.data.iter_mut().for_each(|v| *v *= alpha);
    }

    /// In-place addition of a scalar.
    pub fn shift(&mut self, beta: f32) {
        self.data.iter_mut().for_each(|v| *v += beta);
    }

    /// In-place clamp to `[lo, hi]`; `lo` must be strictly below `hi`.
    pub fn clamp(&mut self, lo: f32, hi: f32) -> Result<()> {
        if lo >= hi {
            return Err(EngineError::InvalidInput(
                "low clamp value must be strictly lower than the high value".to_string(),
            ));
        }
        self.data.iter_mut().for_each(|v| *v = v.clamp(lo, hi));
        Ok(())
    }

    /// In-place lower clamp.
    pub fn clamp_min(&mut self, lo: f32) {
        self.data.iter_mut().for_each(|v| *v = v.max(lo));
    }

    /// Sets every strictly-upper-triangular element (`j > i`) to `value`,
    /// leaving the diagonal untouched. Defined only for square matrices.
    pub fn mask_upper_triangle(&mut self, value: f32) -> Result<()> {
        if self.rows != self.cols {
            return Err(EngineError::InvalidInput(format!(
                "upper-triangle mask requires a square matrix, got {}x{}",
                self.rows, self.cols
            )));
        }
        for (i, row) in self.data.chunks_mut(self.cols).enumerate() {
            for v in &mut row[i + 1..] {
                *v = value;
            }
        }
        Ok(())
    }

    /// Returns a freshly allocated transposed copy.
    ///
    /// The traversal is blocked so both source and destination stay within a
    /// few cache lines at a time.
    pub fn transpose(&self) -> Result<Tensor> {
        let mut res = Tensor::new(self.cols, self.rows)?;
        let (r, c) = (self.rows, self.cols);
        for ii in (0..r).step_by(TRANSPOSE_BLOCK) {
            let i_max = (ii + TRANSPOSE_BLOCK).min(r);
            for jj in (0..c).step_by(TRANSPOSE_BLOCK) {
                let j_max = (jj + TRANSPOSE_BLOCK).min(c);
                for i in ii..i_max {
                    for j in jj..j_max {
                        res.data[j * r + i] = self.data[i * c + j];
                    }
                }
            }
        }
        Ok(res)
    }

    /// Gathers rows by a `1 x k` index vector.
    pub fn row_select(&self, indices: &IndexTensor) -> Result<Tensor> {
        if indices.rows() != 1 {
            return Err(EngineError::InvalidInput(
                "row selection indices must be a single row".to_string(),
            ));
        }
        for &idx in indices.data() {
            if idx as usize >= self.rows {
                return Err(EngineError::InvalidInput(format!(
                    "row index {} out of bounds for matrix with {} rows",
                    idx, self.rows
                )));
            }
        }

        let mut res = Tensor::new(indices.cols(), self.cols)?;
        for (out_row, &idx) in res.data.chunks_mut(self.cols).zip(indices.data()) {
            let start = idx as usize * self.cols;
            out_row.copy_from_slice(&self.data[start..start + self.cols]);
        }
        Ok(res)
    }

    /// Appends the rows of `other` to `self`, growing the storage in place.
    /// Column counts must agree. This is the vertical-stack primitive the
    /// attention cache is built on; `Vec` supplies the geometric
    /// reallocation.
    pub fn append_rows(&mut self, other: &Tensor) -> Result<()> {
        if self.cols != other.cols {
            return Err(EngineError::InvalidInput(format!(
                "cannot stack rows of width {} onto a matrix of width {}",
                other.cols, self.cols
            )));
        }
        self.data
            .try_reserve(other.data.len())
            .map_err(|_| alloc_failure(other.rows, other.cols))?;
        self.data.extend_from_slice(&other.data);
        self.rows += other.rows;
        Ok(())
    }
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("rows", &self.rows)
            .field("cols", &self.cols)
            .finish()
    }
}

/// A 2-D matrix of `u32` values, used only for token and position
/// identifiers. Same shape semantics as [`Tensor`].
#[derive(Clone, PartialEq)]
pub struct IndexTensor {
    rows: usize,
    cols: usize,
    data: Vec<u32>,
}

impl IndexTensor {
    /// Creates a zero-initialized `rows x cols` index matrix.
    pub fn new(rows: usize, cols: usize) -> Result<Self> {
        if rows == 0 || cols == 0 {
            return Err(EngineError::InvalidInput(
                "index matrix dimensions cannot be zero".to_string(),
            ));
        }
        let mut data = Vec::new();
        data.try_reserve_exact(rows * cols)
            .map_err(|_| alloc_failure(rows, cols))?;
        data.resize(rows * cols, 0);
        Ok(Self { rows, cols, data })
    }

    /// A `1 x n` index vector from a slice of identifiers.
    pub fn from_slice(ids: &[u32]) -> Result<Self> {
        let mut res = Self::new(1, ids.len())?;
        res.data.copy_from_slice(ids);
        Ok(res)
    }

    /// A `1 x (end - start)` vector holding `start, start+1, .., end-1`.
    pub fn from_range(start: usize, end: usize) -> Result<Self> {
        if end <= start {
            return Err(EngineError::InvalidInput(format!(
                "empty index range {start}..{end}"
            )));
        }
        let mut res = Self::new(1, end - start)?;
        for (slot, id) in res.data.iter_mut().zip(start..end) {
            *slot = id as u32;
        }
        Ok(res)
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn data(&self) -> &[u32] {
        &self.data
    }

    /// Bounds-checked mutable element access.
    pub fn at_mut(&mut self, i: usize, j: usize) -> Result<&mut u32> {
        if i >= self.rows || j >= self.cols {
            return Err(EngineError::Index(format!(
                "element ({}, {}) out of range for {}x{} index matrix",
                i, j, self.rows, self.cols
            )));
        }
        Ok(&mut self.data[i * self.cols + j])
    }
}

impl std::fmt::Debug for IndexTensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexTensor")
            .field("rows", &self.rows)
            .field("cols", &self.cols)
            .finish()
    }
}

fn alloc_zeroed(rows: usize, cols: usize) -> Result<Vec<f32>> {
    let len = rows * cols;
    let mut data = Vec::new();
    data.try_reserve_exact(len)
        .map_err(|_| alloc_failure(rows, cols))?;
    data.resize(len, 0.0);
    Ok(data)
}

fn alloc_failure(rows: usize, cols: usize) -> EngineError {
    EngineError::Memory(format!("failed to allocate {rows}x{cols} matrix storage"))
}
