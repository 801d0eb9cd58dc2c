//! Compressed sparse row storage for large, mostly-zero Jacobian blocks.

use std::collections::BTreeMap;

use nalgebra::{DMatrix, DVector};

/// Sparse matrix in compressed sparse row (CSR) format.
///
/// Column indices within every row are sorted and unique. Explicit zeros are
/// never stored by the constructors in this module.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseMatrix {
    nrows: usize,
    ncols: usize,
    indptr: Vec<usize>,
    indices: Vec<usize>,
    values: Vec<f64>,
}

impl SparseMatrix {
    /// Creates an all-zero matrix.
    pub fn zeros(nrows: usize, ncols: usize) -> Self {
        Self {
            nrows,
            ncols,
            indptr: vec![0; nrows + 1],
            indices: Vec::new(),
            values: Vec::new(),
        }
    }

    /// Creates a square matrix with `diag` on the main diagonal.
    pub fn from_diagonal(diag: &DVector<f64>) -> Self {
        let n = diag.len();
        Self::from_triplets(n, n, diag.iter().enumerate().map(|(i, v)| (i, i, *v)))
    }

    /// Creates the identity matrix.
    pub fn identity(n: usize) -> Self {
        Self::from_diagonal(&DVector::from_element(n, 1.0))
    }

    /// Converts a dense matrix, dropping zero entries.
    pub fn from_dense(m: &DMatrix<f64>) -> Self {
        let mut indptr = Vec::with_capacity(m.nrows() + 1);
        let mut indices = Vec::new();
        let mut values = Vec::new();

        indptr.push(0);
        for i in 0..m.nrows() {
            for j in 0..m.ncols() {
                let v = m[(i, j)];
                if v != 0.0 {
                    indices.push(j);
                    values.push(v);
                }
            }
            indptr.push(indices.len());
        }

        Self {
            nrows: m.nrows(),
            ncols: m.ncols(),
            indptr,
            indices,
            values,
        }
    }

    /// Creates a matrix from `(row, col, value)` triplets. Duplicate entries
    /// are summed.
    pub fn from_triplets<I>(nrows: usize, ncols: usize, triplets: I) -> Self
    where
        I: IntoIterator<Item = (usize, usize, f64)>,
    {
        let mut entries = BTreeMap::new();
        for (i, j, v) in triplets {
            assert!(i < nrows && j < ncols, "triplet out of bounds");
            *entries.entry((i, j)).or_insert(0.0) += v;
        }

        let mut indptr = vec![0; nrows + 1];
        let mut indices = Vec::with_capacity(entries.len());
        let mut values = Vec::with_capacity(entries.len());

        for ((i, j), v) in entries {
            if v != 0.0 {
                indptr[i + 1] += 1;
                indices.push(j);
                values.push(v);
            }
        }

        for i in 0..nrows {
            indptr[i + 1] += indptr[i];
        }

        Self {
            nrows,
            ncols,
            indptr,
            indices,
            values,
        }
    }

    /// Number of rows.
    pub fn nrows(&self) -> usize {
        self.nrows
    }

    /// Number of columns.
    pub fn ncols(&self) -> usize {
        self.ncols
    }

    /// Number of stored nonzero entries.
    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// Iterates over stored entries of row `i` as `(col, value)`.
    pub fn row(&self, i: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        let range = self.indptr[i]..self.indptr[i + 1];
        self.indices[range.clone()]
            .iter()
            .copied()
            .zip(self.values[range].iter().copied())
    }

    /// Iterates over all stored entries as `(row, col, value)`.
    pub fn triplets(&self) -> impl Iterator<Item = (usize, usize, f64)> + '_ {
        (0..self.nrows).flat_map(move |i| self.row(i).map(move |(j, v)| (i, j, v)))
    }

    /// Gets the entry at `(i, j)`.
    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.row(i)
            .find(|(col, _)| *col == j)
            .map(|(_, v)| v)
            .unwrap_or(0.0)
    }

    /// Converts to a dense matrix.
    pub fn to_dense(&self) -> DMatrix<f64> {
        let mut m = DMatrix::zeros(self.nrows, self.ncols);
        for (i, j, v) in self.triplets() {
            m[(i, j)] = v;
        }
        m
    }

    /// Returns the transposed matrix.
    pub fn transpose(&self) -> Self {
        Self::from_triplets(
            self.ncols,
            self.nrows,
            self.triplets().map(|(i, j, v)| (j, i, v)),
        )
    }

    /// Multiplies every entry by `s`.
    pub fn scale(&self, s: f64) -> Self {
        if s == 0.0 {
            return Self::zeros(self.nrows, self.ncols);
        }

        let mut out = self.clone();
        out.values.iter_mut().for_each(|v| *v *= s);
        out
    }

    /// Computes `diag(d) * self`.
    pub fn scale_rows(&self, d: &DVector<f64>) -> Self {
        assert_eq!(d.len(), self.nrows, "row scaling has invalid size");
        Self::from_triplets(
            self.nrows,
            self.ncols,
            self.triplets().map(|(i, j, v)| (i, j, v * d[i])),
        )
    }

    /// Computes `self * diag(d)`.
    pub fn scale_cols(&self, d: &DVector<f64>) -> Self {
        assert_eq!(d.len(), self.ncols, "column scaling has invalid size");
        Self::from_triplets(
            self.nrows,
            self.ncols,
            self.triplets().map(|(i, j, v)| (i, j, v * d[j])),
        )
    }

    /// Sparse-sparse product.
    pub fn mul(&self, other: &SparseMatrix) -> SparseMatrix {
        assert_eq!(self.ncols, other.nrows, "sparse product has invalid shapes");

        let mut acc = vec![0.0; other.ncols];
        let mut marker = vec![usize::MAX; other.ncols];
        let mut touched = Vec::new();

        let mut indptr = Vec::with_capacity(self.nrows + 1);
        let mut indices = Vec::new();
        let mut values = Vec::new();
        indptr.push(0);

        for i in 0..self.nrows {
            for (k, a) in self.row(i) {
                for (j, b) in other.row(k) {
                    if marker[j] != i {
                        marker[j] = i;
                        acc[j] = 0.0;
                        touched.push(j);
                    }
                    acc[j] += a * b;
                }
            }

            touched.sort_unstable();
            for j in touched.drain(..) {
                if acc[j] != 0.0 {
                    indices.push(j);
                    values.push(acc[j]);
                }
            }
            indptr.push(indices.len());
        }

        SparseMatrix {
            nrows: self.nrows,
            ncols: other.ncols,
            indptr,
            indices,
            values,
        }
    }

    /// Sparse-dense product.
    pub fn mul_dense(&self, other: &DMatrix<f64>) -> DMatrix<f64> {
        assert_eq!(self.ncols, other.nrows(), "sparse product has invalid shapes");
        let mut out = DMatrix::zeros(self.nrows, other.ncols());
        for (i, k, a) in self.triplets() {
            for j in 0..other.ncols() {
                out[(i, j)] += a * other[(k, j)];
            }
        }
        out
    }

    /// Dense-sparse product.
    pub fn dense_mul(lhs: &DMatrix<f64>, rhs: &SparseMatrix) -> DMatrix<f64> {
        assert_eq!(lhs.ncols(), rhs.nrows, "sparse product has invalid shapes");
        let mut out = DMatrix::zeros(lhs.nrows(), rhs.ncols);
        for (k, j, b) in rhs.triplets() {
            for i in 0..lhs.nrows() {
                out[(i, j)] += lhs[(i, k)] * b;
            }
        }
        out
    }

    /// Entrywise sum of two matrices of the same shape.
    pub fn add(&self, other: &SparseMatrix) -> SparseMatrix {
        assert_eq!(
            (self.nrows, self.ncols),
            (other.nrows, other.ncols),
            "sparse sum has invalid shapes"
        );
        Self::from_triplets(
            self.nrows,
            self.ncols,
            self.triplets().chain(other.triplets()),
        )
    }
}

/// Fraction of nonzero entries of a dense matrix.
pub fn density(m: &DMatrix<f64>) -> f64 {
    if m.is_empty() {
        return 0.0;
    }
    m.iter().filter(|v| **v != 0.0).count() as f64 / m.len() as f64
}
