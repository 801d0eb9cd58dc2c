//! Jacobian blocks.
//!
//! A [`Block`] is the partial derivative matrix of one node's output with
//! respect to one of its inputs (or one variable). Elementwise operators
//! produce [`Block::Diagonal`] which is kept unmaterialized until it is
//! multiplied with another block or returned to the user. Multiplication and
//! summation are defined for every pair of variants.

use log::debug;
use nalgebra::{DMatrix, DVector};

use super::{
    base::Error,
    sparse::{density, SparseMatrix},
};

/// Jacobian block.
#[derive(Debug, Clone, PartialEq)]
pub enum Block {
    /// A 1x1 block. Returned from a local derivative rule, it stands for a
    /// multiple of the identity of the input size.
    Scalar(f64),
    /// Dense matrix.
    Dense(DMatrix<f64>),
    /// Square diagonal matrix represented by its diagonal.
    Diagonal(DVector<f64>),
    /// Sparse matrix.
    Sparse(SparseMatrix),
}

/// Storage preference for derivative results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sparsity {
    /// Always return dense blocks.
    Never,
    /// Use sparse storage for large blocks with few nonzeros.
    Auto,
    /// Prefer sparse storage whenever a product or a diagonal is materialized.
    Always,
}

impl Default for Sparsity {
    fn default() -> Self {
        Sparsity::Never
    }
}

/// Thresholds deciding when sparse products are used.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SparsePolicy {
    /// Requested storage.
    pub sparsity: Sparsity,
    /// Minimal product of operand sizes for the sparse path.
    pub size_threshold: usize,
    /// Maximal fraction of nonzeros of at least one operand for the sparse
    /// path.
    pub density_threshold: f64,
    /// Minimal number of entries of a diagonal block to be materialized as
    /// sparse in [`Sparsity::Auto`] mode.
    pub diagonal_threshold: usize,
}

impl SparsePolicy {
    fn prefers_sparse(&self, a: &DMatrix<f64>, b: &DMatrix<f64>) -> bool {
        match self.sparsity {
            Sparsity::Never => false,
            Sparsity::Always => true,
            Sparsity::Auto => {
                a.len() * b.len() > self.size_threshold
                    && (density(a) < self.density_threshold
                        || density(b) < self.density_threshold)
            }
        }
    }

    fn diagonal_as_sparse(&self, n: usize) -> bool {
        match self.sparsity {
            Sparsity::Never => false,
            Sparsity::Always => true,
            Sparsity::Auto => n * n > self.diagonal_threshold,
        }
    }
}

impl Block {
    /// Identity block of size `n`.
    pub fn identity(n: usize) -> Self {
        Block::Diagonal(DVector::from_element(n, 1.0))
    }

    /// Dense zero block.
    pub fn zeros(nrows: usize, ncols: usize) -> Self {
        Block::Dense(DMatrix::zeros(nrows, ncols))
    }

    /// Block with a single column.
    pub fn column(v: &DVector<f64>) -> Self {
        Block::Dense(DMatrix::from_column_slice(v.len(), 1, v.as_slice()))
    }

    /// Block with a single row.
    pub fn row(v: &DVector<f64>) -> Self {
        Block::Dense(DMatrix::from_row_slice(1, v.len(), v.as_slice()))
    }

    /// Shape as `(rows, cols)`.
    pub fn shape(&self) -> (usize, usize) {
        match self {
            Block::Scalar(_) => (1, 1),
            Block::Dense(m) => m.shape(),
            Block::Diagonal(d) => (d.len(), d.len()),
            Block::Sparse(s) => (s.nrows(), s.ncols()),
        }
    }

    /// Returns the value of a 1x1 block.
    pub fn scalar_value(&self) -> Option<f64> {
        match self {
            Block::Scalar(s) => Some(*s),
            Block::Dense(m) if m.len() == 1 => Some(m[(0, 0)]),
            Block::Diagonal(d) if d.len() == 1 => Some(d[0]),
            Block::Sparse(s) if s.nrows() == 1 && s.ncols() == 1 => Some(s.get(0, 0)),
            _ => None,
        }
    }

    /// Materializes the block as a dense matrix.
    pub fn to_dense(&self) -> DMatrix<f64> {
        match self {
            Block::Scalar(s) => DMatrix::from_element(1, 1, *s),
            Block::Dense(m) => m.clone(),
            Block::Diagonal(d) => DMatrix::from_diagonal(d),
            Block::Sparse(s) => s.to_dense(),
        }
    }

    /// Materializes the block as a sparse matrix.
    pub fn to_sparse(&self) -> SparseMatrix {
        match self {
            Block::Scalar(s) => SparseMatrix::from_triplets(1, 1, [(0, 0, *s)]),
            Block::Dense(m) => SparseMatrix::from_dense(m),
            Block::Diagonal(d) => SparseMatrix::from_diagonal(d),
            Block::Sparse(s) => s.clone(),
        }
    }

    /// Returns `true` if the block is stored sparse.
    pub fn is_sparse(&self) -> bool {
        matches!(self, Block::Sparse(_))
    }

    /// Multiplies every entry by `s`.
    pub fn scale(&self, s: f64) -> Self {
        match self {
            Block::Scalar(v) => Block::Scalar(v * s),
            Block::Dense(m) => Block::Dense(m * s),
            Block::Diagonal(d) => Block::Diagonal(d * s),
            Block::Sparse(m) => Block::Sparse(m.scale(s)),
        }
    }

    /// Returns the transposed block.
    pub fn transpose(&self) -> Self {
        match self {
            Block::Dense(m) => Block::Dense(m.transpose()),
            Block::Sparse(s) => Block::Sparse(s.transpose()),
            other => other.clone(),
        }
    }

    /// Chain rule product `self · rhs`.
    ///
    /// A 1x1 operand multiplies the other one as a scalar.
    pub fn mul(&self, rhs: &Block, policy: &SparsePolicy) -> Result<Block, Error> {
        if let Some(s) = self.scalar_value() {
            return Ok(rhs.scale(s));
        }

        if let Some(s) = rhs.scalar_value() {
            return Ok(self.scale(s));
        }

        let (_, inner) = self.shape();
        let (rhs_rows, _) = rhs.shape();

        if inner != rhs_rows {
            return Err(Error::ShapeMismatch {
                op: "chain rule",
                left: inner,
                right: rhs_rows,
            });
        }

        let product = match (self, rhs) {
            (Block::Diagonal(a), Block::Diagonal(b)) => Block::Diagonal(a.component_mul(b)),
            (Block::Diagonal(a), Block::Dense(b)) => {
                let mut m = b.clone();
                m.row_iter_mut()
                    .zip(a.iter())
                    .for_each(|(mut row, ai)| row *= *ai);
                Block::Dense(m)
            }
            (Block::Dense(a), Block::Diagonal(b)) => {
                let mut m = a.clone();
                m.column_iter_mut()
                    .zip(b.iter())
                    .for_each(|(mut col, bi)| col *= *bi);
                Block::Dense(m)
            }
            (Block::Diagonal(a), Block::Sparse(b)) => Block::Sparse(b.scale_rows(a)),
            (Block::Sparse(a), Block::Diagonal(b)) => Block::Sparse(a.scale_cols(b)),
            (Block::Dense(a), Block::Dense(b)) => {
                if policy.prefers_sparse(a, b) {
                    debug!(
                        "sparse product of {}x{} and {}x{} blocks",
                        a.nrows(),
                        a.ncols(),
                        b.nrows(),
                        b.ncols()
                    );
                    Block::Sparse(SparseMatrix::from_dense(a).mul(&SparseMatrix::from_dense(b)))
                } else {
                    Block::Dense(a * b)
                }
            }
            (Block::Sparse(a), Block::Sparse(b)) => Block::Sparse(a.mul(b)),
            (Block::Sparse(a), Block::Dense(b)) => match policy.sparsity {
                Sparsity::Never => Block::Dense(a.mul_dense(b)),
                _ => Block::Sparse(a.mul(&SparseMatrix::from_dense(b))),
            },
            (Block::Dense(a), Block::Sparse(b)) => match policy.sparsity {
                Sparsity::Never => Block::Dense(SparseMatrix::dense_mul(a, b)),
                _ => Block::Sparse(SparseMatrix::from_dense(a).mul(b)),
            },
            // 1x1 blocks were handled above.
            (Block::Scalar(_), _) | (_, Block::Scalar(_)) => unreachable!(),
        };

        Ok(product)
    }

    /// Entrywise sum of two contributions to the same derivative.
    ///
    /// Mixing dense and sparse contributions yields a dense block.
    pub fn add(&self, rhs: &Block) -> Result<Block, Error> {
        if let (Some(a), Some(b)) = (self.scalar_value(), rhs.scalar_value()) {
            return Ok(Block::Scalar(a + b));
        }

        let (lr, lc) = self.shape();
        let (rr, rc) = rhs.shape();
        if (lr, lc) != (rr, rc) {
            return Err(Error::ShapeMismatch {
                op: "derivative accumulation",
                left: lr * lc,
                right: rr * rc,
            });
        }

        let sum = match (self, rhs) {
            (Block::Diagonal(a), Block::Diagonal(b)) => Block::Diagonal(a + b),
            (Block::Sparse(a), Block::Sparse(b)) => Block::Sparse(a.add(b)),
            (Block::Diagonal(d), Block::Sparse(s)) | (Block::Sparse(s), Block::Diagonal(d)) => {
                Block::Sparse(s.add(&SparseMatrix::from_diagonal(d)))
            }
            _ => Block::Dense(self.to_dense() + rhs.to_dense()),
        };

        Ok(sum)
    }

    /// Extracts columns `start..start + len`.
    pub fn columns(&self, start: usize, len: usize, policy: &SparsePolicy) -> Block {
        match self {
            Block::Scalar(s) => Block::Scalar(*s),
            Block::Dense(m) => Block::Dense(m.columns(start, len).into_owned()),
            Block::Diagonal(d) => {
                let n = d.len();
                let triplets = (start..start + len).map(|j| (j, j - start, d[j]));
                if policy.diagonal_as_sparse(n) {
                    Block::Sparse(SparseMatrix::from_triplets(n, len, triplets))
                } else {
                    let mut m = DMatrix::zeros(n, len);
                    triplets.for_each(|(i, j, v)| m[(i, j)] = v);
                    Block::Dense(m)
                }
            }
            Block::Sparse(s) => Block::Sparse(SparseMatrix::from_triplets(
                s.nrows(),
                len,
                s.triplets()
                    .filter(|(_, j, _)| *j >= start && *j < start + len)
                    .map(|(i, j, v)| (i, j - start, v)),
            )),
        }
    }

    /// Materializes a [`Block::Scalar`] standing for a multiple of identity
    /// (or of a ones column/row when one side has size one) as a block of
    /// shape `(nrows, ncols)`. Other blocks are returned unchanged.
    pub fn expand(self, nrows: usize, ncols: usize) -> Block {
        match self {
            Block::Scalar(s) if (nrows, ncols) != (1, 1) => {
                if nrows == ncols {
                    Block::Diagonal(DVector::from_element(nrows, s))
                } else if ncols == 1 || nrows == 1 {
                    Block::Dense(DMatrix::from_element(nrows, ncols, s))
                } else {
                    Block::Scalar(s)
                }
            }
            Block::Diagonal(d) if d.len() == 1 && nrows == ncols && nrows != 1 => {
                Block::Diagonal(DVector::from_element(nrows, d[0]))
            }
            other => other,
        }
    }

    /// Brings a block returned by a derivative rule of node `node` to the
    /// shape `(nrows, ncols)`, transposing it if only its orientation is
    /// wrong.
    pub fn reconcile(self, node: &str, nrows: usize, ncols: usize) -> Result<Block, Error> {
        if let Block::Scalar(_) = self {
            if nrows == ncols || nrows == 1 || ncols == 1 {
                return Ok(self);
            }
        }

        let shape = self.shape();
        if shape == (nrows, ncols) {
            Ok(self)
        } else if shape == (ncols, nrows) {
            Ok(self.transpose())
        } else {
            Err(Error::InvalidBlock {
                node: node.to_string(),
                rows: shape.0,
                cols: shape.1,
                exp_rows: nrows,
                exp_cols: ncols,
            })
        }
    }

    /// Replaces deferred diagonals (and, if sparse storage is not requested,
    /// sparse blocks) with concrete storage.
    pub fn resolve(self, policy: &SparsePolicy) -> Block {
        match self {
            Block::Diagonal(d) => {
                if policy.diagonal_as_sparse(d.len()) {
                    Block::Sparse(SparseMatrix::from_diagonal(&d))
                } else {
                    Block::Dense(DMatrix::from_diagonal(&d))
                }
            }
            Block::Sparse(s) if policy.sparsity == Sparsity::Never => Block::Dense(s.to_dense()),
            other => other,
        }
    }
}
