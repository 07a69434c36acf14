//! Bridge between the ndarray matrices used throughout the crate and faer's
//! dense factorizations. Only what the Newton solver needs lives here: a
//! symmetric positive-definite factorization and its solve.

use faer::linalg::solvers::{Llt, LltError, Solve};
use faer::{Mat, MatRef, Side};
use ndarray::{Array1, ArrayBase, ArrayView1, Data, Ix2};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FaerLinalgError {
    #[error("The {dim}x{dim} system matrix is not positive definite: {reason:?}")]
    NotPositiveDefinite { dim: usize, reason: LltError },
}

/// A faer matrix read from ndarray memory, borrowed when the layout allows it.
enum Source<'a> {
    Borrowed(MatRef<'a, f64>),
    Copied(Mat<f64>),
}

impl<'a> Source<'a> {
    fn read<S: Data<Elem = f64>>(array: &'a ArrayBase<S, Ix2>) -> Self {
        let (rows, cols) = array.dim();
        match array.as_slice_memory_order() {
            Some(slice) if array.is_standard_layout() => {
                Source::Borrowed(MatRef::from_row_major_slice(slice, rows, cols))
            }
            Some(slice) if array.t().is_standard_layout() => {
                Source::Borrowed(MatRef::from_column_major_slice(slice, rows, cols))
            }
            _ => Source::Copied(Mat::from_fn(rows, cols, |i, j| array[(i, j)])),
        }
    }

    fn view(&self) -> MatRef<'_, f64> {
        match self {
            Source::Borrowed(view) => *view,
            Source::Copied(mat) => mat.as_ref(),
        }
    }
}

/// Cholesky factor `L L'` of a symmetric positive-definite matrix.
pub struct CholeskyFactor {
    llt: Llt<f64>,
    dim: usize,
}

impl CholeskyFactor {
    /// Solves `A x = rhs`.
    pub fn solve(&self, rhs: ArrayView1<f64>) -> Array1<f64> {
        let column = Mat::from_fn(rhs.len(), 1, |i, _| rhs[i]);
        let solution = self.llt.solve(column.as_ref());
        Array1::from_shape_fn(self.dim, |i| solution[(i, 0)])
    }
}

pub trait FaerCholesky {
    fn cholesky(&self, side: Side) -> Result<CholeskyFactor, FaerLinalgError>;
}

impl<S: Data<Elem = f64>> FaerCholesky for ArrayBase<S, Ix2> {
    fn cholesky(&self, side: Side) -> Result<CholeskyFactor, FaerLinalgError> {
        let dim = self.nrows();
        let llt = Source::read(self)
            .view()
            .llt(side)
            .map_err(|reason| FaerLinalgError::NotPositiveDefinite { dim, reason })?;
        Ok(CholeskyFactor { llt, dim })
    }
}
