//! # Input Validation and Standardization
//!
//! This module is the exclusive entry point for user-provided arrays. Every
//! input is validated exactly once, here, and wrapped in a type whose
//! invariants the rest of the crate relies on without re-checking:
//!
//! - `ExpressionMatrix`: non-empty, finite, n observations by p variables.
//! - `Labels`: one finite 0/1 entry per observation.
//! - `ClinicalMatrix`: finite covariates with one row per observation.
//!
//! Standardization is performed per column and the fitted means and standard
//! deviations are retained, so that new data can be mapped onto the same scale
//! at prediction time.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use thiserror::Error;

/// A column is treated as constant when its standard deviation falls below this
/// fraction of its magnitude. Exact zero is not reachable for most constant
/// columns once the mean has been rounded.
const DEGENERATE_SD_RATIO: f64 = 1e-12;

/// A comprehensive error type for all input validation failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DataError {
    #[error("'{input}' must be a numeric matrix with at least one row and one column.")]
    EmptyMatrix { input: &'static str },

    #[error(
        "Non-finite value (NaN or Infinity) found in '{input}' at row {row}, column {col}. All entries must be finite."
    )]
    NonFiniteValues {
        input: &'static str,
        row: usize,
        col: usize,
    },

    #[error("'y' must be a numeric vector of length n = {expected} with only 0/1 entries; found length {found}.")]
    LabelLengthMismatch { expected: usize, found: usize },

    #[error("'y' must contain only 0/1 entries; found {value} at position {index}.")]
    NonBinaryLabel { index: usize, value: f64 },

    #[error("'y' contains only class {class}; both classes 0 and 1 must be present.")]
    SingleClass { class: u8 },

    #[error("'u' must have n = {expected} rows to match 'x'; found {found}.")]
    ClinicalRowMismatch { expected: usize, found: usize },

    #[error("There are predictor variables with st. dev. = 0 (first offending column: {column}).")]
    ZeroVariance { column: usize },

    #[error("'{input}' has {found} columns, but the model was fitted on {expected}.")]
    ColumnCountMismatch {
        input: &'static str,
        expected: usize,
        found: usize,
    },
}

fn check_finite(input: &'static str, values: ArrayView2<f64>) -> Result<(), DataError> {
    if values.nrows() == 0 || values.ncols() == 0 {
        return Err(DataError::EmptyMatrix { input });
    }
    match values.indexed_iter().find(|(_, v)| !v.is_finite()) {
        Some(((row, col), _)) => Err(DataError::NonFiniteValues { input, row, col }),
        None => Ok(()),
    }
}

/// The n × p matrix of explanatory variables (e.g. gene expressions), one
/// observation per row.
#[derive(Debug, Clone)]
pub struct ExpressionMatrix {
    values: Array2<f64>,
}

impl ExpressionMatrix {
    pub fn new(values: Array2<f64>) -> Result<Self, DataError> {
        check_finite("x", values.view())?;
        Ok(Self { values })
    }

    pub fn n_obs(&self) -> usize {
        self.values.nrows()
    }

    pub fn n_vars(&self) -> usize {
        self.values.ncols()
    }

    pub fn view(&self) -> ArrayView2<'_, f64> {
        self.values.view()
    }

    pub fn column(&self, j: usize) -> ArrayView1<'_, f64> {
        self.values.column(j)
    }
}

/// Binary class labels, stored as 0.0 / 1.0.
#[derive(Debug, Clone)]
pub struct Labels {
    values: Array1<f64>,
}

impl Labels {
    /// Validates that `values` has one entry per observation, that every
    /// entry equals 0 or equals 1, and that both classes occur.
    pub fn new(values: Array1<f64>, n_obs: usize) -> Result<Self, DataError> {
        if values.len() != n_obs {
            return Err(DataError::LabelLengthMismatch {
                expected: n_obs,
                found: values.len(),
            });
        }
        if let Some((index, &value)) = values
            .iter()
            .enumerate()
            .find(|&(_, &v)| v != 0.0 && v != 1.0)
        {
            return Err(DataError::NonBinaryLabel { index, value });
        }
        let cases = values.iter().filter(|&&v| v == 1.0).count();
        if cases == 0 || cases == n_obs {
            return Err(DataError::SingleClass {
                class: u8::from(cases > 0),
            });
        }
        Ok(Self { values })
    }

    pub fn view(&self) -> ArrayView1<'_, f64> {
        self.values.view()
    }

    /// Fraction of observations labelled 1.
    pub fn prevalence(&self) -> f64 {
        self.values.mean().unwrap_or(0.0)
    }
}

/// Additional covariates that enter the regression model unpenalized by
/// grouping: they are never clustered, flipped or averaged.
#[derive(Debug, Clone)]
pub struct ClinicalMatrix {
    values: Array2<f64>,
}

impl ClinicalMatrix {
    pub fn new(values: Array2<f64>, n_obs: usize) -> Result<Self, DataError> {
        if values.nrows() != n_obs {
            return Err(DataError::ClinicalRowMismatch {
                expected: n_obs,
                found: values.nrows(),
            });
        }
        // A clinical matrix with zero columns is allowed and equivalent to none.
        if values.ncols() > 0 {
            check_finite("u", values.view())?;
        }
        Ok(Self { values })
    }

    pub fn n_covariates(&self) -> usize {
        self.values.ncols()
    }

    pub fn view(&self) -> ArrayView2<'_, f64> {
        self.values.view()
    }
}

/// Per-column location and scale learned from the training matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct Standardization {
    pub means: Array1<f64>,
    pub sds: Array1<f64>,
}

impl Standardization {
    /// Computes column means and population standard deviations, rejecting any
    /// column whose standard deviation is zero.
    pub fn fit(x: ArrayView2<f64>) -> Result<Self, DataError> {
        let n = x.nrows() as f64;
        let means = x.sum_axis(Axis(0)) / n;
        let mut sds = Array1::zeros(x.ncols());
        for (j, column) in x.axis_iter(Axis(1)).enumerate() {
            let mean = means[j];
            let ss: f64 = column.iter().map(|&v| (v - mean) * (v - mean)).sum();
            let sd = (ss / n).sqrt();
            if !(sd > DEGENERATE_SD_RATIO * (1.0 + mean.abs())) {
                return Err(DataError::ZeroVariance { column: j });
            }
            sds[j] = sd;
        }
        Ok(Self { means, sds })
    }

    /// Applies `(x - mean) / sd` column by column.
    pub fn apply(&self, x: ArrayView2<f64>) -> Result<Array2<f64>, DataError> {
        if x.ncols() != self.means.len() {
            return Err(DataError::ColumnCountMismatch {
                input: "x",
                expected: self.means.len(),
                found: x.ncols(),
            });
        }
        let mut out = x.to_owned();
        for (mut column, (&mean, &sd)) in out
            .axis_iter_mut(Axis(1))
            .zip(self.means.iter().zip(self.sds.iter()))
        {
            column.mapv_inplace(|v| (v - mean) / sd);
        }
        Ok(out)
    }
}

/// Validated, optionally standardized inputs ready for the cluster search.
#[derive(Debug, Clone)]
pub struct PreparedData {
    pub x: ExpressionMatrix,
    pub y: Labels,
    pub u: Option<ClinicalMatrix>,
    pub standardization: Option<Standardization>,
}

impl PreparedData {
    pub fn n_obs(&self) -> usize {
        self.x.n_obs()
    }

    pub fn n_vars(&self) -> usize {
        self.x.n_vars()
    }

    pub fn n_clinical(&self) -> usize {
        self.u.as_ref().map_or(0, ClinicalMatrix::n_covariates)
    }
}

/// Validates every input and standardizes `x` when requested. Nothing is
/// returned unless every check passes.
pub fn prepare(
    x: Array2<f64>,
    y: Array1<f64>,
    u: Option<Array2<f64>>,
    standardize: bool,
) -> Result<PreparedData, DataError> {
    let x = ExpressionMatrix::new(x)?;
    let n = x.n_obs();
    let y = Labels::new(y, n)?;
    let u = u.map(|values| ClinicalMatrix::new(values, n)).transpose()?;

    if !standardize {
        return Ok(PreparedData {
            x,
            y,
            u,
            standardization: None,
        });
    }

    let standardization = Standardization::fit(x.view())?;
    let scaled = ExpressionMatrix::new(standardization.apply(x.view())?)?;
    Ok(PreparedData {
        x: scaled,
        y,
        u,
        standardization: Some(standardization),
    })
}
