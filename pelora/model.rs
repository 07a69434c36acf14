use crate::data::{ClinicalMatrix, DataError, ExpressionMatrix, Standardization};
use crate::sign::Sign;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, s};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// --- Configuration ---

/// How the sign of each variable is chosen before it is averaged into a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlipMethod {
    /// The sign is chosen when the variable enters its cluster, whichever of
    /// `+x` and `-x` gives the better criterion.
    #[serde(rename = "pm")]
    PlusMinus,
    /// The sign is fixed a priori as the sign of the empirical correlation
    /// between the variable and the labels.
    #[serde(rename = "cor")]
    Correlation,
    /// No sign flipping.
    #[serde(rename = "none")]
    NoFlip,
}

impl FromStr for FlipMethod {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pm" => Ok(FlipMethod::PlusMinus),
            "cor" => Ok(FlipMethod::Correlation),
            "none" => Ok(FlipMethod::NoFlip),
            other => Err(ConfigError::UnknownFlipMethod(other.to_string())),
        }
    }
}

impl fmt::Display for FlipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FlipMethod::PlusMinus => "pm",
            FlipMethod::Correlation => "cor",
            FlipMethod::NoFlip => "none",
        };
        f.write_str(name)
    }
}

/// Controls for the inner penalized logistic regression solver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitOptions {
    pub tolerance: f64,
    pub max_iterations: usize,
    pub max_step_halvings: usize,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            tolerance: 1e-8,
            max_iterations: 100,
            max_step_halvings: 30,
        }
    }
}

/// Every knob of a Pelora run. Fields missing from a TOML document take
/// their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeloraConfig {
    /// Number of clusters to search for.
    pub noc: usize,
    /// Rescaled penalty parameter in `[0, 1]`.
    pub lambda: f64,
    pub flip: FlipMethod,
    pub standardize: bool,
    /// Verbosity: 0 is silent, 1 reports per cluster, 2 reports every step.
    pub trace: usize,
    /// Run a backward pruning pass after each forward addition.
    pub prune: bool,
    /// A step is taken only if it lowers the criterion by more than this.
    pub min_improvement: f64,
    pub fit: FitOptions,
}

impl Default for PeloraConfig {
    fn default() -> Self {
        Self {
            noc: 10,
            lambda: 1.0 / 32.0,
            flip: FlipMethod::PlusMinus,
            standardize: true,
            trace: 1,
            prune: false,
            min_improvement: 1e-6,
            fit: FitOptions::default(),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("'noc' must be a positive integer; found {0}.")]
    InvalidClusterCount(usize),
    #[error("'lambda' must be a real number in [0, 1]; found {0}.")]
    InvalidLambda(f64),
    #[error("'flip' must be one of \"pm\", \"cor\" or \"none\"; found \"{0}\".")]
    UnknownFlipMethod(String),
    #[error("'min_improvement' must be finite and non-negative; found {0}.")]
    InvalidMinImprovement(f64),
    #[error("Invalid solver options: {0}")]
    InvalidFitOptions(String),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
}

impl PeloraConfig {
    pub fn with_noc(mut self, noc: usize) -> Self {
        self.noc = noc;
        self
    }

    pub fn with_lambda(mut self, lambda: f64) -> Self {
        self.lambda = lambda;
        self
    }

    pub fn with_flip(mut self, flip: FlipMethod) -> Self {
        self.flip = flip;
        self
    }

    pub fn with_standardize(mut self, standardize: bool) -> Self {
        self.standardize = standardize;
        self
    }

    pub fn with_trace(mut self, trace: usize) -> Self {
        self.trace = trace;
        self
    }

    pub fn with_prune(mut self, prune: bool) -> Self {
        self.prune = prune;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.noc == 0 {
            return Err(ConfigError::InvalidClusterCount(self.noc));
        }
        if !(0.0..=1.0).contains(&self.lambda) {
            return Err(ConfigError::InvalidLambda(self.lambda));
        }
        if !self.min_improvement.is_finite() || self.min_improvement < 0.0 {
            return Err(ConfigError::InvalidMinImprovement(self.min_improvement));
        }
        if self.fit.max_iterations == 0 {
            return Err(ConfigError::InvalidFitOptions(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        if !(self.fit.tolerance.is_finite() && self.fit.tolerance > 0.0) {
            return Err(ConfigError::InvalidFitOptions(format!(
                "tolerance must be finite and positive, found {}",
                self.fit.tolerance
            )));
        }
        Ok(())
    }

    /// Parses and validates a TOML configuration document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: PeloraConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// The ridge weight applied by the solver: `lambda` rescaled by the number
    /// of observations.
    pub fn penalty_weight(&self, n_obs: usize) -> f64 {
        self.lambda * n_obs as f64
    }
}

// --- Fitted structures ---

/// A penalized logistic regression fit of the labels on an intercept, the
/// cluster averages and the clinical covariates, in that column order.
#[derive(Debug, Clone, PartialEq)]
pub struct PenalizedModel {
    pub intercept: f64,
    pub cluster_coefficients: Array1<f64>,
    pub clinical_coefficients: Array1<f64>,
    /// Binomial deviance, `-2 * loglik`.
    pub deviance: f64,
    /// `kappa * ||beta||^2` over every coefficient except the intercept.
    pub penalty: f64,
    pub iterations: usize,
}

impl PenalizedModel {
    pub fn from_coefficients(
        beta: ArrayView1<f64>,
        n_clusters: usize,
        deviance: f64,
        penalty: f64,
        iterations: usize,
    ) -> Self {
        Self {
            intercept: beta[0],
            cluster_coefficients: beta.slice(s![1..1 + n_clusters]).to_owned(),
            clinical_coefficients: beta.slice(s![1 + n_clusters..]).to_owned(),
            deviance,
            penalty,
            iterations,
        }
    }

    /// The penalized deviance minimized by the solver and by the search.
    pub fn criterion(&self) -> f64 {
        self.deviance + self.penalty
    }

    pub fn n_clusters(&self) -> usize {
        self.cluster_coefficients.len()
    }

    /// The full coefficient vector in design-column order.
    pub fn coefficients(&self) -> Array1<f64> {
        let mut beta = Array1::zeros(1 + self.n_clusters() + self.clinical_coefficients.len());
        beta[0] = self.intercept;
        beta.slice_mut(s![1..1 + self.n_clusters()])
            .assign(&self.cluster_coefficients);
        beta.slice_mut(s![1 + self.n_clusters()..])
            .assign(&self.clinical_coefficients);
        beta
    }

    pub fn linear_predictor(
        &self,
        averages: ArrayView2<f64>,
        clinical: Option<ArrayView2<f64>>,
    ) -> Array1<f64> {
        assemble_design(averages, clinical).dot(&self.coefficients())
    }
}

/// Stacks `[1 | averages | clinical]` into a design matrix.
pub fn assemble_design(averages: ArrayView2<f64>, clinical: Option<ArrayView2<f64>>) -> Array2<f64> {
    let n = averages.nrows();
    let m = clinical.map_or(0, |u| u.ncols());
    let k = averages.ncols();
    let mut design = Array2::zeros((n, 1 + k + m));
    design.column_mut(0).fill(1.0);
    design.slice_mut(s![.., 1..1 + k]).assign(&averages);
    if let Some(u) = clinical {
        design.slice_mut(s![.., 1 + k..]).assign(&u);
    }
    design
}

/// One member variable of a cluster together with the sign it enters with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterMember {
    pub variable: usize,
    pub sign: Sign,
}

/// A frozen cluster of variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    pub members: Vec<ClusterMember>,
    /// Coefficient of this cluster's average in the final model.
    pub coefficient: f64,
    /// Criterion after every accepted forward or backward step.
    pub criterion_path: Vec<f64>,
}

impl Cluster {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn variables(&self) -> Vec<usize> {
        self.members.iter().map(|m| m.variable).collect()
    }

    /// Row-wise mean of the signed member columns of `x`.
    pub fn average(&self, x: ArrayView2<f64>) -> Array1<f64> {
        let mut total = Array1::zeros(x.nrows());
        for member in &self.members {
            total.scaled_add(member.sign.value(), &x.column(member.variable));
        }
        total / self.members.len().max(1) as f64
    }
}

/// What `ClusterSet::predict` returns per observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictionKind {
    LinearPredictor,
    Probability,
    /// 0/1 class with threshold 0.5 on the probability.
    Class,
}

#[derive(Error, Debug, PartialEq)]
pub enum ModelError {
    #[error(transparent)]
    Data(#[from] DataError),
    #[error("Requested a model with {requested} clusters, but only {available} were found.")]
    TooManyClusters { requested: usize, available: usize },
    #[error("The model uses {expected} clinical covariates, but no 'u' matrix was supplied.")]
    MissingClinical { expected: usize },
}

/// The result of a Pelora run.
#[derive(Debug, Clone)]
pub struct ClusterSet {
    pub clusters: Vec<Cluster>,
    pub intercept: f64,
    pub clinical_coefficients: Array1<f64>,
    pub lambda: f64,
    /// The ridge weight actually applied, `lambda * n`.
    pub kappa: f64,
    pub flip: FlipMethod,
    pub standardization: Option<Standardization>,
    pub(crate) base: PenalizedModel,
    pub(crate) path: Vec<PenalizedModel>,
    pub(crate) training_averages: Array2<f64>,
    pub(crate) n_vars: usize,
}

impl ClusterSet {
    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    /// The fit with the intercept and clinical covariates only.
    pub fn base_model(&self) -> &PenalizedModel {
        &self.base
    }

    /// `path()[k - 1]` is the fit using the first `k` clusters.
    pub fn path(&self) -> &[PenalizedModel] {
        &self.path
    }

    pub fn final_model(&self) -> &PenalizedModel {
        self.path.last().unwrap_or(&self.base)
    }

    /// The model that uses the first `noc` clusters; `None` means all of them.
    pub fn model(&self, noc: Option<usize>) -> Result<&PenalizedModel, ModelError> {
        match noc {
            None => Ok(self.final_model()),
            Some(0) => Ok(&self.base),
            Some(k) if k <= self.path.len() => Ok(&self.path[k - 1]),
            Some(k) => Err(ModelError::TooManyClusters {
                requested: k,
                available: self.path.len(),
            }),
        }
    }

    /// Cluster averages on the (standardized) training data, one column per cluster.
    pub fn training_representatives(&self) -> ArrayView2<'_, f64> {
        self.training_averages.view()
    }

    /// Cluster averages for new observations on the raw scale of the training `x`.
    pub fn representatives(&self, x_new: ArrayView2<f64>) -> Result<Array2<f64>, ModelError> {
        let x = ExpressionMatrix::new(x_new.to_owned())?;
        if x.n_vars() != self.n_vars {
            return Err(DataError::ColumnCountMismatch {
                input: "x",
                expected: self.n_vars,
                found: x.n_vars(),
            }
            .into());
        }
        let scaled = match &self.standardization {
            Some(stats) => stats.apply(x.view())?,
            None => x.view().to_owned(),
        };
        let mut averages = Array2::zeros((scaled.nrows(), self.clusters.len()));
        for (mut column, cluster) in averages.axis_iter_mut(Axis(1)).zip(&self.clusters) {
            column.assign(&cluster.average(scaled.view()));
        }
        Ok(averages)
    }

    /// Predicts new observations with the model built on the first `noc`
    /// clusters (all clusters when `noc` is `None`).
    pub fn predict(
        &self,
        x_new: ArrayView2<f64>,
        u_new: Option<ArrayView2<f64>>,
        noc: Option<usize>,
        kind: PredictionKind,
    ) -> Result<Array1<f64>, ModelError> {
        let model = self.model(noc)?;
        let k = model.n_clusters();
        let averages = self.representatives(x_new)?;
        let n = averages.nrows();

        let expected = self.clinical_coefficients.len();
        let clinical = match (u_new, expected) {
            (None, 0) => None,
            (None, expected) => return Err(ModelError::MissingClinical { expected }),
            (Some(u), expected) => {
                if u.ncols() != expected {
                    return Err(DataError::ColumnCountMismatch {
                        input: "u",
                        expected,
                        found: u.ncols(),
                    }
                    .into());
                }
                Some(ClinicalMatrix::new(u.to_owned(), n)?)
            }
        };

        let eta = model.linear_predictor(
            averages.slice(s![.., ..k]),
            clinical.as_ref().map(|c| c.view()),
        );
        let out = match kind {
            PredictionKind::LinearPredictor => eta,
            PredictionKind::Probability => eta.mapv(logistic),
            PredictionKind::Class => eta.mapv(|e| if logistic(e) > 0.5 { 1.0 } else { 0.0 }),
        };
        Ok(out)
    }
}

pub(crate) fn logistic(eta: f64) -> f64 {
    let e = eta.clamp(-700.0, 700.0);
    1.0 / (1.0 + (-e).exp())
}

impl fmt::Display for ClusterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Pelora: {} cluster(s), lambda = {}, flip = {}",
            self.clusters.len(),
            self.lambda,
            self.flip
        )?;
        for (i, cluster) in self.clusters.iter().enumerate() {
            let members = cluster
                .members
                .iter()
                .map(|m| format!("{}{}", m.sign, m.variable))
                .collect::<Vec<_>>()
                .join(" ");
            writeln!(
                f,
                "  cluster {:>2} (coef {:+.4}): {}",
                i + 1,
                cluster.coefficient,
                members
            )?;
        }
        write!(f, "  intercept: {:+.4}", self.intercept)?;
        for (j, c) in self.clinical_coefficients.iter().enumerate() {
            write!(f, "\n  clinical {:>2}: {:+.4}", j + 1, c)?;
        }
        Ok(())
    }
}
