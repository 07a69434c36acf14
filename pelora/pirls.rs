//! Penalized iteratively reweighted least squares for ridge-penalized logistic
//! regression.
//!
//! The objective is the penalized deviance
//!
//! `D(beta) = -2 * loglik(beta) + kappa * sum_{j >= 1} beta_j^2`
//!
//! where column 0 of the design is the unpenalized intercept. Each iteration
//! takes a full Newton step on `D / 2`, solved by Cholesky, and halves it until
//! the penalized deviance stops increasing.

use crate::faer_ndarray::{FaerCholesky, FaerLinalgError};
use crate::model::FitOptions;
use crate::sign::Scored;
use faer::Side;
use itertools::izip;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use thiserror::Error;

const ETA_CLAMP: f64 = 700.0;
const PROB_EPS: f64 = 1e-8;
const MIN_WEIGHT: f64 = 1e-6;

#[derive(Debug, Error)]
pub enum PirlsError {
    #[error("Cholesky factorization of the penalized Hessian failed: {0}")]
    Factorization(#[from] FaerLinalgError),
    #[error(
        "The penalized logistic regression did not converge within {max_iterations} iterations. Last change in penalized deviance was {last_change:.6e}."
    )]
    DidNotConverge {
        max_iterations: usize,
        last_change: f64,
    },
    #[error("Non-finite values appeared in the working model at iteration {iteration}.")]
    NonFinite { iteration: usize },
}

#[derive(Debug, Clone)]
pub struct WorkingState {
    pub eta: Array1<f64>,
    /// Gradient of `deviance / 2` with respect to beta.
    pub gradient: Array1<f64>,
    /// Hessian of `deviance / 2`, `X' W X`.
    pub hessian: Array2<f64>,
    pub deviance: f64,
}

pub trait WorkingModel {
    fn update(&self, beta: &Array1<f64>) -> WorkingState;
    fn deviance(&self, beta: &Array1<f64>) -> f64;
}

/// Binomial working model with logit link on a borrowed design.
pub struct LogisticWorkingModel<'a> {
    design: ArrayView2<'a, f64>,
    response: ArrayView1<'a, f64>,
}

impl<'a> LogisticWorkingModel<'a> {
    pub fn new(design: ArrayView2<'a, f64>, response: ArrayView1<'a, f64>) -> Self {
        Self { design, response }
    }

    fn mean(eta: &Array1<f64>) -> Array1<f64> {
        eta.mapv(|e| {
            let e = e.clamp(-ETA_CLAMP, ETA_CLAMP);
            (1.0 / (1.0 + (-e).exp())).clamp(PROB_EPS, 1.0 - PROB_EPS)
        })
    }

    fn binomial_deviance(&self, mu: &Array1<f64>) -> f64 {
        let total: f64 = izip!(self.response.iter(), mu.iter())
            .map(|(&y, &m)| {
                let mut term = 0.0;
                if y > 0.0 {
                    term += y * m.ln();
                }
                if y < 1.0 {
                    term += (1.0 - y) * (1.0 - m).ln();
                }
                term
            })
            .sum();
        -2.0 * total
    }
}

impl WorkingModel for LogisticWorkingModel<'_> {
    fn update(&self, beta: &Array1<f64>) -> WorkingState {
        let eta = self.design.dot(beta);
        let mu = Self::mean(&eta);
        let deviance = self.binomial_deviance(&mu);

        let residual = &mu - &self.response;
        let gradient = self.design.t().dot(&residual);
        let weights = mu.mapv(|m| (m * (1.0 - m)).max(MIN_WEIGHT));
        let weighted = &self.design * &weights.insert_axis(Axis(1));
        let hessian = weighted.t().dot(&self.design);

        WorkingState {
            eta,
            gradient,
            hessian,
            deviance,
        }
    }

    fn deviance(&self, beta: &Array1<f64>) -> f64 {
        let eta = self.design.dot(beta);
        self.binomial_deviance(&Self::mean(&eta))
    }
}

/// Ridge penalty `kappa * ||beta||^2` on every coefficient from
/// `first_penalized` onwards.
#[derive(Debug, Clone, Copy)]
pub struct RidgePenalty {
    pub kappa: f64,
    pub first_penalized: usize,
}

impl RidgePenalty {
    pub fn new(kappa: f64) -> Self {
        Self {
            kappa,
            first_penalized: 1,
        }
    }

    pub fn value(&self, beta: &Array1<f64>) -> f64 {
        let ss: f64 = beta
            .iter()
            .skip(self.first_penalized)
            .map(|b| b * b)
            .sum();
        self.kappa * ss
    }

    /// Adds the penalty's contribution to the gradient and Hessian of `D / 2`.
    fn accumulate(&self, beta: &Array1<f64>, gradient: &mut Array1<f64>, hessian: &mut Array2<f64>) {
        for j in self.first_penalized..beta.len() {
            gradient[j] += self.kappa * beta[j];
            hessian[[j, j]] += self.kappa;
        }
    }
}

#[derive(Debug, Clone)]
pub struct PirlsResult {
    pub beta: Array1<f64>,
    pub deviance: f64,
    pub penalty: f64,
    pub iterations: usize,
    pub max_abs_eta: f64,
}

impl Scored for PirlsResult {
    fn criterion(&self) -> f64 {
        self.deviance + self.penalty
    }
}

/// A failed fit never beats a successful one.
impl Scored for Result<PirlsResult, PirlsError> {
    fn criterion(&self) -> f64 {
        self.as_ref().map_or(f64::INFINITY, |fit| fit.criterion())
    }
}

fn max_abs(values: &Array1<f64>) -> f64 {
    values.iter().map(|v| v.abs()).fold(0.0, f64::max)
}

pub fn run_pirls<M: WorkingModel>(
    model: &M,
    penalty: RidgePenalty,
    mut beta: Array1<f64>,
    options: &FitOptions,
) -> Result<PirlsResult, PirlsError> {
    let mut state = model.update(&beta);
    let mut objective = state.deviance + penalty.value(&beta);
    let mut last_change = f64::INFINITY;

    for iteration in 1..=options.max_iterations {
        if !objective.is_finite()
            || !state.gradient.iter().all(|v| v.is_finite())
            || !state.hessian.iter().all(|v| v.is_finite())
        {
            return Err(PirlsError::NonFinite { iteration });
        }

        let WorkingState {
            eta,
            mut gradient,
            mut hessian,
            deviance,
        } = state;
        penalty.accumulate(&beta, &mut gradient, &mut hessian);

        let grad_norm = max_abs(&gradient);
        let converged_result = |beta: Array1<f64>, iterations: usize| PirlsResult {
            penalty: penalty.value(&beta),
            beta,
            deviance,
            iterations,
            max_abs_eta: max_abs(&eta),
        };
        if grad_norm < options.tolerance {
            log::trace!("P-IRLS converged on gradient at iteration {iteration}");
            return Ok(converged_result(beta, iteration - 1));
        }

        let factor = hessian.cholesky(Side::Lower)?;
        let step = factor.solve(gradient.mapv(|g| -g).view());

        let mut scale = 1.0;
        let mut trial = &beta + &step;
        let mut trial_objective = model.deviance(&trial) + penalty.value(&trial);
        let mut halvings = 0;
        while !(trial_objective.is_finite() && trial_objective <= objective)
            && halvings < options.max_step_halvings
        {
            scale *= 0.5;
            trial = &beta + &(&step * scale);
            trial_objective = model.deviance(&trial) + penalty.value(&trial);
            halvings += 1;
        }

        if !(trial_objective.is_finite() && trial_objective <= objective) {
            // Rounding can defeat the descent check right at the optimum.
            if grad_norm < options.tolerance.sqrt() * (1.0 + objective.abs()) {
                log::trace!("P-IRLS stopped at a numerically flat optimum at iteration {iteration}");
                return Ok(converged_result(beta, iteration - 1));
            }
            log::trace!("P-IRLS failed to find a descent step after {halvings} halvings");
            return Err(PirlsError::DidNotConverge {
                max_iterations: options.max_iterations,
                last_change,
            });
        }
        if halvings > 0 {
            log::trace!("P-IRLS iteration {iteration}: step halved {halvings} times");
        }

        last_change = objective - trial_objective;
        let applied = max_abs(&step) * scale;
        beta = trial;
        objective = trial_objective;
        state = model.update(&beta);

        log::trace!(
            "P-IRLS iteration {iteration:<2} | penalized deviance {objective:<13.7} | change {last_change:>12.6e}"
        );

        if applied < options.tolerance || last_change < options.tolerance * (0.1 + objective.abs())
        {
            return Ok(PirlsResult {
                penalty: penalty.value(&beta),
                beta,
                deviance: state.deviance,
                iterations: iteration,
                max_abs_eta: max_abs(&state.eta),
            });
        }
    }

    log::trace!(
        "P-IRLS reached max iterations ({}) without convergence",
        options.max_iterations
    );
    Err(PirlsError::DidNotConverge {
        max_iterations: options.max_iterations,
        last_change,
    })
}

/// Fits the ridge-penalized logistic regression of `y` on `design`, whose first
/// column must be the intercept. Starts from `initial` when given, otherwise
/// from the intercept-only solution.
pub fn fit_penalized_logistic<'a>(
    design: ArrayView2<'a, f64>,
    y: ArrayView1<'a, f64>,
    kappa: f64,
    initial: Option<Array1<f64>>,
    options: &FitOptions,
) -> Result<PirlsResult, PirlsError> {
    let beta0 = match initial {
        Some(beta) => beta,
        None => {
            let prevalence = y.mean().unwrap_or(0.5).clamp(PROB_EPS, 1.0 - PROB_EPS);
            let mut beta = Array1::zeros(design.ncols());
            beta[0] = (prevalence / (1.0 - prevalence)).ln();
            beta
        }
    };
    let model = LogisticWorkingModel::new(design, y);
    run_pirls(&model, RidgePenalty::new(kappa), beta0, options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, array};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn with_intercept(x: &Array1<f64>) -> Array2<f64> {
        let mut design = Array2::ones((x.len(), 2));
        design.column_mut(1).assign(x);
        design
    }

    fn simulated(n: usize, slope: f64, seed: u64) -> (Array1<f64>, Array1<f64>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let x = Array1::linspace(-2.0, 2.0, n);
        let y = x.mapv(|xi| {
            let p = 1.0 / (1.0 + (-(slope * xi - 0.3)).exp());
            if rng.r#gen::<f64>() < p { 1.0 } else { 0.0 }
        });
        (x, y)
    }

    #[test]
    fn intercept_only_fit_recovers_log_odds() {
        let y = array![1.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0];
        let design = Array2::ones((y.len(), 1));
        let result =
            fit_penalized_logistic(design.view(), y.view(), 5.0, None, &FitOptions::default())
                .unwrap();
        // The intercept is never penalized.
        assert_abs_diff_eq!(result.beta[0], (3.0f64 / 5.0).ln(), epsilon = 1e-8);
        assert_eq!(result.penalty, 0.0);
    }

    #[test]
    fn stationarity_holds_at_the_solution() {
        let (x, y) = simulated(200, 1.5, 7);
        let design = with_intercept(&x);
        let kappa = 3.0;
        let result =
            fit_penalized_logistic(design.view(), y.view(), kappa, None, &FitOptions::default())
                .unwrap();
        let model = LogisticWorkingModel::new(design.view(), y.view());
        let state = model.update(&result.beta);
        assert_abs_diff_eq!(state.gradient[0], 0.0, epsilon = 1e-4);
        assert_abs_diff_eq!(state.gradient[1] + kappa * result.beta[1], 0.0, epsilon = 1e-4);
        assert!(result.beta[1] > 0.5, "slope should be clearly positive: {}", result.beta[1]);
    }

    #[test]
    fn ridge_penalty_keeps_separable_data_finite() {
        let x = array![-2.0, -1.0, -0.5, 0.5, 1.0, 2.0];
        let y = array![0.0, 0.0, 0.0, 1.0, 1.0, 1.0];
        let design = with_intercept(&x);
        let result =
            fit_penalized_logistic(design.view(), y.view(), 0.2, None, &FitOptions::default())
                .unwrap();
        assert!(result.beta.iter().all(|b| b.is_finite()));
        assert!(result.beta[1] > 0.0);
    }

    #[test]
    fn exhausted_iterations_surface_as_an_error() {
        let (x, y) = simulated(100, 1.5, 5);
        let design = with_intercept(&x);
        let options = FitOptions {
            max_iterations: 1,
            ..FitOptions::default()
        };
        let result = fit_penalized_logistic(design.view(), y.view(), 0.5, None, &options);
        assert!(matches!(
            result,
            Err(PirlsError::DidNotConverge {
                max_iterations: 1,
                ..
            })
        ));
    }

    #[test]
    fn larger_penalty_shrinks_the_slope() {
        let (x, y) = simulated(150, 2.0, 11);
        let design = with_intercept(&x);
        let mut previous = f64::INFINITY;
        for kappa in [0.0, 0.5, 2.0, 8.0, 32.0, 128.0] {
            let result =
                fit_penalized_logistic(design.view(), y.view(), kappa, None, &FitOptions::default())
                    .unwrap();
            let magnitude = result.beta[1].abs();
            assert!(
                magnitude <= previous + 1e-6,
                "slope grew from {previous} to {magnitude} at kappa {kappa}"
            );
            previous = magnitude;
        }
    }

    #[test]
    fn warm_start_reaches_the_same_optimum() {
        let (x, y) = simulated(120, 1.0, 3);
        let design = with_intercept(&x);
        let options = FitOptions::default();
        let cold = fit_penalized_logistic(design.view(), y.view(), 1.0, None, &options).unwrap();
        let warm = fit_penalized_logistic(
            design.view(),
            y.view(),
            1.0,
            Some(array![0.4, -0.8]),
            &options,
        )
        .unwrap();
        assert_abs_diff_eq!(cold.criterion(), warm.criterion(), epsilon = 1e-6);
        assert_abs_diff_eq!(cold.beta[1], warm.beta[1], epsilon = 1e-4);
    }

    #[test]
    fn failed_fits_score_as_infinitely_bad() {
        let y = array![1.0, 0.0, 0.0, 1.0];
        let design = Array2::ones((y.len(), 1));
        let fitted =
            fit_penalized_logistic(design.view(), y.view(), 0.0, None, &FitOptions::default());
        assert!(fitted.criterion().is_finite());
        let failed: Result<PirlsResult, PirlsError> = Err(PirlsError::NonFinite { iteration: 1 });
        assert_eq!(failed.criterion(), f64::INFINITY);
    }

    #[test]
    fn duplicated_columns_share_the_effect() {
        let x = array![0.3, -1.2, 0.8, 1.5, -0.4, 0.1, -0.9, 1.1];
        let y = array![1.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 1.0];
        let mut design = Array2::ones((x.len(), 3));
        design.column_mut(1).assign(&x);
        design.column_mut(2).assign(&x);
        let result =
            fit_penalized_logistic(design.view(), y.view(), 1.0, None, &FitOptions::default())
                .unwrap();
        assert_abs_diff_eq!(result.beta[1], result.beta[2], epsilon = 1e-8);
    }
}
