//! # Supervised Cluster Search
//!
//! Clusters are grown one at a time. While cluster `k` grows, every variable
//! still in the candidate pool is tried: its signed column is averaged with the
//! current members, a penalized logistic regression of the labels on the frozen
//! cluster averages, the candidate average and the clinical covariates is
//! refit, and the candidate giving the lowest penalized deviance wins. The
//! winner joins the cluster if it lowers the criterion by more than
//! `min_improvement`; otherwise the cluster is frozen and its members leave the
//! pool for good.
//!
//! Candidate fits within one step are independent and run on the rayon pool.
//! They are collected in variable order and reduced sequentially, so ties go
//! to the lowest variable index (and to `+` before `-`) regardless of thread
//! scheduling.

use crate::data::{DataError, PreparedData, prepare};
use crate::model::{
    Cluster, ClusterMember, ClusterSet, ConfigError, PeloraConfig, PenalizedModel, assemble_design,
};
use crate::pirls::{PirlsError, PirlsResult, fit_penalized_logistic};
use crate::sign::{Scored, Sign, SignResolver};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PeloraError {
    #[error("Invalid input: {0}")]
    Data(#[from] DataError),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Penalized logistic regression fit failed: {0}")]
    Fit(#[from] PirlsError),
}

/// Runs Pelora on raw inputs: validates the configuration and the data,
/// standardizes `x` if requested, and searches for up to `config.noc` clusters.
pub fn pelora(
    x: Array2<f64>,
    y: Array1<f64>,
    u: Option<Array2<f64>>,
    config: &PeloraConfig,
) -> Result<ClusterSet, PeloraError> {
    config.validate()?;
    let data = prepare(x, y, u, config.standardize)?;
    ClusterSearch::new(&data, config)?.run()
}

/// Verbosity gate derived from `PeloraConfig::trace`.
#[derive(Debug, Clone, Copy)]
struct Trace(usize);

impl Trace {
    fn clusters(self) -> bool {
        self.0 >= 1
    }

    fn steps(self) -> bool {
        self.0 >= 2
    }
}

/// The design shared by every candidate of one cluster:
/// `[1 | frozen averages | slot | clinical]`, with the slot left at zero.
struct DesignTemplate {
    matrix: Array2<f64>,
    slot: usize,
}

impl DesignTemplate {
    fn new(frozen: &[Array1<f64>], clinical: Option<ArrayView2<f64>>, n: usize) -> Self {
        let k = frozen.len();
        let mut averages = Array2::zeros((n, k + 1));
        for (mut column, average) in averages.axis_iter_mut(Axis(1)).zip(frozen) {
            column.assign(average);
        }
        Self {
            matrix: assemble_design(averages.view(), clinical),
            slot: 1 + k,
        }
    }

    fn with_slot(&self, column: &Array1<f64>) -> Array2<f64> {
        let mut design = self.matrix.clone();
        design.column_mut(self.slot).assign(column);
        design
    }
}

/// Inserts a zero coefficient at `slot`, so a fit without the slot column can
/// warm-start a fit with it.
fn insert_slot(beta: &Array1<f64>, slot: usize) -> Array1<f64> {
    beta.iter()
        .take(slot)
        .copied()
        .chain(std::iter::once(0.0))
        .chain(beta.iter().skip(slot).copied())
        .collect()
}

fn to_model(fit: &PirlsResult, n_clusters: usize) -> PenalizedModel {
    PenalizedModel::from_coefficients(
        fit.beta.view(),
        n_clusters,
        fit.deviance,
        fit.penalty,
        fit.iterations,
    )
}

struct GrowingCluster {
    members: Vec<ClusterMember>,
    /// Sum of the signed member columns.
    sum: Array1<f64>,
    /// Fit with the current average in the slot. While the cluster is empty this
    /// is the frozen-clusters fit with a zero slot coefficient.
    fit: PirlsResult,
    criterion_path: Vec<f64>,
}

impl GrowingCluster {
    fn average_with(&self, column: ArrayView1<f64>, sign: Sign) -> Array1<f64> {
        let mut total = self.sum.clone();
        total.scaled_add(sign.value(), &column);
        total / (self.members.len() + 1) as f64
    }

    fn average_without(&self, position: usize, column: ArrayView1<f64>) -> Array1<f64> {
        let mut total = self.sum.clone();
        total.scaled_add(-self.members[position].sign.value(), &column);
        total / (self.members.len() - 1) as f64
    }

    fn average(&self) -> Array1<f64> {
        &self.sum / self.members.len() as f64
    }

    fn criterion(&self) -> f64 {
        self.fit.criterion()
    }
}

struct Candidate {
    variable: usize,
    sign: Sign,
    fit: PirlsResult,
}

/// The greedy forward search over a prepared data set.
pub struct ClusterSearch<'a> {
    data: &'a PreparedData,
    config: &'a PeloraConfig,
    resolver: SignResolver,
    kappa: f64,
    trace: Trace,
}

impl<'a> ClusterSearch<'a> {
    pub fn new(data: &'a PreparedData, config: &'a PeloraConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            resolver: SignResolver::new(config.flip, &data.x, &data.y),
            kappa: config.penalty_weight(data.n_obs()),
            trace: Trace(config.trace),
            data,
            config,
        })
    }

    pub fn resolver(&self) -> &SignResolver {
        &self.resolver
    }

    fn clinical(&self) -> Option<ArrayView2<'_, f64>> {
        self.data.u.as_ref().map(|u| u.view())
    }

    fn fit(&self, design: &Array2<f64>, initial: Option<Array1<f64>>) -> Result<PirlsResult, PirlsError> {
        fit_penalized_logistic(
            design.view(),
            self.data.y.view(),
            self.kappa,
            initial,
            &self.config.fit,
        )
    }

    pub fn run(&self) -> Result<ClusterSet, PeloraError> {
        let n = self.data.n_obs();
        let p = self.data.n_vars();
        if self.trace.clusters() {
            log::info!(
                "Pelora: searching for {} clusters among {} variables ({} observations, {} clinical covariates, prevalence {:.3}, flip = {}, lambda = {}, kappa = {:.4})",
                self.config.noc,
                p,
                n,
                self.data.n_clinical(),
                self.data.y.prevalence(),
                self.config.flip,
                self.config.lambda,
                self.kappa
            );
        }

        let no_clusters = Array2::<f64>::zeros((n, 0));
        let base_design = assemble_design(no_clusters.view(), self.clinical());
        let base_fit = self.fit(&base_design, None)?;
        let base = to_model(&base_fit, 0);

        let mut pool: Vec<usize> = (0..p).collect();
        let mut baseline = base_fit;
        let mut frozen: Vec<Cluster> = Vec::new();
        let mut averages: Vec<Array1<f64>> = Vec::new();
        let mut path: Vec<PenalizedModel> = Vec::new();

        for k in 1..=self.config.noc {
            if pool.is_empty() {
                if self.trace.clusters() {
                    log::info!(
                        "Candidate pool exhausted after {} clusters; stopping early.",
                        frozen.len()
                    );
                }
                break;
            }

            let Some(grown) = self.grow_cluster(k, &averages, &baseline, &mut pool) else {
                // Another attempt would see the same pool and baseline.
                if self.trace.clusters() {
                    log::info!(
                        "Cluster {k}: no variable lowers the criterion by more than {:e}; stopping with {} clusters.",
                        self.config.min_improvement,
                        frozen.len()
                    );
                }
                break;
            };

            if self.trace.clusters() {
                log::info!(
                    "Cluster {k} frozen with {} variables, criterion {:.6} ({} variables left)",
                    grown.members.len(),
                    grown.criterion(),
                    pool.len()
                );
            }

            averages.push(grown.average());
            path.push(to_model(&grown.fit, k));
            frozen.push(Cluster {
                members: grown.members,
                coefficient: 0.0,
                criterion_path: grown.criterion_path,
            });
            baseline = grown.fit;
        }

        let final_model = path.last().unwrap_or(&base).clone();
        for (cluster, &coefficient) in frozen.iter_mut().zip(final_model.cluster_coefficients.iter()) {
            cluster.coefficient = coefficient;
        }

        let mut training_averages = Array2::zeros((n, averages.len()));
        for (mut column, average) in training_averages.axis_iter_mut(Axis(1)).zip(&averages) {
            column.assign(average);
        }

        Ok(ClusterSet {
            clusters: frozen,
            intercept: final_model.intercept,
            clinical_coefficients: final_model.clinical_coefficients.clone(),
            lambda: self.config.lambda,
            kappa: self.kappa,
            flip: self.config.flip,
            standardization: self.data.standardization.clone(),
            base,
            path,
            training_averages,
            n_vars: p,
        })
    }

    /// Grows cluster `k` against the frozen `averages`. Returns `None` when not
    /// even a first variable improves on `baseline`.
    fn grow_cluster(
        &self,
        k: usize,
        averages: &[Array1<f64>],
        baseline: &PirlsResult,
        pool: &mut Vec<usize>,
    ) -> Option<GrowingCluster> {
        let n = self.data.n_obs();
        let template = DesignTemplate::new(averages, self.clinical(), n);
        let mut growing = GrowingCluster {
            members: Vec::new(),
            sum: Array1::zeros(n),
            fit: PirlsResult {
                beta: insert_slot(&baseline.beta, template.slot),
                ..baseline.clone()
            },
            criterion_path: Vec::new(),
        };

        while !pool.is_empty() {
            let Some(best) = self.best_addition(k, &template, &growing, pool) else {
                break;
            };
            let improvement = growing.criterion() - best.fit.criterion();
            if !(improvement > self.config.min_improvement) {
                break;
            }

            let column = self.data.x.column(best.variable);
            growing.sum.scaled_add(best.sign.value(), &column);
            growing.members.push(ClusterMember {
                variable: best.variable,
                sign: best.sign,
            });
            growing.fit = best.fit;
            growing.criterion_path.push(growing.criterion());
            pool.retain(|&j| j != best.variable);

            if self.trace.steps() {
                log::debug!(
                    "Cluster {k}: added {}{} (size {}), criterion {:.6}, improvement {:.3e}, max |eta| {:.2}",
                    best.sign,
                    best.variable,
                    growing.members.len(),
                    growing.criterion(),
                    improvement,
                    growing.fit.max_abs_eta
                );
            }

            if self.config.prune {
                self.prune(k, &template, &mut growing, pool);
            }
        }

        (!growing.members.is_empty()).then_some(growing)
    }

    /// Scores every pooled variable as the next member. `pool` is sorted, so the
    /// strict comparison keeps the lowest index among equal criteria. A candidate
    /// whose fit fails (a design column collinear with the others, unpenalized
    /// separation) cannot improve the criterion and is skipped.
    fn best_addition(
        &self,
        k: usize,
        template: &DesignTemplate,
        growing: &GrowingCluster,
        pool: &[usize],
    ) -> Option<Candidate> {
        let evaluations: Vec<(usize, Sign, Result<PirlsResult, PirlsError>)> = pool
            .par_iter()
            .map(|&variable| {
                let column = self.data.x.column(variable);
                let (sign, fit) = self.resolver.resolve(variable, |sign| {
                    let design = template.with_slot(&growing.average_with(column, sign));
                    self.fit(&design, Some(growing.fit.beta.clone()))
                });
                (variable, sign, fit)
            })
            .collect();

        let mut best: Option<Candidate> = None;
        for (variable, sign, evaluation) in evaluations {
            let fit = match evaluation {
                Ok(fit) => fit,
                Err(err) => {
                    if self.trace.steps() {
                        log::debug!("Cluster {k}: candidate {variable} skipped: {err}");
                    }
                    continue;
                }
            };
            if best
                .as_ref()
                .is_none_or(|b| fit.criterion() < b.fit.criterion())
            {
                best = Some(Candidate {
                    variable,
                    sign,
                    fit,
                });
            }
        }
        best
    }

    /// Backward step: repeatedly drops the member whose removal lowers the
    /// criterion most, never the one just added, while the cluster has at least
    /// three members. Dropped variables go back to the pool.
    fn prune(
        &self,
        k: usize,
        template: &DesignTemplate,
        growing: &mut GrowingCluster,
        pool: &mut Vec<usize>,
    ) {
        while growing.members.len() >= 3 {
            let removable = growing.members.len() - 1;
            let evaluations: Vec<(usize, Result<PirlsResult, PirlsError>)> = (0..removable)
                .into_par_iter()
                .map(|position| {
                    let member = growing.members[position];
                    let column = self.data.x.column(member.variable);
                    let design = template.with_slot(&growing.average_without(position, column));
                    (position, self.fit(&design, Some(growing.fit.beta.clone())))
                })
                .collect();

            let mut best: Option<(usize, PirlsResult)> = None;
            for (position, evaluation) in evaluations {
                let fit = match evaluation {
                    Ok(fit) => fit,
                    Err(err) => {
                        if self.trace.steps() {
                            log::debug!(
                                "Cluster {k}: removal of {} skipped: {err}",
                                growing.members[position].variable
                            );
                        }
                        continue;
                    }
                };
                let better = match &best {
                    None => true,
                    Some((incumbent, incumbent_fit)) => {
                        let (c, ci) = (fit.criterion(), incumbent_fit.criterion());
                        c < ci
                            || (c == ci
                                && growing.members[position].variable
                                    < growing.members[*incumbent].variable)
                    }
                };
                if better {
                    best = Some((position, fit));
                }
            }

            let Some((position, fit)) = best else {
                break;
            };
            let improvement = growing.criterion() - fit.criterion();
            if !(improvement > self.config.min_improvement) {
                break;
            }

            let member = growing.members.remove(position);
            growing
                .sum
                .scaled_add(-member.sign.value(), &self.data.x.column(member.variable));
            growing.fit = fit;
            growing.criterion_path.push(growing.criterion());
            if let Err(slot) = pool.binary_search(&member.variable) {
                pool.insert(slot, member.variable);
            }

            if self.trace.steps() {
                log::debug!(
                    "Cluster {k}: pruned {}{} (size {}), criterion {:.6}, improvement {:.3e}",
                    member.sign,
                    member.variable,
                    growing.members.len(),
                    growing.criterion(),
                    improvement
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FlipMethod;
    use crate::test_fixtures::GroupedDataBuilder;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use std::collections::HashSet;

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn quiet(config: PeloraConfig) -> PeloraConfig {
        config.with_trace(0)
    }

    #[test]
    fn insert_slot_shifts_trailing_coefficients() {
        let beta = array![1.0, 2.0, 3.0];
        assert_eq!(insert_slot(&beta, 2), array![1.0, 2.0, 0.0, 3.0]);
        assert_eq!(insert_slot(&beta, 3), array![1.0, 2.0, 3.0, 0.0]);
    }

    #[test]
    fn template_places_frozen_averages_before_the_slot() {
        let frozen = vec![array![1.0, 2.0]];
        let clinical = array![[7.0], [8.0]];
        let template = DesignTemplate::new(&frozen, Some(clinical.view()), 2);
        assert_eq!(template.slot, 2);
        let design = template.with_slot(&array![-1.0, -2.0]);
        assert_eq!(design, array![[1.0, 1.0, -1.0, 7.0], [1.0, 2.0, -2.0, 8.0]]);
    }

    #[test]
    fn clusters_partition_the_variables() {
        init_logging();
        let data = GroupedDataBuilder::new(60).groups(3, 3).noise_vars(4).build();
        let config = PeloraConfig::default().with_noc(5).with_trace(2);
        let result = pelora(data.x, data.y, None, &config).unwrap();

        let mut seen = HashSet::new();
        for cluster in &result.clusters {
            assert!(!cluster.is_empty());
            for member in &cluster.members {
                assert!(seen.insert(member.variable), "variable {} reused", member.variable);
                assert!(member.variable < 13);
            }
        }
        assert!(result.len() <= 5);
    }

    #[test]
    fn each_frozen_cluster_improves_the_criterion() {
        let data = GroupedDataBuilder::new(80).groups(2, 4).noise_vars(3).build();
        let config = quiet(PeloraConfig::default().with_noc(3));
        let result = pelora(data.x, data.y, None, &config).unwrap();

        let mut previous = result.base_model().criterion();
        for (cluster, model) in result.clusters.iter().zip(result.path()) {
            assert!(model.criterion() < previous);
            previous = model.criterion();
            // Forward-only steps strictly decrease the criterion within a cluster.
            assert!(cluster.criterion_path.windows(2).all(|w| w[1] < w[0]));
            assert_abs_diff_eq!(
                *cluster.criterion_path.last().unwrap(),
                model.criterion(),
                epsilon = 1e-12
            );
        }
    }

    #[test]
    fn final_coefficients_come_from_the_last_path_model() {
        let data = GroupedDataBuilder::new(50).groups(2, 2).noise_vars(2).build();
        let config = quiet(PeloraConfig::default().with_noc(2));
        let result = pelora(data.x, data.y, None, &config).unwrap();
        let last = result.final_model();
        assert_eq!(result.intercept, last.intercept);
        for (i, cluster) in result.clusters.iter().enumerate() {
            assert_eq!(cluster.coefficient, last.cluster_coefficients[i]);
        }
        assert_eq!(last.n_clusters(), result.len());
    }

    #[test]
    fn no_flip_yields_only_plus_signs() {
        let data = GroupedDataBuilder::new(60).groups(2, 3).negated(true).build();
        let config = quiet(
            PeloraConfig::default()
                .with_noc(4)
                .with_flip(FlipMethod::NoFlip),
        );
        let result = pelora(data.x, data.y, None, &config).unwrap();
        assert!(!result.is_empty());
        for cluster in &result.clusters {
            assert!(cluster.members.iter().all(|m| m.sign == Sign::Plus));
        }
    }

    #[test]
    fn cor_signs_are_fixed_before_the_search() {
        let data = GroupedDataBuilder::new(60).groups(2, 3).negated(true).build();
        let config = quiet(
            PeloraConfig::default()
                .with_noc(3)
                .with_flip(FlipMethod::Correlation),
        );
        let prepared = prepare(data.x.clone(), data.y.clone(), None, true).unwrap();
        let search = ClusterSearch::new(&prepared, &config).unwrap();
        let expected = search.resolver().fixed_signs().to_vec();

        let result = search.run().unwrap();
        for cluster in &result.clusters {
            for member in &cluster.members {
                assert_eq!(member.sign, expected[member.variable]);
            }
        }
    }

    #[test]
    fn pm_flips_negatively_associated_variables_into_one_group() {
        let data = GroupedDataBuilder::new(120)
            .groups(1, 4)
            .noise_vars(2)
            .negated(true)
            .signal(3.0)
            .build();
        let config = quiet(PeloraConfig::default().with_noc(1));
        let result = pelora(data.x, data.y, None, &config).unwrap();
        let cluster = &result.clusters[0];
        assert!(cluster.len() >= 2);
        // Odd members of the group were generated negated; within the cluster,
        // signs must reconcile them with the even members.
        let signs: Vec<(usize, Sign)> = cluster
            .members
            .iter()
            .filter(|m| m.variable < 4)
            .map(|m| (m.variable, m.sign))
            .collect();
        for window in signs.windows(2) {
            let (a, sa) = window[0];
            let (b, sb) = window[1];
            let same_parity = a % 2 == b % 2;
            assert_eq!(same_parity, sa == sb, "members {a}{sa} and {b}{sb}");
        }
    }

    #[test]
    fn results_do_not_depend_on_trace() {
        let data = GroupedDataBuilder::new(40).groups(2, 3).noise_vars(2).build();
        let silent = pelora(
            data.x.clone(),
            data.y.clone(),
            None,
            &PeloraConfig::default().with_noc(3).with_trace(0),
        )
        .unwrap();
        let chatty = pelora(
            data.x,
            data.y,
            None,
            &PeloraConfig::default().with_noc(3).with_trace(2),
        )
        .unwrap();
        assert_eq!(silent.clusters, chatty.clusters);
        assert_eq!(silent.intercept, chatty.intercept);
    }

    #[test]
    fn pruning_keeps_the_partition_and_never_worsens_the_fit() {
        let data = GroupedDataBuilder::new(80).groups(2, 4).noise_vars(4).build();
        let config = quiet(PeloraConfig::default().with_noc(3).with_prune(true));
        let result = pelora(data.x, data.y, None, &config).unwrap();
        let mut seen = HashSet::new();
        let mut previous = result.base_model().criterion();
        for (cluster, model) in result.clusters.iter().zip(result.path()) {
            assert!(cluster.members.iter().all(|m| seen.insert(m.variable)));
            assert!(cluster.criterion_path.windows(2).all(|w| w[1] < w[0]));
            assert!(model.criterion() < previous);
            previous = model.criterion();
        }
    }

    #[test]
    fn clinical_covariates_get_their_own_coefficients() {
        let data = GroupedDataBuilder::new(60).groups(1, 3).noise_vars(2).build();
        let u = Array2::from_shape_fn((60, 2), |(i, j)| match j {
            0 => (i % 7) as f64 * 0.3,
            _ => ((i * 3) % 5) as f64 - 2.0,
        });
        let config = quiet(PeloraConfig::default().with_noc(2));
        let result = pelora(data.x, data.y, Some(u), &config).unwrap();
        assert_eq!(result.clinical_coefficients.len(), 2);
        assert_eq!(result.base_model().clinical_coefficients.len(), 2);
        assert_eq!(result.base_model().n_clusters(), 0);
        for model in result.path() {
            assert_eq!(model.clinical_coefficients.len(), 2);
        }
    }

    #[test]
    fn search_refuses_an_unvalidated_config() {
        let data = GroupedDataBuilder::new(30).groups(1, 2).noise_vars(1).build();
        let prepared = prepare(data.x, data.y, None, true).unwrap();
        let config = PeloraConfig::default().with_lambda(-0.5);
        assert!(matches!(
            ClusterSearch::new(&prepared, &config),
            Err(ConfigError::InvalidLambda(_))
        ));
    }

    #[test]
    fn invalid_config_fails_before_validation_of_data() {
        let config = PeloraConfig::default().with_lambda(-0.1);
        let err = pelora(array![[1.0]], array![5.0], None, &config).unwrap_err();
        assert!(matches!(err, PeloraError::Config(ConfigError::InvalidLambda(_))));
    }
}
