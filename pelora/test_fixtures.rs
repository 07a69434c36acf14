//! Synthetic expression data with known group structure.

use ndarray::{Array1, Array2};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, StandardNormal};

pub struct GroupedData {
    pub x: Array2<f64>,
    pub y: Array1<f64>,
}

/// Builds `groups * group_size` correlated variables followed by
/// `noise_vars` independent ones. Every group shares a latent factor; the
/// labels mark the upper half of a noisy score that loads on the factors with
/// weights `signal, signal / 2, ...`, so both classes are always present.
pub struct GroupedDataBuilder {
    n_obs: usize,
    groups: usize,
    group_size: usize,
    noise_vars: usize,
    negated: bool,
    signal: f64,
    member_noise: f64,
    seed: u64,
}

impl GroupedDataBuilder {
    pub fn new(n_obs: usize) -> Self {
        Self {
            n_obs,
            groups: 2,
            group_size: 3,
            noise_vars: 2,
            negated: false,
            signal: 2.0,
            member_noise: 0.5,
            seed: 42,
        }
    }

    pub fn groups(mut self, groups: usize, group_size: usize) -> Self {
        self.groups = groups;
        self.group_size = group_size;
        self
    }

    pub fn noise_vars(mut self, noise_vars: usize) -> Self {
        self.noise_vars = noise_vars;
        self
    }

    /// Negate every odd-numbered member within each group.
    pub fn negated(mut self, negated: bool) -> Self {
        self.negated = negated;
        self
    }

    pub fn signal(mut self, signal: f64) -> Self {
        self.signal = signal;
        self
    }

    pub fn build(self) -> GroupedData {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let n = self.n_obs;
        let p = self.groups * self.group_size + self.noise_vars;

        let factors: Array2<f64> = Array2::from_shape_fn((n, self.groups), |_| {
            StandardNormal.sample(&mut rng)
        });

        let mut x = Array2::<f64>::zeros((n, p));
        for g in 0..self.groups {
            for m in 0..self.group_size {
                let j = g * self.group_size + m;
                let sign = if self.negated && m % 2 == 1 { -1.0 } else { 1.0 };
                for i in 0..n {
                    let e: f64 = StandardNormal.sample(&mut rng);
                    x[[i, j]] = sign * (factors[[i, g]] + self.member_noise * e);
                }
            }
        }
        for j in self.groups * self.group_size..p {
            for i in 0..n {
                x[[i, j]] = StandardNormal.sample(&mut rng);
            }
        }

        let scores: Vec<f64> = (0..n)
            .map(|i| {
                let mut s: f64 = (0..self.groups)
                    .map(|g| self.signal / (g + 1) as f64 * factors[[i, g]])
                    .sum();
                let e: f64 = StandardNormal.sample(&mut rng);
                s += 0.5 * e;
                s
            })
            .collect();
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));
        let mut y = Array1::zeros(n);
        for &i in &order[n / 2..] {
            y[i] = 1.0;
        }

        GroupedData { x, y }
    }
}
