//! Sign flipping of variables before they are averaged into a cluster.

use crate::data::{ExpressionMatrix, Labels};
use crate::model::FlipMethod;
use ndarray::ArrayView1;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sign {
    Plus,
    Minus,
}

impl Sign {
    pub fn value(self) -> f64 {
        match self {
            Sign::Plus => 1.0,
            Sign::Minus => -1.0,
        }
    }

    /// Sign of `v`, with zero mapped to `Plus`.
    pub fn of(v: f64) -> Self {
        if v < 0.0 { Sign::Minus } else { Sign::Plus }
    }
}

impl fmt::Display for Sign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Sign::Plus => "+",
            Sign::Minus => "-",
        })
    }
}

/// Anything carrying a criterion to be minimized.
pub trait Scored {
    fn criterion(&self) -> f64;
}

/// Pearson correlation of two vectors; zero when either has no spread.
pub fn pearson_correlation(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    let n = a.len() as f64;
    let mean_a = a.sum() / n;
    let mean_b = b.sum() / n;
    let (mut sab, mut saa, mut sbb) = (0.0, 0.0, 0.0);
    for (&x, &y) in a.iter().zip(b.iter()) {
        let da = x - mean_a;
        let db = y - mean_b;
        sab += da * db;
        saa += da * da;
        sbb += db * db;
    }
    let denom = (saa * sbb).sqrt();
    if denom > 0.0 { sab / denom } else { 0.0 }
}

const BOTH: [Sign; 2] = [Sign::Plus, Sign::Minus];
const PLUS_ONLY: [Sign; 1] = [Sign::Plus];

/// Decides the sign a variable enters its cluster with.
#[derive(Debug, Clone)]
pub struct SignResolver {
    method: FlipMethod,
    fixed: Vec<Sign>,
}

impl SignResolver {
    /// Under `FlipMethod::Correlation` the per-variable signs are computed here,
    /// once, before any search begins.
    pub fn new(method: FlipMethod, x: &ExpressionMatrix, y: &Labels) -> Self {
        let fixed = match method {
            FlipMethod::Correlation => (0..x.n_vars())
                .map(|j| Sign::of(pearson_correlation(x.column(j), y.view())))
                .collect(),
            FlipMethod::PlusMinus | FlipMethod::NoFlip => Vec::new(),
        };
        Self { method, fixed }
    }

    /// A-priori signs under `FlipMethod::Correlation`; empty otherwise.
    pub fn fixed_signs(&self) -> &[Sign] {
        &self.fixed
    }

    /// The signs worth trying for `variable`, `Plus` first.
    pub fn candidate_signs(&self, variable: usize) -> &[Sign] {
        match self.method {
            FlipMethod::PlusMinus => &BOTH,
            FlipMethod::Correlation => std::slice::from_ref(&self.fixed[variable]),
            FlipMethod::NoFlip => &PLUS_ONLY,
        }
    }

    /// Evaluates every candidate sign of `variable` and keeps the one with the
    /// lowest criterion. Ties keep `Plus`.
    pub fn resolve<T, F>(&self, variable: usize, mut evaluate: F) -> (Sign, T)
    where
        T: Scored,
        F: FnMut(Sign) -> T,
    {
        let signs = self.candidate_signs(variable);
        let mut best_sign = signs[0];
        let mut best = evaluate(best_sign);
        for &sign in &signs[1..] {
            let scored = evaluate(sign);
            if scored.criterion() < best.criterion() {
                best_sign = sign;
                best = scored;
            }
        }
        (best_sign, best)
    }
}
