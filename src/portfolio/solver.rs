//! Projected-gradient solver for the concave quadratic program
//!
//! Maximizes `cᵀw - wᵀQw` over `{Σw = 1, lo ≤ w ≤ hi, ‖w - w₀‖₁ ≤ T}` using
//! accelerated projected gradient ascent with function-value restarts.
//! Projection onto the feasible set is exact up to floating point: the
//! budget multiplier is found on the piecewise-linear sum, the turnover
//! multiplier by bisection.

use crate::error::{EngineError, Result};
use std::time::Instant;

/// Lower bound on the Lipschitz constant, keeps steps bounded for near-linear objectives
const MIN_LIPSCHITZ: f64 = 1e-6;
/// Upper end of the turnover multiplier search
const MAX_TURNOVER_MULTIPLIER: f64 = 1e12;
const MULTIPLIER_BISECTIONS: usize = 200;

/// `cᵀw - wᵀQw`
#[derive(Debug, Clone)]
pub struct QuadraticObjective {
    pub q: Vec<Vec<f64>>,
    pub c: Vec<f64>,
}

impl QuadraticObjective {
    pub fn value(&self, w: &[f64]) -> f64 {
        let linear: f64 = self.c.iter().zip(w).map(|(c, w)| c * w).sum();
        linear - quadratic_form(&self.q, w)
    }

    pub fn gradient(&self, w: &[f64]) -> Vec<f64> {
        let n = w.len();
        (0..n)
            .map(|i| {
                let qw: f64 = (0..n).map(|j| self.q[i][j] * w[j]).sum();
                self.c[i] - 2.0 * qw
            })
            .collect()
    }

    /// `2 · max row abs sum`, an upper bound on the gradient's Lipschitz constant
    pub fn lipschitz(&self) -> f64 {
        let bound = self
            .q
            .iter()
            .map(|row| row.iter().map(|v| v.abs()).sum::<f64>())
            .fold(0.0, f64::max);
        (2.0 * bound).max(MIN_LIPSCHITZ)
    }
}

pub fn quadratic_form(q: &[Vec<f64>], w: &[f64]) -> f64 {
    let n = w.len();
    let mut total = 0.0;
    for i in 0..n {
        for j in 0..n {
            total += w[i] * q[i][j] * w[j];
        }
    }
    total
}

pub fn l1_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y).abs()).sum()
}

fn inf_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y).abs()).fold(0.0, f64::max)
}

/// Budget, box and turnover constraints
#[derive(Debug, Clone)]
pub struct FeasibleSet {
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
    /// Current weights the turnover is measured from
    pub anchor: Vec<f64>,
    pub max_turnover: Option<f64>,
}

impl FeasibleSet {
    fn coordinate(&self, i: usize, y: f64, nu: f64, rho: f64) -> f64 {
        let u = y + nu - self.anchor[i];
        let soft = if u > rho {
            u - rho
        } else if u < -rho {
            u + rho
        } else {
            0.0
        };
        (self.anchor[i] + soft).max(self.lower[i]).min(self.upper[i])
    }

    fn total(&self, y: &[f64], nu: f64, rho: f64) -> f64 {
        (0..y.len()).map(|i| self.coordinate(i, y[i], nu, rho)).sum()
    }

    /// Budget multiplier for a fixed turnover multiplier
    ///
    /// Each coordinate is piecewise linear in `nu`, so the sum is too; the
    /// root is found between consecutive breakpoints and interpolated.
    fn budget_multiplier(&self, y: &[f64], rho: f64) -> f64 {
        let mut breakpoints = Vec::with_capacity(4 * y.len());
        for i in 0..y.len() {
            let a = self.anchor[i];
            let shift = y[i] - a;
            breakpoints.push(-rho - shift);
            breakpoints.push(rho - shift);
            for bound in [self.lower[i], self.upper[i]] {
                if bound > a {
                    breakpoints.push(bound - a + rho - shift);
                } else if bound < a {
                    breakpoints.push(bound - a - rho - shift);
                }
            }
        }
        breakpoints.retain(|b| b.is_finite());
        breakpoints.sort_by(|a, b| a.total_cmp(b));
        breakpoints.dedup();

        let Some(&first) = breakpoints.first() else {
            return 0.0;
        };
        if self.total(y, first, rho) >= 1.0 {
            return first;
        }

        // first breakpoint whose sum reaches the budget
        let idx = breakpoints.partition_point(|nu| self.total(y, *nu, rho) < 1.0);
        if idx >= breakpoints.len() {
            return breakpoints[breakpoints.len() - 1];
        }
        let (lo, hi) = (breakpoints[idx - 1], breakpoints[idx]);
        let (s_lo, s_hi) = (self.total(y, lo, rho), self.total(y, hi, rho));
        if s_hi - s_lo <= 0.0 {
            return hi;
        }
        lo + (1.0 - s_lo) * (hi - lo) / (s_hi - s_lo)
    }

    fn project_budget(&self, y: &[f64], rho: f64) -> Vec<f64> {
        let nu = self.budget_multiplier(y, rho);
        (0..y.len()).map(|i| self.coordinate(i, y[i], nu, rho)).collect()
    }

    /// Euclidean projection of `y`
    pub fn project(&self, y: &[f64]) -> Vec<f64> {
        let unrestricted = self.project_budget(y, 0.0);
        let Some(limit) = self.max_turnover else {
            return unrestricted;
        };
        if l1_distance(&unrestricted, &self.anchor) <= limit {
            return unrestricted;
        }

        let within = |rho: f64| l1_distance(&self.project_budget(y, rho), &self.anchor) <= limit;

        let mut hi = 1e-9;
        while !within(hi) && hi < MAX_TURNOVER_MULTIPLIER {
            hi *= 2.0;
        }
        let mut lo = 0.0;
        for _ in 0..MULTIPLIER_BISECTIONS {
            if hi - lo <= f64::EPSILON * hi {
                break;
            }
            let mid = 0.5 * (lo + hi);
            if within(mid) {
                hi = mid;
            } else {
                lo = mid;
            }
        }
        self.project_budget(y, hi)
    }

    pub fn turnover(&self, w: &[f64]) -> f64 {
        l1_distance(w, &self.anchor)
    }
}

#[derive(Debug, Clone)]
pub struct SolverSettings {
    pub max_iterations: usize,
    pub tolerance: f64,
    pub started: Instant,
    pub deadline: Option<Instant>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Solution {
    pub weights: Vec<f64>,
    pub iterations: usize,
    /// Projected-gradient KKT residual at `weights`
    pub residual: f64,
}

/// `‖w - P(w + α∇f(w))‖∞ / α`; zero exactly at a KKT point
pub fn kkt_residual(objective: &QuadraticObjective, set: &FeasibleSet, w: &[f64], step: f64) -> f64 {
    let gradient = objective.gradient(w);
    let moved: Vec<f64> = w.iter().zip(&gradient).map(|(w, g)| w + step * g).collect();
    inf_distance(w, &set.project(&moved)) / step
}

/// Maximize `objective` over `set`, starting from the projection of `start`
pub fn solve(
    objective: &QuadraticObjective,
    set: &FeasibleSet,
    start: &[f64],
    settings: &SolverSettings,
) -> Result<Solution> {
    let lipschitz = objective.lipschitz();
    let step = 1.0 / lipschitz;
    // residuals carry rounding of order ε·L once the step is small
    let tolerance = settings.tolerance * lipschitz.max(1.0);
    let mut x = set.project(start);
    let mut y = x.clone();
    let mut fx = objective.value(&x);
    let mut momentum = 1.0_f64;

    for iteration in 0..settings.max_iterations {
        if let Some(deadline) = settings.deadline {
            if Instant::now() >= deadline {
                return Err(EngineError::OptimizationTimeout {
                    elapsed_ms: settings.started.elapsed().as_millis() as u64,
                    iterations: iteration,
                });
            }
        }

        let gradient = objective.gradient(&y);
        let moved: Vec<f64> = y.iter().zip(&gradient).map(|(y, g)| y + step * g).collect();
        let next = set.project(&moved);

        if inf_distance(&next, &y) / step <= tolerance {
            let residual = kkt_residual(objective, set, &next, step);
            if residual <= tolerance {
                return Ok(Solution {
                    weights: next,
                    iterations: iteration + 1,
                    residual,
                });
            }
        }

        let f_next = objective.value(&next);
        if f_next < fx {
            momentum = 1.0;
            y = next.clone();
        } else {
            let momentum_next = (1.0 + (1.0 + 4.0 * momentum * momentum).sqrt()) / 2.0;
            let beta = (momentum - 1.0) / momentum_next;
            y = next
                .iter()
                .zip(&x)
                .map(|(n, p)| n + beta * (n - p))
                .collect();
            momentum = momentum_next;
        }
        x = next;
        fx = f_next;
    }

    let residual = kkt_residual(objective, set, &x, step);
    Err(EngineError::OptimizationDidNotConverge {
        iterations: settings.max_iterations,
        residual,
    })
}
