//! Black-Litterman posterior returns
//!
//! Equilibrium returns implied by market weights, blended with views. The
//! engine forms one absolute view per asset from its sentiment summary.

use crate::error::{EngineError, Result};

/// Smallest view confidence; keeps Ω finite
const MIN_VIEW_CONFIDENCE: f64 = 0.01;
const PIVOT_TOLERANCE: f64 = 1e-14;

/// A view in the Black-Litterman model
#[derive(Debug, Clone, PartialEq)]
pub struct View {
    /// Asset weights in view (P matrix row)
    pub weights: Vec<f64>,
    /// Expected return of view (Q value)
    pub expected_return: f64,
    /// Confidence in view (0-1, higher = more confident)
    pub confidence: f64,
}

impl View {
    /// "Asset `index` returns `expected_return`"
    pub fn absolute(n: usize, index: usize, expected_return: f64, confidence: f64) -> Self {
        let mut weights = vec![0.0; n];
        weights[index] = 1.0;
        Self {
            weights,
            expected_return,
            confidence,
        }
    }
}

pub struct BlackLitterman {
    equilibrium_returns: Vec<f64>,
    covariance: Vec<Vec<f64>>,
    tau: f64,
}

impl BlackLitterman {
    /// Equilibrium returns `Π = δ Σ w_mkt`
    pub fn new(market_weights: &[f64], covariance: &[Vec<f64>], risk_aversion: f64, tau: f64) -> Result<Self> {
        let n = market_weights.len();
        if covariance.len() != n || covariance.iter().any(|row| row.len() != n) {
            return Err(EngineError::invalid_parameter(
                "covariance",
                format!("expected a {}x{} matrix for Black-Litterman", n, n),
            ));
        }
        if !(tau > 0.0) {
            return Err(EngineError::invalid_parameter(
                "black_litterman_tau",
                "tau must be positive",
            ));
        }

        let equilibrium_returns = (0..n)
            .map(|i| {
                (0..n)
                    .map(|j| risk_aversion * covariance[i][j] * market_weights[j])
                    .sum()
            })
            .collect();

        Ok(Self {
            equilibrium_returns,
            covariance: covariance.to_vec(),
            tau,
        })
    }

    pub fn equilibrium_returns(&self) -> &[f64] {
        &self.equilibrium_returns
    }

    /// `Π + τΣPᵀ (PτΣPᵀ + Ω)⁻¹ (Q - PΠ)`
    pub fn apply_views(&self, views: &[View]) -> Result<Vec<f64>> {
        let n = self.equilibrium_returns.len();
        let k = views.len();
        if k == 0 {
            return Ok(self.equilibrium_returns.clone());
        }
        if views.iter().any(|v| v.weights.len() != n) {
            return Err(EngineError::invalid_parameter(
                "views",
                format!("each view needs {} asset weights", n),
            ));
        }

        // τΣPᵀ (n x k)
        let mut tau_sigma_p_t = vec![vec![0.0; k]; n];
        for i in 0..n {
            for j in 0..k {
                tau_sigma_p_t[i][j] = (0..n)
                    .map(|a| self.tau * self.covariance[i][a] * views[j].weights[a])
                    .sum();
            }
        }

        // PτΣPᵀ + Ω, with Ω_ii = (1/c - 1) · P_i τΣ P_iᵀ
        let mut m = vec![vec![0.0; k]; k];
        for i in 0..k {
            for j in 0..k {
                m[i][j] = (0..n).map(|a| views[i].weights[a] * tau_sigma_p_t[a][j]).sum();
            }
            let confidence = views[i].confidence.clamp(MIN_VIEW_CONFIDENCE, 1.0);
            m[i][i] += (1.0 / confidence - 1.0) * m[i][i];
        }

        let m_inv = invert_matrix(&m)?;

        let gap: Vec<f64> = views
            .iter()
            .map(|v| {
                v.expected_return
                    - (0..n)
                        .map(|a| v.weights[a] * self.equilibrium_returns[a])
                        .sum::<f64>()
            })
            .collect();
        let scaled: Vec<f64> = (0..k)
            .map(|i| (0..k).map(|j| m_inv[i][j] * gap[j]).sum())
            .collect();

        Ok((0..n)
            .map(|i| {
                self.equilibrium_returns[i]
                    + (0..k).map(|j| tau_sigma_p_t[i][j] * scaled[j]).sum::<f64>()
            })
            .collect())
    }
}

/// Gauss-Jordan inversion with partial pivoting
pub fn invert_matrix(matrix: &[Vec<f64>]) -> Result<Vec<Vec<f64>>> {
    let n = matrix.len();
    let scale = matrix
        .iter()
        .flatten()
        .map(|v| v.abs())
        .fold(0.0, f64::max)
        .max(f64::MIN_POSITIVE);

    let mut aug = vec![vec![0.0; 2 * n]; n];
    for i in 0..n {
        aug[i][..n].copy_from_slice(&matrix[i]);
        aug[i][n + i] = 1.0;
    }

    for col in 0..n {
        let mut max_row = col;
        for row in (col + 1)..n {
            if aug[row][col].abs() > aug[max_row][col].abs() {
                max_row = row;
            }
        }
        if aug[max_row][col].abs() <= PIVOT_TOLERANCE * scale {
            return Err(EngineError::invalid_parameter(
                "covariance",
                "singular matrix in Black-Litterman posterior",
            ));
        }
        aug.swap(col, max_row);

        let pivot = aug[col][col];
        for value in aug[col].iter_mut() {
            *value /= pivot;
        }

        let col_row = aug[col].clone();
        for row in 0..n {
            if row != col {
                let factor = aug[row][col];
                for j in 0..(2 * n) {
                    aug[row][j] -= factor * col_row[j];
                }
            }
        }
    }

    Ok(aug.into_iter().map(|row| row[n..].to_vec()).collect())
}
