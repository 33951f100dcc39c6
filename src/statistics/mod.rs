//! # Statistics Core
//!
//! Turns price histories into the inputs every other component consumes:
//! - Period returns from a [`PriceSeries`]
//! - Sample covariance (Bessel-corrected) with an ill-conditioning flag
//! - Expected returns: historical mean, exponentially weighted, CAPM-implied
//! - Diagonal shrinkage for matrices that cannot be solved as-is
//!
//! ```rust,ignore
//! use behavioral_optimizer::statistics::{compute_returns, compute_covariance};
//!
//! let returns = compute_returns(&series)?;
//! let cov = compute_covariance(&returns_by_asset)?;
//! if cov.ill_conditioned {
//!     let cov = cov.shrink(0.2, 1e-8);
//! }
//! ```

pub mod performance;


pub use performance::{performance_summary, PerformanceSummary};

use crate::config::StatisticsConfig;
use crate::error::{EngineError, Result};
use crate::types::PriceSeries;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Period returns derived from a price series
pub type ReturnVector = Vec<f64>;

/// Relative pivot below which a covariance matrix counts as singular
const PIVOT_TOLERANCE: f64 = 1e-10;

/// Simple close-to-close returns
pub fn compute_returns(series: &PriceSeries) -> Result<ReturnVector> {
    series.validate()?;
    if series.len() < 2 {
        return Err(EngineError::insufficient(
            format!("price series {}", series.symbol),
            2,
            series.len(),
        ));
    }

    let closes = series.closes();
    let mut returns = Vec::with_capacity(closes.len() - 1);
    for (i, pair) in closes.windows(2).enumerate() {
        if !(pair[0] > 0.0) || !pair[1].is_finite() {
            return Err(EngineError::invalid_parameter(
                format!("price_series.{}", series.symbol),
                format!("non-positive or non-finite close at bar {}", i),
            ));
        }
        returns.push(pair[1] / pair[0] - 1.0);
    }
    Ok(returns)
}

/// Symmetric covariance over the request's asset universe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CovarianceMatrix {
    pub symbols: Vec<String>,
    pub values: Vec<Vec<f64>>,
    /// Return observations behind the estimate (0 when supplied directly)
    pub observations: usize,
    /// Rank-deficient or numerically singular; shrink before solving
    pub ill_conditioned: bool,
    #[serde(default)]
    pub shrinkage_applied: bool,
}

impl CovarianceMatrix {
    /// Wrap a caller-supplied matrix, checking shape, symmetry and diagonal
    pub fn from_values(symbols: Vec<String>, values: Vec<Vec<f64>>) -> Result<Self> {
        let n = symbols.len();
        if values.len() != n || values.iter().any(|row| row.len() != n) {
            return Err(EngineError::invalid_parameter(
                "covariance",
                format!("expected a {}x{} matrix", n, n),
            ));
        }
        for i in 0..n {
            if !(values[i][i] >= 0.0) {
                return Err(EngineError::invalid_parameter(
                    "covariance",
                    format!("negative or non-finite variance for asset {}", symbols[i]),
                ));
            }
            for j in 0..n {
                let (a, b) = (values[i][j], values[j][i]);
                if !a.is_finite() {
                    return Err(EngineError::invalid_parameter(
                        "covariance",
                        format!("non-finite entry at ({}, {})", i, j),
                    ));
                }
                if (a - b).abs() > 1e-9 * (1.0 + a.abs().max(b.abs())) {
                    return Err(EngineError::invalid_parameter(
                        "covariance",
                        format!("matrix is not symmetric at ({}, {})", i, j),
                    ));
                }
            }
        }
        let ill_conditioned = !is_positive_definite(&values);
        Ok(Self {
            symbols,
            values,
            observations: 0,
            ill_conditioned,
            shrinkage_applied: false,
        })
    }

    pub fn dim(&self) -> usize {
        self.symbols.len()
    }

    pub fn volatilities(&self) -> Vec<f64> {
        (0..self.dim()).map(|i| self.values[i][i].max(0.0).sqrt()).collect()
    }

    /// Correlation matrix; zero-variance assets correlate only with themselves
    pub fn correlation(&self) -> Vec<Vec<f64>> {
        let n = self.dim();
        let vols = self.volatilities();
        let mut corr = vec![vec![0.0; n]; n];
        for i in 0..n {
            for j in 0..n {
                if vols[i] > 0.0 && vols[j] > 0.0 {
                    corr[i][j] = self.values[i][j] / (vols[i] * vols[j]);
                } else if i == j {
                    corr[i][j] = 1.0;
                }
            }
        }
        corr
    }

    /// wᵀΣw, clamped at zero
    pub fn portfolio_variance(&self, weights: &[f64]) -> f64 {
        let n = weights.len().min(self.dim());
        let mut variance = 0.0;
        for i in 0..n {
            for j in 0..n {
                variance += weights[i] * weights[j] * self.values[i][j];
            }
        }
        variance.max(0.0)
    }

    /// Shrink toward a constant-variance diagonal target
    ///
    /// `Σ' = (1 - δ)Σ + δ·mean(diag)·I`, with the diagonal floored at
    /// `variance_floor` so the result is positive definite.
    pub fn shrink(&self, intensity: f64, variance_floor: f64) -> CovarianceMatrix {
        let n = self.dim();
        let delta = intensity.clamp(0.0, 1.0);
        let floor = variance_floor.max(f64::MIN_POSITIVE);
        let mean_variance = if n > 0 {
            (0..n).map(|i| self.values[i][i]).sum::<f64>() / n as f64
        } else {
            0.0
        };
        let target = mean_variance.max(floor);

        let mut values = vec![vec![0.0; n]; n];
        for i in 0..n {
            for j in 0..n {
                values[i][j] = (1.0 - delta) * self.values[i][j];
            }
            values[i][i] = (values[i][i] + delta * target).max(floor);
        }

        tracing::debug!(
            assets = n,
            intensity = delta,
            target_variance = target,
            "Applied diagonal covariance shrinkage"
        );

        CovarianceMatrix {
            symbols: self.symbols.clone(),
            values,
            observations: self.observations,
            ill_conditioned: false,
            shrinkage_applied: true,
        }
    }
}

/// Cholesky pivot test
pub fn is_positive_definite(values: &[Vec<f64>]) -> bool {
    let n = values.len();
    if n == 0 {
        return false;
    }
    let scale = (0..n).map(|i| values[i][i].abs()).fold(0.0, f64::max);
    if scale <= 0.0 {
        return false;
    }

    let mut l = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in 0..=i {
            let mut sum = values[i][j];
            for k in 0..j {
                sum -= l[i][k] * l[j][k];
            }
            if i == j {
                if sum <= PIVOT_TOLERANCE * scale {
                    return false;
                }
                l[i][j] = sum.sqrt();
            } else {
                l[i][j] = sum / l[j][j];
            }
        }
    }
    true
}

fn validate_returns(returns_by_asset: &BTreeMap<String, ReturnVector>) -> Result<usize> {
    if returns_by_asset.is_empty() {
        return Err(EngineError::invalid_parameter(
            "returns_by_asset",
            "at least one asset is required",
        ));
    }
    let mut observations: Option<usize> = None;
    for (symbol, returns) in returns_by_asset {
        if let Some(n) = observations {
            if returns.len() != n {
                return Err(EngineError::invalid_parameter(
                    format!("returns.{}", symbol),
                    format!("expected {} observations like other assets, got {}", n, returns.len()),
                ));
            }
        }
        if returns.iter().any(|r| !r.is_finite()) {
            return Err(EngineError::invalid_parameter(
                format!("returns.{}", symbol),
                "returns must be finite",
            ));
        }
        observations = Some(returns.len());
    }
    Ok(observations.unwrap_or(0))
}

/// Sample covariance with Bessel's correction
///
/// A single observation is accepted: every deviation is zero, the matrix is
/// flagged `ill_conditioned`, and the optimizer shrinks it.
pub fn compute_covariance(returns_by_asset: &BTreeMap<String, ReturnVector>) -> Result<CovarianceMatrix> {
    let observations = validate_returns(returns_by_asset)?;
    if observations == 0 {
        return Err(EngineError::insufficient("covariance", 1, 0));
    }

    let symbols: Vec<String> = returns_by_asset.keys().cloned().collect();
    let series: Vec<&ReturnVector> = returns_by_asset.values().collect();
    let n_assets = symbols.len();

    let means: Vec<f64> = series
        .iter()
        .map(|r| r.iter().sum::<f64>() / observations as f64)
        .collect();

    let mut values = vec![vec![0.0; n_assets]; n_assets];
    for t in 0..observations {
        for i in 0..n_assets {
            let dev_i = series[i][t] - means[i];
            for j in i..n_assets {
                values[i][j] += dev_i * (series[j][t] - means[j]);
            }
        }
    }

    let divisor = observations.saturating_sub(1).max(1) as f64;
    for i in 0..n_assets {
        for j in i..n_assets {
            let v = values[i][j] / divisor;
            values[i][j] = v;
            values[j][i] = v;
        }
    }

    let rank_deficient = observations < n_assets;
    let ill_conditioned = rank_deficient || !is_positive_definite(&values);
    if ill_conditioned {
        tracing::debug!(
            assets = n_assets,
            observations,
            "Covariance matrix is ill-conditioned"
        );
    }

    Ok(CovarianceMatrix {
        symbols,
        values,
        observations,
        ill_conditioned,
        shrinkage_applied: false,
    })
}

/// How expected returns are estimated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpectedReturnMethod {
    HistoricalMean,
    ExponentialWeighted,
    CapmImplied,
}

impl Default for ExpectedReturnMethod {
    fn default() -> Self {
        ExpectedReturnMethod::HistoricalMean
    }
}

impl FromStr for ExpectedReturnMethod {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "historical_mean" => Ok(ExpectedReturnMethod::HistoricalMean),
            "exponential_weighted" => Ok(ExpectedReturnMethod::ExponentialWeighted),
            "capm_implied" => Ok(ExpectedReturnMethod::CapmImplied),
            other => Err(EngineError::invalid_parameter(
                "expected_return_method",
                format!(
                    "unknown method `{}` (expected historical_mean, exponential_weighted or capm_implied)",
                    other
                ),
            )),
        }
    }
}

/// Per-asset expected period return
pub fn compute_expected_returns(
    returns_by_asset: &BTreeMap<String, ReturnVector>,
    method: ExpectedReturnMethod,
    config: &StatisticsConfig,
) -> Result<BTreeMap<String, f64>> {
    let observations = validate_returns(returns_by_asset)?;
    let required = match method {
        ExpectedReturnMethod::HistoricalMean => 1,
        ExpectedReturnMethod::ExponentialWeighted | ExpectedReturnMethod::CapmImplied => 2,
    };
    if observations < required {
        return Err(EngineError::insufficient(
            format!("expected returns ({:?})", method),
            required,
            observations,
        ));
    }

    match method {
        ExpectedReturnMethod::HistoricalMean => Ok(returns_by_asset
            .iter()
            .map(|(s, r)| (s.clone(), mean(r)))
            .collect()),
        ExpectedReturnMethod::ExponentialWeighted => {
            if !(config.ewma_half_life > 0.0) {
                return Err(EngineError::invalid_parameter(
                    "ewma_half_life",
                    "half-life must be positive",
                ));
            }
            let weights: Vec<f64> = (0..observations)
                .map(|t| 0.5_f64.powf((observations - 1 - t) as f64 / config.ewma_half_life))
                .collect();
            let total: f64 = weights.iter().sum();
            Ok(returns_by_asset
                .iter()
                .map(|(s, r)| {
                    let weighted: f64 = r.iter().zip(&weights).map(|(x, w)| x * w).sum();
                    (s.clone(), weighted / total)
                })
                .collect())
        }
        ExpectedReturnMethod::CapmImplied => {
            let n_assets = returns_by_asset.len() as f64;
            let market: Vec<f64> = (0..observations)
                .map(|t| returns_by_asset.values().map(|r| r[t]).sum::<f64>() / n_assets)
                .collect();
            let market_mean = mean(&market);
            let market_var = sample_covariance(&market, &market);
            let rf = config.risk_free_rate;

            Ok(returns_by_asset
                .iter()
                .map(|(s, r)| {
                    let beta = if market_var > 0.0 {
                        sample_covariance(r, &market) / market_var
                    } else {
                        1.0
                    };
                    (s.clone(), rf + beta * (market_mean - rf))
                })
                .collect())
        }
    }
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Bessel-corrected covariance of two equal-length samples
pub fn sample_covariance(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().min(b.len());
    if n < 2 {
        return 0.0;
    }
    let (ma, mb) = (mean(&a[..n]), mean(&b[..n]));
    a[..n]
        .iter()
        .zip(&b[..n])
        .map(|(x, y)| (x - ma) * (y - mb))
        .sum::<f64>()
        / (n - 1) as f64
}

/// Pearson correlation; `None` when either sample has no variance
pub fn correlation(a: &[f64], b: &[f64]) -> Option<f64> {
    let n = a.len().min(b.len());
    if n < 2 {
        return None;
    }
    let (ma, mb) = (mean(&a[..n]), mean(&b[..n]));
    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for i in 0..n {
        let da = a[i] - ma;
        let db = b[i] - mb;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }
    if var_a <= 0.0 || var_b <= 0.0 {
        return None;
    }
    Some((cov / (var_a * var_b).sqrt()).clamp(-1.0, 1.0))
}
