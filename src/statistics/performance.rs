//! Performance summary for a return series (simple backtest metrics)

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub periods: usize,
    pub total_return: f64,
    pub annual_return: f64,
    /// Annualized population standard deviation
    pub volatility: f64,
    pub sharpe_ratio: Option<f64>,
    pub sortino_ratio: Option<f64>,
    /// Worst peak-to-trough decline, as a non-positive fraction
    pub max_drawdown: f64,
}

/// Summarize per-period returns
///
/// `risk_free_rate` is annual; `periods_per_year` annualizes return and risk.
pub fn performance_summary(
    returns: &[f64],
    risk_free_rate: f64,
    periods_per_year: u32,
) -> Result<PerformanceSummary> {
    if returns.is_empty() {
        return Err(EngineError::insufficient("performance summary", 1, 0));
    }
    if periods_per_year == 0 {
        return Err(EngineError::invalid_parameter(
            "periods_per_year",
            "must be positive",
        ));
    }
    if returns.iter().any(|r| !r.is_finite() || *r <= -1.0) {
        return Err(EngineError::invalid_parameter(
            "returns",
            "returns must be finite and greater than -100%",
        ));
    }

    let n = returns.len() as f64;
    let ppy = periods_per_year as f64;

    let mut growth = 1.0;
    let mut peak = 1.0;
    let mut max_drawdown: f64 = 0.0;
    for r in returns {
        growth *= 1.0 + r;
        peak = f64::max(peak, growth);
        max_drawdown = max_drawdown.min((growth - peak) / peak);
    }
    let total_return = growth - 1.0;
    let annual_return = growth.powf(ppy / n) - 1.0;

    let mean = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
    let volatility = variance.sqrt() * ppy.sqrt();

    let downside = (returns.iter().map(|r| r.min(0.0).powi(2)).sum::<f64>() / n).sqrt() * ppy.sqrt();

    let excess = annual_return - risk_free_rate;
    let sharpe_ratio = if volatility > 0.0 {
        Some(excess / volatility)
    } else {
        None
    };
    let sortino_ratio = if downside > 0.0 {
        Some(excess / downside)
    } else {
        None
    };

    Ok(PerformanceSummary {
        periods: returns.len(),
        total_return,
        annual_return,
        volatility,
        sharpe_ratio,
        sortino_ratio,
        max_drawdown,
    })
}
