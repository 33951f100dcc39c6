//! Core request-scoped value types

use crate::error::{EngineError, Result};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Trade direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// +1 for buys, -1 for sells
    pub fn direction(&self) -> f64 {
        match self {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        }
    }
}

/// One OHLCV observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    #[serde(default)]
    pub volume: Decimal,
}

/// Ordered price history for one asset
///
/// Timestamps are strictly increasing. Deserialized series are unchecked
/// until [`PriceSeries::validate`] runs, which the engine does before use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceSeries {
    pub symbol: String,
    pub bars: Vec<PriceBar>,
}

impl PriceSeries {
    pub fn new(symbol: impl Into<String>, bars: Vec<PriceBar>) -> Result<Self> {
        let series = Self {
            symbol: symbol.into(),
            bars,
        };
        series.validate()?;
        Ok(series)
    }

    /// Check timestamp ordering
    pub fn validate(&self) -> Result<()> {
        for pair in self.bars.windows(2) {
            if pair[1].timestamp <= pair[0].timestamp {
                return Err(EngineError::invalid_parameter(
                    format!("price_series.{}", self.symbol),
                    format!(
                        "timestamps must be strictly increasing ({} follows {})",
                        pair[1].timestamp, pair[0].timestamp
                    ),
                ));
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    /// Closing prices as f64
    pub fn closes(&self) -> Vec<f64> {
        self.bars.iter().map(|b| decimal_to_f64(b.close)).collect()
    }

    /// Latest bar at or before `at`
    pub fn bar_at_or_before(&self, at: DateTime<Utc>) -> Option<&PriceBar> {
        let idx = self.bars.partition_point(|b| b.timestamp <= at);
        if idx == 0 {
            None
        } else {
            self.bars.get(idx - 1)
        }
    }

    /// Close of the latest bar at or before `at`
    pub fn close_at_or_before(&self, at: DateTime<Utc>) -> Option<f64> {
        self.bar_at_or_before(at).map(|b| decimal_to_f64(b.close))
    }

    /// Simple return over `lookback` bars ending at the latest bar before `at`
    pub fn trailing_return(&self, at: DateTime<Utc>, lookback: usize) -> Option<f64> {
        let end = self.bars.partition_point(|b| b.timestamp <= at);
        if end == 0 || lookback == 0 || end <= lookback {
            return None;
        }
        let last = decimal_to_f64(self.bars[end - 1].close);
        let first = decimal_to_f64(self.bars[end - 1 - lookback].close);
        if first <= 0.0 {
            return None;
        }
        Some(last / first - 1.0)
    }

    /// Highest high and lowest low over bars in `[from, to]`
    pub fn range_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Option<(f64, f64)> {
        let mut high: Option<f64> = None;
        let mut low: Option<f64> = None;
        for bar in self.bars.iter().filter(|b| b.timestamp >= from && b.timestamp <= to) {
            let h = decimal_to_f64(bar.high);
            let l = decimal_to_f64(bar.low);
            high = Some(high.map_or(h, |v| v.max(h)));
            low = Some(low.map_or(l, |v| v.min(l)));
        }
        match (high, low) {
            (Some(h), Some(l)) => Some((h, l)),
            _ => None,
        }
    }
}

/// A single executed trade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub symbol: String,
    #[serde(alias = "action")]
    pub side: Side,
    pub quantity: Decimal,
    pub price: Decimal,
    #[serde(alias = "trade_date")]
    pub timestamp: DateTime<Utc>,
}

/// Portfolio weights at one point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub timestamp: DateTime<Utc>,
    pub weights: BTreeMap<String, f64>,
}

/// A timestamped period return (benchmark or market flow proxy)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimedReturn {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// Symbol -> weight
///
/// Long-only and fully invested unless the request allows shorting.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortfolioState {
    pub weights: BTreeMap<String, f64>,
}

/// Tolerance for the budget invariant
pub const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

impl PortfolioState {
    pub fn new(weights: BTreeMap<String, f64>) -> Self {
        Self { weights }
    }

    /// Equal weights over `symbols`
    pub fn equal_weight(symbols: &[String]) -> Self {
        let n = symbols.len().max(1) as f64;
        Self {
            weights: symbols.iter().map(|s| (s.clone(), 1.0 / n)).collect(),
        }
    }

    pub fn weight(&self, symbol: &str) -> f64 {
        self.weights.get(symbol).copied().unwrap_or(0.0)
    }

    pub fn total(&self) -> f64 {
        self.weights.values().sum()
    }

    /// Weights in the order of `symbols`; missing symbols are 0
    pub fn aligned(&self, symbols: &[String]) -> Vec<f64> {
        symbols.iter().map(|s| self.weight(s)).collect()
    }

    /// Validate the budget and sign invariants
    pub fn validate(&self, allow_short: bool) -> Result<()> {
        for (symbol, w) in &self.weights {
            if !w.is_finite() {
                return Err(EngineError::invalid_parameter(
                    format!("current_weights.{}", symbol),
                    "weight must be finite",
                ));
            }
            if !allow_short && *w < -WEIGHT_SUM_TOLERANCE {
                return Err(EngineError::invalid_parameter(
                    format!("current_weights.{}", symbol),
                    format!("negative weight {} without short selling", w),
                ));
            }
        }
        let total = self.total();
        if (total - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(EngineError::invalid_parameter(
                "current_weights",
                format!("weights must sum to 1, got {}", total),
            ));
        }
        Ok(())
    }

    /// L1 distance to another allocation over the union of symbols
    pub fn turnover_to(&self, other: &PortfolioState) -> f64 {
        let mut symbols: Vec<&String> = self.weights.keys().chain(other.weights.keys()).collect();
        symbols.sort();
        symbols.dedup();
        symbols
            .into_iter()
            .map(|s| (self.weight(s) - other.weight(s)).abs())
            .sum()
    }
}

/// Lossy Decimal -> f64 used at the numeric boundary
pub fn decimal_to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}
