//! # Engine
//!
//! One request in, one answer out. [`Engine::optimize`] runs the full
//! pipeline:
//!
//! ```text
//! price history → returns → covariance, expected returns
//! trades, snapshots, market → bias scores ─┐
//! sentiment signals → summaries ───────────┴→ constraints → optimizer → rationale
//! ```
//!
//! The engine holds only its configuration and shares nothing between
//! requests, so one instance serves any number of threads.

#[cfg(test)]
mod tests;

use crate::bias::{self, BiasKind, BiasScoreSet, MarketContext};
use crate::config::Config;
use crate::constraints::{self, ConstraintDerivation, ConstraintOverrides};
use crate::error::{EngineError, Result};
use crate::portfolio::{OptimizationMethod, OptimizerSettings, PortfolioOptimizer};
use crate::rationale;
use crate::sentiment::{self, SentimentSignal, SentimentSummary};
use crate::statistics::{
    self, CovarianceMatrix, ExpectedReturnMethod, PerformanceSummary, ReturnVector,
};
use crate::types::{PortfolioSnapshot, PortfolioState, PriceBar, PriceSeries, TimedReturn, Trade};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

fn default_method() -> String {
    OptimizationMethod::default().as_str().to_string()
}

/// Sentiment for one asset, raw or already aggregated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SentimentInput {
    Summary(SentimentSummary),
    Signals(Vec<SentimentSignal>),
}

/// Portfolio optimization request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizationRequest {
    #[serde(default)]
    pub portfolio_id: String,
    pub assets: Vec<String>,
    /// `behavioral_mvo`, `risk_parity` or `black_litterman`
    #[serde(default = "default_method")]
    pub method: String,
    /// Explicit limits; they win over anything derived from biases
    #[serde(default)]
    pub constraints: Option<ConstraintOverrides>,
    /// Empty means starting from cash
    #[serde(default)]
    pub current_weights: PortfolioState,
    #[serde(default)]
    pub price_history: BTreeMap<String, Vec<PriceBar>>,
    /// Period returns, used for assets without price history
    #[serde(default)]
    pub returns: BTreeMap<String, ReturnVector>,
    /// Skip estimation and use these per-period expected returns
    #[serde(default)]
    pub expected_returns: Option<BTreeMap<String, f64>>,
    /// Covariance rows and columns in `assets` order
    #[serde(default)]
    pub covariance: Option<Vec<Vec<f64>>>,
    #[serde(default, alias = "trades")]
    pub trade_history: Vec<Trade>,
    #[serde(default)]
    pub portfolio_history: Vec<PortfolioSnapshot>,
    #[serde(default)]
    pub benchmark_returns: Vec<TimedReturn>,
    #[serde(default)]
    pub sentiment: BTreeMap<String, SentimentInput>,
    /// Precomputed bias scores; skips scoring when present
    #[serde(default)]
    pub bias_scores: Option<BTreeMap<BiasKind, f64>>,
    #[serde(default)]
    pub expected_return_method: Option<String>,
    #[serde(default)]
    pub risk_aversion: Option<f64>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Reference time for sentiment decay; defaults to the latest input timestamp
    #[serde(default)]
    pub as_of: Option<DateTime<Utc>>,
}

/// Optimization answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationResult {
    pub portfolio_id: String,
    pub method: String,
    pub recommended_weights: PortfolioState,
    pub expected_return: f64,
    pub expected_risk: f64,
    pub sharpe_ratio: Option<f64>,
    pub rationale: String,
    pub constraint_activations: Vec<String>,
    pub turnover: f64,
    /// `None` when starting from cash
    pub turnover_limit: Option<f64>,
    pub effective_n: f64,
    pub risk_contributions: BTreeMap<String, f64>,
    pub iterations: usize,
    pub kkt_residual: f64,
    pub derivations: Vec<ConstraintDerivation>,
}

/// Bias analysis request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BiasAnalysisRequest {
    #[serde(default)]
    pub user_id: String,
    #[serde(default, alias = "trades")]
    pub trade_history: Vec<Trade>,
    #[serde(default)]
    pub portfolio_history: Vec<PortfolioSnapshot>,
    #[serde(default)]
    pub benchmark_returns: Vec<TimedReturn>,
    #[serde(default)]
    pub price_history: BTreeMap<String, Vec<PriceBar>>,
    #[serde(default)]
    pub sentiment: BTreeMap<String, Vec<SentimentSignal>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiasAnalysis {
    pub user_id: String,
    #[serde(flatten)]
    pub scores: BiasScoreSet,
}

/// Sentiment aggregation request for one symbol
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SentimentRequest {
    pub symbol: String,
    #[serde(default)]
    pub signals: Vec<SentimentSignal>,
    /// Defaults to the newest signal
    #[serde(default)]
    pub as_of: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentimentReport {
    pub symbol: String,
    #[serde(flatten)]
    pub summary: SentimentSummary,
}

/// Backtest of a return series, or of fixed weights rebalanced every period
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BacktestRequest {
    #[serde(default)]
    pub returns: Vec<f64>,
    #[serde(default)]
    pub weights: Option<PortfolioState>,
    #[serde(default)]
    pub price_history: BTreeMap<String, Vec<PriceBar>>,
    /// Annual
    #[serde(default)]
    pub risk_free_rate: Option<f64>,
    #[serde(default)]
    pub periods_per_year: Option<u32>,
}

/// Stateless request processor
#[derive(Debug, Clone, Default)]
pub struct Engine {
    config: Config,
}

impl Engine {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run the full optimization pipeline
    pub fn optimize(&self, request: &OptimizationRequest) -> Result<OptimizationResult> {
        let method: OptimizationMethod = request.method.parse()?;
        let assets = universe(&request.assets)?;

        let price_series = price_series(&request.price_history)?;
        let covariance = self.covariance(request, &assets, &price_series)?;
        let expected_returns = self.expected_returns(request, &assets, &price_series)?;

        let as_of = request.as_of.or_else(|| latest_timestamp(request));
        let (summaries, raw_signals) = self.sentiment_summaries(&request.sentiment, as_of)?;

        let bias_scores = match &request.bias_scores {
            Some(values) => BiasScoreSet::from_values(values, self.config.bias.event_threshold)?,
            None => {
                let market = MarketContext {
                    benchmark_returns: request.benchmark_returns.clone(),
                    prices: price_series.clone(),
                    sentiment: raw_signals,
                };
                bias::score_biases(
                    &request.trade_history,
                    &request.portfolio_history,
                    &market,
                    &self.config.bias,
                )?
            }
        };

        let overrides = request.constraints.clone().unwrap_or_default();
        let constraints = constraints::build_constraints(
            &bias_scores,
            &summaries,
            &request.current_weights,
            &assets,
            &overrides,
            &self.config.constraints,
        )?;

        let mut settings = OptimizerSettings::from_config(&self.config.optimizer, &self.config.statistics);
        if let Some(risk_aversion) = request.risk_aversion {
            settings.risk_aversion = risk_aversion;
        }
        if let Some(timeout_ms) = request.timeout_ms {
            settings.timeout = Some(Duration::from_millis(timeout_ms));
        }

        let portfolio = PortfolioOptimizer::new(&expected_returns, covariance, settings)?
            .with_current(request.current_weights.clone())
            .with_constraints(constraints.clone())
            .with_sentiment(summaries)
            .optimize(method)?;

        let rationale = rationale::explain(
            &bias_scores,
            &constraints,
            &portfolio,
            self.config.constraints.bias_threshold,
        );

        tracing::info!(
            portfolio_id = %request.portfolio_id,
            method = method.as_str(),
            assets = assets.len(),
            activations = portfolio.constraint_activations.len(),
            "Optimization request complete"
        );

        Ok(OptimizationResult {
            portfolio_id: request.portfolio_id.clone(),
            method: method.as_str().to_string(),
            recommended_weights: PortfolioState::new(portfolio.weights),
            expected_return: portfolio.expected_return,
            expected_risk: portfolio.expected_risk,
            sharpe_ratio: portfolio.sharpe_ratio,
            rationale,
            constraint_activations: portfolio.constraint_activations,
            turnover: portfolio.turnover,
            turnover_limit: portfolio.turnover_limit,
            effective_n: portfolio.effective_n,
            risk_contributions: portfolio.risk_contributions,
            iterations: portfolio.iterations,
            kkt_residual: portfolio.kkt_residual,
            derivations: constraints.derivations,
        })
    }

    /// Score biases from trading history
    pub fn analyze_biases(&self, request: &BiasAnalysisRequest) -> Result<BiasAnalysis> {
        let market = MarketContext {
            benchmark_returns: request.benchmark_returns.clone(),
            prices: price_series(&request.price_history)?,
            sentiment: request.sentiment.clone(),
        };
        let scores = bias::score_biases(
            &request.trade_history,
            &request.portfolio_history,
            &market,
            &self.config.bias,
        )?;
        Ok(BiasAnalysis {
            user_id: request.user_id.clone(),
            scores,
        })
    }

    /// Aggregate one symbol's signals
    pub fn aggregate_sentiment(&self, request: &SentimentRequest) -> Result<SentimentReport> {
        let as_of = request
            .as_of
            .or_else(|| request.signals.iter().map(|s| s.timestamp).max());
        let summary = match as_of {
            Some(as_of) => sentiment::aggregate_sentiment(&request.signals, as_of, &self.config.sentiment)?,
            None => SentimentSummary::neutral(),
        };
        Ok(SentimentReport {
            symbol: request.symbol.clone(),
            summary,
        })
    }

    /// Performance summary of a return series or a fixed-weight portfolio
    pub fn backtest(&self, request: &BacktestRequest) -> Result<PerformanceSummary> {
        let periods_per_year = request
            .periods_per_year
            .unwrap_or(self.config.statistics.periods_per_year);
        let risk_free_rate = request
            .risk_free_rate
            .unwrap_or(self.config.statistics.risk_free_rate * periods_per_year as f64);

        let returns = match &request.weights {
            Some(weights) => portfolio_returns(weights, &request.price_history)?,
            None => request.returns.clone(),
        };

        let summary = statistics::performance_summary(&returns, risk_free_rate, periods_per_year)?;
        tracing::info!(
            periods = summary.periods,
            total_return = summary.total_return,
            max_drawdown = summary.max_drawdown,
            "Backtest complete"
        );
        Ok(summary)
    }

    fn covariance(
        &self,
        request: &OptimizationRequest,
        assets: &[String],
        prices: &BTreeMap<String, PriceSeries>,
    ) -> Result<CovarianceMatrix> {
        match &request.covariance {
            Some(values) => {
                // rows arrive in request order, the optimizer works in sorted order
                let order = request_order(&request.assets, assets)?;
                if values.len() != order.len() || values.iter().any(|row| row.len() != order.len()) {
                    return Err(EngineError::invalid_parameter(
                        "covariance",
                        format!("expected a {}x{} matrix", order.len(), order.len()),
                    ));
                }
                let sorted: Vec<Vec<f64>> = order
                    .iter()
                    .map(|&i| order.iter().map(|&j| values[i][j]).collect())
                    .collect();
                CovarianceMatrix::from_values(assets.to_vec(), sorted)
            }
            None => statistics::compute_covariance(&asset_returns(request, assets, prices)?),
        }
    }

    fn expected_returns(
        &self,
        request: &OptimizationRequest,
        assets: &[String],
        prices: &BTreeMap<String, PriceSeries>,
    ) -> Result<BTreeMap<String, f64>> {
        if let Some(supplied) = &request.expected_returns {
            return Ok(supplied.clone());
        }
        let method: ExpectedReturnMethod = match &request.expected_return_method {
            Some(name) => name.parse()?,
            None => ExpectedReturnMethod::default(),
        };
        statistics::compute_expected_returns(
            &asset_returns(request, assets, prices)?,
            method,
            &self.config.statistics,
        )
    }

    /// Summaries for the optimizer and constraint builder, raw signals for bias scoring
    fn sentiment_summaries(
        &self,
        inputs: &BTreeMap<String, SentimentInput>,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<(
        BTreeMap<String, SentimentSummary>,
        BTreeMap<String, Vec<SentimentSignal>>,
    )> {
        let mut summaries = BTreeMap::new();
        let mut raw = BTreeMap::new();
        for (symbol, input) in inputs {
            let summary = match input {
                SentimentInput::Summary(summary) => {
                    summary.validate()?;
                    summary.clone()
                }
                SentimentInput::Signals(signals) => {
                    raw.insert(symbol.clone(), signals.clone());
                    match as_of {
                        Some(as_of) => {
                            sentiment::aggregate_sentiment(signals, as_of, &self.config.sentiment)?
                        }
                        None => SentimentSummary::neutral(),
                    }
                }
            };
            summaries.insert(symbol.clone(), summary);
        }
        Ok((summaries, raw))
    }
}

/// Sorted, de-duplicated asset universe
fn universe(assets: &[String]) -> Result<Vec<String>> {
    if assets.is_empty() {
        return Err(EngineError::invalid_parameter("assets", "at least one asset is required"));
    }
    let unique: BTreeSet<&String> = assets.iter().collect();
    if unique.len() != assets.len() {
        return Err(EngineError::invalid_parameter("assets", "duplicate asset symbols"));
    }
    if let Some(blank) = assets.iter().find(|s| s.trim().is_empty()) {
        return Err(EngineError::invalid_parameter(
            "assets",
            format!("invalid symbol `{}`", blank),
        ));
    }
    Ok(unique.into_iter().cloned().collect())
}

/// Index into the request's asset list for each sorted symbol
fn request_order(requested: &[String], sorted: &[String]) -> Result<Vec<usize>> {
    sorted
        .iter()
        .map(|symbol| {
            requested.iter().position(|s| s == symbol).ok_or_else(|| {
                EngineError::invalid_parameter("assets", format!("unknown symbol {}", symbol))
            })
        })
        .collect()
}

fn price_series(history: &BTreeMap<String, Vec<PriceBar>>) -> Result<BTreeMap<String, PriceSeries>> {
    history
        .iter()
        .map(|(symbol, bars)| {
            PriceSeries::new(symbol.clone(), bars.clone()).map(|series| (symbol.clone(), series))
        })
        .collect()
}

/// Return vectors for every asset, from prices first, then supplied returns
fn asset_returns(
    request: &OptimizationRequest,
    assets: &[String],
    prices: &BTreeMap<String, PriceSeries>,
) -> Result<BTreeMap<String, ReturnVector>> {
    let mut returns = BTreeMap::new();
    for symbol in assets {
        let series = match (prices.get(symbol), request.returns.get(symbol)) {
            (Some(series), _) => statistics::compute_returns(series)?,
            (None, Some(supplied)) => supplied.clone(),
            (None, None) => {
                return Err(EngineError::insufficient(
                    format!("price history for {}", symbol),
                    2,
                    0,
                ))
            }
        };
        returns.insert(symbol.clone(), series);
    }
    Ok(returns)
}

/// Newest timestamp anywhere in the request
fn latest_timestamp(request: &OptimizationRequest) -> Option<DateTime<Utc>> {
    let trades = request.trade_history.iter().map(|t| t.timestamp);
    let snapshots = request.portfolio_history.iter().map(|s| s.timestamp);
    let benchmark = request.benchmark_returns.iter().map(|b| b.timestamp);
    let bars = request
        .price_history
        .values()
        .filter_map(|bars| bars.last().map(|b| b.timestamp));
    let signals = request.sentiment.values().flat_map(|input| match input {
        SentimentInput::Signals(signals) => signals.iter().map(|s| s.timestamp).max(),
        SentimentInput::Summary(_) => None,
    });
    trades
        .chain(snapshots)
        .chain(benchmark)
        .chain(bars)
        .chain(signals)
        .max()
}

/// Per-period returns of `weights`, rebalanced every period
fn portfolio_returns(
    weights: &PortfolioState,
    history: &BTreeMap<String, Vec<PriceBar>>,
) -> Result<Vec<f64>> {
    weights.validate(false)?;
    let mut by_asset = Vec::with_capacity(weights.weights.len());
    for (symbol, weight) in &weights.weights {
        let bars = history.get(symbol).ok_or_else(|| {
            EngineError::insufficient(format!("price history for {}", symbol), 2, 0)
        })?;
        let series = PriceSeries::new(symbol.clone(), bars.clone())?;
        by_asset.push((symbol, *weight, statistics::compute_returns(&series)?));
    }

    let periods = by_asset.first().map(|(_, _, r)| r.len()).unwrap_or(0);
    if let Some((symbol, _, r)) = by_asset.iter().find(|(_, _, r)| r.len() != periods) {
        return Err(EngineError::invalid_parameter(
            format!("price_history.{}", symbol),
            format!("{} returns where {} were expected", r.len(), periods),
        ));
    }

    Ok((0..periods)
        .map(|t| by_asset.iter().map(|(_, w, r)| w * r[t]).sum())
        .collect())
}
