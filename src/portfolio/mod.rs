//! # Portfolio Optimization
//!
//! Behavioral mean-variance optimization:
//!
//! ```text
//! maximize  wᵀμ' - λ wᵀΣw - γ‖w - w₀‖² - β‖w - 1/n‖²
//! s.t.      Σw = 1,  lo ≤ wᵢ ≤ hiᵢ,  ‖w - w₀‖₁ ≤ T,  √(wᵀΣw) ≤ σ*
//! ```
//!
//! `μ'` is μ shrunk toward its cross-sectional mean, `γ` the behavioral
//! penalty and `β` the diversification penalty from the constraint builder.
//! With a loss-aversion coefficient `κ`, `μ'` is further passed through the
//! prospect-theory value function around its mean (`x^0.88` on gains,
//! `-κ(-x)^0.88` on losses) and the diagonal of `Σ` is scaled by the
//! perceived-risk multiplier. Reported risk and return use the measured
//! inputs.
//! Methods:
//! - Behavioral MVO (the program above)
//! - Risk Parity (pull toward equal risk contribution, same constraints)
//! - Black-Litterman (sentiment views on equilibrium returns, then MVO)
//!
//! ```rust,ignore
//! use behavioral_optimizer::portfolio::{PortfolioOptimizer, OptimizationMethod};
//!
//! let optimizer = PortfolioOptimizer::new(&expected_returns, covariance, settings)?
//!     .with_current(current)
//!     .with_constraints(constraints);
//! let portfolio = optimizer.optimize(OptimizationMethod::BehavioralMvo)?;
//! ```

pub mod black_litterman;
pub mod feasibility;
pub mod risk_parity;
pub mod solver;


pub use black_litterman::{BlackLitterman, View};
pub use risk_parity::{equal_risk_contribution, portfolio_volatility, risk_contributions};

use crate::config::{OptimizerConfig, StatisticsConfig};
use crate::constraints::OptimizationConstraints;
use crate::error::{ConstraintConflict, ConstraintKind, EngineError, Result};
use crate::sentiment::SentimentSummary;
use crate::statistics::CovarianceMatrix;
use crate::types::{PortfolioState, WEIGHT_SUM_TOLERANCE};
use serde::{Deserialize, Serialize};
use solver::{FeasibleSet, QuadraticObjective, Solution, SolverSettings};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::{Duration, Instant};

/// Distance from a bound at which it counts as active
const ACTIVE_TOLERANCE: f64 = 1e-7;
/// Weights this close to zero are reported as zero
const ZERO_SNAP: f64 = 1e-12;
/// Give up on a volatility target once this much extra risk aversion still misses it
const MAX_EXTRA_RISK_AVERSION: f64 = 1e10;
const TARGET_VOLATILITY_BISECTIONS: usize = 60;
/// Diminishing sensitivity of the prospect-theory value function
const PROSPECT_CURVATURE: f64 = 0.88;

/// Optimization method to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationMethod {
    /// Mean-variance with behavioral penalties
    BehavioralMvo,
    /// Equal risk contribution, constrained
    RiskParity,
    /// Sentiment views blended into equilibrium returns
    BlackLitterman,
}

impl OptimizationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptimizationMethod::BehavioralMvo => "behavioral_mvo",
            OptimizationMethod::RiskParity => "risk_parity",
            OptimizationMethod::BlackLitterman => "black_litterman",
        }
    }
}

impl Default for OptimizationMethod {
    fn default() -> Self {
        OptimizationMethod::BehavioralMvo
    }
}

impl FromStr for OptimizationMethod {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "behavioral_mvo" => Ok(OptimizationMethod::BehavioralMvo),
            "risk_parity" => Ok(OptimizationMethod::RiskParity),
            "black_litterman" => Ok(OptimizationMethod::BlackLitterman),
            other => Err(EngineError::invalid_parameter(
                "method",
                format!(
                    "unknown method `{}` (expected behavioral_mvo, risk_parity or black_litterman)",
                    other
                ),
            )),
        }
    }
}

/// Solver and model parameters for one optimization
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizerSettings {
    pub risk_aversion: f64,
    /// Per-period, same units as expected returns
    pub risk_free_rate: f64,
    pub max_iterations: usize,
    pub kkt_tolerance: f64,
    pub timeout: Option<Duration>,
    pub shrinkage_intensity: f64,
    pub variance_floor: f64,
    pub black_litterman_tau: f64,
    pub sentiment_view_scale: f64,
    pub risk_parity_strength: f64,
}

impl OptimizerSettings {
    pub fn from_config(optimizer: &OptimizerConfig, statistics: &StatisticsConfig) -> Self {
        Self {
            risk_aversion: optimizer.risk_aversion,
            risk_free_rate: optimizer.risk_free_rate,
            max_iterations: optimizer.max_iterations,
            kkt_tolerance: optimizer.kkt_tolerance,
            timeout: optimizer.timeout_ms.map(Duration::from_millis),
            shrinkage_intensity: statistics.shrinkage_intensity,
            variance_floor: statistics.variance_floor,
            black_litterman_tau: optimizer.black_litterman_tau,
            sentiment_view_scale: optimizer.sentiment_view_scale,
            risk_parity_strength: optimizer.risk_parity_strength,
        }
    }

    fn validate(&self) -> Result<()> {
        if !self.risk_aversion.is_finite() || self.risk_aversion < 0.0 {
            return Err(EngineError::invalid_parameter(
                "risk_aversion",
                format!("must be finite and non-negative, got {}", self.risk_aversion),
            ));
        }
        if !self.risk_free_rate.is_finite() {
            return Err(EngineError::invalid_parameter("risk_free_rate", "must be finite"));
        }
        if self.max_iterations == 0 {
            return Err(EngineError::invalid_parameter("max_iterations", "must be positive"));
        }
        if !(self.kkt_tolerance > 0.0) {
            return Err(EngineError::invalid_parameter("kkt_tolerance", "must be positive"));
        }
        if !self.risk_parity_strength.is_finite() || self.risk_parity_strength < 0.0 {
            return Err(EngineError::invalid_parameter(
                "risk_parity_strength",
                "must be finite and non-negative",
            ));
        }
        if !self.sentiment_view_scale.is_finite() {
            return Err(EngineError::invalid_parameter("sentiment_view_scale", "must be finite"));
        }
        Ok(())
    }
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self::from_config(&OptimizerConfig::default(), &StatisticsConfig::default())
    }
}

/// Optimized portfolio result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizedPortfolio {
    pub weights: BTreeMap<String, f64>,
    /// Per-period expected return under the model's μ
    pub expected_return: f64,
    /// Per-period volatility
    pub expected_risk: f64,
    /// `None` when the portfolio has no risk
    pub sharpe_ratio: Option<f64>,
    pub turnover: f64,
    /// Turnover limit in force; `None` when starting from cash
    #[serde(default)]
    pub turnover_limit: Option<f64>,
    /// Effective number of assets (1/sum(w^2))
    pub effective_n: f64,
    pub diversification_ratio: f64,
    pub risk_contributions: BTreeMap<String, f64>,
    /// Binding constraints and adjustments, in a fixed order
    pub constraint_activations: Vec<String>,
    pub iterations: usize,
    pub kkt_residual: f64,
}

/// Portfolio optimizer
pub struct PortfolioOptimizer {
    symbols: Vec<String>,
    expected_returns: Vec<f64>,
    covariance: CovarianceMatrix,
    current: PortfolioState,
    constraints: Option<OptimizationConstraints>,
    sentiment: BTreeMap<String, SentimentSummary>,
    settings: OptimizerSettings,
}

/// Quadratic terms shared by every solve of one request
struct Model {
    covariance: Vec<Vec<f64>>,
    linear: Vec<f64>,
    risk_aversion: f64,
    /// `(strength, target)` pulls, each adding `-s‖w - t‖²`
    anchors: Vec<(f64, Vec<f64>)>,
}

impl Model {
    fn objective(&self, extra_risk_aversion: f64) -> QuadraticObjective {
        let n = self.linear.len();
        let lambda = self.risk_aversion + extra_risk_aversion;
        let ridge: f64 = self.anchors.iter().map(|(s, _)| s).sum();

        let mut q = vec![vec![0.0; n]; n];
        for i in 0..n {
            for j in 0..n {
                q[i][j] = lambda * self.covariance[i][j];
            }
            q[i][i] += ridge;
        }
        let c = (0..n)
            .map(|i| {
                self.linear[i]
                    + self
                        .anchors
                        .iter()
                        .map(|(s, t)| 2.0 * s * t[i])
                        .sum::<f64>()
            })
            .collect();
        QuadraticObjective { q, c }
    }
}

impl PortfolioOptimizer {
    /// Create optimizer over the covariance matrix's assets
    pub fn new(
        expected_returns: &BTreeMap<String, f64>,
        covariance: CovarianceMatrix,
        settings: OptimizerSettings,
    ) -> Result<Self> {
        settings.validate()?;
        let symbols = covariance.symbols.clone();
        if symbols.is_empty() {
            return Err(EngineError::invalid_parameter("assets", "at least one asset is required"));
        }
        if covariance.values.len() != symbols.len()
            || covariance.values.iter().any(|row| row.len() != symbols.len())
        {
            return Err(EngineError::invalid_parameter(
                "covariance",
                "matrix shape does not match its symbols",
            ));
        }
        if let Some(extra) = expected_returns.keys().find(|s| !symbols.contains(s)) {
            return Err(EngineError::invalid_parameter(
                format!("expected_returns.{}", extra),
                "asset is not in the covariance matrix",
            ));
        }

        let mut mu = Vec::with_capacity(symbols.len());
        for symbol in &symbols {
            match expected_returns.get(symbol) {
                Some(r) if r.is_finite() => mu.push(*r),
                Some(r) => {
                    return Err(EngineError::invalid_parameter(
                        format!("expected_returns.{}", symbol),
                        format!("non-finite expected return {}", r),
                    ))
                }
                None => {
                    return Err(EngineError::invalid_parameter(
                        format!("expected_returns.{}", symbol),
                        "missing expected return",
                    ))
                }
            }
        }

        Ok(Self {
            symbols,
            expected_returns: mu,
            covariance,
            current: PortfolioState::default(),
            constraints: None,
            sentiment: BTreeMap::new(),
            settings,
        })
    }

    pub fn with_current(mut self, current: PortfolioState) -> Self {
        self.current = current;
        self
    }

    pub fn with_constraints(mut self, constraints: OptimizationConstraints) -> Self {
        self.constraints = Some(constraints);
        self
    }

    /// Sentiment used to form Black-Litterman views
    pub fn with_sentiment(mut self, sentiment: BTreeMap<String, SentimentSummary>) -> Self {
        self.sentiment = sentiment;
        self
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    /// Run the optimization
    pub fn optimize(&self, method: OptimizationMethod) -> Result<OptimizedPortfolio> {
        let started = Instant::now();
        let n = self.symbols.len();
        let constraints = match &self.constraints {
            Some(c) => c.clone(),
            None => OptimizationConstraints::from_config(&Default::default()),
        };
        constraints.validate()?;

        let mut activations = Vec::new();

        // Current allocation; an empty one means starting from cash
        let has_current = !self.current.weights.is_empty();
        if has_current {
            if let Some(extra) = self.current.weights.keys().find(|s| !self.symbols.contains(s)) {
                return Err(EngineError::invalid_parameter(
                    format!("current_weights.{}", extra),
                    "asset is not in the optimization universe",
                ));
            }
            self.current.validate(constraints.allow_short)?;
        }
        let anchor = if has_current {
            self.current.aligned(&self.symbols)
        } else {
            vec![0.0; n]
        };

        let covariance = if self.covariance.ill_conditioned {
            tracing::warn!(
                assets = n,
                observations = self.covariance.observations,
                intensity = self.settings.shrinkage_intensity,
                "Ill-conditioned covariance, applying shrinkage"
            );
            activations.push("covariance_shrinkage".to_string());
            self.covariance
                .shrink(self.settings.shrinkage_intensity, self.settings.variance_floor)
        } else {
            self.covariance.clone()
        };

        let set = FeasibleSet {
            lower: self
                .symbols
                .iter()
                .map(|s| constraints.lower_bound(s))
                .collect(),
            upper: self
                .symbols
                .iter()
                .map(|s| constraints.upper_bound(s))
                .collect(),
            anchor: anchor.clone(),
            max_turnover: has_current.then_some(constraints.max_turnover),
        };
        feasibility::check_feasibility(&set, &self.symbols)?;

        let model_returns = match method {
            OptimizationMethod::BlackLitterman => self.black_litterman_returns(&covariance.values, &anchor, has_current)?,
            _ => self.expected_returns.clone(),
        };

        let shrink = constraints.expected_return_shrinkage;
        let cross_mean = model_returns.iter().sum::<f64>() / n as f64;
        let shrunk_returns: Vec<f64> = model_returns
            .iter()
            .map(|r| (1.0 - shrink) * r + shrink * cross_mean)
            .collect();
        if shrink > 0.0 {
            activations.push("expected_return_shrinkage".to_string());
        }
        let behavioral = method != OptimizationMethod::RiskParity;
        let solve_returns = match constraints.loss_aversion_coefficient {
            Some(coefficient) if behavioral => {
                activations.push("prospect_theory_returns".to_string());
                prospect_values(&shrunk_returns, coefficient)
            }
            _ => shrunk_returns,
        };
        let perception = constraints.risk_perception_multiplier;
        let solve_covariance = if behavioral && perception > 1.0 {
            activations.push("risk_perception".to_string());
            perceived_covariance(&covariance.values, perception)
        } else {
            covariance.values.clone()
        };

        let mut anchors = Vec::new();
        if has_current && constraints.behavioral_penalty_weight > 0.0 {
            anchors.push((constraints.behavioral_penalty_weight, anchor.clone()));
            activations.push("behavioral_penalty".to_string());
        }
        if constraints.diversification_penalty_weight > 0.0 {
            anchors.push((constraints.diversification_penalty_weight, vec![1.0 / n as f64; n]));
            activations.push("diversification_penalty".to_string());
        }

        let model = match method {
            OptimizationMethod::RiskParity => {
                if !(self.settings.risk_parity_strength > 0.0) {
                    return Err(EngineError::invalid_parameter(
                        "risk_parity_strength",
                        "must be positive for risk parity",
                    ));
                }
                anchors.push((
                    self.settings.risk_parity_strength,
                    equal_risk_contribution(&covariance.values),
                ));
                Model {
                    covariance: covariance.values.clone(),
                    linear: vec![0.0; n],
                    risk_aversion: 0.0,
                    anchors,
                }
            }
            _ => Model {
                covariance: solve_covariance,
                linear: solve_returns,
                risk_aversion: self.settings.risk_aversion,
                anchors,
            },
        };

        let solver_settings = SolverSettings {
            max_iterations: self.settings.max_iterations,
            tolerance: self.settings.kkt_tolerance,
            started,
            deadline: self.settings.timeout.map(|t| started + t),
        };
        let start = if has_current {
            anchor.clone()
        } else {
            vec![1.0 / n as f64; n]
        };

        let mut solution = solver::solve(&model.objective(0.0), &set, &start, &solver_settings)?;

        if let Some(target) = constraints.target_volatility {
            let (constrained, extra) = self.meet_target_volatility(
                &model,
                &covariance.values,
                &set,
                solution,
                target,
                &solver_settings,
            )?;
            solution = constrained;
            if extra > 0.0 {
                activations.push("target_volatility".to_string());
            }
        }

        let weights: Vec<f64> = solution
            .weights
            .iter()
            .map(|w| if w.abs() < ZERO_SNAP { 0.0 } else { *w })
            .collect();
        let total: f64 = weights.iter().sum();
        if (total - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(EngineError::OptimizationDidNotConverge {
                iterations: solution.iterations,
                residual: (total - 1.0).abs(),
            });
        }

        for (i, symbol) in self.symbols.iter().enumerate() {
            if weights[i] >= set.upper[i] - ACTIVE_TOLERANCE && set.upper[i] < 1.0 {
                activations.push(format!("max_weight_per_asset:{}", symbol));
            } else if weights[i] <= set.lower[i] + ACTIVE_TOLERANCE {
                activations.push(format!("min_weight_per_asset:{}", symbol));
            }
        }
        let turnover = solver::l1_distance(&weights, &anchor);
        if let Some(limit) = set.max_turnover {
            if turnover >= limit - ACTIVE_TOLERANCE {
                activations.push("max_turnover".to_string());
            }
        }

        let result = self.build_result(
            weights,
            &covariance.values,
            &model_returns,
            turnover,
            set.max_turnover,
            activations,
            &solution,
        );

        tracing::info!(
            method = method.as_str(),
            assets = n,
            iterations = result.iterations,
            kkt_residual = result.kkt_residual,
            expected_return = result.expected_return,
            expected_risk = result.expected_risk,
            turnover = result.turnover,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Optimization converged"
        );
        Ok(result)
    }

    /// Raise risk aversion until measured volatility is within `target`
    ///
    /// The minimum-variance portfolio over the same feasible set is solved
    /// first; when even it misses the target the request is infeasible.
    fn meet_target_volatility(
        &self,
        model: &Model,
        measured: &[Vec<f64>],
        set: &FeasibleSet,
        solution: Solution,
        target: f64,
        settings: &SolverSettings,
    ) -> Result<(Solution, f64)> {
        let within = |w: &[f64]| portfolio_volatility(measured, w) <= target * (1.0 + 1e-9);
        if within(&solution.weights) {
            return Ok((solution, 0.0));
        }

        let minimum_variance = QuadraticObjective {
            q: measured.to_vec(),
            c: vec![0.0; measured.len()],
        };
        let floor = solver::solve(&minimum_variance, set, &solution.weights, settings)?;
        let mut iterations = solution.iterations + floor.iterations;
        if !within(&floor.weights) {
            let reached = portfolio_volatility(measured, &floor.weights);
            return Err(EngineError::InfeasibleConstraints {
                conflicts: vec![ConstraintConflict {
                    constraints: vec![ConstraintKind::TargetVolatility],
                    asset: None,
                    required: reached,
                    limit: target,
                    detail: format!(
                        "lowest volatility reachable under the other constraints is {:.6}",
                        reached
                    ),
                }],
            });
        }

        let mut lo = 0.0;
        let mut hi = model.risk_aversion.max(1.0);
        let mut best = loop {
            if hi >= MAX_EXTRA_RISK_AVERSION {
                break floor;
            }
            let candidate = solver::solve(&model.objective(hi), set, &solution.weights, settings)?;
            iterations += candidate.iterations;
            if within(&candidate.weights) {
                break candidate;
            }
            lo = hi;
            hi *= 10.0;
        };

        for _ in 0..TARGET_VOLATILITY_BISECTIONS {
            if hi - lo <= 1e-6 * hi {
                break;
            }
            let mid = 0.5 * (lo + hi);
            let candidate = solver::solve(&model.objective(mid), set, &best.weights, settings)?;
            iterations += candidate.iterations;
            if within(&candidate.weights) {
                hi = mid;
                best = candidate;
            } else {
                lo = mid;
            }
        }

        tracing::debug!(extra_risk_aversion = hi, target, "Volatility target met");
        best.iterations = iterations;
        Ok((best, hi))
    }

    /// Equilibrium returns from current (or equal) weights, with one view per asset with sentiment
    fn black_litterman_returns(
        &self,
        covariance: &[Vec<f64>],
        anchor: &[f64],
        has_current: bool,
    ) -> Result<Vec<f64>> {
        let n = self.symbols.len();
        let market_weights = if has_current {
            anchor.to_vec()
        } else {
            vec![1.0 / n as f64; n]
        };
        let model = BlackLitterman::new(
            &market_weights,
            covariance,
            self.settings.risk_aversion,
            self.settings.black_litterman_tau,
        )?;
        let equilibrium = model.equilibrium_returns().to_vec();

        let views: Vec<View> = self
            .symbols
            .iter()
            .enumerate()
            .filter_map(|(i, symbol)| {
                let summary = self.sentiment.get(symbol)?;
                if summary.confidence <= 0.0 || summary.sentiment_score == 0.0 {
                    return None;
                }
                Some(View::absolute(
                    n,
                    i,
                    equilibrium[i] + summary.sentiment_score * self.settings.sentiment_view_scale,
                    summary.confidence,
                ))
            })
            .collect();

        tracing::debug!(views = views.len(), "Black-Litterman posterior");
        model.apply_views(&views)
    }

    fn build_result(
        &self,
        weights: Vec<f64>,
        covariance: &[Vec<f64>],
        model_returns: &[f64],
        turnover: f64,
        turnover_limit: Option<f64>,
        constraint_activations: Vec<String>,
        solution: &Solution,
    ) -> OptimizedPortfolio {
        let expected_return: f64 = weights.iter().zip(model_returns).map(|(w, r)| w * r).sum();
        let volatility = portfolio_volatility(covariance, &weights);
        let sharpe_ratio = if volatility > 0.0 {
            Some((expected_return - self.settings.risk_free_rate) / volatility)
        } else {
            None
        };

        let weighted_vol: f64 = weights
            .iter()
            .enumerate()
            .map(|(i, w)| w * covariance[i][i].max(0.0).sqrt())
            .sum();
        let diversification_ratio = if volatility > 0.0 {
            weighted_vol / volatility
        } else {
            1.0
        };

        let sum_w_sq: f64 = weights.iter().map(|w| w * w).sum();
        let effective_n = if sum_w_sq > 0.0 {
            1.0 / sum_w_sq
        } else {
            self.symbols.len() as f64
        };

        let contributions = risk_contributions(covariance, &weights);

        OptimizedPortfolio {
            weights: self.symbols.iter().cloned().zip(weights).collect(),
            expected_return,
            expected_risk: volatility,
            sharpe_ratio,
            turnover,
            turnover_limit,
            effective_n,
            diversification_ratio,
            risk_contributions: self.symbols.iter().cloned().zip(contributions).collect(),
            constraint_activations,
            iterations: solution.iterations,
            kkt_residual: solution.residual,
        }
    }
}

/// Prospect-theory value of each return around their cross-sectional mean
fn prospect_values(returns: &[f64], loss_aversion: f64) -> Vec<f64> {
    let reference = returns.iter().sum::<f64>() / returns.len().max(1) as f64;
    returns
        .iter()
        .map(|r| {
            let gap = r - reference;
            if gap >= 0.0 {
                reference + gap.powf(PROSPECT_CURVATURE)
            } else {
                reference - loss_aversion * (-gap).powf(PROSPECT_CURVATURE)
            }
        })
        .collect()
}

/// Covariance with each variance scaled by `multiplier`
fn perceived_covariance(covariance: &[Vec<f64>], multiplier: f64) -> Vec<Vec<f64>> {
    let mut values = covariance.to_vec();
    for (i, row) in values.iter_mut().enumerate() {
        row[i] *= multiplier;
    }
    values
}

/// Behavioral mean-variance optimization of `current_portfolio` under `constraints`
pub fn optimize(
    expected_returns: &BTreeMap<String, f64>,
    covariance: &CovarianceMatrix,
    current_portfolio: &PortfolioState,
    constraints: &OptimizationConstraints,
    settings: &OptimizerSettings,
) -> Result<OptimizedPortfolio> {
    PortfolioOptimizer::new(expected_returns, covariance.clone(), settings.clone())?
        .with_current(current_portfolio.clone())
        .with_constraints(constraints.clone())
        .optimize(OptimizationMethod::BehavioralMvo)
}
