//! Engine configuration
//!
//! Loaded from an optional TOML file plus `BPO__`-prefixed environment
//! variables (`BPO__OPTIMIZER__RISK_AVERSION=3.0`). Every section has
//! defaults, so an empty file is a valid configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub statistics: StatisticsConfig,
    #[serde(default)]
    pub bias: BiasConfig,
    #[serde(default)]
    pub sentiment: SentimentConfig,
    #[serde(default)]
    pub constraints: ConstraintConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
}

impl Config {
    /// Load configuration from `path` (if it exists) and the environment
    pub fn load(path: &str) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if Path::new(path).exists() {
            builder = builder.add_source(config::File::with_name(path));
        } else {
            tracing::warn!("Config file {} not found, using defaults", path);
        }
        builder
            .add_source(
                config::Environment::with_prefix("BPO")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Statistics core settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatisticsConfig {
    /// Half-life in periods for exponentially weighted expected returns
    pub ewma_half_life: f64,
    /// Per-period risk-free rate used by CAPM-implied returns
    pub risk_free_rate: f64,
    /// Periods per year for performance annualization
    pub periods_per_year: u32,
    /// Weight on the diagonal target when shrinking an ill-conditioned matrix
    pub shrinkage_intensity: f64,
    /// Smallest variance allowed on the shrunk diagonal
    pub variance_floor: f64,
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        Self {
            ewma_half_life: 20.0,
            risk_free_rate: 0.0,
            periods_per_year: 252,
            shrinkage_intensity: 0.2,
            variance_floor: 1e-8,
        }
    }
}

/// Bias scoring settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BiasConfig {
    /// Peer baseline for overconfidence (trades per 30 days)
    pub benchmark_trades_per_month: f64,
    /// Bars used for trailing returns (recency, confirmation)
    pub trailing_window: usize,
    /// Lookback for 52-week high/low anchors
    pub anchoring_lookback_days: i64,
    /// How far back a sentiment signal may confirm a trade
    pub sentiment_window_hours: i64,
    /// Buying back within this many days of an exit counts as re-entry
    pub reentry_window_days: i64,
    /// Computed scores above this produce a behavioral event
    pub event_threshold: f64,
}

impl Default for BiasConfig {
    fn default() -> Self {
        Self {
            benchmark_trades_per_month: 1.5,
            trailing_window: 20,
            anchoring_lookback_days: 365,
            sentiment_window_hours: 72,
            reentry_window_days: 30,
            event_threshold: 0.7,
        }
    }
}

/// Sentiment aggregation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SentimentConfig {
    /// Age at which a signal's weight halves
    pub half_life_hours: f64,
    /// Signals older than this are ignored
    pub lookback_hours: i64,
}

impl Default for SentimentConfig {
    fn default() -> Self {
        Self {
            half_life_hours: 24.0,
            lookback_hours: 168,
        }
    }
}

/// Behavioral constraint derivation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConstraintConfig {
    /// Bias scores above this activate a rule
    pub bias_threshold: f64,
    pub default_max_weight: f64,
    pub default_min_weight: f64,
    pub default_max_turnover: f64,
    pub default_behavioral_penalty: f64,
    /// Fraction of turnover removed at full disposition/loss-aversion severity
    pub turnover_tightening: f64,
    /// Fraction of the concentration cap removed at full overconfidence severity
    pub concentration_tightening: f64,
    /// Penalty added at full herding severity
    pub herding_penalty: f64,
    /// Diversification pull added at full herding/confirmation severity
    pub diversification_penalty: f64,
    /// Expected-return shrinkage at full recency/anchoring severity
    pub return_shrinkage: f64,
    /// Minimum weight floor when regret aversion fires
    pub regret_min_weight: f64,
    /// Sentiment at or below this (with enough confidence) caps the asset
    pub negative_sentiment_threshold: f64,
    /// Sentiment at or above this marks a crowded trade when herding fires
    pub crowded_sentiment_threshold: f64,
    /// Mentions needed for a crowded trade
    pub crowded_mentions: u64,
    /// Sentiment below this confidence never derives constraints
    pub min_sentiment_confidence: f64,
    /// Fraction of the cap removed at full sentiment strength
    pub sentiment_cap_tightening: f64,
    /// Loss-aversion coefficient of an investor scoring 0
    pub loss_aversion_base: f64,
    /// Coefficient added per unit of loss-aversion score
    pub loss_aversion_score_weight: f64,
    /// Share of the coefficient above 1 added to perceived variance
    pub risk_perception_scale: f64,
}

impl Default for ConstraintConfig {
    fn default() -> Self {
        Self {
            bias_threshold: 0.6,
            default_max_weight: 0.40,
            default_min_weight: 0.0,
            default_max_turnover: 0.50,
            default_behavioral_penalty: 0.0,
            turnover_tightening: 0.5,
            concentration_tightening: 0.5,
            herding_penalty: 0.5,
            diversification_penalty: 0.5,
            return_shrinkage: 0.5,
            regret_min_weight: 0.02,
            negative_sentiment_threshold: -0.5,
            crowded_sentiment_threshold: 0.5,
            crowded_mentions: 500,
            min_sentiment_confidence: 0.5,
            sentiment_cap_tightening: 0.5,
            loss_aversion_base: 2.25,
            loss_aversion_score_weight: 0.5,
            risk_perception_scale: 0.2,
        }
    }
}

/// Quadratic program solver settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Risk-aversion coefficient (lambda)
    pub risk_aversion: f64,
    /// Per-period risk-free rate for the Sharpe ratio
    pub risk_free_rate: f64,
    pub max_iterations: usize,
    /// Projected-gradient KKT residual accepted as converged
    pub kkt_tolerance: f64,
    /// Default solve deadline; requests may override
    pub timeout_ms: Option<u64>,
    /// Black-Litterman prior uncertainty
    pub black_litterman_tau: f64,
    /// Excess return per unit of sentiment in Black-Litterman views
    pub sentiment_view_scale: f64,
    /// Pull toward the equal-risk-contribution portfolio
    pub risk_parity_strength: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            risk_aversion: 2.5,
            risk_free_rate: 0.0,
            max_iterations: 20_000,
            kkt_tolerance: 1e-9,
            timeout_ms: Some(5_000),
            black_litterman_tau: 0.05,
            sentiment_view_scale: 0.01,
            risk_parity_strength: 1.0,
        }
    }
}
