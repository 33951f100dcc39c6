//! # Bias Scoring
//!
//! Scores eight behavioral biases from an investor's trade history,
//! portfolio snapshots and market context.
//!
//! Trades are replayed through an average-cost [`Ledger`]; each rule in
//! [`rules`] reads the replay and returns a score in `[0, 1]` or nothing.
//! A rule with too little evidence reports the neutral 0.5 flagged
//! [`ScoreConfidence::InsufficientEvidence`], and downstream consumers
//! never treat that default as a signal.

pub mod ledger;
pub mod realtime;
pub mod rules;


pub use ledger::Ledger;
pub use realtime::{assess_trade, AlertKind, BehavioralAlert, MarketConditions, TradeIntent};

use crate::config::BiasConfig;
use crate::error::{EngineError, Result};
use crate::sentiment::SentimentSignal;
use crate::types::{PortfolioSnapshot, PriceSeries, TimedReturn, Trade};
use chrono::{DateTime, Utc};
use rules::{RuleContext, RuleOutput};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Score reported when a rule has no evidence
pub const NEUTRAL_SCORE: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BiasKind {
    DispositionEffect,
    LossAversion,
    Overconfidence,
    RecencyBias,
    HerdingBehavior,
    ConfirmationBias,
    AnchoringBias,
    RegretAversion,
}

impl BiasKind {
    pub const ALL: [BiasKind; 8] = [
        BiasKind::DispositionEffect,
        BiasKind::LossAversion,
        BiasKind::Overconfidence,
        BiasKind::RecencyBias,
        BiasKind::HerdingBehavior,
        BiasKind::ConfirmationBias,
        BiasKind::AnchoringBias,
        BiasKind::RegretAversion,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BiasKind::DispositionEffect => "disposition_effect",
            BiasKind::LossAversion => "loss_aversion",
            BiasKind::Overconfidence => "overconfidence",
            BiasKind::RecencyBias => "recency_bias",
            BiasKind::HerdingBehavior => "herding_behavior",
            BiasKind::ConfirmationBias => "confirmation_bias",
            BiasKind::AnchoringBias => "anchoring_bias",
            BiasKind::RegretAversion => "regret_aversion",
        }
    }

    /// Human-readable name used in explanations
    pub fn label(&self) -> &'static str {
        match self {
            BiasKind::DispositionEffect => "disposition effect",
            BiasKind::LossAversion => "loss aversion",
            BiasKind::Overconfidence => "overconfidence",
            BiasKind::RecencyBias => "recency bias",
            BiasKind::HerdingBehavior => "herding behavior",
            BiasKind::ConfirmationBias => "confirmation bias",
            BiasKind::AnchoringBias => "anchoring bias",
            BiasKind::RegretAversion => "regret aversion",
        }
    }

    fn rule(&self) -> fn(&RuleContext) -> RuleOutput {
        match self {
            BiasKind::DispositionEffect => rules::disposition_effect,
            BiasKind::LossAversion => rules::loss_aversion,
            BiasKind::Overconfidence => rules::overconfidence,
            BiasKind::RecencyBias => rules::recency_bias,
            BiasKind::HerdingBehavior => rules::herding_behavior,
            BiasKind::ConfirmationBias => rules::confirmation_bias,
            BiasKind::AnchoringBias => rules::anchoring_bias,
            BiasKind::RegretAversion => rules::regret_aversion,
        }
    }
}

impl std::fmt::Display for BiasKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BiasKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        BiasKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| EngineError::invalid_parameter("bias", format!("unknown bias `{}`", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreConfidence {
    Computed,
    InsufficientEvidence,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BiasScore {
    pub score: f64,
    pub confidence: ScoreConfidence,
    /// Observations behind the score
    pub evidence: usize,
}

impl BiasScore {
    pub fn computed(score: f64, evidence: usize) -> Self {
        Self {
            score: score.clamp(0.0, 1.0),
            confidence: ScoreConfidence::Computed,
            evidence,
        }
    }

    pub fn neutral() -> Self {
        Self {
            score: NEUTRAL_SCORE,
            confidence: ScoreConfidence::InsufficientEvidence,
            evidence: 0,
        }
    }

    pub fn is_computed(&self) -> bool {
        self.confidence == ScoreConfidence::Computed
    }
}

/// A computed bias strong enough to report on its own
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehavioralEvent {
    pub bias: BiasKind,
    pub score: f64,
    pub description: String,
}

/// Scores for every bias
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiasScoreSet {
    pub scores: BTreeMap<BiasKind, BiasScore>,
    /// Mean of computed scores; neutral when nothing was computed
    pub overall_score: f64,
    #[serde(default)]
    pub events: Vec<BehavioralEvent>,
}

impl Default for BiasScoreSet {
    fn default() -> Self {
        Self::from_scores(BTreeMap::new(), BiasConfig::default().event_threshold)
    }
}

impl BiasScoreSet {
    /// Fill missing biases with the neutral default and derive the summary fields
    pub fn from_scores(mut scores: BTreeMap<BiasKind, BiasScore>, event_threshold: f64) -> Self {
        for kind in BiasKind::ALL {
            scores.entry(kind).or_insert_with(BiasScore::neutral);
        }

        let computed: Vec<f64> = scores
            .values()
            .filter(|s| s.is_computed())
            .map(|s| s.score)
            .collect();
        let overall_score = if computed.is_empty() {
            NEUTRAL_SCORE
        } else {
            computed.iter().sum::<f64>() / computed.len() as f64
        };

        let events = scores
            .iter()
            .filter(|(_, s)| s.is_computed() && s.score > event_threshold)
            .map(|(kind, s)| BehavioralEvent {
                bias: *kind,
                score: s.score,
                description: format!(
                    "Strong {} detected (score {:.2} from {} observations)",
                    kind.label(),
                    s.score,
                    s.evidence
                ),
            })
            .collect();

        Self {
            scores,
            overall_score,
            events,
        }
    }

    /// Caller-supplied scores, treated as computed
    pub fn from_values(values: &BTreeMap<BiasKind, f64>, event_threshold: f64) -> Result<Self> {
        let mut scores = BTreeMap::new();
        for (kind, value) in values {
            if !value.is_finite() || !(0.0..=1.0).contains(value) {
                return Err(EngineError::invalid_parameter(
                    format!("bias_scores.{}", kind),
                    format!("score {} outside [0, 1]", value),
                ));
            }
            scores.insert(*kind, BiasScore::computed(*value, 1));
        }
        Ok(Self::from_scores(scores, event_threshold))
    }

    pub fn get(&self, kind: BiasKind) -> BiasScore {
        self.scores.get(&kind).copied().unwrap_or_else(BiasScore::neutral)
    }

    /// Computed biases scoring above `threshold`, strongest first (ties by name)
    pub fn ranked_above(&self, threshold: f64) -> Vec<(BiasKind, f64)> {
        let mut ranked: Vec<(BiasKind, f64)> = self
            .scores
            .iter()
            .filter(|(_, s)| s.is_computed() && s.score > threshold)
            .map(|(k, s)| (*k, s.score))
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        ranked
    }
}

/// Market data the rules may consult
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketContext {
    /// Benchmark (market flow) returns, in any order
    #[serde(default)]
    pub benchmark_returns: Vec<TimedReturn>,
    #[serde(default)]
    pub prices: BTreeMap<String, PriceSeries>,
    #[serde(default)]
    pub sentiment: BTreeMap<String, Vec<SentimentSignal>>,
}

impl MarketContext {
    /// Latest timestamp anywhere in the context
    fn latest_timestamp(&self) -> Option<DateTime<Utc>> {
        let benchmark = self.benchmark_returns.iter().map(|b| b.timestamp);
        let prices = self
            .prices
            .values()
            .filter_map(|s| s.bars.last().map(|b| b.timestamp));
        let sentiment = self.sentiment.values().flatten().map(|s| s.timestamp);
        benchmark.chain(prices).chain(sentiment).max()
    }
}

fn validate_trades(trades: &[Trade]) -> Result<()> {
    for (i, trade) in trades.iter().enumerate() {
        if trade.quantity <= Decimal::ZERO {
            return Err(EngineError::invalid_parameter(
                format!("trade_history[{}].quantity", i),
                "quantity must be positive",
            ));
        }
        if trade.price <= Decimal::ZERO {
            return Err(EngineError::invalid_parameter(
                format!("trade_history[{}].price", i),
                "price must be positive",
            ));
        }
    }
    Ok(())
}

/// Score every bias
pub fn score_biases(
    trades: &[Trade],
    portfolio_history: &[PortfolioSnapshot],
    market: &MarketContext,
    config: &BiasConfig,
) -> Result<BiasScoreSet> {
    validate_trades(trades)?;
    for series in market.prices.values() {
        series.validate()?;
    }

    let mut market = market.clone();
    market.benchmark_returns.sort_by_key(|b| b.timestamp);
    let mut snapshots = portfolio_history.to_vec();
    snapshots.sort_by_key(|s| s.timestamp);

    let as_of = trades
        .iter()
        .map(|t| t.timestamp)
        .chain(snapshots.iter().map(|s| s.timestamp))
        .chain(market.latest_timestamp())
        .max();

    let Some(as_of) = as_of else {
        tracing::debug!("No timestamped input, every bias defaults to neutral");
        return Ok(BiasScoreSet::from_scores(BTreeMap::new(), config.event_threshold));
    };

    let ledger = Ledger::replay(trades)?;
    let ctx = RuleContext {
        ledger: &ledger,
        snapshots: &snapshots,
        market: &market,
        config,
        as_of,
    };

    let mut scores = BTreeMap::new();
    for kind in BiasKind::ALL {
        let score = match (kind.rule())(&ctx) {
            Some((score, evidence)) if score.is_finite() => BiasScore::computed(score, evidence),
            _ => BiasScore::neutral(),
        };
        tracing::debug!(
            bias = kind.as_str(),
            score = score.score,
            evidence = score.evidence,
            computed = score.is_computed(),
            "Scored bias"
        );
        scores.insert(kind, score);
    }

    let set = BiasScoreSet::from_scores(scores, config.event_threshold);
    tracing::info!(
        trades = trades.len(),
        snapshots = snapshots.len(),
        overall = set.overall_score,
        events = set.events.len(),
        "Bias scoring complete"
    );
    Ok(set)
}
