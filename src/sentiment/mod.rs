//! Sentiment aggregation
//!
//! Collapses numeric sentiment signals for one security into a summary.
//! Each signal counts with weight `confidence * 0.5^(age / half_life)`;
//! signals outside `(as_of - lookback, as_of]` are ignored. No signals is a
//! neutral summary, not an error.


use crate::config::SentimentConfig;
use crate::error::{EngineError, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One numeric sentiment observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentimentSignal {
    /// -1 (bearish) to 1 (bullish)
    pub score: f64,
    /// 0 to 1
    pub confidence: f64,
    pub source: String,
    pub timestamp: DateTime<Utc>,
}

/// Aggregated sentiment for one security
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SentimentSummary {
    pub sentiment_score: f64,
    pub confidence: f64,
    pub volume_mentions: u64,
    /// Signals per source inside the window
    #[serde(default)]
    pub sources: BTreeMap<String, u64>,
}

impl SentimentSummary {
    /// Neutral summary used when there is nothing to aggregate
    pub fn neutral() -> Self {
        Self::default()
    }

    pub fn validate(&self) -> Result<()> {
        check_range("sentiment_score", self.sentiment_score, -1.0, 1.0)?;
        check_range("confidence", self.confidence, 0.0, 1.0)
    }
}

fn check_range(name: &str, value: f64, lo: f64, hi: f64) -> Result<()> {
    if !value.is_finite() || value < lo || value > hi {
        return Err(EngineError::invalid_parameter(
            name,
            format!("{} outside [{}, {}]", value, lo, hi),
        ));
    }
    Ok(())
}

fn validate_signal(signal: &SentimentSignal) -> Result<()> {
    check_range("sentiment.score", signal.score, -1.0, 1.0)?;
    check_range("sentiment.confidence", signal.confidence, 0.0, 1.0)
}

/// Aggregate signals for one security as of `as_of`
pub fn aggregate_sentiment(
    signals: &[SentimentSignal],
    as_of: DateTime<Utc>,
    config: &SentimentConfig,
) -> Result<SentimentSummary> {
    if !(config.half_life_hours > 0.0) {
        return Err(EngineError::invalid_parameter(
            "half_life_hours",
            "half-life must be positive",
        ));
    }
    if config.lookback_hours <= 0 {
        return Err(EngineError::invalid_parameter(
            "lookback_hours",
            "lookback must be positive",
        ));
    }
    for signal in signals {
        validate_signal(signal)?;
    }

    let window_start = as_of - Duration::hours(config.lookback_hours);
    let mut weighted_score = 0.0;
    let mut score_weight = 0.0;
    let mut weighted_confidence = 0.0;
    let mut decay_total = 0.0;
    let mut summary = SentimentSummary::neutral();

    for signal in signals
        .iter()
        .filter(|s| s.timestamp > window_start && s.timestamp <= as_of)
    {
        let age_hours = (as_of - signal.timestamp).num_seconds() as f64 / 3600.0;
        let decay = 0.5_f64.powf(age_hours / config.half_life_hours);
        let weight = signal.confidence * decay;

        weighted_score += weight * signal.score;
        score_weight += weight;
        weighted_confidence += decay * signal.confidence;
        decay_total += decay;

        summary.volume_mentions += 1;
        *summary.sources.entry(signal.source.clone()).or_insert(0) += 1;
    }

    if score_weight > 0.0 {
        summary.sentiment_score = (weighted_score / score_weight).clamp(-1.0, 1.0);
    }
    if decay_total > 0.0 {
        summary.confidence = (weighted_confidence / decay_total).clamp(0.0, 1.0);
    }

    tracing::debug!(
        signals = signals.len(),
        in_window = summary.volume_mentions,
        score = summary.sentiment_score,
        confidence = summary.confidence,
        "Aggregated sentiment"
    );

    Ok(summary)
}

/// Aggregate every symbol's signals; symbols with no signals get a neutral summary
pub fn aggregate_by_symbol(
    signals_by_symbol: &BTreeMap<String, Vec<SentimentSignal>>,
    as_of: DateTime<Utc>,
    config: &SentimentConfig,
) -> Result<BTreeMap<String, SentimentSummary>> {
    signals_by_symbol
        .iter()
        .map(|(symbol, signals)| Ok((symbol.clone(), aggregate_sentiment(signals, as_of, config)?)))
        .collect()
}
