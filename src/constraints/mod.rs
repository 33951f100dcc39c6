//! # Behavioral Constraints
//!
//! Translates bias scores and sentiment into optimizer limits.
//!
//! Rules only fire on computed scores above the configured threshold, with
//! strength `severity = (score - threshold) / (1 - threshold)`. Every limit a
//! rule moves is recorded as a [`ConstraintDerivation`] so the rationale can
//! say what changed and why. User overrides are applied last and win.
//!
//! Limits that only bind relative to a held portfolio (turnover and the
//! pull toward current weights) are left alone when starting from cash.

#[cfg(test)]
mod tests;

use crate::bias::{BiasKind, BiasScoreSet};
use crate::config::ConstraintConfig;
use crate::error::{ConstraintKind, EngineError, Result};
use crate::sentiment::SentimentSummary;
use crate::types::PortfolioState;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Smallest short bound accepted when shorting is allowed
const SHORT_FLOOR: f64 = -1.0;

/// What moved a limit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "name")]
pub enum DerivationSource {
    Bias(BiasKind),
    Sentiment,
    /// Cap raised so the universe can hold the whole budget
    Universe,
    UserOverride,
}

/// One limit change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintDerivation {
    pub source: DerivationSource,
    pub constraint: ConstraintKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset: Option<String>,
    /// `None` when the limit was unset before
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<f64>,
    pub to: f64,
}

/// Limits handed to the optimizer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationConstraints {
    pub max_weight_per_asset: f64,
    pub min_weight_per_asset: f64,
    /// L1 distance allowed from the current portfolio
    pub max_turnover: f64,
    pub target_volatility: Option<f64>,
    /// Pull toward the current portfolio
    pub behavioral_penalty_weight: f64,
    /// Pull toward equal weight
    pub diversification_penalty_weight: f64,
    /// Fraction of each expected return replaced by the cross-sectional mean
    pub expected_return_shrinkage: f64,
    /// Per-asset caps tighter than `max_weight_per_asset`
    #[serde(default)]
    pub asset_max_weights: BTreeMap<String, f64>,
    #[serde(default)]
    pub allow_short: bool,
    /// Prospect-theory weight on losses; `None` leaves expected returns linear
    #[serde(default)]
    pub loss_aversion_coefficient: Option<f64>,
    /// Scale on the covariance diagonal for perceived risk
    #[serde(default = "unit_multiplier")]
    pub risk_perception_multiplier: f64,
    #[serde(default)]
    pub derivations: Vec<ConstraintDerivation>,
}

fn unit_multiplier() -> f64 {
    1.0
}

impl OptimizationConstraints {
    /// Defaults with no behavioral adjustment
    pub fn from_config(config: &ConstraintConfig) -> Self {
        Self {
            max_weight_per_asset: config.default_max_weight,
            min_weight_per_asset: config.default_min_weight,
            max_turnover: config.default_max_turnover,
            target_volatility: None,
            behavioral_penalty_weight: config.default_behavioral_penalty,
            diversification_penalty_weight: 0.0,
            expected_return_shrinkage: 0.0,
            asset_max_weights: BTreeMap::new(),
            allow_short: false,
            loss_aversion_coefficient: None,
            risk_perception_multiplier: 1.0,
            derivations: Vec::new(),
        }
    }

    /// Effective upper bound for one asset
    pub fn upper_bound(&self, asset: &str) -> f64 {
        match self.asset_max_weights.get(asset) {
            Some(cap) => cap.min(self.max_weight_per_asset),
            None => self.max_weight_per_asset,
        }
    }

    pub fn lower_bound(&self, _asset: &str) -> f64 {
        self.min_weight_per_asset
    }

    /// Derivations attributed to one bias
    pub fn derived_from(&self, kind: BiasKind) -> Vec<&ConstraintDerivation> {
        self.derivations
            .iter()
            .filter(|d| d.source == DerivationSource::Bias(kind))
            .collect()
    }

    /// Check hard bounds
    pub fn validate(&self) -> Result<()> {
        let invalid = |constraint: ConstraintKind, value: f64, bound: &str| {
            Err(EngineError::InvalidConstraint {
                constraint,
                value,
                bound: bound.to_string(),
            })
        };

        let max = self.max_weight_per_asset;
        if !max.is_finite() || max <= 0.0 || max > 1.0 {
            return invalid(ConstraintKind::MaxWeightPerAsset, max, "0 < value <= 1");
        }

        let min = self.min_weight_per_asset;
        let min_floor = if self.allow_short { SHORT_FLOOR } else { 0.0 };
        if !min.is_finite() || min < min_floor {
            let bound = if self.allow_short { "value >= -1" } else { "value >= 0" };
            return invalid(ConstraintKind::MinWeightPerAsset, min, bound);
        }
        if min > max {
            return invalid(
                ConstraintKind::MinWeightPerAsset,
                min,
                &format!("value <= max_weight_per_asset ({})", max),
            );
        }

        if !self.max_turnover.is_finite() || self.max_turnover < 0.0 {
            return invalid(ConstraintKind::MaxTurnover, self.max_turnover, "value >= 0");
        }
        if let Some(vol) = self.target_volatility {
            if !vol.is_finite() || vol <= 0.0 {
                return invalid(ConstraintKind::TargetVolatility, vol, "value > 0");
            }
        }
        if !self.behavioral_penalty_weight.is_finite() || self.behavioral_penalty_weight < 0.0 {
            return invalid(
                ConstraintKind::BehavioralPenaltyWeight,
                self.behavioral_penalty_weight,
                "value >= 0",
            );
        }
        if !self.diversification_penalty_weight.is_finite() || self.diversification_penalty_weight < 0.0 {
            return invalid(
                ConstraintKind::DiversificationPenaltyWeight,
                self.diversification_penalty_weight,
                "value >= 0",
            );
        }
        let shrink = self.expected_return_shrinkage;
        if !shrink.is_finite() || !(0.0..=1.0).contains(&shrink) {
            return invalid(ConstraintKind::ExpectedReturnShrinkage, shrink, "0 <= value <= 1");
        }
        if let Some(coefficient) = self.loss_aversion_coefficient {
            if !coefficient.is_finite() || coefficient < 1.0 {
                return invalid(ConstraintKind::LossAversionCoefficient, coefficient, "value >= 1");
            }
        }
        let perception = self.risk_perception_multiplier;
        if !perception.is_finite() || perception < 1.0 {
            return invalid(ConstraintKind::RiskPerceptionMultiplier, perception, "value >= 1");
        }
        for cap in self.asset_max_weights.values() {
            if !cap.is_finite() || *cap <= 0.0 || *cap > 1.0 {
                return invalid(ConstraintKind::MaxWeightPerAsset, *cap, "0 < value <= 1");
            }
            if *cap < min {
                return invalid(
                    ConstraintKind::MaxWeightPerAsset,
                    *cap,
                    &format!("value >= min_weight_per_asset ({})", min),
                );
            }
        }
        Ok(())
    }
}

/// Caller-supplied limits; anything set here wins over derived values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConstraintOverrides {
    #[serde(alias = "max_weight")]
    pub max_weight_per_asset: Option<f64>,
    #[serde(alias = "min_weight")]
    pub min_weight_per_asset: Option<f64>,
    pub max_turnover: Option<f64>,
    pub target_volatility: Option<f64>,
    pub behavioral_penalty_weight: Option<f64>,
    pub diversification_penalty_weight: Option<f64>,
    pub expected_return_shrinkage: Option<f64>,
    pub asset_max_weights: BTreeMap<String, f64>,
    pub allow_short: Option<bool>,
    pub loss_aversion_coefficient: Option<f64>,
    pub risk_perception_multiplier: Option<f64>,
}

struct Builder<'a> {
    constraints: OptimizationConstraints,
    config: &'a ConstraintConfig,
}

impl Builder<'_> {
    fn severity(&self, scores: &BiasScoreSet, kind: BiasKind) -> Option<f64> {
        let threshold = self.config.bias_threshold;
        let score = scores.get(kind);
        if !score.is_computed() || score.score <= threshold || threshold >= 1.0 {
            return None;
        }
        Some(((score.score - threshold) / (1.0 - threshold)).clamp(0.0, 1.0))
    }

    fn record(
        &mut self,
        source: DerivationSource,
        constraint: ConstraintKind,
        asset: Option<String>,
        from: impl Into<Option<f64>>,
        to: f64,
    ) {
        let from = from.into();
        tracing::debug!(
            ?source,
            constraint = constraint.as_str(),
            asset = asset.as_deref().unwrap_or("-"),
            ?from,
            to,
            "Derived constraint"
        );
        self.constraints.derivations.push(ConstraintDerivation {
            source,
            constraint,
            asset,
            from,
            to,
        });
    }

    fn tighten_turnover(&mut self, kind: BiasKind, severity: f64) {
        let from = self.constraints.max_turnover;
        let to = from * (1.0 - self.config.turnover_tightening * severity);
        self.constraints.max_turnover = to;
        self.record(DerivationSource::Bias(kind), ConstraintKind::MaxTurnover, None, from, to);
    }

    /// Prospect-theory coefficient and the variance inflation it implies
    fn weigh_losses(&mut self, score: f64) {
        let coefficient = self.config.loss_aversion_base + self.config.loss_aversion_score_weight * score;
        self.constraints.loss_aversion_coefficient = Some(coefficient);
        self.record(
            DerivationSource::Bias(BiasKind::LossAversion),
            ConstraintKind::LossAversionCoefficient,
            None,
            None::<f64>,
            coefficient,
        );

        let from = self.constraints.risk_perception_multiplier;
        let to = from * (1.0 + (coefficient - 1.0).max(0.0) * self.config.risk_perception_scale);
        self.constraints.risk_perception_multiplier = to;
        self.record(
            DerivationSource::Bias(BiasKind::LossAversion),
            ConstraintKind::RiskPerceptionMultiplier,
            None,
            from,
            to,
        );
    }

    fn add_diversification(&mut self, kind: BiasKind, severity: f64) {
        let from = self.constraints.diversification_penalty_weight;
        let to = from + self.config.diversification_penalty * severity;
        self.constraints.diversification_penalty_weight = to;
        self.record(
            DerivationSource::Bias(kind),
            ConstraintKind::DiversificationPenaltyWeight,
            None,
            from,
            to,
        );
    }

    fn add_return_shrinkage(&mut self, kind: BiasKind, severity: f64) {
        let from = self.constraints.expected_return_shrinkage;
        let to = (from + self.config.return_shrinkage * severity).min(1.0);
        self.constraints.expected_return_shrinkage = to;
        self.record(
            DerivationSource::Bias(kind),
            ConstraintKind::ExpectedReturnShrinkage,
            None,
            from,
            to,
        );
    }

    /// Tighten one asset's cap, never below `max(min_weight, 1/n)`
    fn cap_asset(&mut self, source: DerivationSource, asset: &str, strength: f64, n: usize) {
        let from = self.constraints.upper_bound(asset);
        let floor = self
            .constraints
            .min_weight_per_asset
            .max(1.0 / n.max(1) as f64);
        let to = (from * (1.0 - self.config.sentiment_cap_tightening * strength))
            .max(floor)
            .min(from);
        if to < from {
            self.constraints.asset_max_weights.insert(asset.to_string(), to);
            self.record(
                source,
                ConstraintKind::MaxWeightPerAsset,
                Some(asset.to_string()),
                from,
                to,
            );
        }
    }
}

/// Derive optimizer limits for `assets`
pub fn build_constraints(
    bias_scores: &BiasScoreSet,
    sentiment_by_asset: &BTreeMap<String, SentimentSummary>,
    current_portfolio: &PortfolioState,
    assets: &[String],
    overrides: &ConstraintOverrides,
    config: &ConstraintConfig,
) -> Result<OptimizationConstraints> {
    let n = assets.len().max(1);
    let equal_weight = 1.0 / n as f64;
    let from_cash = current_portfolio.weights.is_empty();
    let mut builder = Builder {
        constraints: OptimizationConstraints::from_config(config),
        config,
    };

    let default_cap = builder.constraints.max_weight_per_asset;
    if default_cap < equal_weight {
        builder.constraints.max_weight_per_asset = equal_weight;
        builder.record(
            DerivationSource::Universe,
            ConstraintKind::MaxWeightPerAsset,
            None,
            default_cap,
            equal_weight,
        );
    }

    for kind in [BiasKind::DispositionEffect, BiasKind::LossAversion] {
        if let Some(severity) = builder.severity(bias_scores, kind) {
            if !from_cash {
                builder.tighten_turnover(kind, severity);
            }
        }
    }
    if builder.severity(bias_scores, BiasKind::LossAversion).is_some() {
        builder.weigh_losses(bias_scores.get(BiasKind::LossAversion).score);
    }

    if let Some(severity) = builder.severity(bias_scores, BiasKind::Overconfidence) {
        let from = builder.constraints.max_weight_per_asset;
        let to = (from * (1.0 - config.concentration_tightening * severity)).max(equal_weight);
        if to < from {
            builder.constraints.max_weight_per_asset = to;
            builder.record(
                DerivationSource::Bias(BiasKind::Overconfidence),
                ConstraintKind::MaxWeightPerAsset,
                None,
                from,
                to,
            );
        }
    }

    let herding = builder.severity(bias_scores, BiasKind::HerdingBehavior);
    if let Some(severity) = herding {
        if !from_cash {
            let from = builder.constraints.behavioral_penalty_weight;
            let to = from + config.herding_penalty * severity;
            builder.constraints.behavioral_penalty_weight = to;
            builder.record(
                DerivationSource::Bias(BiasKind::HerdingBehavior),
                ConstraintKind::BehavioralPenaltyWeight,
                None,
                from,
                to,
            );
        }
        builder.add_diversification(BiasKind::HerdingBehavior, severity);
    }

    for kind in [BiasKind::RecencyBias, BiasKind::AnchoringBias] {
        if let Some(severity) = builder.severity(bias_scores, kind) {
            builder.add_return_shrinkage(kind, severity);
        }
    }

    if let Some(severity) = builder.severity(bias_scores, BiasKind::ConfirmationBias) {
        builder.add_diversification(BiasKind::ConfirmationBias, severity);
    }

    if builder.severity(bias_scores, BiasKind::RegretAversion).is_some() {
        let from = builder.constraints.min_weight_per_asset;
        let to = from.max(config.regret_min_weight.min(equal_weight));
        if to > from {
            builder.constraints.min_weight_per_asset = to;
            builder.record(
                DerivationSource::Bias(BiasKind::RegretAversion),
                ConstraintKind::MinWeightPerAsset,
                None,
                from,
                to,
            );
        }
    }

    for asset in assets {
        let Some(summary) = sentiment_by_asset.get(asset) else {
            continue;
        };
        if summary.confidence < config.min_sentiment_confidence {
            continue;
        }
        if summary.sentiment_score <= config.negative_sentiment_threshold {
            builder.cap_asset(
                DerivationSource::Sentiment,
                asset,
                summary.sentiment_score.abs(),
                n,
            );
        } else if let Some(severity) = herding {
            let crowded = summary.sentiment_score >= config.crowded_sentiment_threshold
                && summary.volume_mentions >= config.crowded_mentions;
            if crowded {
                builder.cap_asset(
                    DerivationSource::Bias(BiasKind::HerdingBehavior),
                    asset,
                    severity,
                    n,
                );
            }
        }
    }

    apply_overrides(&mut builder, overrides);

    let constraints = builder.constraints;
    constraints.validate()?;

    tracing::debug!(
        assets = assets.len(),
        from_cash,
        derivations = constraints.derivations.len(),
        max_turnover = constraints.max_turnover,
        max_weight = constraints.max_weight_per_asset,
        "Built optimization constraints"
    );
    Ok(constraints)
}

fn apply_overrides(builder: &mut Builder, overrides: &ConstraintOverrides) {
    let c = &builder.constraints;
    let scalar = [
        (
            ConstraintKind::MaxWeightPerAsset,
            overrides.max_weight_per_asset,
            c.max_weight_per_asset,
        ),
        (
            ConstraintKind::MinWeightPerAsset,
            overrides.min_weight_per_asset,
            c.min_weight_per_asset,
        ),
        (ConstraintKind::MaxTurnover, overrides.max_turnover, c.max_turnover),
        (
            ConstraintKind::BehavioralPenaltyWeight,
            overrides.behavioral_penalty_weight,
            c.behavioral_penalty_weight,
        ),
        (
            ConstraintKind::DiversificationPenaltyWeight,
            overrides.diversification_penalty_weight,
            c.diversification_penalty_weight,
        ),
        (
            ConstraintKind::ExpectedReturnShrinkage,
            overrides.expected_return_shrinkage,
            c.expected_return_shrinkage,
        ),
        (
            ConstraintKind::RiskPerceptionMultiplier,
            overrides.risk_perception_multiplier,
            c.risk_perception_multiplier,
        ),
    ];

    for (kind, value, from) in scalar {
        let Some(to) = value else {
            continue;
        };
        let c = &mut builder.constraints;
        match kind {
            ConstraintKind::MaxWeightPerAsset => c.max_weight_per_asset = to,
            ConstraintKind::MinWeightPerAsset => c.min_weight_per_asset = to,
            ConstraintKind::MaxTurnover => c.max_turnover = to,
            ConstraintKind::BehavioralPenaltyWeight => c.behavioral_penalty_weight = to,
            ConstraintKind::DiversificationPenaltyWeight => c.diversification_penalty_weight = to,
            ConstraintKind::ExpectedReturnShrinkage => c.expected_return_shrinkage = to,
            ConstraintKind::RiskPerceptionMultiplier => c.risk_perception_multiplier = to,
            ConstraintKind::TargetVolatility
            | ConstraintKind::LossAversionCoefficient
            | ConstraintKind::BudgetSum => {}
        }
        builder.record(DerivationSource::UserOverride, kind, None, from, to);
    }

    let optional = [
        (ConstraintKind::TargetVolatility, overrides.target_volatility),
        (
            ConstraintKind::LossAversionCoefficient,
            overrides.loss_aversion_coefficient,
        ),
    ];
    for (kind, value) in optional {
        let Some(to) = value else {
            continue;
        };
        let slot = match kind {
            ConstraintKind::TargetVolatility => &mut builder.constraints.target_volatility,
            _ => &mut builder.constraints.loss_aversion_coefficient,
        };
        let from = slot.replace(to);
        builder.record(DerivationSource::UserOverride, kind, None, from, to);
    }
    if let Some(allow_short) = overrides.allow_short {
        builder.constraints.allow_short = allow_short;
    }
    for (asset, cap) in &overrides.asset_max_weights {
        let from = builder.constraints.upper_bound(asset);
        builder.constraints.asset_max_weights.insert(asset.clone(), *cap);
        builder.record(
            DerivationSource::UserOverride,
            ConstraintKind::MaxWeightPerAsset,
            Some(asset.clone()),
            from,
            *cap,
        );
    }
}
