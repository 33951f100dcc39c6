//! Tests for behavioral constraint derivation

#[cfg(test)]
mod tests {
    use super::super::*;

    fn assets(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn scores(values: &[(BiasKind, f64)]) -> BiasScoreSet {
        BiasScoreSet::from_values(&values.iter().copied().collect(), 0.7).unwrap()
    }

    fn build(
        bias: &BiasScoreSet,
        sentiment: &BTreeMap<String, SentimentSummary>,
        universe: &[String],
        overrides: &ConstraintOverrides,
    ) -> Result<OptimizationConstraints> {
        let current = PortfolioState::equal_weight(universe);
        build_constraints(
            bias,
            sentiment,
            &current,
            universe,
            overrides,
            &ConstraintConfig::default(),
        )
    }

    #[test]
    fn test_defaults_without_biases() {
        let universe = assets(&["A", "B", "C"]);
        let c = build(
            &BiasScoreSet::default(),
            &BTreeMap::new(),
            &universe,
            &ConstraintOverrides::default(),
        )
        .unwrap();
        assert_eq!(c.max_weight_per_asset, 0.40);
        assert_eq!(c.min_weight_per_asset, 0.0);
        assert_eq!(c.max_turnover, 0.50);
        assert_eq!(c.behavioral_penalty_weight, 0.0);
        assert!(c.derivations.is_empty());
    }

    #[test]
    fn test_disposition_and_loss_aversion_tighten_turnover() {
        let universe = assets(&["A", "B", "C"]);
        let bias = scores(&[
            (BiasKind::DispositionEffect, 0.65),
            (BiasKind::LossAversion, 0.72),
        ]);
        let c = build(&bias, &BTreeMap::new(), &universe, &ConstraintOverrides::default()).unwrap();

        // severities 0.125 and 0.3
        let expected = 0.5 * (1.0 - 0.5 * 0.125) * (1.0 - 0.5 * 0.3);
        assert!((c.max_turnover - expected).abs() < 1e-12);
        assert!(c.max_turnover < 0.5);
        assert_eq!(c.derived_from(BiasKind::DispositionEffect).len(), 1);
        // turnover, coefficient and perceived risk
        assert_eq!(c.derived_from(BiasKind::LossAversion).len(), 3);
    }

    #[test]
    fn test_loss_aversion_sets_prospect_parameters() {
        let universe = assets(&["A", "B", "C"]);
        let bias = scores(&[(BiasKind::LossAversion, 0.72)]);
        let c = build(&bias, &BTreeMap::new(), &universe, &ConstraintOverrides::default()).unwrap();

        let coefficient = 2.25 + 0.5 * 0.72;
        assert!((c.loss_aversion_coefficient.unwrap() - coefficient).abs() < 1e-12);
        let multiplier = 1.0 + (coefficient - 1.0) * 0.2;
        assert!((c.risk_perception_multiplier - multiplier).abs() < 1e-12);

        let derived = c.derived_from(BiasKind::LossAversion);
        let set = derived
            .iter()
            .find(|d| d.constraint == ConstraintKind::LossAversionCoefficient)
            .unwrap();
        assert_eq!(set.from, None);
        let perceived = derived
            .iter()
            .find(|d| d.constraint == ConstraintKind::RiskPerceptionMultiplier)
            .unwrap();
        assert_eq!(perceived.from, Some(1.0));
    }

    #[test]
    fn test_calm_investor_keeps_plain_model() {
        let universe = assets(&["A", "B", "C"]);
        let bias = scores(&[(BiasKind::LossAversion, 0.5)]);
        let c = build(&bias, &BTreeMap::new(), &universe, &ConstraintOverrides::default()).unwrap();
        assert_eq!(c.loss_aversion_coefficient, None);
        assert_eq!(c.risk_perception_multiplier, 1.0);
    }

    #[test]
    fn test_small_universe_raises_default_cap() {
        let universe = assets(&["A", "B"]);
        let c = build(
            &BiasScoreSet::default(),
            &BTreeMap::new(),
            &universe,
            &ConstraintOverrides::default(),
        )
        .unwrap();
        assert_eq!(c.max_weight_per_asset, 0.5);
        assert_eq!(c.derivations.len(), 1);
        assert_eq!(c.derivations[0].source, DerivationSource::Universe);
        assert_eq!(c.derivations[0].from, Some(0.4));
        assert_eq!(c.derivations[0].to, 0.5);

        let single = build(
            &BiasScoreSet::default(),
            &BTreeMap::new(),
            &assets(&["A"]),
            &ConstraintOverrides::default(),
        )
        .unwrap();
        assert_eq!(single.max_weight_per_asset, 1.0);
    }

    #[test]
    fn test_explicit_cap_is_not_raised() {
        let universe = assets(&["A", "B"]);
        let overrides = ConstraintOverrides {
            max_weight_per_asset: Some(0.45),
            ..Default::default()
        };
        let c = build(&BiasScoreSet::default(), &BTreeMap::new(), &universe, &overrides).unwrap();
        assert_eq!(c.max_weight_per_asset, 0.45);
        let last = c.derivations.last().unwrap();
        assert_eq!(last.source, DerivationSource::UserOverride);
        assert_eq!(last.from, Some(0.5));
    }

    #[test]
    fn test_starting_from_cash_skips_anchored_limits() {
        let universe = assets(&["A", "B", "C"]);
        let bias = scores(&[
            (BiasKind::DispositionEffect, 0.9),
            (BiasKind::LossAversion, 0.9),
            (BiasKind::HerdingBehavior, 0.9),
        ]);
        let c = build_constraints(
            &bias,
            &BTreeMap::new(),
            &PortfolioState::default(),
            &universe,
            &ConstraintOverrides::default(),
            &ConstraintConfig::default(),
        )
        .unwrap();

        assert_eq!(c.max_turnover, 0.5);
        assert_eq!(c.behavioral_penalty_weight, 0.0);
        assert!(c.diversification_penalty_weight > 0.0);
        assert!(c.loss_aversion_coefficient.is_some());
        assert!(c
            .derivations
            .iter()
            .all(|d| d.constraint != ConstraintKind::MaxTurnover));
    }

    #[test]
    fn test_scores_at_threshold_do_not_fire() {
        let universe = assets(&["A", "B"]);
        let bias = scores(&[(BiasKind::DispositionEffect, 0.6)]);
        let c = build(&bias, &BTreeMap::new(), &universe, &ConstraintOverrides::default()).unwrap();
        assert_eq!(c.max_turnover, 0.5);
    }

    #[test]
    fn test_default_scores_never_fire() {
        let universe = assets(&["A", "B"]);
        let mut set = BiasScoreSet::default();
        // a neutral default is never evidence, whatever its value
        if let Some(score) = set.scores.get_mut(&BiasKind::DispositionEffect) {
            score.score = 0.95;
        }
        let c = build(&set, &BTreeMap::new(), &universe, &ConstraintOverrides::default()).unwrap();
        assert_eq!(c.max_turnover, 0.5);
    }

    #[test]
    fn test_overconfidence_caps_concentration_at_equal_weight() {
        let universe = assets(&["A", "B", "C"]);
        let bias = scores(&[(BiasKind::Overconfidence, 1.0)]);
        let c = build(&bias, &BTreeMap::new(), &universe, &ConstraintOverrides::default()).unwrap();
        // 0.4 * 0.5 = 0.2, floored at 1/3
        assert!((c.max_weight_per_asset - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_herding_adds_penalties() {
        let universe = assets(&["A", "B"]);
        let bias = scores(&[(BiasKind::HerdingBehavior, 0.8)]);
        let c = build(&bias, &BTreeMap::new(), &universe, &ConstraintOverrides::default()).unwrap();
        assert!((c.behavioral_penalty_weight - 0.25).abs() < 1e-12);
        assert!((c.diversification_penalty_weight - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_crowded_trade_capped_when_herding() {
        let universe = assets(&["A", "B", "C", "D", "E"]);
        let bias = scores(&[(BiasKind::HerdingBehavior, 1.0)]);
        let mut sentiment = BTreeMap::new();
        sentiment.insert(
            "A".to_string(),
            SentimentSummary {
                sentiment_score: 0.8,
                confidence: 0.9,
                volume_mentions: 800,
                sources: BTreeMap::new(),
            },
        );
        let c = build(&bias, &sentiment, &universe, &ConstraintOverrides::default()).unwrap();
        assert!((c.upper_bound("A") - 0.2).abs() < 1e-12);
        assert_eq!(c.upper_bound("B"), 0.4);
    }

    #[test]
    fn test_negative_sentiment_caps_asset() {
        let universe = assets(&["A", "B", "C", "D", "E"]);
        let mut sentiment = BTreeMap::new();
        sentiment.insert(
            "B".to_string(),
            SentimentSummary {
                sentiment_score: -0.6,
                confidence: 0.7,
                volume_mentions: 12,
                sources: BTreeMap::new(),
            },
        );
        sentiment.insert(
            "C".to_string(),
            SentimentSummary {
                sentiment_score: -0.9,
                confidence: 0.2,
                volume_mentions: 3,
                sources: BTreeMap::new(),
            },
        );
        let c = build(
            &BiasScoreSet::default(),
            &sentiment,
            &universe,
            &ConstraintOverrides::default(),
        )
        .unwrap();
        // 0.4 * (1 - 0.5 * 0.6)
        assert!((c.upper_bound("B") - 0.28).abs() < 1e-12);
        // low confidence is ignored
        assert_eq!(c.upper_bound("C"), 0.4);
        assert!(c
            .derivations
            .iter()
            .any(|d| d.source == DerivationSource::Sentiment && d.asset.as_deref() == Some("B")));
    }

    #[test]
    fn test_regret_aversion_sets_floor() {
        let universe = assets(&["A", "B"]);
        let bias = scores(&[(BiasKind::RegretAversion, 0.9)]);
        let c = build(&bias, &BTreeMap::new(), &universe, &ConstraintOverrides::default()).unwrap();
        assert_eq!(c.min_weight_per_asset, 0.02);
    }

    #[test]
    fn test_recency_and_anchoring_shrink_returns() {
        let universe = assets(&["A", "B"]);
        let bias = scores(&[(BiasKind::RecencyBias, 1.0), (BiasKind::AnchoringBias, 1.0)]);
        let c = build(&bias, &BTreeMap::new(), &universe, &ConstraintOverrides::default()).unwrap();
        assert_eq!(c.expected_return_shrinkage, 1.0);
    }

    #[test]
    fn test_overrides_take_precedence() {
        let universe = assets(&["A", "B", "C"]);
        let bias = scores(&[(BiasKind::LossAversion, 1.0)]);
        let overrides = ConstraintOverrides {
            max_turnover: Some(0.9),
            max_weight_per_asset: Some(0.6),
            target_volatility: Some(0.15),
            ..Default::default()
        };
        let c = build(&bias, &BTreeMap::new(), &universe, &overrides).unwrap();
        assert_eq!(c.max_turnover, 0.9);
        assert_eq!(c.max_weight_per_asset, 0.6);
        assert_eq!(c.target_volatility, Some(0.15));
        let target = c
            .derivations
            .iter()
            .find(|d| d.constraint == ConstraintKind::TargetVolatility)
            .unwrap();
        assert_eq!(target.source, DerivationSource::UserOverride);
        assert_eq!(target.from, None);
        assert_eq!(target.to, 0.15);
        assert!(c
            .derivations
            .iter()
            .any(|d| d.source == DerivationSource::UserOverride && d.constraint == ConstraintKind::MaxTurnover));
    }

    #[test]
    fn test_invalid_overrides_rejected() {
        let universe = assets(&["A", "B"]);
        let cases = [
            ConstraintOverrides {
                max_weight_per_asset: Some(1.5),
                ..Default::default()
            },
            ConstraintOverrides {
                max_weight_per_asset: Some(0.0),
                ..Default::default()
            },
            ConstraintOverrides {
                min_weight_per_asset: Some(-0.1),
                ..Default::default()
            },
            ConstraintOverrides {
                max_turnover: Some(-0.1),
                ..Default::default()
            },
            ConstraintOverrides {
                target_volatility: Some(0.0),
                ..Default::default()
            },
            ConstraintOverrides {
                min_weight_per_asset: Some(0.5),
                max_weight_per_asset: Some(0.3),
                ..Default::default()
            },
            ConstraintOverrides {
                behavioral_penalty_weight: Some(f64::NAN),
                ..Default::default()
            },
        ];
        for overrides in cases {
            let err = build(&BiasScoreSet::default(), &BTreeMap::new(), &universe, &overrides)
                .unwrap_err();
            assert_eq!(err.kind(), "invalid_constraint", "{:?}", overrides);
        }
    }

    #[test]
    fn test_short_selling_relaxes_min_weight_bound() {
        let universe = assets(&["A", "B"]);
        let overrides = ConstraintOverrides {
            min_weight_per_asset: Some(-0.2),
            allow_short: Some(true),
            ..Default::default()
        };
        let c = build(&BiasScoreSet::default(), &BTreeMap::new(), &universe, &overrides).unwrap();
        assert_eq!(c.min_weight_per_asset, -0.2);
        assert!(c.allow_short);
    }

    #[test]
    fn test_deterministic() {
        let universe = assets(&["A", "B", "C"]);
        let bias = scores(&[
            (BiasKind::DispositionEffect, 0.9),
            (BiasKind::HerdingBehavior, 0.8),
        ]);
        let a = build(&bias, &BTreeMap::new(), &universe, &ConstraintOverrides::default()).unwrap();
        let b = build(&bias, &BTreeMap::new(), &universe, &ConstraintOverrides::default()).unwrap();
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }
}
