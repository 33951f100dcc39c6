//! End-to-end tests through the engine

#[cfg(test)]
mod tests {
    use crate::bias::BiasKind;
    use crate::config::{Config, SentimentConfig};
    use crate::constraints::DerivationSource;
    use crate::engine::{Engine, OptimizationRequest};
    use crate::error::{ConstraintKind, EngineError};
    use crate::sentiment::aggregate_sentiment;
    use crate::types::{PortfolioState, PriceBar, Side, Trade};
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap;

    fn day(n: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap() + Duration::days(n)
    }

    fn linear_bars(start: Decimal, step: Decimal, count: i64) -> Vec<PriceBar> {
        (0..count)
            .map(|i| {
                let close = start + step * Decimal::from(i);
                PriceBar {
                    timestamp: day(i),
                    open: close,
                    high: close,
                    low: close,
                    close,
                    volume: dec!(500),
                }
            })
            .collect()
    }

    fn trade(symbol: &str, side: Side, quantity: Decimal, price: Decimal, at: i64) -> Trade {
        Trade {
            symbol: symbol.to_string(),
            side,
            quantity,
            price,
            timestamp: day(at),
        }
    }

    /// Three assets, per-period expected returns 1% / 2% / 1.5%,
    /// variance 0.0004 and covariance 0.0001
    const SCENARIO: &str = r#"{
        "portfolio_id": "demo",
        "assets": ["A", "B", "C"],
        "method": "behavioral_mvo",
        "current_weights": {"A": 0.33, "B": 0.33, "C": 0.34},
        "expected_returns": {"A": 0.01, "B": 0.02, "C": 0.015},
        "covariance": [
            [0.0004, 0.0001, 0.0001],
            [0.0001, 0.0004, 0.0001],
            [0.0001, 0.0001, 0.0004]
        ],
        "bias_scores": {"disposition_effect": 0.65, "loss_aversion": 0.72}
    }"#;

    #[test]
    fn test_disposition_and_loss_aversion_scenario() {
        let request: OptimizationRequest = serde_json::from_str(SCENARIO).unwrap();
        let result = Engine::new(Config::default()).optimize(&request).unwrap();

        let expected_limit = 0.5 * (1.0 - 0.5 * 0.125) * (1.0 - 0.5 * 0.3);
        let final_limit = result
            .derivations
            .iter()
            .filter(|d| d.constraint == ConstraintKind::MaxTurnover)
            .map(|d| d.to)
            .last()
            .unwrap();
        assert!((final_limit - expected_limit).abs() < 1e-12);
        assert!(final_limit < 0.5);
        assert!(result.turnover <= final_limit + 1e-9);

        assert!(result.rationale.contains("disposition effect"));
        assert!(result.rationale.contains("loss aversion"));

        let total: f64 = result.recommended_weights.weights.values().sum();
        assert!((total - 1.0).abs() < 1e-6);
        for w in result.recommended_weights.weights.values() {
            assert!(*w >= 0.0 && *w <= 0.4 + 1e-9);
        }
        // highest-return asset is held at its cap
        assert!((result.recommended_weights.weight("B") - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_optimization_output_is_byte_identical() {
        let request: OptimizationRequest = serde_json::from_str(SCENARIO).unwrap();
        let engine = Engine::default();
        let first = serde_json::to_string(&engine.optimize(&request).unwrap()).unwrap();
        for _ in 0..3 {
            let again = serde_json::to_string(&engine.optimize(&request).unwrap()).unwrap();
            assert_eq!(first, again);
        }
    }

    #[test]
    fn test_symbol_without_signals_is_neutral() {
        let summary = aggregate_sentiment(&[], day(0), &SentimentConfig::default()).unwrap();
        assert_eq!(summary.sentiment_score, 0.0);
        assert_eq!(summary.confidence, 0.0);
        assert_eq!(summary.volume_mentions, 0);
    }

    #[test]
    fn test_single_observation_is_shrunk_and_solved() {
        let mut price_history = BTreeMap::new();
        price_history.insert("A".to_string(), linear_bars(dec!(100), dec!(1), 2));
        price_history.insert("B".to_string(), linear_bars(dec!(50), dec!(1), 2));
        price_history.insert("C".to_string(), linear_bars(dec!(20), dec!(-1), 2));
        let request = OptimizationRequest {
            portfolio_id: "thin".to_string(),
            assets: vec!["A".to_string(), "B".to_string(), "C".to_string()],
            method: "behavioral_mvo".to_string(),
            price_history,
            ..Default::default()
        };

        let result = Engine::default().optimize(&request).unwrap();
        assert_eq!(result.constraint_activations[0], "covariance_shrinkage");
        let total: f64 = result.recommended_weights.weights.values().sum();
        assert!((total - 1.0).abs() < 1e-6);
        assert!(result.expected_risk > 0.0);
    }

    #[test]
    fn test_frozen_portfolio_above_cap_is_infeasible() {
        let mut request: OptimizationRequest = serde_json::from_str(SCENARIO).unwrap();
        request.bias_scores = None;
        request.current_weights = PortfolioState::new(
            [("A", 0.6), ("B", 0.2), ("C", 0.2)]
                .iter()
                .map(|(s, w)| (s.to_string(), *w))
                .collect(),
        );
        request.constraints = Some(crate::constraints::ConstraintOverrides {
            max_turnover: Some(0.0),
            ..Default::default()
        });

        match Engine::default().optimize(&request).unwrap_err() {
            EngineError::InfeasibleConstraints { conflicts } => {
                assert_eq!(conflicts.len(), 1);
                assert_eq!(conflicts[0].asset.as_deref(), Some("A"));
                assert!(conflicts[0].constraints.contains(&ConstraintKind::MaxTurnover));
                assert!(conflicts[0].constraints.contains(&ConstraintKind::MaxWeightPerAsset));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_trade_history_drives_constraints() {
        let mut price_history = BTreeMap::new();
        price_history.insert("A".to_string(), linear_bars(dec!(100), dec!(2), 11));
        price_history.insert("B".to_string(), linear_bars(dec!(100), dec!(-2), 11));
        price_history.insert("C".to_string(), linear_bars(dec!(40), dec!(0.5), 11));

        let request = OptimizationRequest {
            portfolio_id: "history".to_string(),
            assets: vec!["A".to_string(), "B".to_string(), "C".to_string()],
            method: "behavioral_mvo".to_string(),
            current_weights: PortfolioState::equal_weight(&[
                "A".to_string(),
                "B".to_string(),
                "C".to_string(),
            ]),
            price_history,
            trade_history: vec![
                trade("A", Side::Buy, dec!(10), dec!(100), 0),
                trade("B", Side::Buy, dec!(10), dec!(100), 0),
                trade("A", Side::Sell, dec!(10), dec!(120), 10),
            ],
            ..Default::default()
        };

        let result = Engine::default().optimize(&request).unwrap();
        let disposition: Vec<_> = result
            .derivations
            .iter()
            .filter(|d| d.source == DerivationSource::Bias(BiasKind::DispositionEffect))
            .collect();
        assert_eq!(disposition.len(), 1);
        assert_eq!(disposition[0].constraint, ConstraintKind::MaxTurnover);
        assert!((disposition[0].to - 0.25).abs() < 1e-12);
        assert!(result.rationale.contains("disposition effect (1.00)"));
    }

    #[test]
    fn test_black_litterman_with_sentiment_summary() {
        let mut request: OptimizationRequest = serde_json::from_str(SCENARIO).unwrap();
        request.method = "black_litterman".to_string();
        request.bias_scores = None;
        request.current_weights = PortfolioState::default();
        request.sentiment.insert(
            "A".to_string(),
            serde_json::from_str(r#"{"sentiment_score": 0.9, "confidence": 0.8, "volume_mentions": 20}"#)
                .unwrap(),
        );

        let result = Engine::default().optimize(&request).unwrap();
        assert_eq!(result.method, "black_litterman");
        let a = result.recommended_weights.weight("A");
        assert!(a > result.recommended_weights.weight("B"));
        assert!(a > result.recommended_weights.weight("C"));
    }
}
