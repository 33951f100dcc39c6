//! Tests for the request pipeline

#[cfg(test)]
mod tests {
    use super::super::*;
    use crate::constraints::DerivationSource;
    use crate::error::ConstraintKind;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use rust_decimal::Decimal;

    fn symbols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn weights(values: &[(&str, f64)]) -> PortfolioState {
        PortfolioState::new(values.iter().map(|(s, w)| (s.to_string(), *w)).collect())
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap()
    }

    fn bars(closes: &[i64]) -> Vec<PriceBar> {
        closes
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let close = Decimal::from(*c);
                PriceBar {
                    timestamp: start() + ChronoDuration::days(i as i64),
                    open: close,
                    high: close,
                    low: close,
                    close,
                    volume: Decimal::from(1_000),
                }
            })
            .collect()
    }

    /// Three assets, per-period returns 1% / 2% / 1.5%, mild positive correlation
    fn model_request() -> OptimizationRequest {
        OptimizationRequest {
            portfolio_id: "pf-1".to_string(),
            assets: symbols(&["A", "B", "C"]),
            method: "behavioral_mvo".to_string(),
            current_weights: weights(&[("A", 0.33), ("B", 0.33), ("C", 0.34)]),
            expected_returns: Some(
                [("A", 0.01), ("B", 0.02), ("C", 0.015)]
                    .iter()
                    .map(|(s, r)| (s.to_string(), *r))
                    .collect(),
            ),
            covariance: Some(vec![
                vec![0.0004, 0.0001, 0.0001],
                vec![0.0001, 0.0004, 0.0001],
                vec![0.0001, 0.0001, 0.0004],
            ]),
            ..Default::default()
        }
    }

    fn price_request() -> OptimizationRequest {
        let mut price_history = BTreeMap::new();
        price_history.insert("A".to_string(), bars(&[100, 101, 103, 102, 104, 106, 105, 108]));
        price_history.insert("B".to_string(), bars(&[50, 51, 50, 52, 53, 52, 54, 55]));
        price_history.insert("C".to_string(), bars(&[20, 20, 21, 21, 20, 22, 21, 22]));
        OptimizationRequest {
            portfolio_id: "pf-2".to_string(),
            assets: symbols(&["A", "B", "C"]),
            method: "behavioral_mvo".to_string(),
            current_weights: weights(&[("A", 0.4), ("B", 0.3), ("C", 0.3)]),
            price_history,
            ..Default::default()
        }
    }

    #[test]
    fn test_biases_tighten_turnover_and_are_explained() {
        let mut request = model_request();
        request.bias_scores = Some(
            [(BiasKind::DispositionEffect, 0.65), (BiasKind::LossAversion, 0.72)]
                .into_iter()
                .collect(),
        );

        let result = Engine::default().optimize(&request).unwrap();

        let turnover_limit = result
            .derivations
            .iter()
            .filter(|d| d.constraint == ConstraintKind::MaxTurnover)
            .map(|d| d.to)
            .last()
            .unwrap();
        assert!(turnover_limit < 0.5);
        assert!(result.turnover <= turnover_limit + 1e-9);
        assert!(result.rationale.contains("disposition effect"));
        assert!(result.rationale.contains("loss aversion"));

        let total: f64 = result.recommended_weights.weights.values().sum();
        assert!((total - 1.0).abs() < 1e-6);
        assert!(result.recommended_weights.weights.values().all(|w| *w >= 0.0));
        assert_eq!(result.portfolio_id, "pf-1");
        assert_eq!(result.method, "behavioral_mvo");
    }

    #[test]
    fn test_two_asset_universe_with_defaults() {
        let request = OptimizationRequest {
            portfolio_id: "pair".to_string(),
            assets: symbols(&["A", "B"]),
            method: "behavioral_mvo".to_string(),
            current_weights: weights(&[("A", 0.5), ("B", 0.5)]),
            expected_returns: Some(
                [("A", 0.01), ("B", 0.02)]
                    .iter()
                    .map(|(s, r)| (s.to_string(), *r))
                    .collect(),
            ),
            covariance: Some(vec![vec![0.0004, 0.0001], vec![0.0001, 0.0004]]),
            ..Default::default()
        };

        let result = Engine::default().optimize(&request).unwrap();
        let total: f64 = result.recommended_weights.weights.values().sum();
        assert!((total - 1.0).abs() < 1e-6);
        assert!((result.recommended_weights.weight("B") - 0.5).abs() < 1e-6);
        assert!(result
            .derivations
            .iter()
            .any(|d| d.source == DerivationSource::Universe && (d.to - 0.5).abs() < 1e-12));
        assert!(result.rationale.contains("position cap was raised to 50.0%"));
    }

    #[test]
    fn test_single_asset_holds_everything() {
        let request = OptimizationRequest {
            portfolio_id: "solo".to_string(),
            assets: symbols(&["A"]),
            method: "behavioral_mvo".to_string(),
            expected_returns: Some([("A".to_string(), 0.01)].into_iter().collect()),
            covariance: Some(vec![vec![0.0004]]),
            ..Default::default()
        };

        let result = Engine::default().optimize(&request).unwrap();
        assert!((result.recommended_weights.weight("A") - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_starting_from_cash_is_explained() {
        let mut request = model_request();
        request.current_weights = PortfolioState::default();
        request.bias_scores = Some(
            [(BiasKind::DispositionEffect, 0.9), (BiasKind::LossAversion, 0.9)]
                .into_iter()
                .collect(),
        );

        let result = Engine::default().optimize(&request).unwrap();
        assert!(result.rationale.contains("starting from cash with no turnover limit"));
        assert!(!result.rationale.contains("against a limit"));
        assert!(result
            .derivations
            .iter()
            .all(|d| d.constraint != ConstraintKind::MaxTurnover));
        assert!(result
            .derivations
            .iter()
            .any(|d| d.constraint == ConstraintKind::LossAversionCoefficient));
    }

    #[test]
    fn test_unknown_method_rejected() {
        let mut request = model_request();
        request.method = "max_sharpe".to_string();
        let err = Engine::default().optimize(&request).unwrap_err();
        assert_eq!(err.kind(), "invalid_parameter");
    }

    #[test]
    fn test_empty_universe_rejected() {
        let mut request = model_request();
        request.assets.clear();
        assert_eq!(
            Engine::default().optimize(&request).unwrap_err().kind(),
            "invalid_parameter"
        );
    }

    #[test]
    fn test_duplicate_assets_rejected() {
        let mut request = model_request();
        request.assets.push("A".to_string());
        assert_eq!(
            Engine::default().optimize(&request).unwrap_err().kind(),
            "invalid_parameter"
        );
    }

    #[test]
    fn test_missing_price_history() {
        let mut request = price_request();
        request.price_history.remove("C");
        let err = Engine::default().optimize(&request).unwrap_err();
        assert_eq!(err.kind(), "insufficient_data");
    }

    #[test]
    fn test_single_bar_history() {
        let mut request = price_request();
        request.price_history.insert("C".to_string(), bars(&[20]));
        let err = Engine::default().optimize(&request).unwrap_err();
        assert_eq!(err.kind(), "insufficient_data");
    }

    #[test]
    fn test_price_history_pipeline_is_deterministic() {
        let engine = Engine::default();
        let request = price_request();
        let first = serde_json::to_string(&engine.optimize(&request).unwrap()).unwrap();
        let second = serde_json::to_string(&engine.optimize(&request).unwrap()).unwrap();
        assert_eq!(first, second);

        let result = engine.optimize(&request).unwrap();
        assert!(result.derivations.is_empty());
        assert!(result.rationale.starts_with("No behavioral bias"));
    }

    #[test]
    fn test_risk_parity_request() {
        let mut request = price_request();
        request.method = "risk_parity".to_string();
        let result = Engine::default().optimize(&request).unwrap();
        assert_eq!(result.method, "risk_parity");
        let total: f64 = result.recommended_weights.weights.values().sum();
        assert!((total - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_negative_sentiment_caps_asset() {
        let mut request = model_request();
        let as_of = start();
        request.as_of = Some(as_of);
        request.current_weights = PortfolioState::default();
        request.sentiment.insert(
            "B".to_string(),
            SentimentInput::Signals(vec![SentimentSignal {
                score: -0.8,
                confidence: 0.9,
                source: "news".to_string(),
                timestamp: as_of,
            }]),
        );

        let result = Engine::default().optimize(&request).unwrap();
        let cap = result
            .derivations
            .iter()
            .find(|d| d.source == DerivationSource::Sentiment)
            .unwrap();
        assert_eq!(cap.asset.as_deref(), Some("B"));
        assert!((cap.to - 1.0 / 3.0).abs() < 1e-12);
        assert!(result.recommended_weights.weight("B") <= 1.0 / 3.0 + 1e-9);
    }

    #[test]
    fn test_sentiment_summary_input() {
        let json = r#"{"sentiment_score": 0.4, "confidence": 0.7, "volume_mentions": 12}"#;
        let input: SentimentInput = serde_json::from_str(json).unwrap();
        assert!(matches!(input, SentimentInput::Summary(ref s) if s.volume_mentions == 12));

        let json = r#"[{"score": 0.4, "confidence": 0.7, "source": "x", "timestamp": "2024-01-02T00:00:00Z"}]"#;
        let input: SentimentInput = serde_json::from_str(json).unwrap();
        assert!(matches!(input, SentimentInput::Signals(ref s) if s.len() == 1));
    }

    #[test]
    fn test_covariance_reordered_to_sorted_assets() {
        assert_eq!(
            request_order(&symbols(&["C", "A", "B"]), &symbols(&["A", "B", "C"])).unwrap(),
            vec![1, 2, 0]
        );

        let mut request = model_request();
        request.assets = symbols(&["B", "A", "C"]);
        request.covariance = Some(vec![
            vec![0.0009, 0.0001, 0.0001],
            vec![0.0001, 0.0004, 0.0001],
            vec![0.0001, 0.0001, 0.0004],
        ]);
        let result = Engine::default().optimize(&request).unwrap();
        let rc = &result.risk_contributions;
        let vol = result.expected_risk;
        assert!((rc.values().sum::<f64>() - vol).abs() < 1e-12);
    }

    #[test]
    fn test_request_deserializes_with_defaults() {
        let json = r#"{"portfolio_id": "p", "assets": ["A", "B"]}"#;
        let request: OptimizationRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.method, "behavioral_mvo");
        assert!(request.current_weights.weights.is_empty());
        assert!(request.constraints.is_none());
    }

    #[test]
    fn test_analyze_biases_without_history() {
        let analysis = Engine::default()
            .analyze_biases(&BiasAnalysisRequest {
                user_id: "u1".to_string(),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(analysis.user_id, "u1");
        assert_eq!(analysis.scores.overall_score, 0.5);
        assert!(analysis.scores.events.is_empty());
        assert!(analysis.scores.scores.values().all(|s| !s.is_computed()));
    }

    #[test]
    fn test_sentiment_without_signals_is_neutral() {
        let report = Engine::default()
            .aggregate_sentiment(&SentimentRequest {
                symbol: "XYZ".to_string(),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(report.symbol, "XYZ");
        assert_eq!(report.summary.sentiment_score, 0.0);
        assert_eq!(report.summary.confidence, 0.0);
        assert_eq!(report.summary.volume_mentions, 0);
    }

    #[test]
    fn test_backtest_returns() {
        let summary = Engine::default()
            .backtest(&BacktestRequest {
                returns: vec![0.01, -0.02, 0.03],
                risk_free_rate: Some(0.0),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(summary.periods, 3);
        assert!((summary.total_return - (1.01 * 0.98 * 1.03 - 1.0)).abs() < 1e-12);
        assert!(summary.max_drawdown < 0.0);
    }

    #[test]
    fn test_backtest_weights() {
        let mut price_history = BTreeMap::new();
        price_history.insert("A".to_string(), bars(&[100, 110, 121]));
        price_history.insert("B".to_string(), bars(&[100, 100, 100]));
        let summary = Engine::default()
            .backtest(&BacktestRequest {
                weights: Some(weights(&[("A", 0.5), ("B", 0.5)])),
                price_history,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(summary.periods, 2);
        assert!((summary.total_return - (1.05 * 1.05 - 1.0)).abs() < 1e-12);
    }

    #[test]
    fn test_backtest_empty() {
        let err = Engine::default().backtest(&BacktestRequest::default()).unwrap_err();
        assert_eq!(err.kind(), "insufficient_data");
    }
}
