//! Point-in-time check of a trade about to be placed

use crate::types::Side;
use serde::{Deserialize, Serialize};

/// Move (in percent) both the market and the stock must exceed
const MOVE_THRESHOLD_PCT: f64 = 5.0;
/// Market move (in percent) that maps to full severity
const FULL_SEVERITY_PCT: f64 = 20.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeIntent {
    pub symbol: String,
    #[serde(alias = "action")]
    pub side: Side,
}

/// Recent moves in percent; negative is down
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketConditions {
    #[serde(default)]
    pub market_change_pct: f64,
    #[serde(default)]
    pub stock_change_pct: f64,
    #[serde(default)]
    pub sentiment_score: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    PanicSelling,
    FomoBuying,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehavioralAlert {
    pub kind: AlertKind,
    pub symbol: String,
    /// 0 to 1
    pub severity: f64,
    pub market_change_pct: f64,
    pub stock_change_pct: f64,
    /// News sentiment at the time of the trade, when supplied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentiment_score: Option<f64>,
    pub message: String,
}

/// Flag panic selling into a falling market or FOMO buying into a rising one
pub fn assess_trade(intent: &TradeIntent, conditions: &MarketConditions) -> Option<BehavioralAlert> {
    let market = conditions.market_change_pct;
    let stock = conditions.stock_change_pct;

    let kind = match intent.side {
        Side::Sell if market < -MOVE_THRESHOLD_PCT && stock < -MOVE_THRESHOLD_PCT => {
            AlertKind::PanicSelling
        }
        Side::Buy if market > MOVE_THRESHOLD_PCT && stock > MOVE_THRESHOLD_PCT => {
            AlertKind::FomoBuying
        }
        _ => return None,
    };

    let severity = (market.abs() / FULL_SEVERITY_PCT).min(1.0);
    let sentiment_score = conditions.sentiment_score.filter(|s| s.is_finite());
    let mut message = match kind {
        AlertKind::PanicSelling => format!(
            "Selling {} after a {:.1}% market drop and {:.1}% stock drop may be panic selling",
            intent.symbol, market, stock
        ),
        AlertKind::FomoBuying => format!(
            "Buying {} after a {:.1}% market rally and {:.1}% stock gain may be FOMO buying",
            intent.symbol, market, stock
        ),
    };
    if let Some(score) = sentiment_score {
        message.push_str(&format!(" (news sentiment {:+.2})", score));
    }

    tracing::info!(symbol = %intent.symbol, ?kind, severity, "Behavioral alert raised");

    Some(BehavioralAlert {
        kind,
        symbol: intent.symbol.clone(),
        severity,
        market_change_pct: market,
        stock_change_pct: stock,
        sentiment_score,
        message,
    })
}
