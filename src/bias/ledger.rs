//! Trade replay through an average-cost ledger
//!
//! Lots are kept FIFO so holding durations can be measured; gains and
//! losses are judged against the position's average cost.

use crate::error::{EngineError, Result};
use crate::types::{decimal_to_f64, Side, Trade};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, VecDeque};

#[derive(Debug, Clone, PartialEq)]
pub struct Lot {
    pub quantity: Decimal,
    pub price: Decimal,
    pub opened: DateTime<Utc>,
}

/// Open lots for one symbol
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Position {
    pub lots: VecDeque<Lot>,
}

impl Position {
    pub fn quantity(&self) -> Decimal {
        self.lots
            .iter()
            .fold(Decimal::ZERO, |acc, l| acc.saturating_add(l.quantity))
    }

    fn checked_quantity(&self) -> Option<Decimal> {
        self.lots
            .iter()
            .try_fold(Decimal::ZERO, |acc, l| acc.checked_add(l.quantity))
    }

    /// Cost basis of the open lots; `None` past the decimal range
    fn checked_cost(&self) -> Option<Decimal> {
        self.lots
            .iter()
            .try_fold(Decimal::ZERO, |acc, l| acc.checked_add(l.quantity.checked_mul(l.price)?))
    }

    pub fn is_open(&self) -> bool {
        self.quantity() > Decimal::ZERO
    }

    pub fn avg_cost(&self) -> Option<Decimal> {
        let qty = self.quantity();
        if qty <= Decimal::ZERO {
            return None;
        }
        self.checked_cost()?.checked_div(qty)
    }

    /// Quantity-weighted age of the open lots, in days
    pub fn holding_days(&self, at: DateTime<Utc>) -> f64 {
        let qty = decimal_to_f64(self.quantity());
        if qty <= 0.0 {
            return 0.0;
        }
        self.lots
            .iter()
            .map(|l| decimal_to_f64(l.quantity) * days_between(l.opened, at))
            .sum::<f64>()
            / qty
    }

    /// Consume `quantity` FIFO; returns the matched quantity and its weighted age
    fn consume(&mut self, quantity: Decimal, at: DateTime<Utc>) -> (Decimal, f64) {
        let mut remaining = quantity;
        let mut matched = Decimal::ZERO;
        let mut weighted_days = 0.0;

        while remaining > Decimal::ZERO {
            let Some(front) = self.lots.front_mut() else {
                break;
            };
            let take = remaining.min(front.quantity);
            weighted_days += decimal_to_f64(take) * days_between(front.opened, at);
            front.quantity -= take;
            remaining -= take;
            matched += take;
            if front.quantity <= Decimal::ZERO {
                self.lots.pop_front();
            }
        }

        let matched_f = decimal_to_f64(matched);
        let age = if matched_f > 0.0 {
            weighted_days / matched_f
        } else {
            0.0
        };
        (matched, age)
    }
}

fn days_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_seconds().max(0) as f64 / 86_400.0
}

/// A sell matched against open lots
#[derive(Debug, Clone, PartialEq)]
pub struct Realization {
    pub symbol: String,
    pub closed: DateTime<Utc>,
    /// Sale price over average cost, minus one
    pub realized_return: f64,
    pub holding_days: f64,
    /// The sell emptied the position
    pub exits_position: bool,
}

/// Ledger state observed just before one trade was applied
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayStep {
    pub trade: Trade,
    /// Open positions before the trade, by symbol
    pub holdings_before: BTreeMap<String, Position>,
    /// Set for sells that matched open lots
    pub realization: Option<Realization>,
}

impl ReplayStep {
    pub fn position_before(&self) -> Option<&Position> {
        self.holdings_before.get(&self.trade.symbol)
    }
}

/// Full replay result
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ledger {
    pub steps: Vec<ReplayStep>,
    /// Open positions after the last trade
    pub positions: BTreeMap<String, Position>,
    /// Sells with no matching open quantity
    pub unmatched_sells: usize,
}

impl Ledger {
    /// Replay trades in timestamp order (ties keep input order)
    ///
    /// Fails when a position's size or cost basis leaves the decimal range.
    pub fn replay(trades: &[Trade]) -> Result<Self> {
        let mut ordered: Vec<(usize, &Trade)> = trades.iter().enumerate().collect();
        ordered.sort_by_key(|(_, t)| t.timestamp);

        let mut ledger = Ledger::default();
        for (index, trade) in ordered {
            let out_of_range = || {
                EngineError::invalid_parameter(
                    format!("trade_history[{}]", index),
                    "position size or cost exceeds the decimal range",
                )
            };
            let holdings_before = ledger.positions.clone();
            let mut realization = None;

            match trade.side {
                Side::Buy => {
                    let position = ledger.positions.entry(trade.symbol.clone()).or_default();
                    position.lots.push_back(Lot {
                        quantity: trade.quantity,
                        price: trade.price,
                        opened: trade.timestamp,
                    });
                    if position.checked_quantity().is_none() || position.checked_cost().is_none() {
                        return Err(out_of_range());
                    }
                }
                Side::Sell => {
                    let position = ledger.positions.entry(trade.symbol.clone()).or_default();
                    let avg_cost = position.avg_cost();
                    let (matched, holding_days) = position.consume(trade.quantity, trade.timestamp);

                    match avg_cost {
                        Some(cost) if matched > Decimal::ZERO && cost > Decimal::ZERO => {
                            let ratio = trade.price.checked_div(cost).ok_or_else(out_of_range)?;
                            realization = Some(Realization {
                                symbol: trade.symbol.clone(),
                                closed: trade.timestamp,
                                realized_return: decimal_to_f64(ratio) - 1.0,
                                holding_days,
                                exits_position: !position.is_open(),
                            });
                        }
                        _ => {
                            ledger.unmatched_sells += 1;
                        }
                    }
                    if matched < trade.quantity {
                        tracing::debug!(
                            symbol = %trade.symbol,
                            requested = %trade.quantity,
                            matched = %matched,
                            "Sell exceeds open quantity, excess ignored"
                        );
                    }
                }
            }

            ledger.positions.retain(|_, p| p.is_open());
            ledger.steps.push(ReplayStep {
                trade: trade.clone(),
                holdings_before,
                realization,
            });
        }
        Ok(ledger)
    }

    pub fn realizations(&self) -> impl Iterator<Item = &Realization> {
        self.steps.iter().filter_map(|s| s.realization.as_ref())
    }
}
