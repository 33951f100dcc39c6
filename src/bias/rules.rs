//! Bias rules
//!
//! Each rule is a pure function of the replayed ledger and market context.
//! A rule returns `(score, evidence)` when it has enough observations and
//! `None` otherwise; the caller substitutes the neutral default.

use super::ledger::Ledger;
use super::MarketContext;
use crate::config::BiasConfig;
use crate::statistics::{correlation, mean};
use crate::types::{decimal_to_f64, PortfolioSnapshot, Side};
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeSet;

/// Pairs needed before a correlation counts as evidence
pub const MIN_CORRELATION_SAMPLES: usize = 3;
/// Events needed before a ratio counts as evidence
pub const MIN_RATIO_SAMPLES: usize = 2;

pub type RuleOutput = Option<(f64, usize)>;

/// Everything a rule may look at
pub struct RuleContext<'a> {
    pub ledger: &'a Ledger,
    /// Sorted by timestamp
    pub snapshots: &'a [PortfolioSnapshot],
    pub market: &'a MarketContext,
    pub config: &'a BiasConfig,
    pub as_of: DateTime<Utc>,
}

impl RuleContext<'_> {
    /// Market close at or before `at`, else the latest traded price
    pub fn price_at(&self, symbol: &str, at: DateTime<Utc>) -> Option<f64> {
        if let Some(close) = self
            .market
            .prices
            .get(symbol)
            .and_then(|s| s.close_at_or_before(at))
        {
            return Some(close);
        }
        self.ledger
            .steps
            .iter()
            .rev()
            .find(|s| s.trade.symbol == symbol && s.trade.timestamp <= at)
            .map(|s| decimal_to_f64(s.trade.price))
    }

    fn trailing_return(&self, symbol: &str, at: DateTime<Utc>) -> Option<f64> {
        self.market
            .prices
            .get(symbol)
            .and_then(|s| s.trailing_return(at, self.config.trailing_window))
    }
}

fn correlation_score(pairs: &[(f64, f64)]) -> RuleOutput {
    if pairs.len() < MIN_CORRELATION_SAMPLES {
        return None;
    }
    let (xs, ys): (Vec<f64>, Vec<f64>) = pairs.iter().copied().unzip();
    correlation(&xs, &ys).map(|rho| ((rho + 1.0) / 2.0, pairs.len()))
}

/// Odean's proportion of gains realized vs proportion of losses realized
pub fn disposition_effect(ctx: &RuleContext) -> RuleOutput {
    let (mut realized_gains, mut realized_losses) = (0usize, 0usize);
    let (mut paper_gains, mut paper_losses) = (0usize, 0usize);
    let mut sells = 0usize;

    for step in &ctx.ledger.steps {
        let Some(realization) = &step.realization else {
            continue;
        };
        sells += 1;
        if realization.realized_return > 0.0 {
            realized_gains += 1;
        } else if realization.realized_return < 0.0 {
            realized_losses += 1;
        }

        let at = step.trade.timestamp;
        for (symbol, position) in &step.holdings_before {
            if *symbol == step.trade.symbol {
                continue;
            }
            let (Some(cost), Some(price)) = (position.avg_cost(), ctx.price_at(symbol, at)) else {
                continue;
            };
            let cost = decimal_to_f64(cost);
            if price > cost {
                paper_gains += 1;
            } else if price < cost {
                paper_losses += 1;
            }
        }
    }

    let gain_events = realized_gains + paper_gains;
    let loss_events = realized_losses + paper_losses;
    if sells == 0 || gain_events == 0 || loss_events == 0 {
        return None;
    }
    let pgr = realized_gains as f64 / gain_events as f64;
    let plr = realized_losses as f64 / loss_events as f64;
    Some((0.5 + (pgr - plr) / 2.0, sells))
}

/// Losers held longer than winners
pub fn loss_aversion(ctx: &RuleContext) -> RuleOutput {
    let mut loser_days = Vec::new();
    let mut winner_days = Vec::new();

    for (symbol, position) in &ctx.ledger.positions {
        let (Some(cost), Some(price)) = (position.avg_cost(), ctx.price_at(symbol, ctx.as_of)) else {
            continue;
        };
        let cost = decimal_to_f64(cost);
        let age = position.holding_days(ctx.as_of);
        if price < cost {
            loser_days.push(age);
        } else if price > cost {
            winner_days.push(age);
        }
    }

    if loser_days.is_empty() || winner_days.is_empty() {
        loser_days.clear();
        winner_days.clear();
        for r in ctx.ledger.realizations() {
            if r.realized_return < 0.0 {
                loser_days.push(r.holding_days);
            } else if r.realized_return > 0.0 {
                winner_days.push(r.holding_days);
            }
        }
    }
    if loser_days.is_empty() || winner_days.is_empty() {
        return None;
    }

    let evidence = loser_days.len() + winner_days.len();
    let l = mean(&loser_days);
    let g = mean(&winner_days);
    if l + g <= 0.0 {
        return Some((0.5, evidence));
    }
    Some((l / (l + g), evidence))
}

/// Trading frequency against the peer baseline
pub fn overconfidence(ctx: &RuleContext) -> RuleOutput {
    let steps = &ctx.ledger.steps;
    if steps.len() < MIN_RATIO_SAMPLES || !(ctx.config.benchmark_trades_per_month > 0.0) {
        return None;
    }
    let first = steps.first()?.trade.timestamp;
    let last = steps.last()?.trade.timestamp;
    let span_days = ((last - first).num_seconds() as f64 / 86_400.0).max(30.0);
    let per_month = steps.len() as f64 / span_days * 30.0;
    let r = per_month / ctx.config.benchmark_trades_per_month;
    Some((r / (1.0 + r), steps.len()))
}

/// Allocation changes chasing trailing returns
pub fn recency_bias(ctx: &RuleContext) -> RuleOutput {
    let mut pairs = Vec::new();
    for window in ctx.snapshots.windows(2) {
        let (before, after) = (&window[0], &window[1]);
        let symbols: BTreeSet<&String> = before.weights.keys().chain(after.weights.keys()).collect();
        for symbol in symbols {
            let Some(trailing) = ctx.trailing_return(symbol, before.timestamp) else {
                continue;
            };
            let change = after.weights.get(symbol).copied().unwrap_or(0.0)
                - before.weights.get(symbol).copied().unwrap_or(0.0);
            pairs.push((trailing, change));
        }
    }

    if let Some(output) = correlation_score(&pairs) {
        return Some(output);
    }

    let pairs: Vec<(f64, f64)> = ctx
        .ledger
        .steps
        .iter()
        .filter_map(|s| {
            ctx.trailing_return(&s.trade.symbol, s.trade.timestamp)
                .map(|r| (r, s.trade.side.direction()))
        })
        .collect();
    correlation_score(&pairs)
}

/// Trading with the market flow
pub fn herding_behavior(ctx: &RuleContext) -> RuleOutput {
    let benchmark = &ctx.market.benchmark_returns;
    let pairs: Vec<(f64, f64)> = ctx
        .ledger
        .steps
        .iter()
        .filter_map(|s| {
            let idx = benchmark.partition_point(|b| b.timestamp <= s.trade.timestamp);
            idx.checked_sub(1)
                .map(|i| (s.trade.side.direction(), benchmark[i].value))
        })
        .collect();
    correlation_score(&pairs)
}

/// Adding to winners on the back of agreeable news
pub fn confirmation_bias(ctx: &RuleContext) -> RuleOutput {
    let window = Duration::hours(ctx.config.sentiment_window_hours);
    let mut add_ons = 0usize;
    let mut confirmed = 0usize;

    for step in &ctx.ledger.steps {
        if step.trade.side != Side::Buy {
            continue;
        }
        let Some(cost) = step.position_before().and_then(|p| p.avg_cost()) else {
            continue;
        };
        if step.trade.price <= cost {
            continue;
        }
        add_ons += 1;

        let at = step.trade.timestamp;
        let agreed = match ctx.market.sentiment.get(&step.trade.symbol) {
            Some(signals) if !signals.is_empty() => signals
                .iter()
                .any(|s| s.timestamp > at - window && s.timestamp <= at && s.score > 0.0),
            _ => ctx
                .trailing_return(&step.trade.symbol, at)
                .is_some_and(|r| r > 0.0),
        };
        if agreed {
            confirmed += 1;
        }
    }

    if add_ons < MIN_RATIO_SAMPLES {
        return None;
    }
    Some((confirmed as f64 / add_ons as f64, add_ons))
}

/// Trades clustered at the trailing high or low
pub fn anchoring_bias(ctx: &RuleContext) -> RuleOutput {
    let lookback = Duration::days(ctx.config.anchoring_lookback_days);
    let proximity: Vec<f64> = ctx
        .ledger
        .steps
        .iter()
        .filter_map(|s| {
            let series = ctx.market.prices.get(&s.trade.symbol)?;
            let at = s.trade.timestamp;
            let (high, low) = series.range_between(at - lookback, at)?;
            if high - low <= 0.0 {
                return None;
            }
            let p = ((decimal_to_f64(s.trade.price) - low) / (high - low)).clamp(0.0, 1.0);
            Some((2.0 * p - 1.0).abs())
        })
        .collect();

    if proximity.len() < MIN_RATIO_SAMPLES {
        return None;
    }
    Some((mean(&proximity), proximity.len()))
}

/// Avoiding positions that previously lost money
pub fn regret_aversion(ctx: &RuleContext) -> RuleOutput {
    let window = Duration::days(ctx.config.reentry_window_days);
    let (mut loss_exits, mut loss_reentries) = (0usize, 0usize);
    let (mut gain_exits, mut gain_reentries) = (0usize, 0usize);

    for exit in ctx.ledger.realizations().filter(|r| r.exits_position) {
        let reentered = ctx.ledger.steps.iter().any(|s| {
            s.trade.side == Side::Buy
                && s.trade.symbol == exit.symbol
                && s.trade.timestamp > exit.closed
                && s.trade.timestamp <= exit.closed + window
        });
        if exit.realized_return < 0.0 {
            loss_exits += 1;
            loss_reentries += reentered as usize;
        } else if exit.realized_return > 0.0 {
            gain_exits += 1;
            gain_reentries += reentered as usize;
        }
    }

    if loss_exits == 0 {
        return None;
    }
    let rate_loss = loss_reentries as f64 / loss_exits as f64;
    let rate_gain = if gain_exits > 0 {
        gain_reentries as f64 / gain_exits as f64
    } else {
        0.5
    };
    Some((0.5 + (rate_gain - rate_loss) / 2.0, loss_exits + gain_exits))
}
