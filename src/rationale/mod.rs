//! # Rationale
//!
//! Plain-language explanation of an optimization: which biases drove the
//! limits, how far each limit moved, and what that did to concentration
//! and turnover. Output depends only on its inputs.


use crate::bias::{BiasKind, BiasScoreSet};
use crate::constraints::{ConstraintDerivation, DerivationSource, OptimizationConstraints};
use crate::portfolio::OptimizedPortfolio;
use std::fmt::Write;

/// Most biases named in one explanation
const MAX_EXPLAINED_BIASES: usize = 2;

/// Explain `result` in terms of the biases above `threshold`
pub fn explain(
    bias_scores: &BiasScoreSet,
    constraints: &OptimizationConstraints,
    result: &OptimizedPortfolio,
    threshold: f64,
) -> String {
    let dominant: Vec<(BiasKind, f64)> = bias_scores
        .ranked_above(threshold)
        .into_iter()
        .take(MAX_EXPLAINED_BIASES)
        .collect();

    let mut text = String::new();
    if dominant.is_empty() {
        let _ = write!(
            text,
            "No behavioral bias scored above {:.2}, so the behavioral limits stayed at their defaults.",
            threshold
        );
    } else {
        let names: Vec<String> = dominant
            .iter()
            .map(|(kind, score)| format!("{} ({:.2})", kind.label(), score))
            .collect();
        let _ = write!(text, "Dominant biases: {}.", names.join(" and "));

        for (kind, _) in &dominant {
            let derivations = constraints.derived_from(*kind);
            if derivations.is_empty() {
                let _ = write!(text, " {} did not move any limit.", capitalize(kind.label()));
                continue;
            }
            let changes: Vec<String> = derivations.iter().map(|d| describe(d)).collect();
            let _ = write!(
                text,
                " {} {}.",
                capitalize(kind.label()),
                changes.join(", ")
            );
        }
    }

    let sentiment = count_source(constraints, &DerivationSource::Sentiment);
    if sentiment > 0 {
        let _ = write!(text, " Sentiment capped {} position limit(s).", sentiment);
    }
    let floored = count_source(constraints, &DerivationSource::Universe);
    if floored > 0 {
        let _ = write!(
            text,
            " The position cap was raised to {:.1}% so {} asset(s) can hold the whole budget.",
            constraints.max_weight_per_asset * 100.0,
            result.weights.len()
        );
    }
    let overrides = count_source(constraints, &DerivationSource::UserOverride);
    if overrides > 0 {
        let _ = write!(text, " {} limit(s) were set explicitly by the caller.", overrides);
    }

    let largest = result
        .weights
        .iter()
        .fold(None::<(&String, f64)>, |best, (symbol, w)| match best {
            Some((_, b)) if b >= *w => best,
            _ => Some((symbol, *w)),
        });
    let _ = write!(text, " Net effect:");
    if let Some((symbol, weight)) = largest {
        let _ = write!(
            text,
            " the largest position is {} at {:.1}% (cap {:.1}%), effective number of holdings {:.2},",
            symbol,
            weight * 100.0,
            constraints.upper_bound(symbol) * 100.0,
            result.effective_n
        );
    }
    match result.turnover_limit {
        Some(limit) => {
            let _ = write!(
                text,
                " turnover {:.1}% against a limit of {:.1}%.",
                result.turnover * 100.0,
                limit * 100.0
            );
        }
        None => {
            let _ = write!(
                text,
                " turnover {:.1}%, starting from cash with no turnover limit.",
                result.turnover * 100.0
            );
        }
    }

    let binding: Vec<&str> = result
        .constraint_activations
        .iter()
        .map(String::as_str)
        .collect();
    if !binding.is_empty() {
        let _ = write!(text, " Active: {}.", binding.join(", "));
    }

    text
}

fn describe(derivation: &ConstraintDerivation) -> String {
    let target = match &derivation.asset {
        Some(asset) => format!("{} for {}", derivation.constraint.as_str(), asset),
        None => derivation.constraint.as_str().to_string(),
    };
    match derivation.from {
        Some(from) => {
            let verb = if derivation.to < from { "tightened" } else { "raised" };
            format!("{} {} from {:.4} to {:.4}", verb, target, from, derivation.to)
        }
        None => format!("set {} to {:.4}", target, derivation.to),
    }
}

fn count_source(constraints: &OptimizationConstraints, source: &DerivationSource) -> usize {
    constraints
        .derivations
        .iter()
        .filter(|d| &d.source == source)
        .count()
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
