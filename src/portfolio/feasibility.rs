//! Analytic feasibility checks run before the solver
//!
//! An empty feasible region is reported with the constraints and assets that
//! cause it instead of letting the solver fail to converge.

use super::solver::FeasibleSet;
use crate::error::{ConstraintConflict, ConstraintKind, EngineError, Result};

const FEASIBILITY_TOLERANCE: f64 = 1e-9;

/// Smallest turnover any feasible allocation needs
///
/// Moves forced by the box are `mᵢ = clip(0, loᵢ - w₀ᵢ, hiᵢ - w₀ᵢ)`; whatever
/// budget gap remains after them has to be traded on top.
pub fn minimum_turnover(set: &FeasibleSet) -> f64 {
    let mut forced = 0.0;
    let mut net = 0.0;
    let mut held = 0.0;
    for i in 0..set.anchor.len() {
        let a = set.anchor[i];
        let m = 0.0_f64.max(set.lower[i] - a).min(set.upper[i] - a);
        forced += m.abs();
        net += m;
        held += a;
    }
    forced + ((1.0 - held) - net).abs()
}

/// Check budget, box and turnover against each other
pub fn check_feasibility(set: &FeasibleSet, symbols: &[String]) -> Result<()> {
    let mut conflicts = Vec::new();

    let lower_sum: f64 = set.lower.iter().sum();
    if lower_sum > 1.0 + FEASIBILITY_TOLERANCE {
        conflicts.push(ConstraintConflict {
            constraints: vec![ConstraintKind::MinWeightPerAsset, ConstraintKind::BudgetSum],
            asset: None,
            required: lower_sum,
            limit: 1.0,
            detail: format!(
                "minimum weights over {} assets sum to {:.4}, above the full budget",
                symbols.len(),
                lower_sum
            ),
        });
    }

    let upper_sum: f64 = set.upper.iter().sum();
    if upper_sum < 1.0 - FEASIBILITY_TOLERANCE {
        conflicts.push(ConstraintConflict {
            constraints: vec![ConstraintKind::MaxWeightPerAsset, ConstraintKind::BudgetSum],
            asset: None,
            required: 1.0,
            limit: upper_sum,
            detail: format!(
                "maximum weights over {} assets sum to {:.4}, the budget cannot be invested",
                symbols.len(),
                upper_sum
            ),
        });
    }

    if !conflicts.is_empty() {
        return Err(EngineError::InfeasibleConstraints { conflicts });
    }

    let Some(limit) = set.max_turnover else {
        return Ok(());
    };
    let required = minimum_turnover(set);
    if required <= limit + FEASIBILITY_TOLERANCE {
        return Ok(());
    }

    for (i, symbol) in symbols.iter().enumerate() {
        let a = set.anchor[i];
        if a > set.upper[i] + FEASIBILITY_TOLERANCE {
            conflicts.push(ConstraintConflict {
                constraints: vec![ConstraintKind::MaxTurnover, ConstraintKind::MaxWeightPerAsset],
                asset: Some(symbol.clone()),
                required,
                limit,
                detail: format!(
                    "current weight {:.4} is above the cap {:.4} but turnover is limited to {:.4}",
                    a, set.upper[i], limit
                ),
            });
        } else if a < set.lower[i] - FEASIBILITY_TOLERANCE {
            conflicts.push(ConstraintConflict {
                constraints: vec![ConstraintKind::MaxTurnover, ConstraintKind::MinWeightPerAsset],
                asset: Some(symbol.clone()),
                required,
                limit,
                detail: format!(
                    "current weight {:.4} is below the floor {:.4} but turnover is limited to {:.4}",
                    a, set.lower[i], limit
                ),
            });
        }
    }
    if conflicts.is_empty() {
        conflicts.push(ConstraintConflict {
            constraints: vec![ConstraintKind::MaxTurnover, ConstraintKind::BudgetSum],
            asset: None,
            required,
            limit,
            detail: format!(
                "reaching a fully invested portfolio needs turnover {:.4}, above the limit {:.4}",
                required, limit
            ),
        });
    }

    tracing::debug!(
        required_turnover = required,
        limit,
        conflicts = conflicts.len(),
        "Constraint set is infeasible"
    );
    Err(EngineError::InfeasibleConstraints { conflicts })
}
