//! Engine error types
//!
//! Every failure carries enough structure for a caller to act on it: which
//! constraint, which asset, which bound. The engine never replaces a failure
//! with fabricated numbers.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Constraint families named in feasibility conflicts and derivations
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    MaxWeightPerAsset,
    MinWeightPerAsset,
    MaxTurnover,
    TargetVolatility,
    BehavioralPenaltyWeight,
    DiversificationPenaltyWeight,
    ExpectedReturnShrinkage,
    LossAversionCoefficient,
    RiskPerceptionMultiplier,
    BudgetSum,
}

impl ConstraintKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConstraintKind::MaxWeightPerAsset => "max_weight_per_asset",
            ConstraintKind::MinWeightPerAsset => "min_weight_per_asset",
            ConstraintKind::MaxTurnover => "max_turnover",
            ConstraintKind::TargetVolatility => "target_volatility",
            ConstraintKind::BehavioralPenaltyWeight => "behavioral_penalty_weight",
            ConstraintKind::DiversificationPenaltyWeight => "diversification_penalty_weight",
            ConstraintKind::ExpectedReturnShrinkage => "expected_return_shrinkage",
            ConstraintKind::LossAversionCoefficient => "loss_aversion_coefficient",
            ConstraintKind::RiskPerceptionMultiplier => "risk_perception_multiplier",
            ConstraintKind::BudgetSum => "budget_sum",
        }
    }
}

impl std::fmt::Display for ConstraintKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One reason the feasible region is empty
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConstraintConflict {
    /// Constraints that cannot hold together
    pub constraints: Vec<ConstraintKind>,
    /// Asset that forces the conflict, when a single asset does
    pub asset: Option<String>,
    /// Value the constraint set would require
    pub required: f64,
    /// Bound that forbids it
    pub limit: f64,
    pub detail: String,
}

impl std::fmt::Display for ConstraintConflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.constraints.iter().map(|c| c.as_str()).collect();
        write!(f, "[{}] {}", names.join(" vs "), self.detail)?;
        if let Some(asset) = &self.asset {
            write!(f, " (asset {})", asset)?;
        }
        Ok(())
    }
}

fn join_conflicts(conflicts: &[ConstraintConflict]) -> String {
    conflicts
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Engine errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Insufficient data for {context}: need at least {required} observations, got {actual}")]
    InsufficientData {
        context: String,
        required: usize,
        actual: usize,
    },

    #[error("Invalid parameter `{name}`: {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("Invalid constraint {constraint}: value {value} violates hard bound {bound}")]
    InvalidConstraint {
        constraint: ConstraintKind,
        value: f64,
        bound: String,
    },

    #[error("Infeasible constraints: {}", join_conflicts(.conflicts))]
    InfeasibleConstraints { conflicts: Vec<ConstraintConflict> },

    #[error("Optimization did not converge after {iterations} iterations (KKT residual {residual:e})")]
    OptimizationDidNotConverge { iterations: usize, residual: f64 },

    #[error("Optimization timed out after {elapsed_ms} ms ({iterations} iterations)")]
    OptimizationTimeout { elapsed_ms: u64, iterations: usize },
}

impl EngineError {
    pub fn insufficient(context: impl Into<String>, required: usize, actual: usize) -> Self {
        EngineError::InsufficientData {
            context: context.into(),
            required,
            actual,
        }
    }

    pub fn invalid_parameter(name: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::InvalidParameter {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Stable machine-readable kind, used by the HTTP layer
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InsufficientData { .. } => "insufficient_data",
            EngineError::InvalidParameter { .. } => "invalid_parameter",
            EngineError::InvalidConstraint { .. } => "invalid_constraint",
            EngineError::InfeasibleConstraints { .. } => "infeasible_constraints",
            EngineError::OptimizationDidNotConverge { .. } => "optimization_did_not_converge",
            EngineError::OptimizationTimeout { .. } => "optimization_timeout",
        }
    }

    /// Structured details for the error body
    pub fn details(&self) -> serde_json::Value {
        match self {
            EngineError::InsufficientData {
                context,
                required,
                actual,
            } => serde_json::json!({
                "context": context,
                "required": required,
                "actual": actual,
            }),
            EngineError::InvalidParameter { name, reason } => serde_json::json!({
                "name": name,
                "reason": reason,
            }),
            EngineError::InvalidConstraint {
                constraint,
                value,
                bound,
            } => serde_json::json!({
                "constraint": constraint,
                "value": value,
                "bound": bound,
            }),
            EngineError::InfeasibleConstraints { conflicts } => serde_json::json!({
                "conflicts": conflicts,
            }),
            EngineError::OptimizationDidNotConverge {
                iterations,
                residual,
            } => serde_json::json!({
                "iterations": iterations,
                "residual": residual,
            }),
            EngineError::OptimizationTimeout {
                elapsed_ms,
                iterations,
            } => serde_json::json!({
                "elapsed_ms": elapsed_ms,
                "iterations": iterations,
            }),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
