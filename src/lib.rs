//! Behavioral Portfolio Optimization Engine
//!
//! Scores an investor's cognitive biases from trading history, aggregates
//! market sentiment, turns both into portfolio constraints and solves for a
//! recommended allocation with a plain-language rationale.
//!
//! ## Architecture
//!
//! ```text
//! Statistics ──────────────────────────────┐
//!     │                                    ↓
//! Bias Scoring ─┐                      Optimizer → Rationale
//!               ├→ Constraint Builder ─────↑
//! Sentiment ────┘
//! ```
//!
//! [`engine::Engine`] wires the pipeline for one request; [`api`] serves it
//! over HTTP.

pub mod api;
pub mod bias;
pub mod config;
pub mod constraints;
pub mod engine;
pub mod error;
pub mod portfolio;
pub mod rationale;
pub mod sentiment;
pub mod statistics;
pub mod types;

#[cfg(test)]
mod integration_tests;
