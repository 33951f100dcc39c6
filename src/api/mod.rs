//! HTTP API
//!
//! JSON endpoints over the [`Engine`]. Optimizations run on the blocking
//! pool; the solver enforces the request's deadline itself.


use crate::bias::{assess_trade, BehavioralAlert, MarketConditions, TradeIntent};
use crate::engine::{
    BacktestRequest, BiasAnalysis, BiasAnalysisRequest, Engine, OptimizationRequest,
    OptimizationResult, SentimentReport, SentimentRequest,
};
use crate::error::EngineError;
use crate::statistics::PerformanceSummary;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// State shared across handlers
pub struct ApiState {
    pub engine: Engine,
}

impl ApiState {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }
}

/// Error response: `{error, message, details}`
#[derive(Debug)]
pub enum ApiError {
    Engine(EngineError),
    Internal(String),
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError::Engine(err)
    }
}

/// HTTP status for an engine failure
pub fn status_for(err: &EngineError) -> StatusCode {
    match err {
        EngineError::InvalidParameter { .. } | EngineError::InvalidConstraint { .. } => {
            StatusCode::BAD_REQUEST
        }
        EngineError::InsufficientData { .. } | EngineError::InfeasibleConstraints { .. } => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        EngineError::OptimizationDidNotConverge { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        EngineError::OptimizationTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Engine(err) => {
                let status = status_for(&err);
                if status.is_server_error() {
                    tracing::error!(error = %err, "Request failed");
                } else {
                    tracing::warn!(error = %err, "Request rejected");
                }
                (
                    status,
                    serde_json::json!({
                        "error": err.kind(),
                        "message": err.to_string(),
                        "details": err.details(),
                    }),
                )
            }
            ApiError::Internal(message) => {
                tracing::error!(%message, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    serde_json::json!({
                        "error": "internal",
                        "message": message,
                        "details": serde_json::Value::Null,
                    }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Health check
async fn health_check() -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "healthy".to_string(),
        service: "Behavioral Portfolio Optimizer".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Optimize a portfolio
async fn optimize(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<OptimizationRequest>,
) -> Result<Json<OptimizationResult>, ApiError> {
    let request_id = Uuid::new_v4();
    let span = tracing::info_span!(
        "optimize",
        %request_id,
        portfolio_id = %request.portfolio_id,
        method = %request.method
    );

    let result = tokio::task::spawn_blocking(move || {
        let _guard = span.enter();
        state.engine.optimize(&request)
    })
    .await
    .map_err(|e| ApiError::Internal(format!("optimization task failed: {}", e)))??;

    Ok(Json(result))
}

/// Score biases from trading history
async fn analyze_biases(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<BiasAnalysisRequest>,
) -> Result<Json<BiasAnalysis>, ApiError> {
    Ok(Json(state.engine.analyze_biases(&request)?))
}

/// Trade about to be placed plus the market backdrop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeBiasRequest {
    #[serde(flatten)]
    pub intent: TradeIntent,
    #[serde(flatten)]
    pub conditions: MarketConditions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeBiasResponse {
    pub bias_detected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert: Option<BehavioralAlert>,
}

/// Real-time check of one trade
async fn detect_trade_bias(Json(request): Json<TradeBiasRequest>) -> Json<TradeBiasResponse> {
    let alert = assess_trade(&request.intent, &request.conditions);
    Json(TradeBiasResponse {
        bias_detected: alert.is_some(),
        alert,
    })
}

/// Aggregate one symbol's sentiment signals
async fn aggregate_sentiment(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<SentimentRequest>,
) -> Result<Json<SentimentReport>, ApiError> {
    Ok(Json(state.engine.aggregate_sentiment(&request)?))
}

/// Performance summary of a return series or fixed weights
async fn run_backtest(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<BacktestRequest>,
) -> Result<Json<PerformanceSummary>, ApiError> {
    Ok(Json(state.engine.backtest(&request)?))
}

/// Create API router
pub fn create_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/optimization/optimize", post(optimize))
        .route("/api/bias/analyze", post(analyze_biases))
        .route("/api/bias/detect-trade-bias", post(detect_trade_bias))
        .route("/api/sentiment/aggregate", post(aggregate_sentiment))
        .route("/api/backtest/run", post(run_backtest))
        .with_state(state)
}

/// Start API server
pub async fn serve(
    state: Arc<ApiState>,
    host: &str,
    port: u16,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = create_router(state);

    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("API server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
