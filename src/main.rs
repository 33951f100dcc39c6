//! Behavioral Portfolio Optimizer
//!
//! Serves the optimization engine over HTTP, or answers one JSON request
//! from a file.

use anyhow::Context;
use behavioral_optimizer::{
    api::{self, ApiState},
    config::Config,
    engine::{BacktestRequest, BiasAnalysisRequest, Engine, OptimizationRequest, SentimentRequest},
};
use clap::{Parser, Subcommand};
use serde::{de::DeserializeOwned, Serialize};
use std::io::Read;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "behavioral-optimizer")]
#[command(about = "Portfolio optimization with behavioral bias constraints")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API
    Serve {
        /// Bind address (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Port (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Optimize a portfolio from a JSON request
    Optimize {
        /// Request file, `-` for stdin
        input: String,
    },
    /// Score behavioral biases from a JSON trading history
    ScoreBiases {
        /// Request file, `-` for stdin
        input: String,
    },
    /// Aggregate sentiment signals for one symbol
    Sentiment {
        /// Request file, `-` for stdin
        input: String,
    },
    /// Summarize a return series or fixed-weight portfolio
    Backtest {
        /// Request file, `-` for stdin
        input: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(&cli.config)?;

    match cli.command {
        Commands::Serve { host, port } => serve(config, host, port).await,
        Commands::Optimize { input } => {
            let engine = Engine::new(config);
            let request: OptimizationRequest = read_request(&input)?;
            print_json(&engine.optimize(&request)?)
        }
        Commands::ScoreBiases { input } => {
            let engine = Engine::new(config);
            let request: BiasAnalysisRequest = read_request(&input)?;
            print_json(&engine.analyze_biases(&request)?)
        }
        Commands::Sentiment { input } => {
            let engine = Engine::new(config);
            let request: SentimentRequest = read_request(&input)?;
            print_json(&engine.aggregate_sentiment(&request)?)
        }
        Commands::Backtest { input } => {
            let engine = Engine::new(config);
            let request: BacktestRequest = read_request(&input)?;
            print_json(&engine.backtest(&request)?)
        }
    }
}

async fn serve(config: Config, host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    let host = host.unwrap_or_else(|| config.server.host.clone());
    let port = port.unwrap_or(config.server.port);
    tracing::info!(
        risk_aversion = config.optimizer.risk_aversion,
        bias_threshold = config.constraints.bias_threshold,
        "Starting behavioral optimizer"
    );

    let state = Arc::new(ApiState::new(Engine::new(config)));
    api::serve(state, &host, port)
        .await
        .map_err(|e| anyhow::anyhow!("API server failed: {}", e))
}

fn read_request<T: DeserializeOwned>(input: &str) -> anyhow::Result<T> {
    let raw = if input == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read request from stdin")?;
        buf
    } else {
        std::fs::read_to_string(input).with_context(|| format!("Failed to read {}", input))?
    };
    serde_json::from_str(&raw).with_context(|| format!("Invalid request JSON in {}", input))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
