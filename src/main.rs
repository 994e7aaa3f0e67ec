mod config;
mod data;
mod engine;
mod errors;
mod filters;
mod indicators;
mod ml;
mod strategies;
mod types;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::config::{load_config, render_config, StrategyConfig};
use crate::engine::{StrategyExecutor, WalkForwardEngine};
use crate::types::RegimeFrame;

#[derive(Parser)]
#[command(name = "regime-allocator")]
#[command(version = "0.1.0")]
#[command(about = "Walk-forward HMM regime detection and regime-based allocation", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (TOML); built-in defaults when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Walk-forward regimes, stabilizer, filters and execution
    Run {
        /// Feature table (CSV or JSON)
        #[arg(short, long)]
        data: PathBuf,
        /// Write the full result as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Walk-forward regime labels only
    Regimes {
        /// Feature table (CSV or JSON)
        #[arg(short, long)]
        data: PathBuf,
        /// Write regime rows and refit records as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Validate the configuration
    CheckConfig {
        /// Print the effective configuration as TOML
        #[arg(long)]
        print: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Regime Allocator v0.1.0");

    let config = load_config(cli.config.as_deref()).context("Invalid configuration")?;

    match cli.command {
        Commands::Run { data, output } => {
            run_strategy(config, &data, output.as_deref()).await?;
        }
        Commands::Regimes { data, output } => {
            run_regimes(config, &data, output.as_deref()).await?;
        }
        Commands::CheckConfig { print } => {
            info!(
                "Configuration OK: {} features, {} states, first prediction after {} periods",
                config.features.len(),
                config.walk_forward.n_states,
                config.min_train_periods()
            );
            if print {
                println!("{}", render_config(&config)?);
            }
        }
    }

    Ok(())
}

async fn run_regimes(config: StrategyConfig, data: &Path, output: Option<&Path>) -> Result<()> {
    let frame = crate::data::load_frame(data, &config.features, &config.universe.all()).await?;

    let regimes = tokio::task::spawn_blocking(move || {
        let mut engine = WalkForwardEngine::new(&config)?;
        engine.walk_forward_training(frame)
    })
    .await
    .context("Walk-forward task panicked")??;

    print_regime_summary(&regimes);

    if let Some(path) = output {
        #[derive(Serialize)]
        struct RegimeExport<'a> {
            first_prediction: usize,
            n_states: usize,
            refits: &'a [crate::types::RefitRecord],
            regimes: &'a [crate::types::RegimeRow],
        }
        let export = RegimeExport {
            first_prediction: regimes.first_prediction,
            n_states: regimes.n_states,
            refits: &regimes.refits,
            regimes: regimes.predicted_rows(),
        };
        write_json(path, &export).await?;
    }

    Ok(())
}

async fn run_strategy(config: StrategyConfig, data: &Path, output: Option<&Path>) -> Result<()> {
    let assets = config.universe.all();
    let frame = crate::data::load_frame(data, &config.features, &assets).await?;

    let result = tokio::task::spawn_blocking(move || -> Result<_> {
        let mut engine = WalkForwardEngine::new(&config)?;
        let regimes = engine.walk_forward_training(frame)?;
        print_regime_summary(&regimes);

        let mut executor = StrategyExecutor::new(&config, regimes.frame.assets());
        Ok(executor.execute_strategy(&regimes))
    })
    .await
    .context("Strategy task panicked")??;

    result.print_summary();

    if let Some(path) = output {
        write_json(path, &result).await?;
    }

    Ok(())
}

fn print_regime_summary(regimes: &RegimeFrame) {
    let predicted = regimes.predicted_rows();
    let mut counts = vec![0usize; regimes.n_states];
    for label in predicted.iter().filter_map(|r| r.regime()) {
        if let Some(c) = counts.get_mut(label) {
            *c += 1;
        }
    }

    info!(
        "{} predicted rows, {} refits, {} flagged rows",
        predicted.len(),
        regimes.refits.len(),
        regimes.flagged_count()
    );
    for (regime, count) in counts.iter().enumerate() {
        info!(
            "  Regime {}: {} rows ({:.1}%)",
            regime,
            count,
            *count as f64 / predicted.len().max(1) as f64 * 100.0
        );
    }
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    tokio::fs::write(path, json)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    info!("Results written to {}", path.display());
    Ok(())
}
