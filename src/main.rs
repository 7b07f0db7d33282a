//! Fraud Detection MLOps - Main Entry Point
//!
//! Runs the offline stages (download, preprocess, train, pipeline), reports
//! on or exports the tracked model, and serves predictions over HTTP.

use anyhow::Result;
use clap::{Parser, Subcommand};
use fraud_detection_mlops::{
    config::AppConfig,
    data::download_dataset,
    models::{check_status, export_latest},
    pipeline::run_pipeline,
    preprocessing::run_preprocessing,
    serving::{self, api, gateway},
    tracking::open_store,
    training::run_training,
};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fraud-mlops", version, about = "Credit-card fraud detection workflow")]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = "config/config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Download the raw dataset if it is not present
    Download,
    /// Split and standardize the raw dataset
    Preprocess,
    /// Train every configured forest and persist the best
    Train,
    /// Download, preprocess, train and gate deployment
    Pipeline,
    /// Report the latest tracked run and the local model
    Status,
    /// Save the latest tracked model to the configured model path
    Export,
    /// Serve `/prediz` and `/info-modelo`
    ServeApi,
    /// Serve `/predict` and `/metrics`
    ServeGateway,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load_from_path(&cli.config)?;
    init_logging(&config)?;

    info!(config = %cli.config.display(), "Configuration loaded");

    match cli.command {
        Command::Download => {
            let path = download_dataset(&config.data).await?;
            info!(path = %path.display(), "Dataset ready");
        }
        Command::Preprocess => {
            let data = tokio::task::spawn_blocking(move || run_preprocessing(&config)).await??;
            info!(
                train = data.y_train.len(),
                test = data.y_test.len(),
                "Preprocessing complete"
            );
        }
        Command::Train => {
            let store = open_store(&config.tracking)?;
            let summary = run_training(&config, store).await?;
            info!(
                run = %summary.best.run_name,
                metric = summary.best.metric.as_str(),
                score = summary.best.score,
                "Training complete"
            );
        }
        Command::Pipeline => {
            let store = open_store(&config.tracking)?;
            let outcome = run_pipeline(&config, store).await?;
            info!(
                run = %outcome.training.best.run_name,
                accuracy = outcome.training.best.test.accuracy,
                promoted_version = ?outcome.promoted_version,
                "Pipeline complete"
            );
        }
        Command::Status => {
            let store = open_store(&config.tracking)?;
            check_status(&config, store.as_ref()).await.log();
        }
        Command::Export => {
            let store = open_store(&config.tracking)?;
            export_latest(&config, store.as_ref()).await?;
        }
        Command::ServeApi => {
            let store = open_store(&config.tracking)?;
            let ctx = serving::build_context(&config, store).await?;
            let metrics = ctx.metrics().clone();
            info!(service = "api", "Starting prediction API");
            serving::serve(api::router(ctx), &config.serving.api.bind_addr(), metrics).await?;
        }
        Command::ServeGateway => {
            let store = open_store(&config.tracking)?;
            let ctx = serving::build_context(&config, store).await?;
            let metrics = ctx.metrics().clone();
            info!(service = "gateway", "Starting prediction gateway");
            serving::serve(
                gateway::router(ctx),
                &config.serving.gateway.bind_addr(),
                metrics,
            )
            .await?;
        }
    }

    Ok(())
}

fn init_logging(config: &AppConfig) -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive(
        format!("fraud_detection_mlops={}", config.logging.level).parse()?,
    );

    if config.logging.format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}
