//! End-to-end workflow: download, preprocess, train, then gate deployment

use crate::config::AppConfig;
use crate::data::download_dataset;
use crate::preprocessing::run_preprocessing;
use crate::tracking::TrackingStore;
use crate::training::{run_training, TrainingSummary};
use anyhow::{Context, Result};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Best model did not clear the accuracy bar
#[derive(Debug, Error, PartialEq)]
#[error("deploy gate failed: test accuracy {accuracy:.4} does not exceed {minimum:.4}")]
pub struct DeployGateError {
    pub accuracy: f64,
    pub minimum: f64,
}

/// Accuracy must be strictly greater than the minimum
pub fn deploy_gate(accuracy: f64, minimum: f64) -> Result<(), DeployGateError> {
    if accuracy > minimum {
        Ok(())
    } else {
        Err(DeployGateError { accuracy, minimum })
    }
}

/// Outcome of a pipeline run that passed the gate
#[derive(Debug)]
pub struct PipelineOutcome {
    pub training: TrainingSummary,
    /// Registry version given the production alias, when one was registered
    pub promoted_version: Option<String>,
}

/// Run every stage in order; the first failing stage ends the run.
pub async fn run_pipeline(
    config: &AppConfig,
    store: Arc<dyn TrackingStore>,
) -> Result<PipelineOutcome> {
    info!("Pipeline stage 1/4: download");
    download_dataset(&config.data)
        .await
        .context("Download stage failed")?;

    info!("Pipeline stage 2/4: preprocess");
    let preprocess_config = config.clone();
    tokio::task::spawn_blocking(move || run_preprocessing(&preprocess_config))
        .await
        .context("Preprocessing task panicked")?
        .context("Preprocessing stage failed")?;

    info!("Pipeline stage 3/4: train");
    let training = run_training(config, store.clone())
        .await
        .context("Training stage failed")?;

    info!("Pipeline stage 4/4: deploy gate");
    promote(config, store.as_ref(), training).await
}

/// Apply the deploy gate to a training result and alias the winner.
pub async fn promote(
    config: &AppConfig,
    store: &dyn TrackingStore,
    training: TrainingSummary,
) -> Result<PipelineOutcome> {
    let accuracy = training.best.test.accuracy;
    deploy_gate(accuracy, config.pipeline.min_deploy_accuracy)?;

    let promoted_version = match &training.best.registered_version {
        Some(version) => {
            store
                .set_alias(
                    &config.tracking.registered_model_name,
                    &config.pipeline.production_alias,
                    version,
                )
                .await
                .with_context(|| {
                    format!(
                        "Failed to set alias {} on version {version}",
                        config.pipeline.production_alias
                    )
                })?;
            info!(
                model = %config.tracking.registered_model_name,
                version = %version,
                alias = %config.pipeline.production_alias,
                accuracy = accuracy,
                "Model promoted"
            );
            Some(version.clone())
        }
        None => {
            warn!(
                accuracy = accuracy,
                "Gate passed but the best model was never registered, nothing to promote"
            );
            None
        }
    };

    Ok(PipelineOutcome {
        training,
        promoted_version,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_is_strict() {
        assert!(deploy_gate(0.81, 0.8).is_ok());
        assert_eq!(
            deploy_gate(0.8, 0.8),
            Err(DeployGateError {
                accuracy: 0.8,
                minimum: 0.8
            })
        );
        assert!(deploy_gate(0.5, 0.8).is_err());
    }

    #[test]
    fn test_gate_error_message() {
        let err = deploy_gate(0.75, 0.8).unwrap_err();
        assert_eq!(
            err.to_string(),
            "deploy gate failed: test accuracy 0.7500 does not exceed 0.8000"
        );
    }
}
