//! Model status report and export of the latest tracked model

use crate::config::AppConfig;
use crate::tracking::{ModelSource, RunSummary, TrackingStore};
use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;
use tracing::{info, warn};

/// Local model file on disk
#[derive(Debug, Clone, PartialEq)]
pub struct LocalModel {
    pub path: PathBuf,
    pub size_mb: f64,
}

/// What the tracking store and the local disk know about the model
#[derive(Debug, Clone)]
pub struct ModelStatus {
    pub latest_run: Option<RunSummary>,
    /// Set when the tracking store could not be queried
    pub tracking_error: Option<String>,
    pub local_model: Option<LocalModel>,
}

impl ModelStatus {
    /// Log the report
    pub fn log(&self) {
        match (&self.latest_run, &self.tracking_error) {
            (Some(run), _) => info!(
                run_id = %run.run_id,
                run_name = %run.run_name,
                status = %run.status,
                f1 = ?run.metric("test_f1"),
                accuracy = ?run.metric("test_accuracy"),
                "Latest tracked run"
            ),
            (None, Some(error)) => warn!(error = %error, "Tracking store could not be queried"),
            (None, None) => info!("No tracked runs found"),
        }

        match &self.local_model {
            Some(local) => info!(
                path = %local.path.display(),
                size_mb = format!("{:.2}", local.size_mb),
                "Local model present"
            ),
            None => warn!("Local model file not found"),
        }
    }
}

/// Query the latest run and inspect the local model file. Store errors are
/// reported in the result, never returned.
pub async fn check_status(config: &AppConfig, store: &dyn TrackingStore) -> ModelStatus {
    let (latest_run, tracking_error) = match store
        .latest_runs(&config.tracking.experiment_name, 1)
        .await
    {
        Ok(runs) => (runs.into_iter().next(), None),
        Err(e) => (None, Some(format!("{e:#}"))),
    };

    let local_model = std::fs::metadata(&config.model.path)
        .ok()
        .filter(|meta| meta.is_file())
        .map(|meta| LocalModel {
            path: config.model.path.clone(),
            size_mb: meta.len() as f64 / (1024.0 * 1024.0),
        });

    ModelStatus {
        latest_run,
        tracking_error,
        local_model,
    }
}

/// Download the model of the most recent run to `model.path`.
pub async fn export_latest(config: &AppConfig, store: &dyn TrackingStore) -> Result<PathBuf> {
    let runs = store
        .latest_runs(&config.tracking.experiment_name, 1)
        .await
        .context("Failed to query the tracking store")?;
    let run = runs
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("No runs in experiment {}", config.tracking.experiment_name))?;

    let source = ModelSource::Run {
        run_id: run.run_id.clone(),
    };
    store
        .download_model(&source, &config.model.path)
        .await
        .with_context(|| format!("Failed to export model of run {}", run.run_id))?;

    info!(
        run_id = %run.run_id,
        f1 = ?run.metric("test_f1"),
        accuracy = ?run.metric("test_accuracy"),
        path = %config.model.path.display(),
        "Latest model exported"
    );
    Ok(config.model.path.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracking::{FileStore, NoopStore, MODEL_ARTIFACT_DIR, MODEL_FILE_NAME};
    use std::collections::BTreeMap;

    fn config_in(dir: &std::path::Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.model.path = dir.join("models").join("best_model.bin");
        config
    }

    #[tokio::test]
    async fn test_status_without_anything() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let store = FileStore::new(dir.path().join("mlruns"));

        let status = check_status(&config, &store).await;
        assert!(status.latest_run.is_none());
        // unknown experiment is reported, not raised
        assert!(status.tracking_error.is_some());
        assert!(status.local_model.is_none());
    }

    #[tokio::test]
    async fn test_status_and_export_latest_run() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let store = FileStore::new(dir.path().join("mlruns"));

        let experiment = store
            .ensure_experiment(&config.tracking.experiment_name)
            .await
            .unwrap();
        let run = store.start_run(&experiment, "config_1").await.unwrap();
        let artifact = dir.path().join(MODEL_FILE_NAME);
        std::fs::write(&artifact, vec![7u8; 2048]).unwrap();
        store
            .log_artifact(&run, &artifact, MODEL_ARTIFACT_DIR)
            .await
            .unwrap();
        store
            .log_metrics(&run.run_id, &BTreeMap::from([("test_f1".to_string(), 0.9)]))
            .await
            .unwrap();

        let exported = export_latest(&config, &store).await.unwrap();
        assert_eq!(std::fs::read(&exported).unwrap().len(), 2048);

        let status = check_status(&config, &store).await;
        let latest = status.latest_run.unwrap();
        assert_eq!(latest.run_id, run.run_id);
        assert_eq!(latest.metric("test_f1"), Some(0.9));
        assert!(status.local_model.unwrap().size_mb > 0.0);
    }

    #[tokio::test]
    async fn test_export_without_runs_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        assert!(export_latest(&config, &NoopStore).await.is_err());
    }
}
