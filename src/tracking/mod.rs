//! Experiment tracking and model registry.
//!
//! Training logs every run through [`TrackingStore`]; serving and the
//! status/export commands read registered models back through it. The
//! backend is picked from the tracking URI:
//!
//! - `http://` / `https://` → [`MlflowStore`] (MLflow REST API 2.0)
//! - `file://<dir>` or a bare path → [`FileStore`]
//! - `none` or empty → [`NoopStore`]

pub mod file;
pub mod mlflow;
pub mod noop;

pub use file::FileStore;
pub use mlflow::MlflowStore;
pub use noop::NoopStore;

use crate::config::TrackingConfig;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Artifact directory the serialized model is logged under.
pub const MODEL_ARTIFACT_DIR: &str = "model";
/// File name of the serialized model inside [`MODEL_ARTIFACT_DIR`].
pub const MODEL_FILE_NAME: &str = "model.bin";

/// Identity of a run as returned when it is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunInfo {
    pub run_id: String,
    pub experiment_id: String,
    pub run_name: String,
    pub artifact_uri: String,
}

/// Terminal run states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Finished,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Finished => "FINISHED",
            RunStatus::Failed => "FAILED",
        }
    }
}

/// A past run with its logged data, as returned by searches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub run_name: String,
    pub status: String,
    /// Milliseconds since the Unix epoch
    pub start_time: i64,
    pub artifact_uri: String,
    pub metrics: BTreeMap<String, f64>,
    pub params: BTreeMap<String, String>,
    pub tags: BTreeMap<String, String>,
}

impl RunSummary {
    pub fn metric(&self, key: &str) -> Option<f64> {
        self.metrics.get(key).copied()
    }
}

/// Where a model artifact is fetched from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    /// Registered model version reached through an alias
    Alias { name: String, alias: String },
    /// Model artifact logged by a run
    Run { run_id: String },
}

impl std::fmt::Display for ModelSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelSource::Alias { name, alias } => write!(f, "models:/{}@{}", name, alias),
            ModelSource::Run { run_id } => write!(f, "runs:/{}/{}", run_id, MODEL_ARTIFACT_DIR),
        }
    }
}

/// Experiment tracking backend.
#[async_trait]
pub trait TrackingStore: Send + Sync {
    /// Short backend name for logs
    fn kind(&self) -> &'static str;

    /// Look up an experiment by name, creating it when absent. Returns its id.
    async fn ensure_experiment(&self, name: &str) -> Result<String>;

    async fn start_run(&self, experiment_id: &str, run_name: &str) -> Result<RunInfo>;

    async fn log_params(&self, run_id: &str, params: &BTreeMap<String, String>) -> Result<()>;

    async fn log_metrics(&self, run_id: &str, metrics: &BTreeMap<String, f64>) -> Result<()>;

    async fn set_tags(&self, run_id: &str, tags: &BTreeMap<String, String>) -> Result<()>;

    /// Store a local file under `artifact_dir/<file name>` of the run.
    async fn log_artifact(&self, run: &RunInfo, local_path: &Path, artifact_dir: &str)
        -> Result<()>;

    async fn end_run(&self, run_id: &str, status: RunStatus) -> Result<()>;

    /// Register the run's `artifact_dir` as a new version of `name`. Returns the version.
    async fn register_model(&self, name: &str, run: &RunInfo, artifact_dir: &str)
        -> Result<String>;

    async fn set_alias(&self, name: &str, alias: &str, version: &str) -> Result<()>;

    /// Most recent runs of an experiment, newest first.
    async fn latest_runs(&self, experiment_name: &str, max_results: usize)
        -> Result<Vec<RunSummary>>;

    /// Fetch the serialized model behind `source` into `dest`.
    async fn download_model(&self, source: &ModelSource, dest: &Path) -> Result<()>;
}

/// Open the store addressed by `config.uri`.
pub fn open_store(config: &TrackingConfig) -> Result<Arc<dyn TrackingStore>> {
    let uri = config.uri.trim();
    let store: Arc<dyn TrackingStore> = if uri.is_empty() || uri.eq_ignore_ascii_case("none") {
        Arc::new(NoopStore)
    } else if uri.starts_with("http://") || uri.starts_with("https://") {
        Arc::new(MlflowStore::new(
            uri,
            Duration::from_secs(config.request_timeout_secs),
        )?)
    } else {
        let root = uri.strip_prefix("file://").unwrap_or(uri);
        Arc::new(FileStore::new(PathBuf::from(root)))
    };

    info!(uri = %uri, backend = store.kind(), "Tracking store opened");
    Ok(store)
}

/// Milliseconds since the Unix epoch, as the tracking API expects.
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_uri(uri: &str) -> TrackingConfig {
        TrackingConfig {
            uri: uri.to_string(),
            ..TrackingConfig::default()
        }
    }

    #[test]
    fn test_open_store_picks_backend_by_scheme() {
        assert_eq!(open_store(&config_with_uri("none")).unwrap().kind(), "noop");
        assert_eq!(open_store(&config_with_uri("")).unwrap().kind(), "noop");
        assert_eq!(
            open_store(&config_with_uri("file:///tmp/mlruns")).unwrap().kind(),
            "file"
        );
        assert_eq!(open_store(&config_with_uri("mlruns")).unwrap().kind(), "file");
        assert_eq!(
            open_store(&config_with_uri("http://localhost:5000")).unwrap().kind(),
            "mlflow"
        );
    }

    #[test]
    fn test_model_source_display() {
        let alias = ModelSource::Alias {
            name: "fraud_detection_model".to_string(),
            alias: "champion".to_string(),
        };
        assert_eq!(alias.to_string(), "models:/fraud_detection_model@champion");
        let run = ModelSource::Run {
            run_id: "abc".to_string(),
        };
        assert_eq!(run.to_string(), "runs:/abc/model");
    }
}
