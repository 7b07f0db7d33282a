//! Tracking store that records nothing

use super::{ModelSource, RunInfo, RunStatus, RunSummary, TrackingStore};
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;

/// Accepts every write and holds no models. Used when tracking is disabled
/// or the configured store could not be reached.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStore;

#[async_trait]
impl TrackingStore for NoopStore {
    fn kind(&self) -> &'static str {
        "noop"
    }

    async fn ensure_experiment(&self, _name: &str) -> Result<String> {
        Ok("0".to_string())
    }

    async fn start_run(&self, experiment_id: &str, run_name: &str) -> Result<RunInfo> {
        Ok(RunInfo {
            run_id: uuid::Uuid::new_v4().simple().to_string(),
            experiment_id: experiment_id.to_string(),
            run_name: run_name.to_string(),
            artifact_uri: String::new(),
        })
    }

    async fn log_params(&self, _run_id: &str, _params: &BTreeMap<String, String>) -> Result<()> {
        Ok(())
    }

    async fn log_metrics(&self, _run_id: &str, _metrics: &BTreeMap<String, f64>) -> Result<()> {
        Ok(())
    }

    async fn set_tags(&self, _run_id: &str, _tags: &BTreeMap<String, String>) -> Result<()> {
        Ok(())
    }

    async fn log_artifact(
        &self,
        _run: &RunInfo,
        _local_path: &Path,
        _artifact_dir: &str,
    ) -> Result<()> {
        Ok(())
    }

    async fn end_run(&self, _run_id: &str, _status: RunStatus) -> Result<()> {
        Ok(())
    }

    async fn register_model(
        &self,
        name: &str,
        _run: &RunInfo,
        _artifact_dir: &str,
    ) -> Result<String> {
        bail!("Tracking disabled: cannot register model {}", name)
    }

    async fn set_alias(&self, name: &str, alias: &str, _version: &str) -> Result<()> {
        bail!("Tracking disabled: cannot set alias {} on {}", alias, name)
    }

    async fn latest_runs(
        &self,
        _experiment_name: &str,
        _max_results: usize,
    ) -> Result<Vec<RunSummary>> {
        Ok(Vec::new())
    }

    async fn download_model(&self, source: &ModelSource, _dest: &Path) -> Result<()> {
        bail!("Tracking disabled: no model at {}", source)
    }
}
