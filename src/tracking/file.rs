//! Tracking store on the local filesystem
//!
//! Layout under the root directory:
//!
//! ```text
//! experiments.json            experiment name -> id
//! registry.json               registered models, versions and aliases
//! runs/<run_id>/run.json      run metadata, params, metrics, tags
//! runs/<run_id>/artifacts/    logged files
//! ```

use super::{
    now_millis, ModelSource, RunInfo, RunStatus, RunSummary, TrackingStore, MODEL_FILE_NAME,
};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRun {
    info: RunInfo,
    status: RunStatus,
    start_time: i64,
    end_time: Option<i64>,
    /// Creation order, breaks ties between runs started in the same millisecond
    sequence: u64,
    params: BTreeMap<String, String>,
    metrics: BTreeMap<String, f64>,
    tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RegisteredModel {
    versions: Vec<ModelVersion>,
    aliases: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ModelVersion {
    version: String,
    run_id: String,
    /// Artifact directory holding the model file
    source: PathBuf,
}

/// File-backed [`TrackingStore`] for offline use and tests.
pub struct FileStore {
    root: PathBuf,
    /// Serializes read-modify-write cycles on the JSON files
    lock: Mutex<()>,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn experiments_path(&self) -> PathBuf {
        self.root.join("experiments.json")
    }

    fn registry_path(&self) -> PathBuf {
        self.root.join("registry.json")
    }

    fn runs_dir(&self) -> PathBuf {
        self.root.join("runs")
    }

    fn run_dir(&self, run_id: &str) -> PathBuf {
        self.runs_dir().join(run_id)
    }

    fn run_file(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("run.json")
    }

    async fn load_run(&self, run_id: &str) -> Result<StoredRun> {
        read_json(&self.run_file(run_id))
            .await?
            .ok_or_else(|| anyhow!("Run {} not found in {}", run_id, self.root.display()))
    }

    async fn update_run<F>(&self, run_id: &str, update: F) -> Result<()>
    where
        F: FnOnce(&mut StoredRun) + Send,
    {
        let _guard = self.lock.lock().await;
        let mut run = self.load_run(run_id).await?;
        update(&mut run);
        write_json(&self.run_file(run_id), &run).await
    }

    async fn stored_runs(&self) -> Result<Vec<StoredRun>> {
        let mut runs = Vec::new();
        let mut entries = match fs::read_dir(self.runs_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(runs),
            Err(e) => return Err(e).context("Failed to list runs"),
        };
        while let Some(entry) = entries.next_entry().await? {
            if let Some(run) = read_json::<StoredRun>(&entry.path().join("run.json")).await? {
                runs.push(run);
            }
        }
        Ok(runs)
    }

    async fn model_path(&self, source: &ModelSource) -> Result<PathBuf> {
        match source {
            ModelSource::Run { run_id } => {
                let run = self.load_run(run_id).await?;
                Ok(PathBuf::from(run.info.artifact_uri)
                    .join(super::MODEL_ARTIFACT_DIR)
                    .join(MODEL_FILE_NAME))
            }
            ModelSource::Alias { name, alias } => {
                let registry: BTreeMap<String, RegisteredModel> =
                    read_json(&self.registry_path()).await?.unwrap_or_default();
                let model = registry
                    .get(name)
                    .ok_or_else(|| anyhow!("Registered model {} not found", name))?;
                let version = model
                    .aliases
                    .get(alias)
                    .ok_or_else(|| anyhow!("Alias {} not set on {}", alias, name))?;
                let entry = model
                    .versions
                    .iter()
                    .find(|v| &v.version == version)
                    .ok_or_else(|| anyhow!("Version {} of {} missing", version, name))?;
                Ok(entry.source.join(MODEL_FILE_NAME))
            }
        }
    }
}

#[async_trait]
impl TrackingStore for FileStore {
    fn kind(&self) -> &'static str {
        "file"
    }

    async fn ensure_experiment(&self, name: &str) -> Result<String> {
        let _guard = self.lock.lock().await;
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("Failed to create {}", self.root.display()))?;

        let path = self.experiments_path();
        let mut experiments: BTreeMap<String, String> =
            read_json(&path).await?.unwrap_or_default();
        if let Some(id) = experiments.get(name) {
            return Ok(id.clone());
        }

        let id = (experiments.len() + 1).to_string();
        experiments.insert(name.to_string(), id.clone());
        write_json(&path, &experiments).await?;
        debug!(experiment = %name, id = %id, "Experiment created");
        Ok(id)
    }

    async fn start_run(&self, experiment_id: &str, run_name: &str) -> Result<RunInfo> {
        let _guard = self.lock.lock().await;
        let run_id = uuid::Uuid::new_v4().simple().to_string();
        let artifacts = self.run_dir(&run_id).join("artifacts");
        fs::create_dir_all(&artifacts)
            .await
            .with_context(|| format!("Failed to create {}", artifacts.display()))?;

        let sequence = self.stored_runs().await?.len() as u64;
        let info = RunInfo {
            run_id: run_id.clone(),
            experiment_id: experiment_id.to_string(),
            run_name: run_name.to_string(),
            artifact_uri: artifacts.to_string_lossy().into_owned(),
        };
        let run = StoredRun {
            info: info.clone(),
            status: RunStatus::Running,
            start_time: now_millis(),
            end_time: None,
            sequence,
            params: BTreeMap::new(),
            metrics: BTreeMap::new(),
            tags: BTreeMap::new(),
        };
        write_json(&self.run_file(&run_id), &run).await?;
        Ok(info)
    }

    async fn log_params(&self, run_id: &str, params: &BTreeMap<String, String>) -> Result<()> {
        self.update_run(run_id, |run| run.params.extend(params.clone()))
            .await
    }

    async fn log_metrics(&self, run_id: &str, metrics: &BTreeMap<String, f64>) -> Result<()> {
        self.update_run(run_id, |run| run.metrics.extend(metrics.clone()))
            .await
    }

    async fn set_tags(&self, run_id: &str, tags: &BTreeMap<String, String>) -> Result<()> {
        self.update_run(run_id, |run| run.tags.extend(tags.clone()))
            .await
    }

    async fn log_artifact(
        &self,
        run: &RunInfo,
        local_path: &Path,
        artifact_dir: &str,
    ) -> Result<()> {
        let file_name = local_path
            .file_name()
            .ok_or_else(|| anyhow!("Artifact path {} has no file name", local_path.display()))?;
        let dir = PathBuf::from(&run.artifact_uri).join(artifact_dir);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        fs::copy(local_path, dir.join(file_name))
            .await
            .with_context(|| format!("Failed to copy {}", local_path.display()))?;
        Ok(())
    }

    async fn end_run(&self, run_id: &str, status: RunStatus) -> Result<()> {
        let end = now_millis();
        self.update_run(run_id, |run| {
            run.status = status;
            run.end_time = Some(end);
        })
        .await
    }

    async fn register_model(
        &self,
        name: &str,
        run: &RunInfo,
        artifact_dir: &str,
    ) -> Result<String> {
        let _guard = self.lock.lock().await;
        let source = PathBuf::from(&run.artifact_uri).join(artifact_dir);
        if !fs::try_exists(source.join(MODEL_FILE_NAME)).await.unwrap_or(false) {
            bail!("Run {} has no model under {}", run.run_id, artifact_dir);
        }

        let path = self.registry_path();
        let mut registry: BTreeMap<String, RegisteredModel> =
            read_json(&path).await?.unwrap_or_default();
        let model = registry.entry(name.to_string()).or_default();
        let version = (model.versions.len() + 1).to_string();
        model.versions.push(ModelVersion {
            version: version.clone(),
            run_id: run.run_id.clone(),
            source,
        });
        write_json(&path, &registry).await?;
        Ok(version)
    }

    async fn set_alias(&self, name: &str, alias: &str, version: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.registry_path();
        let mut registry: BTreeMap<String, RegisteredModel> =
            read_json(&path).await?.unwrap_or_default();
        let model = registry
            .get_mut(name)
            .ok_or_else(|| anyhow!("Registered model {} not found", name))?;
        if !model.versions.iter().any(|v| v.version == version) {
            bail!("Version {} of {} does not exist", version, name);
        }
        model.aliases.insert(alias.to_string(), version.to_string());
        write_json(&path, &registry).await
    }

    async fn latest_runs(
        &self,
        experiment_name: &str,
        max_results: usize,
    ) -> Result<Vec<RunSummary>> {
        let experiments: BTreeMap<String, String> =
            read_json(&self.experiments_path()).await?.unwrap_or_default();
        let Some(experiment_id) = experiments.get(experiment_name) else {
            bail!("Experiment {} not found", experiment_name);
        };

        let mut runs: Vec<StoredRun> = self
            .stored_runs()
            .await?
            .into_iter()
            .filter(|run| &run.info.experiment_id == experiment_id)
            .collect();
        runs.sort_by(|a, b| (b.start_time, b.sequence).cmp(&(a.start_time, a.sequence)));
        runs.truncate(max_results);

        Ok(runs
            .into_iter()
            .map(|run| RunSummary {
                run_id: run.info.run_id,
                run_name: run.info.run_name,
                status: run.status.as_str().to_string(),
                start_time: run.start_time,
                artifact_uri: run.info.artifact_uri,
                metrics: run.metrics,
                params: run.params,
                tags: run.tags,
            })
            .collect())
    }

    async fn download_model(&self, source: &ModelSource, dest: &Path) -> Result<()> {
        let path = self.model_path(source).await?;
        if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        fs::copy(&path, dest)
            .await
            .with_context(|| format!("Failed to copy model for {} from {}", source, path.display()))?;
        Ok(())
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .with_context(|| format!("Corrupt tracking file {}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

async fn write_json<T: Serialize + Sync>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    fs::write(path, bytes)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracking::MODEL_ARTIFACT_DIR;

    async fn run_with_model(store: &FileStore, dir: &Path, name: &str) -> RunInfo {
        let experiment = store.ensure_experiment("Fraud Detection").await.unwrap();
        let run = store.start_run(&experiment, name).await.unwrap();
        let model = dir.join(MODEL_FILE_NAME);
        std::fs::write(&model, name.as_bytes()).unwrap();
        store
            .log_artifact(&run, &model, MODEL_ARTIFACT_DIR)
            .await
            .unwrap();
        run
    }

    #[tokio::test]
    async fn test_experiment_ids_are_stable() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("mlruns"));
        let first = store.ensure_experiment("Fraud Detection").await.unwrap();
        let again = store.ensure_experiment("Fraud Detection").await.unwrap();
        let other = store.ensure_experiment("Other").await.unwrap();
        assert_eq!(first, again);
        assert_ne!(first, other);
    }

    #[tokio::test]
    async fn test_run_records_params_metrics_and_tags() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("mlruns"));
        let experiment = store.ensure_experiment("Fraud Detection").await.unwrap();
        let run = store.start_run(&experiment, "config_1").await.unwrap();

        let params = BTreeMap::from([("n_estimators".to_string(), "100".to_string())]);
        let metrics = BTreeMap::from([("test_f1".to_string(), 0.8)]);
        let tags = BTreeMap::from([("model_type".to_string(), "RandomForest".to_string())]);
        store.log_params(&run.run_id, &params).await.unwrap();
        store.log_metrics(&run.run_id, &metrics).await.unwrap();
        store.set_tags(&run.run_id, &tags).await.unwrap();
        store.end_run(&run.run_id, RunStatus::Finished).await.unwrap();

        let runs = store.latest_runs("Fraud Detection", 10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, "FINISHED");
        assert_eq!(runs[0].metric("test_f1"), Some(0.8));
        assert_eq!(runs[0].params["n_estimators"], "100");
        assert_eq!(runs[0].tags["model_type"], "RandomForest");
    }

    #[tokio::test]
    async fn test_latest_runs_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("mlruns"));
        for name in ["config_1", "config_2", "config_3"] {
            run_with_model(&store, dir.path(), name).await;
        }
        let runs = store.latest_runs("Fraud Detection", 2).await.unwrap();
        let names: Vec<&str> = runs.iter().map(|r| r.run_name.as_str()).collect();
        assert_eq!(names, vec!["config_3", "config_2"]);
    }

    #[tokio::test]
    async fn test_register_alias_and_download() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("mlruns"));
        let first = run_with_model(&store, dir.path(), "config_1").await;
        let second = run_with_model(&store, dir.path(), "config_2").await;

        let name = "fraud_detection_model";
        assert_eq!(store.register_model(name, &first, "model").await.unwrap(), "1");
        assert_eq!(store.register_model(name, &second, "model").await.unwrap(), "2");
        store.set_alias(name, "champion", "2").await.unwrap();
        assert!(store.set_alias(name, "champion", "9").await.is_err());

        let dest = dir.path().join("out").join("best.bin");
        let source = ModelSource::Alias {
            name: name.to_string(),
            alias: "champion".to_string(),
        };
        store.download_model(&source, &dest).await.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"config_2");

        let by_run = ModelSource::Run {
            run_id: first.run_id.clone(),
        };
        store.download_model(&by_run, &dest).await.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"config_1");
    }

    #[tokio::test]
    async fn test_unknown_alias_and_experiment_fail() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("mlruns"));
        let source = ModelSource::Alias {
            name: "fraud_detection_model".to_string(),
            alias: "production".to_string(),
        };
        assert!(store
            .download_model(&source, &dir.path().join("x.bin"))
            .await
            .is_err());
        assert!(store.latest_runs("Missing", 1).await.is_err());
    }

    #[tokio::test]
    async fn test_register_requires_logged_model() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("mlruns"));
        let experiment = store.ensure_experiment("Fraud Detection").await.unwrap();
        let run = store.start_run(&experiment, "config_1").await.unwrap();
        assert!(store.register_model("m", &run, "model").await.is_err());
    }
}
