//! MLflow tracking server client (REST API 2.0)

use super::{now_millis, ModelSource, RunInfo, RunStatus, RunSummary, TrackingStore, MODEL_FILE_NAME};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Artifact URIs served through the tracking server's artifact proxy.
const PROXIED_ARTIFACT_SCHEME: &str = "mlflow-artifacts:/";

/// [`TrackingStore`] talking to an MLflow server.
pub struct MlflowStore {
    base_url: String,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    error_code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct RunEnvelope {
    run: WireRun,
}

#[derive(Debug, Deserialize)]
struct WireRun {
    info: WireRunInfo,
    #[serde(default)]
    data: WireRunData,
}

#[derive(Debug, Deserialize)]
struct WireRunInfo {
    run_id: String,
    experiment_id: String,
    #[serde(default)]
    run_name: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    start_time: Option<i64>,
    #[serde(default)]
    artifact_uri: String,
}

#[derive(Debug, Default, Deserialize)]
struct WireRunData {
    #[serde(default)]
    metrics: Vec<WireMetric>,
    #[serde(default)]
    params: Vec<KeyValue>,
    #[serde(default)]
    tags: Vec<KeyValue>,
}

#[derive(Debug, Deserialize)]
struct WireMetric {
    key: String,
    value: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct KeyValue {
    key: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct ModelVersionEnvelope {
    model_version: WireModelVersion,
}

#[derive(Debug, Deserialize)]
struct WireModelVersion {
    version: String,
    #[serde(default)]
    source: String,
}

impl From<WireRun> for RunSummary {
    fn from(run: WireRun) -> Self {
        RunSummary {
            run_id: run.info.run_id,
            run_name: run.info.run_name,
            status: run.info.status,
            start_time: run.info.start_time.unwrap_or_default(),
            artifact_uri: run.info.artifact_uri,
            metrics: run
                .data
                .metrics
                .into_iter()
                .map(|m| (m.key, m.value))
                .collect(),
            params: run.data.params.into_iter().map(|p| (p.key, p.value)).collect(),
            tags: run.data.tags.into_iter().map(|t| (t.key, t.value)).collect(),
        }
    }
}

fn key_values(map: &BTreeMap<String, String>) -> Vec<KeyValue> {
    map.iter()
        .map(|(key, value)| KeyValue {
            key: key.clone(),
            value: value.clone(),
        })
        .collect()
}

/// Path of an artifact below the server's proxy endpoint, e.g.
/// `mlflow-artifacts:/1/abc/artifacts/model` → `1/abc/artifacts/model`.
fn proxied_artifact_path(uri: &str) -> Result<&str> {
    uri.strip_prefix(PROXIED_ARTIFACT_SCHEME)
        .map(|rest| rest.trim_start_matches('/'))
        .ok_or_else(|| {
            anyhow!(
                "Artifact location {} is not served by the tracking server",
                uri
            )
        })
}

impl MlflowStore {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build tracking HTTP client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn api_url(&self, endpoint: &str) -> String {
        format!("{}/api/2.0/mlflow/{}", self.base_url, endpoint)
    }

    fn artifact_url(&self, path: &str) -> String {
        format!("{}/api/2.0/mlflow-artifacts/artifacts/{}", self.base_url, path)
    }

    async fn post<T: DeserializeOwned>(&self, endpoint: &str, body: Value) -> Result<T> {
        let response = self
            .client
            .post(self.api_url(endpoint))
            .json(&body)
            .send()
            .await
            .with_context(|| format!("MLflow request {} failed", endpoint))?;
        decode(endpoint, response).await
    }

    async fn get<T: DeserializeOwned>(&self, endpoint: &str, query: &[(&str, &str)]) -> Result<T> {
        let response = self
            .client
            .get(self.api_url(endpoint))
            .query(query)
            .send()
            .await
            .with_context(|| format!("MLflow request {} failed", endpoint))?;
        decode(endpoint, response).await
    }

    async fn log_batch(&self, run_id: &str, body: Value) -> Result<()> {
        let mut payload = json!({ "run_id": run_id });
        if let (Some(target), Some(fields)) = (payload.as_object_mut(), body.as_object()) {
            target.extend(fields.clone());
        }
        let _: Value = self.post("runs/log-batch", payload).await?;
        Ok(())
    }

    async fn find_experiment(&self, name: &str) -> Result<Option<String>> {
        let response = self
            .client
            .get(self.api_url("experiments/get-by-name"))
            .query(&[("experiment_name", name)])
            .send()
            .await
            .context("MLflow request experiments/get-by-name failed")?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body: Value = decode("experiments/get-by-name", response).await?;
        Ok(body["experiment"]["experiment_id"]
            .as_str()
            .map(str::to_string))
    }

    async fn model_source_uri(&self, source: &ModelSource) -> Result<String> {
        match source {
            ModelSource::Alias { name, alias } => {
                let found: ModelVersionEnvelope = self
                    .get(
                        "registered-models/alias",
                        &[("name", name.as_str()), ("alias", alias.as_str())],
                    )
                    .await?;
                debug!(model = %name, alias = %alias, version = %found.model_version.version, "Alias resolved");
                Ok(found.model_version.source)
            }
            ModelSource::Run { run_id } => {
                let found: RunEnvelope = self.get("runs/get", &[("run_id", run_id.as_str())]).await?;
                Ok(format!(
                    "{}/{}",
                    found.run.info.artifact_uri,
                    super::MODEL_ARTIFACT_DIR
                ))
            }
        }
    }
}

async fn decode<T: DeserializeOwned>(endpoint: &str, response: reqwest::Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return response
            .json()
            .await
            .with_context(|| format!("Invalid MLflow response for {}", endpoint));
    }
    let text = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ApiErrorBody>(&text) {
        Ok(err) => bail!(
            "MLflow {} returned {} {}: {}",
            endpoint,
            status,
            err.error_code,
            err.message
        ),
        Err(_) => bail!("MLflow {} returned {}", endpoint, status),
    }
}

#[async_trait]
impl TrackingStore for MlflowStore {
    fn kind(&self) -> &'static str {
        "mlflow"
    }

    async fn ensure_experiment(&self, name: &str) -> Result<String> {
        if let Some(id) = self.find_experiment(name).await? {
            return Ok(id);
        }
        let created: Value = self
            .post("experiments/create", json!({ "name": name }))
            .await?;
        created["experiment_id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("experiments/create returned no id"))
    }

    async fn start_run(&self, experiment_id: &str, run_name: &str) -> Result<RunInfo> {
        let created: RunEnvelope = self
            .post(
                "runs/create",
                json!({
                    "experiment_id": experiment_id,
                    "run_name": run_name,
                    "start_time": now_millis(),
                    "tags": [{ "key": "mlflow.runName", "value": run_name }],
                }),
            )
            .await?;
        let info = created.run.info;
        Ok(RunInfo {
            run_id: info.run_id,
            experiment_id: info.experiment_id,
            run_name: run_name.to_string(),
            artifact_uri: info.artifact_uri,
        })
    }

    async fn log_params(&self, run_id: &str, params: &BTreeMap<String, String>) -> Result<()> {
        self.log_batch(run_id, json!({ "params": key_values(params) }))
            .await
    }

    async fn log_metrics(&self, run_id: &str, metrics: &BTreeMap<String, f64>) -> Result<()> {
        let timestamp = now_millis();
        let metrics: Vec<Value> = metrics
            .iter()
            .map(|(key, value)| json!({ "key": key, "value": value, "timestamp": timestamp, "step": 0 }))
            .collect();
        self.log_batch(run_id, json!({ "metrics": metrics })).await
    }

    async fn set_tags(&self, run_id: &str, tags: &BTreeMap<String, String>) -> Result<()> {
        self.log_batch(run_id, json!({ "tags": key_values(tags) }))
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
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow!("Artifact path {} has no file name", local_path.display()))?;
        let root = proxied_artifact_path(&run.artifact_uri)?;
        let relative = if artifact_dir.is_empty() {
            file_name.to_string()
        } else {
            format!("{}/{}", artifact_dir.trim_matches('/'), file_name)
        };
        let url = self.artifact_url(&format!("{}/{}", root, relative));

        let bytes = tokio::fs::read(local_path)
            .await
            .with_context(|| format!("Failed to read {}", local_path.display()))?;
        let response = self
            .client
            .put(&url)
            .body(bytes)
            .send()
            .await
            .with_context(|| format!("Artifact upload of {} failed", file_name))?;
        if !response.status().is_success() {
            bail!("Artifact upload of {} returned {}", file_name, response.status());
        }
        Ok(())
    }

    async fn end_run(&self, run_id: &str, status: RunStatus) -> Result<()> {
        let _: Value = self
            .post(
                "runs/update",
                json!({ "run_id": run_id, "status": status.as_str(), "end_time": now_millis() }),
            )
            .await?;
        Ok(())
    }

    async fn register_model(
        &self,
        name: &str,
        run: &RunInfo,
        artifact_dir: &str,
    ) -> Result<String> {
        let response = self
            .client
            .post(self.api_url("registered-models/create"))
            .json(&json!({ "name": name }))
            .send()
            .await
            .context("MLflow request registered-models/create failed")?;
        // an existing registered model answers with RESOURCE_ALREADY_EXISTS
        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            let err: Option<ApiErrorBody> = serde_json::from_str(&text).ok();
            if err.map(|e| e.error_code) != Some("RESOURCE_ALREADY_EXISTS".to_string()) {
                bail!("Failed to create registered model {}: {}", name, text);
            }
        }

        let created: ModelVersionEnvelope = self
            .post(
                "model-versions/create",
                json!({
                    "name": name,
                    "source": format!("{}/{}", run.artifact_uri, artifact_dir),
                    "run_id": run.run_id,
                }),
            )
            .await?;
        Ok(created.model_version.version)
    }

    async fn set_alias(&self, name: &str, alias: &str, version: &str) -> Result<()> {
        let _: Value = self
            .post(
                "registered-models/alias",
                json!({ "name": name, "alias": alias, "version": version }),
            )
            .await?;
        Ok(())
    }

    async fn latest_runs(
        &self,
        experiment_name: &str,
        max_results: usize,
    ) -> Result<Vec<RunSummary>> {
        let experiment_id = self
            .find_experiment(experiment_name)
            .await?
            .ok_or_else(|| anyhow!("Experiment {} not found", experiment_name))?;

        #[derive(Deserialize)]
        struct SearchResponse {
            #[serde(default)]
            runs: Vec<WireRun>,
        }

        let found: SearchResponse = self
            .post(
                "runs/search",
                json!({
                    "experiment_ids": [experiment_id],
                    "max_results": max_results,
                    "order_by": ["attributes.start_time DESC"],
                }),
            )
            .await?;
        Ok(found.runs.into_iter().map(RunSummary::from).collect())
    }

    async fn download_model(&self, source: &ModelSource, dest: &Path) -> Result<()> {
        let location = self.model_source_uri(source).await?;
        let path = proxied_artifact_path(&location)?;
        let url = self.artifact_url(&format!("{}/{}", path, MODEL_FILE_NAME));

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Model download for {} failed", source))?;
        if !response.status().is_success() {
            bail!("Model download for {} returned {}", source, response.status());
        }
        let bytes = response.bytes().await?;

        if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest, &bytes)
            .await
            .with_context(|| format!("Failed to write {}", dest.display()))?;
        debug!(source = %source, bytes = bytes.len(), "Model downloaded");
        Ok(())
    }
}
