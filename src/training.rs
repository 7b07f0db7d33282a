//! Training and model selection.
//!
//! Every configuration is cross-validated, fitted on the full training set,
//! evaluated on the test set and logged as its own tracking run. The model
//! with the strictly highest test score wins; on ties the earlier
//! configuration is kept.

use crate::config::AppConfig;
use crate::evaluation::{cross_validate, CvSummary, EvaluationReport, ScoringMetric, StratifiedKFold};
use crate::forest::RandomForestClassifier;
use crate::preprocessing::ProcessedData;
use crate::tracking::{NoopStore, RunInfo, RunStatus, TrackingStore, MODEL_ARTIFACT_DIR, MODEL_FILE_NAME};
use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

pub use crate::forest::ForestParams;

pub const MODEL_TYPE: &str = "RandomForestClassifier";
pub const BEST_CONFIG_FILE: &str = "best_config.json";
pub const FEATURE_IMPORTANCE_FILE: &str = "feature_importance.csv";
pub const CONFUSION_MATRIX_FILE: &str = "confusion_matrix.json";

/// Keeps the highest-scoring candidate seen so far.
#[derive(Debug)]
pub struct BestTracker<T> {
    best: Option<(f64, T)>,
}

impl<T> Default for BestTracker<T> {
    fn default() -> Self {
        Self { best: None }
    }
}

impl<T> BestTracker<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer a candidate; it replaces the current best only when its score is
    /// strictly greater. Returns whether it was taken.
    pub fn offer(&mut self, score: f64, candidate: T) -> bool {
        let wins = match &self.best {
            None => true,
            Some((best, _)) => score > *best,
        };
        if wins {
            self.best = Some((score, candidate));
        }
        wins
    }

    pub fn best_score(&self) -> Option<f64> {
        self.best.as_ref().map(|(score, _)| *score)
    }

    pub fn into_best(self) -> Option<(f64, T)> {
        self.best
    }
}

/// Outcome of one configuration's run.
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub config_index: usize,
    pub run_name: String,
    pub run_id: String,
    pub params: ForestParams,
    pub cv: CvSummary,
    pub test: EvaluationReport,
    /// Test score under the selection metric
    pub score: f64,
    /// Whether this run is the one finally selected
    pub is_best: bool,
    pub registered_version: Option<String>,
}

/// The winning configuration and where its model was persisted.
#[derive(Debug, Clone, Serialize)]
pub struct SelectedModel {
    pub config_index: usize,
    pub run_name: String,
    pub run_id: String,
    pub params: ForestParams,
    pub metric: ScoringMetric,
    pub score: f64,
    pub test: EvaluationReport,
    pub registered_version: Option<String>,
    pub model_path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainingSummary {
    pub best: SelectedModel,
    pub runs: Vec<RunRecord>,
}

/// Train every configured forest, log each run and persist the best model.
pub async fn run_training(
    config: &AppConfig,
    store: Arc<dyn TrackingStore>,
) -> Result<TrainingSummary> {
    let training = &config.training;
    let tracking = &config.tracking;

    let data = ProcessedData::load(&config.data.processed_dir)
        .context("Cannot train without processed data")?;
    if training.configs.is_empty() {
        return Err(anyhow!("No model configurations to train"));
    }
    let data = Arc::new(data);

    info!(
        configs = training.configs.len(),
        train = data.y_train.len(),
        test = data.y_test.len(),
        features = data.n_features(),
        scoring = training.scoring.as_str(),
        "Starting training"
    );

    let (store, experiment_id) = match store.ensure_experiment(&tracking.experiment_name).await {
        Ok(id) => (store, id),
        Err(e) => {
            warn!(
                backend = store.kind(),
                error = %e,
                "Tracking store unavailable, continuing without tracking"
            );
            let noop: Arc<dyn TrackingStore> = Arc::new(NoopStore);
            let id = noop.ensure_experiment(&tracking.experiment_name).await?;
            (noop, id)
        }
    };

    let work_root = config.model.models_dir().join("runs");
    let mut tracker: BestTracker<(usize, RandomForestClassifier)> = BestTracker::new();
    let mut runs = Vec::with_capacity(training.configs.len());

    for (i, params) in training.configs.iter().enumerate() {
        let run_name = format!("config_{}", i + 1);
        let run = match store.start_run(&experiment_id, &run_name).await {
            Ok(run) => run,
            Err(e) => {
                warn!(run = %run_name, error = %e, "Failed to start tracking run");
                NoopStore.start_run(&experiment_id, &run_name).await?
            }
        };

        let started = Instant::now();
        let outcome = train_configuration(config, &data, params.clone()).await;
        let (cv, model, test) = match outcome {
            Ok(result) => result,
            Err(e) => {
                soft(store.end_run(&run.run_id, RunStatus::Failed).await, "end_run");
                return Err(e.context(format!("Training {} failed", run_name)));
            }
        };
        let score = test.score(training.scoring);

        info!(
            run = %run_name,
            cv_mean = format!("{:.4}", cv.mean()),
            cv_std = format!("{:.4}", cv.std()),
            test_score = format!("{:.4}", score),
            accuracy = format!("{:.4}", test.accuracy),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Configuration trained"
        );

        log_run(config, store.as_ref(), &run, params, &cv, &test).await;

        let work_dir = work_root.join(&run_name);
        let registered_version = match write_run_artifacts(&work_dir, &model, &data.feature_names, &test) {
            Ok(()) => log_artifacts(config, store.as_ref(), &run, &work_dir).await,
            Err(e) => {
                warn!(run = %run_name, error = %e, "Failed to write run artifacts");
                None
            }
        };

        tracker.offer(score, (runs.len(), model));
        soft(store.end_run(&run.run_id, RunStatus::Finished).await, "end_run");

        runs.push(RunRecord {
            config_index: i,
            run_name,
            run_id: run.run_id,
            params: params.clone(),
            cv,
            test,
            score,
            is_best: false,
            registered_version,
        });
    }

    let (score, (best_idx, best_model)) = tracker
        .into_best()
        .ok_or_else(|| anyhow!("No configuration produced a model"))?;
    // tagged only once the winner is known, so superseded runs read false
    for (idx, run) in runs.iter_mut().enumerate() {
        run.is_best = idx == best_idx;
        let tags = BTreeMap::from([("is_best_model".to_string(), run.is_best.to_string())]);
        soft(store.set_tags(&run.run_id, &tags).await, "set_tags");
    }
    let record = &runs[best_idx];

    best_model
        .save(&config.model.path)
        .with_context(|| format!("Failed to save best model to {}", config.model.path.display()))?;

    let best = SelectedModel {
        config_index: record.config_index,
        run_name: record.run_name.clone(),
        run_id: record.run_id.clone(),
        params: record.params.clone(),
        metric: training.scoring,
        score,
        test: record.test.clone(),
        registered_version: record.registered_version.clone(),
        model_path: config.model.path.clone(),
    };

    write_best_config(&config.data.processed_dir.join(BEST_CONFIG_FILE), &best)?;

    if let Some(version) = &best.registered_version {
        soft(
            store
                .set_alias(&tracking.registered_model_name, &tracking.best_alias, version)
                .await,
            "set_alias",
        );
    }

    info!(
        run = %best.run_name,
        metric = best.metric.as_str(),
        score = format!("{:.4}", best.score),
        path = %best.model_path.display(),
        version = ?best.registered_version,
        "Best model selected"
    );

    Ok(TrainingSummary { best, runs })
}

type Trained = (CvSummary, RandomForestClassifier, EvaluationReport);

/// Cross-validate, fit and evaluate one configuration off the async runtime.
async fn train_configuration(
    config: &AppConfig,
    data: &Arc<ProcessedData>,
    params: ForestParams,
) -> Result<Trained> {
    let data = Arc::clone(data);
    let random_state = config.training.random_state;
    let cv_splits = config.training.cv_splits;
    let metric = config.training.scoring;

    tokio::task::spawn_blocking(move || -> Result<Trained> {
        let folds = StratifiedKFold::new(cv_splits).with_random_state(random_state);
        let cv = cross_validate(&params, random_state, &data.x_train, &data.y_train, &folds, metric)?;

        let model = RandomForestClassifier::fit(&params, random_state, &data.x_train, &data.y_train)?;
        let proba = model.predict_proba_batch(&data.x_test)?;
        let test = EvaluationReport::from_probabilities(&data.y_test, &proba, 0.5);
        Ok((cv, model, test))
    })
    .await
    .context("Training task panicked")?
}

async fn log_run(
    config: &AppConfig,
    store: &dyn TrackingStore,
    run: &RunInfo,
    params: &ForestParams,
    cv: &CvSummary,
    test: &EvaluationReport,
) {
    let mut logged_params = params.as_params();
    logged_params.insert("model_type".to_string(), MODEL_TYPE.to_string());
    logged_params.insert(
        "random_state".to_string(),
        config.training.random_state.to_string(),
    );
    soft(store.log_params(&run.run_id, &logged_params).await, "log_params");

    let metrics: BTreeMap<String, f64> = cv
        .as_metrics()
        .into_iter()
        .chain(test.as_metrics("test_"))
        .collect();
    soft(store.log_metrics(&run.run_id, &metrics).await, "log_metrics");

    let tags = BTreeMap::from([
        ("model_type".to_string(), MODEL_TYPE.to_string()),
        ("dataset".to_string(), config.data.dataset_file.clone()),
        ("cv_folds".to_string(), config.training.cv_splits.to_string()),
        (
            "scoring_metric".to_string(),
            config.training.scoring.as_str().to_string(),
        ),
    ]);
    soft(store.set_tags(&run.run_id, &tags).await, "set_tags");
}

/// Log the run's files and register its model. Returns the registered version.
async fn log_artifacts(
    config: &AppConfig,
    store: &dyn TrackingStore,
    run: &RunInfo,
    work_dir: &Path,
) -> Option<String> {
    let model_logged = soft(
        store
            .log_artifact(run, &work_dir.join(MODEL_FILE_NAME), MODEL_ARTIFACT_DIR)
            .await,
        "log_artifact",
    )
    .is_some();
    for file in [FEATURE_IMPORTANCE_FILE, CONFUSION_MATRIX_FILE] {
        soft(store.log_artifact(run, &work_dir.join(file), "").await, "log_artifact");
    }
    if !model_logged {
        return None;
    }

    let name = &config.tracking.registered_model_name;
    match store.register_model(name, run, MODEL_ARTIFACT_DIR).await {
        Ok(version) => {
            info!(model = %name, version = %version, run = %run.run_name, "Model registered");
            Some(version)
        }
        Err(e) => {
            warn!(model = %name, run = %run.run_name, error = %e, "Model registration failed");
            None
        }
    }
}

/// Serialized model, feature importances and confusion matrix for one run.
fn write_run_artifacts(
    dir: &Path,
    model: &RandomForestClassifier,
    feature_names: &[String],
    test: &EvaluationReport,
) -> Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    model.save(dir.join(MODEL_FILE_NAME))?;
    write_feature_importance(&dir.join(FEATURE_IMPORTANCE_FILE), feature_names, model.feature_importances())?;

    let confusion = serde_json::json!({
        "labels": [0, 1],
        "matrix": test.confusion.as_rows(),
    });
    std::fs::write(
        dir.join(CONFUSION_MATRIX_FILE),
        serde_json::to_vec_pretty(&confusion)?,
    )?;
    Ok(())
}

/// `feature,importance` rows, most important first.
pub fn write_feature_importance(path: &Path, names: &[String], importances: &[f64]) -> Result<()> {
    let mut rows: Vec<(String, f64)> = importances
        .iter()
        .enumerate()
        .map(|(i, &value)| {
            let name = names.get(i).cloned().unwrap_or_else(|| format!("f{i}"));
            (name, value)
        })
        .collect();
    rows.sort_by(|a, b| b.1.total_cmp(&a.1));

    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    writer.write_record(["feature", "importance"])?;
    for (name, value) in rows {
        writer.write_record([name, value.to_string()])?;
    }
    writer.flush()?;
    Ok(())
}

fn write_best_config(path: &Path, best: &SelectedModel) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(best)?;
    std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))
}

/// Tracking writes never abort training; failures are logged and dropped.
fn soft<T, E: Display>(result: Result<T, E>, operation: &str) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(operation = operation, error = %e, "Tracking call failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_best_tracker_keeps_earlier_on_tie() {
        let mut tracker = BestTracker::new();
        assert!(tracker.offer(0.8, "config_1"));
        assert!(!tracker.offer(0.8, "config_2"));
        assert!(tracker.offer(0.85, "config_3"));
        assert!(!tracker.offer(0.7, "config_4"));

        assert_eq!(tracker.best_score(), Some(0.85));
        assert_eq!(tracker.into_best(), Some((0.85, "config_3")));
    }

    #[test]
    fn test_best_tracker_first_offer_always_wins() {
        let mut tracker = BestTracker::new();
        assert!(tracker.offer(0.0, 1));
        assert_eq!(tracker.best_score(), Some(0.0));
    }

    #[test]
    fn test_feature_importance_csv_sorted_descending() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(FEATURE_IMPORTANCE_FILE);
        let names = vec!["V1".to_string(), "V2".to_string(), "Amount".to_string()];
        write_feature_importance(&path, &names, &[0.2, 0.5, 0.3]).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines[0], "feature,importance");
        assert_eq!(lines[1], "V2,0.5");
        assert_eq!(lines[2], "Amount,0.3");
        assert_eq!(lines[3], "V1,0.2");
    }

    #[test]
    fn test_soft_swallows_errors() {
        let failed: Result<(), anyhow::Error> = Err(anyhow!("unreachable"));
        assert!(soft(failed, "log_metrics").is_none());
        assert_eq!(soft(Ok::<_, anyhow::Error>(3), "register_model"), Some(3));
    }
}
