mod common;

use fraud_detection_mlops::config::AppConfig;
use fraud_detection_mlops::forest::{ClassWeight, ForestParams, RandomForestClassifier};
use fraud_detection_mlops::pipeline::promote;
use fraud_detection_mlops::preprocessing::ProcessedData;
use fraud_detection_mlops::tracking::{open_store, FileStore, ModelSource, TrackingStore};
use fraud_detection_mlops::training::{run_training, BEST_CONFIG_FILE};
use std::path::Path;
use std::sync::Arc;

fn config_in(dir: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.data.processed_dir = dir.join("processed");
    config.model.path = dir.join("models").join("best_model.bin");
    config.tracking.uri = format!("file://{}", dir.join("mlruns").display());
    config.training.cv_splits = 3;
    config.training.configs = vec![
        ForestParams {
            n_estimators: 5,
            max_depth: Some(3),
            ..common::small_params()
        },
        common::small_params(),
        ForestParams {
            n_estimators: 8,
            class_weight: ClassWeight::BalancedSubsample,
            ..common::small_params()
        },
    ];
    config
}

#[tokio::test]
async fn test_training_selects_and_registers_best() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    common::processed_data()
        .save(&config.data.processed_dir)
        .unwrap();

    let store = Arc::new(FileStore::new(dir.path().join("mlruns")));
    let summary = run_training(&config, store.clone()).await.unwrap();

    assert_eq!(summary.runs.len(), 3);
    for run in &summary.runs {
        assert!(summary.best.score >= run.score);
        assert!(run.registered_version.is_some());
    }
    assert_eq!(summary.runs.iter().filter(|run| run.is_best).count(), 1);
    assert!(summary.runs[summary.best.config_index].is_best);
    assert_eq!(summary.best.run_name, format!("config_{}", summary.best.config_index + 1));

    let model = RandomForestClassifier::load(&config.model.path).unwrap();
    assert_eq!(model.n_features(), common::WIDTH);
    assert!(config.data.processed_dir.join(BEST_CONFIG_FILE).exists());

    let tracked = store
        .latest_runs(&config.tracking.experiment_name, 10)
        .await
        .unwrap();
    assert_eq!(tracked.len(), 3);
    for run in &tracked {
        assert!(run.tags.contains_key("is_best_model"));
        assert!(run.metric("test_f1").is_some());
        assert!(run.metric("cv_score_mean").is_some());
    }

    let champion = dir.path().join("champion.bin");
    store
        .download_model(
            &ModelSource::Alias {
                name: config.tracking.registered_model_name.clone(),
                alias: config.tracking.best_alias.clone(),
            },
            &champion,
        )
        .await
        .unwrap();
    assert!(RandomForestClassifier::load(&champion).is_ok());

    let outcome = promote(&config, store.as_ref(), summary).await.unwrap();
    assert!(outcome.promoted_version.is_some());
}

#[tokio::test]
async fn test_training_without_processed_data_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    let store = Arc::new(FileStore::new(dir.path().join("mlruns")));
    assert!(run_training(&config, store).await.is_err());
}

/// Fraud only on the middle sixth of `[0, 3)`; a single split cannot isolate it.
fn interval_rows(n: usize, offset: f64) -> (Vec<Vec<f64>>, Vec<u8>) {
    (0..n)
        .map(|i| {
            let x = (i as f64 + offset) * 3.0 / n as f64;
            (vec![x], u8::from((1.0..1.5).contains(&x)))
        })
        .unzip()
}

#[tokio::test]
async fn test_only_final_winner_is_tagged_best() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config_in(dir.path());
    let stump = ForestParams {
        n_estimators: 10,
        max_depth: Some(1),
        min_samples_split: 2,
        min_samples_leaf: 1,
        class_weight: ClassWeight::None,
    };
    let deep = ForestParams {
        max_depth: Some(6),
        ..stump.clone()
    };
    config.training.configs = vec![stump, deep];

    let (x_train, y_train) = interval_rows(300, 0.25);
    let (x_test, y_test) = interval_rows(100, 0.5);
    ProcessedData {
        x_train,
        x_test,
        y_train,
        y_test,
        feature_names: vec!["x".to_string()],
    }
    .save(&config.data.processed_dir)
    .unwrap();

    let store = Arc::new(FileStore::new(dir.path().join("mlruns")));
    let summary = run_training(&config, store.clone()).await.unwrap();

    assert!(summary.runs[0].score < summary.runs[1].score);
    assert_eq!(summary.best.run_name, "config_2");
    assert!(!summary.runs[0].is_best);
    assert!(summary.runs[1].is_best);

    let tracked = store
        .latest_runs(&config.tracking.experiment_name, 10)
        .await
        .unwrap();
    for run in &tracked {
        let expected = if run.run_name == "config_2" { "true" } else { "false" };
        assert_eq!(run.tags["is_best_model"], expected, "{}", run.run_name);
    }
}

#[tokio::test]
async fn test_unreachable_tracking_still_persists_best_model() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config_in(dir.path());
    config.tracking.uri = "http://127.0.0.1:9".to_string();
    config.tracking.request_timeout_secs = 2;
    common::processed_data()
        .save(&config.data.processed_dir)
        .unwrap();

    let store = open_store(&config.tracking).unwrap();
    let summary = run_training(&config, store).await.unwrap();

    assert_eq!(summary.runs.len(), 3);
    assert!(summary.best.registered_version.is_none());
    assert!(summary.runs.iter().all(|run| run.registered_version.is_none()));
    assert!(config.model.path.exists());
    assert!(RandomForestClassifier::load(&config.model.path).is_ok());
}
