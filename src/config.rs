//! Configuration management for the fraud detection workflow

use crate::evaluation::ScoringMetric;
use crate::forest::{ClassWeight, ForestParams};
use crate::serving::ErrorPolicy;
use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub data: DataConfig,
    pub training: TrainingConfig,
    pub tracking: TrackingConfig,
    pub model: ModelConfig,
    pub serving: ServingConfig,
    pub pipeline: PipelineConfig,
    pub logging: LoggingConfig,
}

/// Dataset acquisition and preprocessing configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DataConfig {
    /// Directory holding the raw CSV
    pub raw_dir: PathBuf,
    /// Directory for the processed arrays and the fitted scaler
    pub processed_dir: PathBuf,
    /// File name of the raw CSV inside `raw_dir`
    pub dataset_file: String,
    /// Where the dataset is downloaded from when absent
    pub dataset_url: String,
    /// Binary target column
    pub label_column: String,
    /// Columns excluded from the feature vector
    pub drop_columns: Vec<String>,
    /// Fraction of samples held out for testing
    pub test_size: f64,
    /// Download request timeout in seconds
    pub download_timeout_secs: u64,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            raw_dir: PathBuf::from("data/raw"),
            processed_dir: PathBuf::from("data/processed"),
            dataset_file: "creditcard.csv".to_string(),
            dataset_url: "https://www.kaggle.com/datasets/mlg-ulb/creditcardfraud/download"
                .to_string(),
            label_column: "Class".to_string(),
            drop_columns: vec!["Time".to_string()],
            test_size: 0.2,
            download_timeout_secs: 600,
        }
    }
}

impl DataConfig {
    /// Full path of the raw dataset
    pub fn raw_dataset_path(&self) -> PathBuf {
        self.raw_dir.join(&self.dataset_file)
    }
}

/// Training and model selection configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Seed shared by the split, the folds and the forests
    pub random_state: u64,
    /// Number of stratified cross-validation folds
    pub cv_splits: usize,
    /// Metric used for cross-validation and for picking the best run
    pub scoring: ScoringMetric,
    /// Hyperparameter configurations tried in order
    pub configs: Vec<ForestParams>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            random_state: 42,
            cv_splits: 5,
            scoring: ScoringMetric::F1,
            configs: default_forest_configs(),
        }
    }
}

/// The three RandomForest configurations tried by default
pub fn default_forest_configs() -> Vec<ForestParams> {
    vec![
        ForestParams {
            n_estimators: 100,
            max_depth: Some(10),
            min_samples_split: 5,
            min_samples_leaf: 2,
            class_weight: ClassWeight::Balanced,
        },
        ForestParams {
            n_estimators: 200,
            max_depth: Some(15),
            min_samples_split: 3,
            min_samples_leaf: 1,
            class_weight: ClassWeight::Balanced,
        },
        ForestParams {
            n_estimators: 150,
            max_depth: Some(12),
            min_samples_split: 4,
            min_samples_leaf: 2,
            class_weight: ClassWeight::BalancedSubsample,
        },
    ]
}

/// Experiment tracking store configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// `http(s)://` for an MLflow server, `file://<dir>` for a local store, `none` to disable
    pub uri: String,
    /// Experiment every run is recorded under
    pub experiment_name: String,
    /// Registry name the trained models are registered as
    pub registered_model_name: String,
    /// Alias pointing at the best version after training
    pub best_alias: String,
    /// Timeout for tracking store requests in seconds
    pub request_timeout_secs: u64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            uri: "file://mlruns".to_string(),
            experiment_name: "Fraud Detection".to_string(),
            registered_model_name: "fraud_detection_model".to_string(),
            best_alias: "champion".to_string(),
            request_timeout_secs: 30,
        }
    }
}

/// Persisted model configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Stable path of the best model
    pub path: PathBuf,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("models/best_model.bin"),
        }
    }
}

impl ModelConfig {
    /// Directory containing the model file
    pub fn models_dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }
}

/// Listen address of one HTTP service
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenConfig {
    pub host: String,
    pub port: u16,
}

impl ListenConfig {
    /// Get bind address
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Serving configuration shared by both HTTP variants
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServingConfig {
    /// Listen address of the `/prediz` API
    pub api: ListenConfig,
    /// Listen address of the `/predict` gateway
    pub gateway: ListenConfig,
    /// Probability at or above which a transaction is flagged
    pub threshold: f64,
    /// How request failures are reported to clients
    pub error_policy: ErrorPolicy,
    /// Registry aliases tried in order before falling back to `model.path`
    pub registry_aliases: Vec<String>,
}

impl Default for ServingConfig {
    fn default() -> Self {
        Self {
            api: ListenConfig {
                host: "0.0.0.0".to_string(),
                port: 8000,
            },
            gateway: ListenConfig {
                host: "0.0.0.0".to_string(),
                port: 5001,
            },
            threshold: 0.5,
            error_policy: ErrorPolicy::Detailed,
            registry_aliases: vec!["production".to_string(), "champion".to_string()],
        }
    }
}

/// End-to-end pipeline configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Test accuracy the best model must exceed to be promoted
    pub min_deploy_accuracy: f64,
    /// Alias given to a promoted model version
    pub production_alias: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            min_deploy_accuracy: 0.8,
            production_alias: "production".to_string(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (json, pretty)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default file location
    pub fn load() -> Result<Self> {
        Self::load_from_path("config/config.toml")
    }

    /// Load configuration from a specific path.
    ///
    /// Layers, lowest priority first: built-in defaults, the file (optional),
    /// `FRAUD__SECTION__KEY` environment variables, and `MLFLOW_TRACKING_URI`.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Config::builder()
            .add_source(File::from(path.as_ref()).required(false))
            .add_source(
                Environment::with_prefix("FRAUD")
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override_option("tracking.uri", std::env::var("MLFLOW_TRACKING_URI").ok())
            .context("Failed to apply tracking URI override")?
            .build()
            .context("Failed to build configuration")?;

        let config: Self = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the workflow cannot run with
    pub fn validate(&self) -> Result<()> {
        let threshold = self.serving.threshold;
        if !(threshold > 0.0 && threshold < 1.0) {
            bail!("serving.threshold must lie strictly between 0 and 1, got {threshold}");
        }
        let test_size = self.data.test_size;
        if !(test_size > 0.0 && test_size < 1.0) {
            bail!("data.test_size must lie strictly between 0 and 1, got {test_size}");
        }
        if self.training.cv_splits < 2 {
            bail!(
                "training.cv_splits must be at least 2, got {}",
                self.training.cv_splits
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.serving.threshold, 0.5);
        assert_eq!(config.serving.api.port, 8000);
        assert_eq!(config.serving.gateway.port, 5001);
        assert_eq!(config.training.configs.len(), 3);
        assert_eq!(config.training.scoring, ScoringMetric::F1);
        assert_eq!(config.data.drop_columns, vec!["Time".to_string()]);
        assert_eq!(
            config.data.raw_dataset_path(),
            PathBuf::from("data/raw/creditcard.csv")
        );
    }

    #[test]
    fn test_default_forest_configs() {
        let configs = default_forest_configs();
        assert_eq!(configs[0].n_estimators, 100);
        assert_eq!(configs[1].max_depth, Some(15));
        assert_eq!(configs[2].class_weight, ClassWeight::BalancedSubsample);
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
[training]
scoring = "roc_auc"
cv_splits = 3

[serving]
error_policy = "generic"
"#
        )
        .unwrap();

        let config = AppConfig::load_from_path(&path).unwrap();
        assert_eq!(config.training.scoring, ScoringMetric::RocAuc);
        assert_eq!(config.training.cv_splits, 3);
        assert_eq!(config.serving.error_policy, ErrorPolicy::Generic);
        // untouched sections keep their defaults
        assert_eq!(config.training.configs.len(), 3);
        assert_eq!(config.tracking.experiment_name, "Fraud Detection");
    }

    #[test]
    fn test_out_of_range_threshold_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        for threshold in ["1.5", "0.0", "1.0", "-0.2"] {
            let path = dir.path().join("config.toml");
            std::fs::write(&path, format!("[serving]\nthreshold = {threshold}\n")).unwrap();
            let err = AppConfig::load_from_path(&path).unwrap_err();
            assert!(err.to_string().contains("serving.threshold"), "{threshold}: {err}");
        }

        let mut config = AppConfig::default();
        config.serving.threshold = 0.7;
        assert!(config.validate().is_ok());
        config.training.cv_splits = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = AppConfig::load_from_path("/nonexistent/config.toml").unwrap();
        assert_eq!(config.model.path, PathBuf::from("models/best_model.bin"));
    }
}
