//! Train/test split, feature standardization and processed-array persistence.

use crate::config::AppConfig;
use crate::data::{load_csv, npy};
use anyhow::{bail, Context, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

pub const X_TRAIN_FILE: &str = "X_train.npy";
pub const X_TEST_FILE: &str = "X_test.npy";
pub const Y_TRAIN_FILE: &str = "y_train.npy";
pub const Y_TEST_FILE: &str = "y_test.npy";
pub const SCALER_FILE: &str = "scaler.json";
pub const FEATURE_NAMES_FILE: &str = "feature_names.json";

/// Per-feature standardization fitted on the training partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    pub mean: Vec<f64>,
    /// Population standard deviation; 1.0 for constant features
    pub scale: Vec<f64>,
}

impl StandardScaler {
    pub fn fit(rows: &[Vec<f64>]) -> Result<Self> {
        let Some(first) = rows.first() else {
            bail!("Cannot fit a scaler on zero rows");
        };
        let width = first.len();
        let n = rows.len() as f64;

        let mut mean = vec![0.0; width];
        for row in rows {
            if row.len() != width {
                bail!("Row width {} differs from {}", row.len(), width);
            }
            for (acc, value) in mean.iter_mut().zip(row) {
                *acc += value;
            }
        }
        mean.iter_mut().for_each(|m| *m /= n);

        let mut variance = vec![0.0; width];
        for row in rows {
            for ((acc, value), m) in variance.iter_mut().zip(row).zip(&mean) {
                *acc += (value - m).powi(2);
            }
        }

        let scale = variance
            .into_iter()
            .map(|v| {
                let std = (v / n).sqrt();
                if std > f64::EPSILON {
                    std
                } else {
                    1.0
                }
            })
            .collect();

        Ok(Self { mean, scale })
    }

    pub fn n_features(&self) -> usize {
        self.mean.len()
    }

    pub fn transform_row(&self, row: &[f64]) -> Result<Vec<f64>> {
        if row.len() != self.n_features() {
            bail!(
                "Row has {} features, scaler was fitted on {}",
                row.len(),
                self.n_features()
            );
        }
        Ok(row
            .iter()
            .zip(&self.mean)
            .zip(&self.scale)
            .map(|((value, mean), scale)| (value - mean) / scale)
            .collect())
    }

    pub fn transform(&self, rows: &[Vec<f64>]) -> Result<Vec<Vec<f64>>> {
        rows.iter().map(|row| self.transform_row(row)).collect()
    }

    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json =
            fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&json).with_context(|| format!("Invalid scaler in {}", path.display()))
    }
}

/// Sample indices of each partition, both sorted ascending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitIndices {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

/// Stratified split: every class sends `round(count * test_size)` of its
/// shuffled samples to the test partition (at least one when the class has
/// two or more samples).
pub fn stratified_split(labels: &[u8], test_size: f64, seed: u64) -> Result<SplitIndices> {
    if !(test_size > 0.0 && test_size < 1.0) {
        bail!("test_size must be in (0, 1), got {}", test_size);
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut train = Vec::new();
    let mut test = Vec::new();

    for class in [0u8, 1u8] {
        let mut members: Vec<usize> = labels
            .iter()
            .enumerate()
            .filter(|(_, &label)| label == class)
            .map(|(idx, _)| idx)
            .collect();
        if members.is_empty() {
            continue;
        }
        members.shuffle(&mut rng);

        let mut n_test = (members.len() as f64 * test_size).round() as usize;
        if members.len() >= 2 {
            n_test = n_test.clamp(1, members.len() - 1);
        } else {
            n_test = 0;
        }

        debug!(class = class, total = members.len(), test = n_test, "Stratum split");
        test.extend_from_slice(&members[..n_test]);
        train.extend_from_slice(&members[n_test..]);
    }

    if train.is_empty() || test.is_empty() {
        bail!(
            "Split of {} samples produced an empty partition",
            labels.len()
        );
    }

    train.sort_unstable();
    test.sort_unstable();
    Ok(SplitIndices { train, test })
}

/// The four processed arrays the training stage consumes.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedData {
    pub x_train: Vec<Vec<f64>>,
    pub x_test: Vec<Vec<f64>>,
    pub y_train: Vec<u8>,
    pub y_test: Vec<u8>,
    pub feature_names: Vec<String>,
}

impl ProcessedData {
    pub fn n_features(&self) -> usize {
        self.x_train.first().map_or(0, Vec::len)
    }

    pub fn save<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;

        npy::write_matrix(dir.join(X_TRAIN_FILE), &self.x_train)
            .with_context(|| format!("Failed to write {}", X_TRAIN_FILE))?;
        npy::write_matrix(dir.join(X_TEST_FILE), &self.x_test)
            .with_context(|| format!("Failed to write {}", X_TEST_FILE))?;
        npy::write_labels(dir.join(Y_TRAIN_FILE), &self.y_train)
            .with_context(|| format!("Failed to write {}", Y_TRAIN_FILE))?;
        npy::write_labels(dir.join(Y_TEST_FILE), &self.y_test)
            .with_context(|| format!("Failed to write {}", Y_TEST_FILE))?;

        let names = serde_json::to_string_pretty(&self.feature_names)?;
        fs::write(dir.join(FEATURE_NAMES_FILE), names)
            .with_context(|| format!("Failed to write {}", FEATURE_NAMES_FILE))?;
        Ok(())
    }

    /// Load the arrays; any missing file fails before anything is returned.
    /// Feature names are optional and default to `f0..fN`.
    pub fn load<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        for file in [X_TRAIN_FILE, X_TEST_FILE, Y_TRAIN_FILE, Y_TEST_FILE] {
            let path = dir.join(file);
            if !path.exists() {
                bail!(
                    "Processed data file {} not found; run preprocessing first",
                    path.display()
                );
            }
        }

        let x_train = npy::read_matrix(dir.join(X_TRAIN_FILE))
            .with_context(|| format!("Failed to read {}", X_TRAIN_FILE))?;
        let x_test = npy::read_matrix(dir.join(X_TEST_FILE))
            .with_context(|| format!("Failed to read {}", X_TEST_FILE))?;
        let y_train = npy::read_labels(dir.join(Y_TRAIN_FILE))
            .with_context(|| format!("Failed to read {}", Y_TRAIN_FILE))?;
        let y_test = npy::read_labels(dir.join(Y_TEST_FILE))
            .with_context(|| format!("Failed to read {}", Y_TEST_FILE))?;

        if x_train.len() != y_train.len() || x_test.len() != y_test.len() {
            bail!("Processed feature and label arrays differ in length");
        }

        let width = x_train.first().map_or(0, Vec::len);
        let names_path = dir.join(FEATURE_NAMES_FILE);
        let feature_names = match fs::read_to_string(&names_path) {
            Ok(json) => serde_json::from_str(&json)
                .with_context(|| format!("Invalid {}", names_path.display()))?,
            Err(_) => (0..width).map(|i| format!("f{i}")).collect(),
        };

        Ok(Self {
            x_train,
            x_test,
            y_train,
            y_test,
            feature_names,
        })
    }
}

/// Split and standardize a loaded dataset. The scaler only sees training rows.
pub fn prepare(
    features: &[Vec<f64>],
    labels: &[u8],
    feature_names: Vec<String>,
    test_size: f64,
    seed: u64,
) -> Result<(ProcessedData, StandardScaler)> {
    let split = stratified_split(labels, test_size, seed)?;

    let pick_rows = |idx: &[usize]| idx.iter().map(|&i| features[i].clone()).collect::<Vec<_>>();
    let pick_labels = |idx: &[usize]| idx.iter().map(|&i| labels[i]).collect::<Vec<_>>();

    let raw_train = pick_rows(&split.train);
    let raw_test = pick_rows(&split.test);

    let scaler = StandardScaler::fit(&raw_train)?;
    let data = ProcessedData {
        x_train: scaler.transform(&raw_train)?,
        x_test: scaler.transform(&raw_test)?,
        y_train: pick_labels(&split.train),
        y_test: pick_labels(&split.test),
        feature_names,
    };
    Ok((data, scaler))
}

/// Load the raw CSV, split, scale, and write the processed directory.
pub fn run_preprocessing(config: &AppConfig) -> Result<ProcessedData> {
    let data_cfg = &config.data;
    let raw_path = data_cfg.raw_dataset_path();

    let dataset = load_csv(&raw_path, &data_cfg.label_column, &data_cfg.drop_columns)
        .with_context(|| format!("Failed to load {}", raw_path.display()))?;

    let (processed, scaler) = prepare(
        &dataset.features,
        &dataset.labels,
        dataset.feature_names.clone(),
        data_cfg.test_size,
        config.training.random_state,
    )?;

    processed.save(&data_cfg.processed_dir)?;
    scaler.save_json(data_cfg.processed_dir.join(SCALER_FILE))?;

    info!(
        dir = %data_cfg.processed_dir.display(),
        train = processed.y_train.len(),
        test = processed.y_test.len(),
        features = processed.n_features(),
        "Preprocessing complete"
    );

    Ok(processed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scaler_standardizes_training_rows() {
        let rows = vec![
            vec![1.0, 10.0, 5.0],
            vec![2.0, 20.0, 5.0],
            vec![3.0, 30.0, 5.0],
            vec![4.0, 40.0, 5.0],
        ];
        let scaler = StandardScaler::fit(&rows).unwrap();
        let scaled = scaler.transform(&rows).unwrap();

        for col in 0..2 {
            let values: Vec<f64> = scaled.iter().map(|r| r[col]).collect();
            let mean = values.iter().sum::<f64>() / 4.0;
            let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / 4.0;
            assert!(mean.abs() < 1e-12);
            assert!((var - 1.0).abs() < 1e-12);
        }
        // constant column keeps scale 1 and becomes all zeros
        assert_eq!(scaler.scale[2], 1.0);
        assert!(scaled.iter().all(|r| r[2] == 0.0));
    }

    #[test]
    fn test_scaler_uses_training_statistics_only() {
        let scaler = StandardScaler::fit(&[vec![0.0], vec![2.0]]).unwrap();
        // mean 1, std 1: a test value of 5 maps to 4 regardless of the test set
        assert_eq!(scaler.transform_row(&[5.0]).unwrap(), vec![4.0]);
        assert!(scaler.transform_row(&[1.0, 2.0]).is_err());
    }

    #[test]
    fn test_scaler_json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SCALER_FILE);
        let scaler = StandardScaler::fit(&[vec![1.0, 3.0], vec![2.0, 7.0]]).unwrap();
        scaler.save_json(&path).unwrap();
        assert_eq!(StandardScaler::load_json(&path).unwrap(), scaler);
    }

    #[test]
    fn test_stratified_split_preserves_class_ratio() {
        let labels: Vec<u8> = (0..100).map(|i| u8::from(i % 10 == 0)).collect();
        let split = stratified_split(&labels, 0.2, 42).unwrap();

        assert_eq!(split.test.len(), 20);
        assert_eq!(split.train.len(), 80);
        let test_pos = split.test.iter().filter(|&&i| labels[i] == 1).count();
        assert_eq!(test_pos, 2);

        let mut all: Vec<usize> = split.train.iter().chain(&split.test).copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_stratified_split_is_deterministic() {
        let labels: Vec<u8> = (0..50).map(|i| u8::from(i % 3 == 0)).collect();
        assert_eq!(
            stratified_split(&labels, 0.3, 7).unwrap(),
            stratified_split(&labels, 0.3, 7).unwrap()
        );
        assert_ne!(
            stratified_split(&labels, 0.3, 7).unwrap(),
            stratified_split(&labels, 0.3, 8).unwrap()
        );
    }

    #[test]
    fn test_rare_class_reaches_both_partitions() {
        let mut labels = vec![0u8; 40];
        labels[3] = 1;
        labels[17] = 1;
        let split = stratified_split(&labels, 0.2, 1).unwrap();
        assert!(split.test.iter().any(|&i| labels[i] == 1));
        assert!(split.train.iter().any(|&i| labels[i] == 1));
    }

    #[test]
    fn test_invalid_test_size() {
        assert!(stratified_split(&[0, 1], 0.0, 0).is_err());
        assert!(stratified_split(&[0, 1], 1.0, 0).is_err());
    }

    #[test]
    fn test_load_requires_every_array() {
        let dir = tempfile::tempdir().unwrap();
        let err = ProcessedData::load(dir.path()).unwrap_err();
        assert!(err.to_string().contains(X_TRAIN_FILE));
    }
}
