//! Labelled tabular dataset loaded from CSV

use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("dataset not found at {0}")]
    Missing(PathBuf),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("label column {0:?} not in header")]
    MissingLabelColumn(String),
    #[error("row {row}, column {column:?}: {value:?} is not a number")]
    NotNumeric {
        row: usize,
        column: String,
        value: String,
    },
    #[error("row {row}: label {value:?} is not 0 or 1")]
    InvalidLabel { row: usize, value: String },
    #[error("row {row} has {found} fields, header has {expected}")]
    ShortRow {
        row: usize,
        expected: usize,
        found: usize,
    },
    #[error("dataset has no rows")]
    Empty,
}

/// Feature matrix with binary labels, columns in header order.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub feature_names: Vec<String>,
    pub features: Vec<Vec<f64>>,
    pub labels: Vec<u8>,
}

impl Dataset {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn n_features(&self) -> usize {
        self.feature_names.len()
    }

    pub fn positive_count(&self) -> usize {
        self.labels.iter().filter(|&&label| label == 1).count()
    }
}

/// Load a headed CSV. `label_column` becomes the 0/1 target, columns named
/// in `drop_columns` are skipped, every remaining column is a feature.
pub fn load_csv<P: AsRef<Path>>(
    path: P,
    label_column: &str,
    drop_columns: &[String],
) -> Result<Dataset, DatasetError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(DatasetError::Missing(path.to_path_buf()));
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path)?;
    let headers = reader.headers()?.clone();

    let label_idx = headers
        .iter()
        .position(|h| h == label_column)
        .ok_or_else(|| DatasetError::MissingLabelColumn(label_column.to_string()))?;

    let feature_columns: Vec<(usize, String)> = headers
        .iter()
        .enumerate()
        .filter(|(idx, name)| *idx != label_idx && !drop_columns.iter().any(|d| d == name))
        .map(|(idx, name)| (idx, name.to_string()))
        .collect();

    let mut features = Vec::new();
    let mut labels = Vec::new();

    for (row, record) in reader.records().enumerate() {
        let record = record?;
        if record.len() != headers.len() {
            return Err(DatasetError::ShortRow {
                row,
                expected: headers.len(),
                found: record.len(),
            });
        }

        let mut values = Vec::with_capacity(feature_columns.len());
        for (idx, name) in &feature_columns {
            let raw = &record[*idx];
            let value = raw.parse::<f64>().map_err(|_| DatasetError::NotNumeric {
                row,
                column: name.clone(),
                value: raw.to_string(),
            })?;
            values.push(value);
        }

        labels.push(parse_label(&record[label_idx], row)?);
        features.push(values);
    }

    if labels.is_empty() {
        return Err(DatasetError::Empty);
    }

    let dataset = Dataset {
        feature_names: feature_columns.into_iter().map(|(_, name)| name).collect(),
        features,
        labels,
    };

    info!(
        path = %path.display(),
        rows = dataset.len(),
        features = dataset.n_features(),
        positives = dataset.positive_count(),
        "Dataset loaded"
    );

    Ok(dataset)
}

/// Accepts `0`/`1` as well as float spellings like `"0.0"` or `"1"` with quotes stripped.
fn parse_label(raw: &str, row: usize) -> Result<u8, DatasetError> {
    let invalid = || DatasetError::InvalidLabel {
        row,
        value: raw.to_string(),
    };
    let cleaned = raw.trim_matches('"');
    let value: f64 = cleaned.parse().map_err(|_| invalid())?;
    if value == 0.0 {
        Ok(0)
    } else if value == 1.0 {
        Ok(1)
    } else {
        Err(invalid())
    }
}
