//! Feature schema shared by training and inference.
//!
//! The credit-card dataset contributes 28 PCA components `V1..V28` and the
//! transaction `Amount`; `Time` is not a model input. The column order a
//! model was trained with is persisted as `feature_names.json` next to the
//! processed arrays.

use crate::preprocessing::FEATURE_NAMES_FILE;
use crate::types::transaction::Transaction;
use std::path::Path;
use tracing::{debug, warn};

/// Number of model inputs for the credit-card dataset.
pub const CREDIT_CARD_FEATURE_COUNT: usize = 29;

/// Model input columns and the width check applied before inference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureExtractor {
    names: Vec<String>,
}

impl FeatureExtractor {
    /// `V1..V28` followed by `Amount`.
    pub fn credit_card() -> Self {
        let mut names: Vec<String> = (1..=28).map(|i| format!("V{i}")).collect();
        names.push("Amount".to_string());
        Self { names }
    }

    pub fn with_names(names: Vec<String>) -> Self {
        Self { names }
    }

    /// Schema for a model of `width` inputs: the persisted training column
    /// names when they match, else the credit-card layout when the width
    /// fits, else positional names `f0..fN`.
    pub fn for_model(width: usize, processed_dir: &Path) -> Self {
        let path = processed_dir.join(FEATURE_NAMES_FILE);
        match std::fs::read_to_string(&path)
            .ok()
            .and_then(|json| serde_json::from_str::<Vec<String>>(&json).ok())
        {
            Some(names) if names.len() == width => {
                debug!(path = %path.display(), "Feature names loaded");
                return Self { names };
            }
            Some(names) => warn!(
                path = %path.display(),
                names = names.len(),
                model_width = width,
                "Persisted feature names do not match the model"
            ),
            None => {}
        }

        if width == CREDIT_CARD_FEATURE_COUNT {
            Self::credit_card()
        } else {
            Self {
                names: (0..width).map(|i| format!("f{i}")).collect(),
            }
        }
    }

    /// Number of model inputs
    pub fn feature_count(&self) -> usize {
        self.names.len()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Feature vector of a transaction, or `(expected, found)` widths when it
    /// does not fit the schema.
    pub fn extract<'a>(&self, tx: &'a Transaction) -> Result<&'a [f64], (usize, usize)> {
        if tx.len() == self.feature_count() {
            Ok(&tx.features)
        } else {
            Err((self.feature_count(), tx.len()))
        }
    }
}

impl Default for FeatureExtractor {
    fn default() -> Self {
        Self::credit_card()
    }
}
