//! Fraud inference over the selected model

use crate::feature_extractor::FeatureExtractor;
use crate::forest::{ForestError, RandomForestClassifier};
use crate::training::MODEL_TYPE;
use crate::types::prediction::{FraudPrediction, ModelInfo};
use crate::types::transaction::Transaction;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum InferenceError {
    /// The request does not fit the model; the model is never invoked
    #[error("expected {expected} features, got {found}")]
    WidthMismatch { expected: usize, found: usize },
    #[error("model evaluation failed: {0}")]
    Model(#[from] ForestError),
}

/// Read-only inference engine shared by request handlers
pub struct InferenceEngine {
    model: RandomForestClassifier,
    extractor: FeatureExtractor,
    /// Probability at or above which a transaction is flagged
    threshold: f64,
    /// Where the model came from (registry alias or file path)
    source: String,
}

impl InferenceEngine {
    /// Create an engine; the extractor is replaced by positional names when
    /// its width disagrees with the model.
    pub fn new(
        model: RandomForestClassifier,
        extractor: FeatureExtractor,
        threshold: f64,
        source: impl Into<String>,
    ) -> Self {
        let extractor = if extractor.feature_count() == model.n_features() {
            extractor
        } else {
            FeatureExtractor::with_names(
                (0..model.n_features()).map(|i| format!("f{i}")).collect(),
            )
        };
        let source = source.into();

        info!(
            source = %source,
            features = model.n_features(),
            trees = model.n_trees(),
            threshold = threshold,
            "Inference engine initialized"
        );

        Self {
            model,
            extractor,
            threshold,
            source,
        }
    }

    /// Engine over an in-memory model with credit-card column names when they fit
    pub fn from_classifier(model: RandomForestClassifier, threshold: f64) -> Self {
        Self::new(model, FeatureExtractor::credit_card(), threshold, "memory")
    }

    pub fn expected_width(&self) -> usize {
        self.model.n_features()
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Score one transaction
    pub fn predict(&self, tx: &Transaction) -> Result<FraudPrediction, InferenceError> {
        let features = self
            .extractor
            .extract(tx)
            .map_err(|(expected, found)| InferenceError::WidthMismatch { expected, found })?;
        let prob = self.model.predict_proba(features)?;
        let prediction = FraudPrediction::from_probability(prob, self.threshold);

        debug!(
            prob_fraude = prediction.prob_fraude,
            eh_fraude = prediction.eh_fraude,
            "Transaction scored"
        );
        Ok(prediction)
    }

    /// Class labels for a batch; the whole batch is rejected if any row has the
    /// wrong width.
    pub fn predict_labels(&self, rows: &[Vec<f64>]) -> Result<Vec<u8>, InferenceError> {
        let expected = self.expected_width();
        if let Some(row) = rows.iter().find(|row| row.len() != expected) {
            return Err(InferenceError::WidthMismatch {
                expected,
                found: row.len(),
            });
        }
        let proba = self.model.predict_proba_batch(rows)?;
        Ok(proba
            .into_iter()
            .map(|p| u8::from(p >= self.threshold))
            .collect())
    }

    pub fn model_info(&self) -> ModelInfo {
        let mut parametros = self.model.params().as_params();
        parametros.insert(
            "random_state".to_string(),
            self.model.random_state().to_string(),
        );
        ModelInfo {
            tipo: MODEL_TYPE.to_string(),
            num_features: self.expected_width(),
            nomes_features: self.extractor.names().to_vec(),
            parametros,
            origem: self.source.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forest::ForestParams;

    /// Fraud when the first feature is positive.
    fn engine() -> InferenceEngine {
        let mut x = Vec::new();
        let mut y = Vec::new();
        for i in 0..60 {
            let v = f64::from(i % 12) - 5.5;
            x.push(vec![v, 0.0, 1.0]);
            y.push(u8::from(v > 0.0));
        }
        let params = ForestParams {
            n_estimators: 10,
            max_depth: Some(3),
            ..ForestParams::default()
        };
        let model = RandomForestClassifier::fit(&params, 42, &x, &y).unwrap();
        InferenceEngine::from_classifier(model, 0.5)
    }

    #[test]
    fn test_predict_flags_positive_side() {
        let engine = engine();
        let fraud = engine.predict(&Transaction::new(vec![5.0, 0.0, 1.0])).unwrap();
        let legit = engine.predict(&Transaction::new(vec![-5.0, 0.0, 1.0])).unwrap();
        assert!(fraud.eh_fraude);
        assert!(fraud.prob_fraude >= 0.5);
        assert!(!legit.eh_fraude);
        assert_eq!(legit.limite, 0.5);
    }

    #[test]
    fn test_width_mismatch_rejected() {
        let engine = engine();
        let err = engine.predict(&Transaction::new(vec![0.0; 29])).unwrap_err();
        assert!(matches!(
            err,
            InferenceError::WidthMismatch {
                expected: 3,
                found: 29
            }
        ));
        assert!(engine.predict_labels(&[vec![1.0, 0.0, 1.0], vec![1.0]]).is_err());
    }

    #[test]
    fn test_batch_labels_follow_threshold() {
        let engine = engine();
        let labels = engine
            .predict_labels(&[vec![5.0, 0.0, 1.0], vec![-5.0, 0.0, 1.0]])
            .unwrap();
        assert_eq!(labels, vec![1, 0]);
    }

    #[test]
    fn test_model_info_uses_positional_names_for_small_models() {
        let info = engine().model_info();
        assert_eq!(info.tipo, "RandomForestClassifier");
        assert_eq!(info.num_features, 3);
        assert_eq!(info.nomes_features, vec!["f0", "f1", "f2"]);
        assert_eq!(info.parametros["n_estimators"], "10");
        assert_eq!(info.parametros["random_state"], "42");
    }
}
