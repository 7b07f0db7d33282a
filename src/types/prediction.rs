//! Response payloads of the prediction services

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Fraud verdict for a single transaction
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FraudPrediction {
    /// Positive-class probability (0.0 - 1.0)
    pub prob_fraude: f64,

    /// `prob_fraude >= limite`
    pub eh_fraude: bool,

    /// Decision threshold in effect
    pub limite: f64,
}

impl FraudPrediction {
    pub fn from_probability(prob_fraude: f64, limite: f64) -> Self {
        Self {
            prob_fraude,
            eh_fraude: prob_fraude >= limite,
            limite,
        }
    }
}

/// Single-transaction verdict as returned by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GatewayPrediction {
    pub prob_fraude: f64,
    pub eh_fraude: bool,
}

impl From<FraudPrediction> for GatewayPrediction {
    fn from(prediction: FraudPrediction) -> Self {
        Self {
            prob_fraude: prediction.prob_fraude,
            eh_fraude: prediction.eh_fraude,
        }
    }
}

/// Class labels for a batch of rows, in request order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchPredictions {
    pub predictions: Vec<u8>,
}

/// Model introspection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Classifier type
    pub tipo: String,
    pub num_features: usize,
    pub nomes_features: Vec<String>,
    /// Hyperparameters
    pub parametros: BTreeMap<String, String>,
    /// Where the model was loaded from
    pub origem: String,
}

/// Service status message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub mensagem: String,
    pub modelo_carregado: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_is_inclusive() {
        assert!(FraudPrediction::from_probability(0.5, 0.5).eh_fraude);
        assert!(!FraudPrediction::from_probability(0.4999, 0.5).eh_fraude);
    }

    #[test]
    fn test_gateway_prediction_drops_threshold() {
        let prediction = FraudPrediction::from_probability(0.9, 0.5);
        let json = serde_json::to_value(GatewayPrediction::from(prediction)).unwrap();
        assert_eq!(json, serde_json::json!({ "prob_fraude": 0.9, "eh_fraude": true }));
    }
}
