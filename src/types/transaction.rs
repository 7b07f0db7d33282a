//! Transaction record scored by the fraud model

use serde::{Deserialize, Serialize};

/// One transaction as a fixed-length feature vector, optionally labelled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Feature values in model column order (`V1..V28`, `Amount` for the
    /// credit-card dataset)
    pub features: Vec<f64>,

    /// Known class (1 = fraud) when the record comes from labelled data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<u8>,
}

impl Transaction {
    /// Create an unlabelled transaction
    pub fn new(features: Vec<f64>) -> Self {
        Self {
            features,
            label: None,
        }
    }

    /// Attach a known class
    pub fn with_label(mut self, label: u8) -> Self {
        self.label = Some(label);
        self
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn is_fraud(&self) -> Option<bool> {
        self.label.map(|label| label == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_serialization() {
        let tx = Transaction::new(vec![0.5; 29]);

        let json = serde_json::to_string(&tx).unwrap();
        assert!(!json.contains("label"));
        let deserialized: Transaction = serde_json::from_str(&json).unwrap();
        assert_eq!(tx, deserialized);
    }

    #[test]
    fn test_labelled_transaction() {
        let tx = Transaction::new(vec![1.0, 2.0]).with_label(1);
        assert_eq!(tx.len(), 2);
        assert_eq!(tx.is_fraud(), Some(true));
        assert_eq!(Transaction::new(vec![]).is_fraud(), None);
    }
}
