//! Type definitions shared by training and serving

pub mod prediction;
pub mod transaction;

pub use prediction::{BatchPredictions, FraudPrediction, GatewayPrediction, ModelInfo, StatusMessage};
pub use transaction::Transaction;
