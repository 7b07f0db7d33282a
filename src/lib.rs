//! Fraud Detection MLOps Library
//!
//! Credit-card fraud detection end to end: dataset acquisition,
//! preprocessing, RandomForest training with cross-validation and
//! experiment tracking, model selection and registration, and HTTP
//! inference services.

pub mod config;
pub mod data;
pub mod evaluation;
pub mod feature_extractor;
pub mod forest;
pub mod metrics;
pub mod models;
pub mod pipeline;
pub mod preprocessing;
pub mod serving;
pub mod tracking;
pub mod training;
pub mod types;

pub use config::AppConfig;
pub use feature_extractor::FeatureExtractor;
pub use forest::{ForestParams, RandomForestClassifier};
pub use models::inference::InferenceEngine;
pub use serving::{ErrorPolicy, ServiceContext};
pub use tracking::{open_store, TrackingStore};
pub use types::{prediction::FraudPrediction, transaction::Transaction};
