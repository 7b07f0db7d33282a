//! Model loading, inference and status

pub mod inference;
pub mod loader;
pub mod status;

pub use inference::{InferenceEngine, InferenceError};
pub use loader::{LoadedModel, ModelLoader};
pub use status::{check_status, export_latest, ModelStatus};
