//! Dataset acquisition, CSV loading and array persistence

pub mod dataset;
pub mod download;
pub mod npy;

pub use dataset::{load_csv, Dataset, DatasetError};
pub use download::download_dataset;
