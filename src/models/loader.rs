//! Startup model loading: registry aliases first, then the local file

use crate::forest::RandomForestClassifier;
use crate::tracking::{ModelSource, TrackingStore};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Loaded classifier with the location it came from
pub struct LoadedModel {
    pub model: RandomForestClassifier,
    /// `models:/<name>@<alias>` or the local file path
    pub source: String,
}

/// Resolves the model a service should run
pub struct ModelLoader {
    store: Arc<dyn TrackingStore>,
    registered_model_name: String,
    /// Tried in order before the local file
    aliases: Vec<String>,
    local_path: PathBuf,
    /// Where registry downloads are written
    cache_dir: PathBuf,
}

impl ModelLoader {
    pub fn new(
        store: Arc<dyn TrackingStore>,
        registered_model_name: impl Into<String>,
        aliases: Vec<String>,
        local_path: impl Into<PathBuf>,
    ) -> Self {
        let local_path = local_path.into();
        let cache_dir = local_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .join("registry-cache");
        Self {
            store,
            registered_model_name: registered_model_name.into(),
            aliases,
            local_path,
            cache_dir,
        }
    }

    /// Load a single model file
    pub fn load_file<P: AsRef<Path>>(path: P) -> Result<RandomForestClassifier> {
        let path = path.as_ref();
        RandomForestClassifier::load(path)
            .with_context(|| format!("Failed to load model from {}", path.display()))
    }

    /// Try every registry alias, then the local file. Each failure is logged
    /// and the next source tried; the error is returned only when all fail.
    pub async fn load(&self) -> Result<LoadedModel> {
        for alias in &self.aliases {
            let source = ModelSource::Alias {
                name: self.registered_model_name.clone(),
                alias: alias.clone(),
            };
            match self.load_from_registry(&source, alias).await {
                Ok(model) => {
                    info!(source = %source, features = model.n_features(), "Model loaded from registry");
                    return Ok(LoadedModel {
                        model,
                        source: source.to_string(),
                    });
                }
                Err(e) => {
                    warn!(source = %source, error = %e, "Registry model unavailable, trying next source");
                }
            }
        }

        let model = Self::load_file(&self.local_path)?;
        info!(
            path = %self.local_path.display(),
            features = model.n_features(),
            "Model loaded from local file"
        );
        Ok(LoadedModel {
            model,
            source: self.local_path.display().to_string(),
        })
    }

    async fn load_from_registry(
        &self,
        source: &ModelSource,
        alias: &str,
    ) -> Result<RandomForestClassifier> {
        let dest = self.cache_dir.join(format!("{alias}.bin"));
        self.store.download_model(source, &dest).await?;
        tokio::task::spawn_blocking(move || Self::load_file(dest))
            .await
            .context("Model load task panicked")?
    }
}
