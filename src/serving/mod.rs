//! HTTP prediction services.
//!
//! Two routers share one [`ServiceContext`]: the API variant ([`api`]) and
//! the gateway variant ([`gateway`]). The context is built once at startup
//! and handed to handlers as axum state.

pub mod api;
pub mod error;
pub mod gateway;
pub mod request;

pub use error::{ApiError, Rejection};

use crate::config::AppConfig;
use crate::feature_extractor::FeatureExtractor;
use crate::metrics::{MetricsReporter, ServingMetrics};
use crate::models::{InferenceEngine, ModelLoader};
use crate::tracking::TrackingStore;
use anyhow::{Context, Result};
use axum::extract::{MatchedPath, Request, State};
use axum::middleware::Next;
use axum::response::Response;
use axum::Router;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Interval between metrics summaries in the log
const METRICS_LOG_INTERVAL_SECS: u64 = 60;

/// `path` label of requests that match no route
pub const UNMATCHED_PATH: &str = "<unmatched>";

/// How request failures are reported to clients
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Status code per failure kind (400, 500 or 503)
    #[default]
    Detailed,
    /// Every failure is a 400 with the same message
    Generic,
}

/// State shared by every handler of a service
#[derive(Clone)]
pub struct ServiceContext {
    engine: Option<Arc<InferenceEngine>>,
    metrics: Arc<ServingMetrics>,
    policy: ErrorPolicy,
}

impl ServiceContext {
    /// Context around an optional engine; `None` starts the service unloaded
    pub fn new(engine: Option<InferenceEngine>, policy: ErrorPolicy) -> Result<Self> {
        let metrics = ServingMetrics::new().context("Failed to create serving metrics")?;
        Ok(Self {
            engine: engine.map(Arc::new),
            metrics: Arc::new(metrics),
            policy,
        })
    }

    /// The loaded engine, or a `ModelUnavailable` rejection
    pub fn engine(&self) -> Result<&InferenceEngine, Rejection> {
        self.engine
            .as_deref()
            .ok_or_else(|| self.reject(ApiError::ModelUnavailable))
    }

    pub fn is_loaded(&self) -> bool {
        self.engine.is_some()
    }

    pub fn metrics(&self) -> &Arc<ServingMetrics> {
        &self.metrics
    }

    pub fn policy(&self) -> ErrorPolicy {
        self.policy
    }

    pub fn reject(&self, error: ApiError) -> Rejection {
        error.under(self.policy)
    }
}

/// Load the model and build the service context. A model that cannot be
/// loaded from any source leaves the service running without one.
pub async fn build_context(
    config: &AppConfig,
    store: Arc<dyn TrackingStore>,
) -> Result<ServiceContext> {
    let loader = ModelLoader::new(
        store,
        config.tracking.registered_model_name.clone(),
        config.serving.registry_aliases.clone(),
        config.model.path.clone(),
    );

    let engine = match loader.load().await {
        Ok(loaded) => {
            let extractor =
                FeatureExtractor::for_model(loaded.model.n_features(), &config.data.processed_dir);
            Some(InferenceEngine::new(
                loaded.model,
                extractor,
                config.serving.threshold,
                loaded.source,
            ))
        }
        Err(e) => {
            warn!(error = %format!("{e:#}"), "No model could be loaded, serving without one");
            None
        }
    };

    ServiceContext::new(engine, config.serving.error_policy)
}

/// Count every request in the context's metrics, labelled by route template
async fn track_requests(State(ctx): State<ServiceContext>, req: Request, next: Next) -> Response {
    let method = req.method().to_string();
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map_or(UNMATCHED_PATH, |p| p.as_str())
        .to_string();

    let start = Instant::now();
    let response = next.run(req).await;
    ctx.metrics
        .record_request(&method, &path, response.status().as_u16(), start.elapsed());
    response
}

/// Attach the request-tracking middleware and the context to a router
pub(crate) fn with_tracking(router: Router<ServiceContext>, ctx: ServiceContext) -> Router {
    router
        .layer(axum::middleware::from_fn_with_state(
            ctx.clone(),
            track_requests,
        ))
        .with_state(ctx)
}

/// Bind `addr` and serve until Ctrl+C
pub async fn serve(router: Router, addr: &str, metrics: Arc<ServingMetrics>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!(addr = %addr, "Listening");

    let reporter = tokio::spawn(MetricsReporter::new(metrics.clone(), METRICS_LOG_INTERVAL_SECS).start());

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    reporter.abort();
    metrics.log_summary();
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracking::NoopStore;

    #[test]
    fn test_unloaded_context_rejects_with_503() {
        let ctx = ServiceContext::new(None, ErrorPolicy::Detailed).unwrap();
        assert!(!ctx.is_loaded());
        let rejection = ctx.engine().err().unwrap();
        assert_eq!(
            rejection.error.status(rejection.policy),
            axum::http::StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn test_build_context_without_model_starts_unloaded() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.model.path = dir.path().join("missing.bin");
        config.data.processed_dir = dir.path().to_path_buf();

        let ctx = build_context(&config, Arc::new(NoopStore)).await.unwrap();
        assert!(!ctx.is_loaded());
        assert_eq!(ctx.policy(), ErrorPolicy::Detailed);
    }
}
