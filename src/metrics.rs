//! Request metrics for the HTTP services.
//!
//! Every service context owns its own Prometheus registry, so two services
//! in one process (or in one test binary) never share counters.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// Metrics collector for one HTTP service
pub struct ServingMetrics {
    registry: Registry,
    /// `http_requests_total{method,path,status}`
    requests: IntCounterVec,
    /// `http_request_errors_total{method,path,status}`, 4xx and 5xx only
    errors: IntCounterVec,
    /// `http_request_duration_seconds{method,path}`
    latency: HistogramVec,
    /// `fraud_predictions_total{outcome}`
    predictions: IntCounterVec,
    requests_seen: AtomicU64,
    errors_seen: AtomicU64,
    fraud_flagged: AtomicU64,
    start_time: Instant,
}

impl ServingMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let requests = IntCounterVec::new(
            Opts::new("http_requests_total", "Total HTTP requests"),
            &["method", "path", "status"],
        )?;
        let errors = IntCounterVec::new(
            Opts::new("http_request_errors_total", "HTTP requests answered with an error"),
            &["method", "path", "status"],
        )?;
        let latency = HistogramVec::new(
            HistogramOpts::new(
                "http_request_duration_seconds",
                "HTTP request latency in seconds",
            )
            .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
            &["method", "path"],
        )?;
        let predictions = IntCounterVec::new(
            Opts::new("fraud_predictions_total", "Transactions scored, by outcome"),
            &["outcome"],
        )?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(errors.clone()))?;
        registry.register(Box::new(latency.clone()))?;
        registry.register(Box::new(predictions.clone()))?;

        Ok(Self {
            registry,
            requests,
            errors,
            latency,
            predictions,
            requests_seen: AtomicU64::new(0),
            errors_seen: AtomicU64::new(0),
            fraud_flagged: AtomicU64::new(0),
            start_time: Instant::now(),
        })
    }

    /// Record a finished request
    pub fn record_request(&self, method: &str, path: &str, status: u16, elapsed: Duration) {
        let status_label = status.to_string();
        self.requests
            .with_label_values(&[method, path, &status_label])
            .inc();
        self.latency
            .with_label_values(&[method, path])
            .observe(elapsed.as_secs_f64());
        self.requests_seen.fetch_add(1, Ordering::Relaxed);

        if status >= 400 {
            self.errors
                .with_label_values(&[method, path, &status_label])
                .inc();
            self.errors_seen.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record one scored transaction
    pub fn record_prediction(&self, is_fraud: bool) {
        let outcome = if is_fraud { "fraud" } else { "legit" };
        self.predictions.with_label_values(&[outcome]).inc();
        if is_fraud {
            self.fraud_flagged.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn total_requests(&self) -> u64 {
        self.requests_seen.load(Ordering::Relaxed)
    }

    pub fn total_errors(&self) -> u64 {
        self.errors_seen.load(Ordering::Relaxed)
    }

    /// Requests per second since startup
    pub fn throughput(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.total_requests() as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Prometheus text exposition of this service's metrics
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    /// Log a one-line summary
    pub fn log_summary(&self) {
        let requests = self.total_requests();
        let errors = self.total_errors();
        let error_rate = if requests > 0 {
            errors as f64 / requests as f64 * 100.0
        } else {
            0.0
        };
        info!(
            requests = requests,
            errors = errors,
            error_rate = format!("{:.1}%", error_rate),
            fraud_flagged = self.fraud_flagged.load(Ordering::Relaxed),
            throughput = format!("{:.2} req/s", self.throughput()),
            "Serving metrics"
        );
    }
}

/// Logs a metrics summary on a fixed interval
pub struct MetricsReporter {
    metrics: Arc<ServingMetrics>,
    interval_secs: u64,
}

impl MetricsReporter {
    pub fn new(metrics: Arc<ServingMetrics>, interval_secs: u64) -> Self {
        Self {
            metrics,
            interval_secs,
        }
    }

    /// Start the periodic reporting task
    pub async fn start(self) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.interval_secs.max(1)));
        // the first tick completes immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            if self.metrics.total_requests() > 0 {
                self.metrics.log_summary();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording() {
        let metrics = ServingMetrics::new().unwrap();

        metrics.record_request("POST", "/predict", 200, Duration::from_micros(100));
        metrics.record_request("POST", "/predict", 400, Duration::from_micros(50));
        metrics.record_request("GET", "/metrics", 200, Duration::from_micros(10));

        assert_eq!(metrics.total_requests(), 3);
        assert_eq!(metrics.total_errors(), 1);
    }

    #[test]
    fn test_render_exposes_labelled_counters() {
        let metrics = ServingMetrics::new().unwrap();
        metrics.record_request("POST", "/predict", 503, Duration::from_millis(1));
        metrics.record_prediction(true);

        let text = metrics.render().unwrap();
        assert!(text.contains(
            r#"http_requests_total{method="POST",path="/predict",status="503"} 1"#
        ));
        assert!(text.contains(
            r#"http_request_errors_total{method="POST",path="/predict",status="503"} 1"#
        ));
        assert!(text.contains(r#"fraud_predictions_total{outcome="fraud"} 1"#));
    }

    #[test]
    fn test_registries_are_independent() {
        let a = ServingMetrics::new().unwrap();
        let b = ServingMetrics::new().unwrap();
        a.record_request("GET", "/", 200, Duration::ZERO);
        assert_eq!(a.total_requests(), 1);
        assert!(!b.render().unwrap().contains("http_requests_total{"));
    }
}
