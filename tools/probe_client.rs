//! Gateway Probe Client
//!
//! Posts legitimate and suspicious feature vectors to a running prediction
//! gateway and logs the verdicts.

use clap::Parser;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

/// Width of the credit-card feature vector (V1..V28, Amount)
const FEATURE_COUNT: usize = 29;

#[derive(Parser)]
#[command(name = "probe-client", about = "Send probe transactions to the prediction gateway")]
struct Args {
    /// Gateway base URL
    #[arg(long, default_value = "http://localhost:5001")]
    url: String,
    /// Number of transactions to send after the fixed probes
    #[arg(long, default_value_t = 20)]
    count: u64,
    /// Fraction of random transactions that are suspicious
    #[arg(long, default_value_t = 0.1)]
    fraud_rate: f64,
    /// Delay between requests in milliseconds
    #[arg(long, default_value_t = 100)]
    delay_ms: u64,
    /// Only print the payloads
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Serialize)]
struct PredictRequest {
    features: Vec<f64>,
}

#[derive(Debug, Deserialize)]
struct PredictResponse {
    prob_fraude: f64,
    eh_fraude: bool,
}

/// Feature vector generator
struct ProbeGenerator {
    rng: rand::rngs::ThreadRng,
}

impl ProbeGenerator {
    fn new() -> Self {
        Self {
            rng: rand::thread_rng(),
        }
    }

    /// All-zero vector, the mean of the standardized features
    fn zeros() -> Vec<f64> {
        vec![0.0; FEATURE_COUNT]
    }

    /// Alternating large components: `[1, -1, 2, -2, ..., 14, -14, 15]`
    fn suspicious() -> Vec<f64> {
        (0..FEATURE_COUNT)
            .map(|i| {
                let magnitude = (i / 2 + 1) as f64;
                if i % 2 == 0 {
                    magnitude
                } else {
                    -magnitude
                }
            })
            .collect()
    }

    /// Small noise around zero
    fn generate_legitimate(&mut self) -> Vec<f64> {
        (0..FEATURE_COUNT)
            .map(|_| self.rng.gen_range(-0.5..0.5))
            .collect()
    }

    /// Suspicious pattern with noise
    fn generate_suspicious(&mut self) -> Vec<f64> {
        Self::suspicious()
            .into_iter()
            .map(|v| v + self.rng.gen_range(-0.5..0.5))
            .collect()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("probe_client=info".parse()?),
        )
        .init();

    let args = Args::parse();
    info!(
        url = %args.url,
        count = args.count,
        fraud_rate = args.fraud_rate,
        delay_ms = args.delay_ms,
        "Starting probe client"
    );

    let mut generator = ProbeGenerator::new();
    let mut rng = rand::thread_rng();
    let mut probes = vec![
        ("zeros", ProbeGenerator::zeros()),
        ("suspicious", ProbeGenerator::suspicious()),
    ];
    for _ in 0..args.count {
        if rng.gen_bool(args.fraud_rate.clamp(0.0, 1.0)) {
            probes.push(("random_suspicious", generator.generate_suspicious()));
        } else {
            probes.push(("random_legitimate", generator.generate_legitimate()));
        }
    }

    if args.dry_run {
        return run_dry_mode(&probes);
    }

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()?;
    let endpoint = format!("{}/predict", args.url.trim_end_matches('/'));

    let mut sent = 0u64;
    let mut flagged = 0u64;
    for (kind, features) in probes.iter() {
        let request = PredictRequest {
            features: features.clone(),
        };
        let response = match client.post(&endpoint).json(&request).send().await {
            Ok(r) => r,
            Err(e) if sent == 0 => {
                warn!(error = %e, "Gateway unreachable. Running in dry-run mode.");
                return run_dry_mode(&probes);
            }
            Err(e) => return Err(e.into()),
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(kind = kind, status = %status, body = %body, "Request rejected");
            continue;
        }

        let verdict: PredictResponse = response.json().await?;
        sent += 1;
        if verdict.eh_fraude {
            flagged += 1;
        }
        info!(
            kind = kind,
            prob_fraude = format!("{:.4}", verdict.prob_fraude),
            eh_fraude = verdict.eh_fraude,
            "Verdict"
        );

        tokio::time::sleep(Duration::from_millis(args.delay_ms)).await;
    }

    info!(sent = sent, flagged = flagged, "Completed");
    Ok(())
}

fn run_dry_mode(probes: &[(&str, Vec<f64>)]) -> anyhow::Result<()> {
    info!("Running in dry-run mode (no gateway connection)");
    for (i, (kind, features)) in probes.iter().enumerate() {
        let json = serde_json::to_string(&PredictRequest {
            features: features.clone(),
        })?;
        if i < 2 || (i + 1) % 10 == 0 {
            info!(kind = kind, "Sample payload {}: {}", i + 1, json);
        }
    }
    Ok(())
}
