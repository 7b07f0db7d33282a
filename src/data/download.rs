//! Raw dataset download

use crate::config::DataConfig;
use anyhow::{bail, Context, Result};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Progress is logged every time this many more bytes arrive.
const PROGRESS_STEP: u64 = 8 * 1024 * 1024;

/// Suffix of the file a transfer streams into before it is complete.
const PARTIAL_SUFFIX: &str = ".part";

/// `creditcard.csv` → `creditcard.csv.part`
fn partial_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_os_string();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

/// Download the raw dataset unless it is already on disk.
///
/// Returns the path of the CSV. The transfer is streamed into a `.part`
/// file that only replaces the target once every byte has arrived, so an
/// interrupted download is never mistaken for the dataset.
pub async fn download_dataset(config: &DataConfig) -> Result<PathBuf> {
    fs::create_dir_all(&config.raw_dir)
        .await
        .with_context(|| format!("Failed to create {}", config.raw_dir.display()))?;

    let target = config.raw_dataset_path();
    if fs::try_exists(&target).await.unwrap_or(false) {
        info!(path = %target.display(), "Dataset already present, skipping download");
        return Ok(target);
    }

    info!(url = %config.dataset_url, path = %target.display(), "Downloading dataset");

    let partial = partial_path(&target);
    let fetched: Result<u64> = async {
        let bytes = fetch_to_file(config, &partial).await?;
        fs::rename(&partial, &target)
            .await
            .with_context(|| format!("Failed to move download into {}", target.display()))?;
        Ok(bytes)
    }
    .await;

    match fetched {
        Ok(bytes) => {
            info!(path = %target.display(), bytes = bytes, "Download complete");
            Ok(target)
        }
        Err(e) => {
            if let Err(remove_err) = fs::remove_file(&partial).await {
                if remove_err.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %partial.display(), error = %remove_err, "Failed to remove partial download");
                }
            }
            Err(e)
        }
    }
}

async fn fetch_to_file(config: &DataConfig, target: &Path) -> Result<u64> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.download_timeout_secs))
        .build()
        .context("Failed to build HTTP client")?;

    let response = client
        .get(&config.dataset_url)
        .send()
        .await
        .with_context(|| format!("Request to {} failed", config.dataset_url))?;

    let status = response.status();
    if !status.is_success() {
        bail!("Dataset download returned HTTP {}", status);
    }

    let total = response.content_length();
    let mut file = fs::File::create(target)
        .await
        .with_context(|| format!("Failed to create {}", target.display()))?;

    let mut stream = response.bytes_stream();
    let mut received: u64 = 0;
    let mut next_report = PROGRESS_STEP;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("Dataset stream interrupted")?;
        file.write_all(&chunk)
            .await
            .with_context(|| format!("Failed to write {}", target.display()))?;
        received += chunk.len() as u64;

        if received >= next_report {
            match total {
                Some(total) if total > 0 => info!(
                    received = received,
                    total = total,
                    percent = format!("{:.1}", received as f64 / total as f64 * 100.0),
                    "Download progress"
                ),
                _ => info!(received = received, "Download progress"),
            }
            next_report += PROGRESS_STEP;
        }
    }

    file.flush().await.context("Failed to flush dataset file")?;
    debug!(received = received, expected = ?total, "Dataset stream finished");

    if let Some(total) = total {
        if received != total {
            bail!("Dataset truncated: received {} of {} bytes", received, total);
        }
    }

    Ok(received)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_existing_file_skips_download() {
        let dir = tempfile::tempdir().unwrap();
        let config = DataConfig {
            raw_dir: dir.path().to_path_buf(),
            // unreachable: the test fails if a request is attempted
            dataset_url: "http://127.0.0.1:9/never".to_string(),
            ..DataConfig::default()
        };
        std::fs::write(config.raw_dataset_path(), "Time,V1,Amount,Class\n").unwrap();

        let path = download_dataset(&config).await.unwrap();
        assert_eq!(path, config.raw_dataset_path());
    }

    #[tokio::test]
    async fn test_stale_partial_file_is_not_the_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let config = DataConfig {
            raw_dir: dir.path().to_path_buf(),
            dataset_url: "http://127.0.0.1:9/creditcard.csv".to_string(),
            download_timeout_secs: 2,
            ..DataConfig::default()
        };
        let partial = partial_path(&config.raw_dataset_path());
        assert_eq!(partial, dir.path().join("creditcard.csv.part"));
        std::fs::write(&partial, "Time,V1,Am").unwrap();

        // the leftover does not count as present, so a transfer is attempted
        assert!(download_dataset(&config).await.is_err());
        assert!(!config.raw_dataset_path().exists());
        assert!(!partial.exists());
    }

    #[tokio::test]
    async fn test_completed_download_is_moved_into_place() {
        let body = "Time,V1,Amount,Class\n0,1.5,10.0,0\n";
        let app = axum::Router::new().route(
            "/creditcard.csv",
            axum::routing::get(move || async move { body }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let dir = tempfile::tempdir().unwrap();
        let config = DataConfig {
            raw_dir: dir.path().join("raw"),
            dataset_url: format!("http://{addr}/creditcard.csv"),
            download_timeout_secs: 5,
            ..DataConfig::default()
        };

        let path = download_dataset(&config).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), body);
        assert!(!partial_path(&path).exists());
    }

    #[tokio::test]
    async fn test_failed_download_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = DataConfig {
            raw_dir: dir.path().join("raw"),
            dataset_url: "http://127.0.0.1:9/creditcard.csv".to_string(),
            download_timeout_secs: 2,
            ..DataConfig::default()
        };

        assert!(download_dataset(&config).await.is_err());
        assert!(!config.raw_dataset_path().exists());
        // the directory itself is still created
        assert!(config.raw_dir.is_dir());
    }
}
