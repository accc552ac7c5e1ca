//! Where manifests and artifacts come from.

use super::manifest::Manifest;
use super::progress::{format_bytes, format_speed, DownloadProgress};
use crate::config::UpdateConfig;
use crate::utils::errors::{AgentError, Result};
use futures_util::StreamExt;
use std::future::Future;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Remote side of the update protocol.
pub trait UpdateSource: Send + Sync {
    /// Fetch the latest-release manifest
    fn fetch_manifest(&self) -> impl Future<Output = Result<Manifest>> + Send;

    /// Download the artifact described by `manifest` into `dest`, returning its size
    fn download(&self, manifest: &Manifest, dest: &Path) -> impl Future<Output = Result<u64>> + Send;
}

/// Update server reached over HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpUpdateSource {
    client: reqwest::Client,
    manifest_url: String,
    download_url: String,
}

impl HttpUpdateSource {
    /// Build a client with the configured timeouts; a timeout surfaces as a network error.
    pub fn new(config: &UpdateConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .connect_timeout(config.connect_timeout())
            .user_agent(concat!("update-agent/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            manifest_url: config.manifest_url(),
            download_url: config.download_url(),
        })
    }

    fn artifact_url<'a>(&'a self, manifest: &'a Manifest) -> &'a str {
        manifest.download_url.as_deref().unwrap_or(&self.download_url)
    }
}

impl UpdateSource for HttpUpdateSource {
    async fn fetch_manifest(&self) -> Result<Manifest> {
        debug!("Fetching manifest from {}", self.manifest_url);

        let response = self.client.get(&self.manifest_url).send().await?;
        if !response.status().is_success() {
            return Err(AgentError::Network(format!(
                "HTTP {}: {}",
                response.status(),
                self.manifest_url
            )));
        }

        let body = response.bytes().await?;
        Manifest::from_json(&body)
    }

    async fn download(&self, manifest: &Manifest, dest: &Path) -> Result<u64> {
        let url = self.artifact_url(manifest);
        info!(version = %manifest.version, "Downloading update from {}", url);

        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(AgentError::Network(format!("HTTP {}: {}", response.status(), url)));
        }

        let mut progress = DownloadProgress::new(response.content_length());
        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| AgentError::file_system(format!("failed to create {}", dest.display()), e))?;

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk)
                .await
                .map_err(|e| AgentError::file_system("failed to write download data", e))?;

            if let Some(percent) = progress.record(chunk.len()) {
                debug!("Download progress: {}%", percent);
            }
        }

        file.flush()
            .await
            .map_err(|e| AgentError::file_system("failed to flush download file", e))?;

        if progress.is_short() {
            return Err(AgentError::Network(format!(
                "truncated download: received {} of {} bytes",
                progress.received_bytes(),
                progress.total_bytes().unwrap_or_default()
            )));
        }

        info!(
            "Download complete: {} ({})",
            format_bytes(progress.received_bytes()),
            format_speed(progress.average_speed())
        );

        Ok(progress.received_bytes())
    }
}
