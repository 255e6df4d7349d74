//! HTTP client for the data-plane control endpoints

use std::time::Duration;
use thiserror::Error;

/// Errors raised while talking to the data-plane process
#[derive(Debug, Error)]
pub enum ExporterClientError {
    #[error("Failed to create HTTP client: {0}")]
    ClientBuild(#[source] reqwest::Error),

    #[error("Request to {endpoint} failed: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Request to {endpoint} returned status {status}")]
    Status { endpoint: String, status: u16 },
}

/// Client for the hash and reload endpoints of the metrics exporter
#[derive(Debug, Clone)]
pub struct ExporterClient {
    client: reqwest::Client,
    config_hash_endpoint: String,
    reload_endpoint: String,
}

impl ExporterClient {
    pub fn new(
        config_hash_endpoint: impl Into<String>,
        reload_endpoint: impl Into<String>,
    ) -> Result<Self, ExporterClientError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(ExporterClientError::ClientBuild)?;

        Ok(Self {
            client,
            config_hash_endpoint: config_hash_endpoint.into(),
            reload_endpoint: reload_endpoint.into(),
        })
    }

    pub fn config_hash_endpoint(&self) -> &str {
        &self.config_hash_endpoint
    }

    pub fn reload_endpoint(&self) -> &str {
        &self.reload_endpoint
    }

    /// Hash of the document the exporter is currently serving
    ///
    /// `timeout` bounds the whole exchange, body included.
    pub async fn active_config_hash(&self, timeout: Duration) -> Result<String, ExporterClientError> {
        let endpoint = &self.config_hash_endpoint;
        let transport = |source| ExporterClientError::Transport {
            endpoint: endpoint.clone(),
            source,
        };

        let response = self
            .client
            .get(endpoint)
            .timeout(timeout)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(ExporterClientError::Status {
                endpoint: endpoint.clone(),
                status: status.as_u16(),
            });
        }

        let body = response.text().await.map_err(transport)?;
        Ok(body.trim().to_string())
    }

    /// Ask the exporter to rebuild its pipelines; only `200 OK` counts as success
    pub async fn force_reload(&self, timeout: Duration) -> Result<(), ExporterClientError> {
        let endpoint = &self.reload_endpoint;
        let response = self
            .client
            .post(endpoint)
            .timeout(timeout)
            .send()
            .await
            .map_err(|source| ExporterClientError::Transport {
                endpoint: endpoint.clone(),
                source,
            })?;

        if response.status() != reqwest::StatusCode::OK {
            return Err(ExporterClientError::Status {
                endpoint: endpoint.clone(),
                status: response.status().as_u16(),
            });
        }

        tracing::info!(endpoint = %endpoint, "Metrics exporter reload requested");
        Ok(())
    }
}
