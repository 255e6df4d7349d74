//! Synthetic health collector for secret-store instances
//!
//! Probes `{uri}/v1/sys/health` on every configured instance and exports one
//! status gauge per instance alongside the usual four health gauges.

use super::query::QUERY_TIMEOUT;
use super::{CollectStats, CollectorError, HealthMetrics, block_on_scrape, const_labels, fq_name};
use futures::future::join_all;
use prometheus::core::{Collector, Desc, Describer};
use prometheus::proto::MetricFamily;
use prometheus::{GaugeVec, Opts};
use serde::Deserialize;
use std::time::Instant;
use thiserror::Error;

pub const VAULT_METRIC_NAMESPACE: &str = "orch";
const MONITOR_SUBSYSTEM: &str = "vault_monitor";
const STATUS_SUBSYSTEM: &str = "vault_status";
const INSTANCE_LABEL: &str = "instance";
const HEALTH_PATH: &str = "v1/sys/health";
const STATUS_HELP: &str = "The current status of vault instance ready:0 , sealed:1 , standby:2";

/// Reported state of one instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VaultStatus {
    Unknown,
    Ready,
    Sealed,
    Standby,
}

impl VaultStatus {
    pub fn as_value(self) -> f64 {
        match self {
            Self::Unknown => -1.0,
            Self::Ready => 0.0,
            Self::Sealed => 1.0,
            Self::Standby => 2.0,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct HealthResponse {
    #[serde(default)]
    initialized: bool,
    #[serde(default)]
    sealed: bool,
    #[serde(default)]
    standby: bool,
}

impl HealthResponse {
    /// Sealed wins over initialized, which wins over standby
    fn status(&self) -> VaultStatus {
        let mut status = VaultStatus::Unknown;
        if self.standby {
            status = VaultStatus::Standby;
        }
        if self.initialized {
            status = VaultStatus::Ready;
        }
        if self.sealed {
            status = VaultStatus::Sealed;
        }
        status
    }
}

#[derive(Debug, Error)]
enum ProbeError {
    #[error("request failed: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("HTTP {status}: undecodable health response: {source}")]
    Decode {
        status: u16,
        #[source]
        source: serde_json::Error,
    },
}

/// Collector probing every configured secret-store instance on each pass
#[derive(Debug)]
pub struct VaultCollector {
    client: reqwest::Client,
    uris: Vec<String>,
    status: Opts,
    status_desc: Desc,
    health: HealthMetrics,
}

impl VaultCollector {
    pub fn new(uris: Vec<String>, customer: &str) -> Result<Self, CollectorError> {
        let labels = const_labels(VAULT_METRIC_NAMESPACE, customer);

        let status = Opts::new(
            fq_name(&[VAULT_METRIC_NAMESPACE, MONITOR_SUBSYSTEM, STATUS_SUBSYSTEM]),
            STATUS_HELP,
        )
        .const_labels(labels.clone());
        let status_desc = status
            .clone()
            .variable_labels(vec![INSTANCE_LABEL.to_string()])
            .describe()
            .map_err(|source| CollectorError::Descriptor {
                name: status.name.clone(),
                source,
            })?;
        let health = HealthMetrics::new(&[VAULT_METRIC_NAMESPACE, STATUS_SUBSYSTEM], &labels)?;

        let client = reqwest::Client::builder()
            .timeout(QUERY_TIMEOUT)
            .build()
            .map_err(|e| CollectorError::Client {
                collector: STATUS_SUBSYSTEM.to_string(),
                source: super::QueryError::ClientBuild(e),
            })?;

        tracing::info!(instances = uris.len(), "Vault health collector created");

        Ok(Self {
            client,
            uris,
            status,
            status_desc,
            health,
        })
    }

    /// Probe every instance once
    ///
    /// An empty instance list reports `up=0`. A failed probe counts one warning and
    /// clears `up`; a successful one counts one sample.
    pub async fn scrape(&self) -> (Vec<MetricFamily>, CollectStats) {
        let mut stats = CollectStats {
            up: !self.uris.is_empty(),
            ..CollectStats::default()
        };

        let probes = join_all(self.uris.iter().map(|uri| async move {
            let start = Instant::now();
            let status = self.probe(uri).await;
            (uri, status, start.elapsed().as_millis() as u64)
        }))
        .await;

        let points = match GaugeVec::new(self.status.clone(), &[INSTANCE_LABEL]) {
            Ok(points) => Some(points),
            Err(e) => {
                tracing::error!(error = %e, "Failed to create vault status gauge");
                stats.up = false;
                None
            }
        };

        for (uri, result, latency_millis) in probes {
            match result {
                Ok(status) => {
                    stats.samples += 1;
                    stats.latency_millis = stats.latency_millis.max(latency_millis);
                    if let Some(points) = &points {
                        match points.get_metric_with_label_values(&[uri.as_str()]) {
                            Ok(gauge) => gauge.set(status.as_value()),
                            Err(e) => {
                                tracing::warn!(instance = %uri, error = %e, "Failed to record vault status");
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(instance = %uri, error = %e, "Vault health probe failed");
                    stats.warnings += 1;
                    stats.up = false;
                }
            }
        }

        let mut families = points.map(|p| p.collect()).unwrap_or_default();
        families.extend(self.health.families(&stats));
        (families, stats)
    }

    async fn probe(&self, uri: &str) -> Result<VaultStatus, ProbeError> {
        let url = format!("{}/{}", uri.trim_end_matches('/'), HEALTH_PATH);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(ProbeError::Transport)?;

        // Sealed and standby instances answer with non-2xx codes and a valid body
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(ProbeError::Transport)?;
        let health: HealthResponse =
            serde_json::from_slice(&body).map_err(|source| ProbeError::Decode { status, source })?;

        Ok(health.status())
    }
}

impl Collector for VaultCollector {
    fn desc(&self) -> Vec<&Desc> {
        std::iter::once(&self.status_desc)
            .chain(self.health.descs())
            .collect()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        block_on_scrape(STATUS_SUBSYSTEM, async { self.scrape().await.0 }).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::{Encoder, TextEncoder};
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn render(families: &[MetricFamily]) -> String {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(families, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }

    fn status_of(body: serde_json::Value) -> VaultStatus {
        let health: HealthResponse = serde_json::from_value(body).unwrap();
        health.status()
    }

    #[test]
    fn test_status_precedence() {
        assert_eq!(status_of(json!({})), VaultStatus::Unknown);
        assert_eq!(status_of(json!({"standby": true})), VaultStatus::Standby);
        assert_eq!(
            status_of(json!({"standby": true, "initialized": true})),
            VaultStatus::Ready
        );
        assert_eq!(
            status_of(json!({"standby": true, "initialized": true, "sealed": true})),
            VaultStatus::Sealed
        );
    }

    #[test]
    fn test_status_values() {
        assert_eq!(VaultStatus::Unknown.as_value(), -1.0);
        assert_eq!(VaultStatus::Ready.as_value(), 0.0);
        assert_eq!(VaultStatus::Sealed.as_value(), 1.0);
        assert_eq!(VaultStatus::Standby.as_value(), 2.0);
    }

    #[tokio::test]
    async fn test_empty_instance_list_reports_down() {
        let collector = VaultCollector::new(Vec::new(), "acme").unwrap();
        let (families, stats) = collector.scrape().await;
        assert!(!stats.up);
        assert_eq!(stats.samples, 0);

        let text = render(&families);
        assert!(text.contains(r#"orch_vault_status_up{customer="acme",service="orch"} 0"#));
    }

    #[tokio::test]
    async fn test_probe_reports_sealed_instance_from_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/sys/health"))
            .respond_with(
                ResponseTemplate::new(503)
                    .set_body_json(json!({"initialized": true, "sealed": true, "standby": false})),
            )
            .mount(&server)
            .await;

        let collector = VaultCollector::new(vec![server.uri()], "acme").unwrap();
        let (families, stats) = collector.scrape().await;
        let text = render(&families);

        assert!(stats.up);
        assert_eq!(stats.samples, 1);
        assert_eq!(stats.warnings, 0);
        assert!(text.contains("orch_vault_monitor_vault_status{"));
        assert!(text.contains(&format!(r#"instance="{}""#, server.uri())));
        assert!(text.contains(r#"orch_vault_status_query_samples{customer="acme",service="orch"} 1"#));
    }

    #[tokio::test]
    async fn test_failed_probe_adds_warning() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/sys/health"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let collector = VaultCollector::new(vec![server.uri()], "acme").unwrap();
        let (_, stats) = collector.scrape().await;

        assert!(!stats.up);
        assert_eq!(stats.warnings, 1);
        assert_eq!(stats.samples, 0);
    }

    #[test]
    fn test_descriptors_cover_status_and_health() {
        let collector = VaultCollector::new(vec!["http://vault:8200".into()], "acme").unwrap();
        let names: Vec<&str> = collector.desc().iter().map(|d| d.fq_name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "orch_vault_monitor_vault_status",
                "orch_vault_status_up",
                "orch_vault_status_warnings",
                "orch_vault_status_query_samples",
                "orch_vault_status_query_latency_milliseconds",
            ]
        );
    }
}
