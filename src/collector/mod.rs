//! Collectors that re-export upstream query results as local metrics
//!
//! [`build_collectors`] turns the enabled collector definitions of a
//! [`ConfigDocument`] into [`GenericCollector`]s bound to a tenant-scoped
//! [`QueryClient`]. [`VaultCollector`] is the synthetic health collector that probes
//! secret-store instances directly.
//!
//! Both implement [`prometheus::core::Collector`]. Their `collect` runs the async
//! scrape on the current Tokio runtime and must be called from a blocking thread.

pub mod generic;
pub mod query;
pub mod vault;

pub use generic::{GenericCollector, MetricDescriptor};
pub use query::{QueryClient, QueryError, QueryOutcome, Sample, ScopedTransport};
pub use vault::{VaultCollector, VaultStatus};

use crate::document::ConfigDocument;
use prometheus::core::{Collector, Desc, Describer};
use prometheus::proto::MetricFamily;
use prometheus::{Gauge, Opts};
use std::collections::HashMap;
use std::str::FromStr;
use thiserror::Error;

pub const CONST_LABEL_SERVICE: &str = "service";
pub const CONST_LABEL_CUSTOMER: &str = "customer";

const HELP_UP: &str = "Were all the last backend queries successful";
const HELP_WARNINGS: &str = "How many warnings did the last queries generate";
const HELP_SAMPLES: &str = "How many samples did the last queries generate";
const HELP_LATENCY: &str = "How long did it take to perform the slowest query";

/// Errors raised while building collectors
#[derive(Debug, Error)]
pub enum CollectorError {
    #[error(
        "Metric '{metric}' in collector '{collector}' has unsupported type '{kind}' (expected Counter or Gauge)"
    )]
    UnsupportedMetricType {
        collector: String,
        metric: String,
        kind: String,
    },

    #[error("Invalid metric descriptor '{name}': {source}")]
    Descriptor {
        name: String,
        #[source]
        source: prometheus::Error,
    },

    #[error("Failed to create query client for collector '{collector}': {source}")]
    Client {
        collector: String,
        #[source]
        source: QueryError,
    },
}

/// Exported value type of a configured metric
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
}

impl FromStr for MetricKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Counter" => Ok(Self::Counter),
            "Gauge" => Ok(Self::Gauge),
            other => Err(other.to_string()),
        }
    }
}

/// A collector that can be registered with a [`crate::pipeline::Pipeline`]
pub trait NamedCollector: Collector {
    /// Name used in registration errors and logs
    fn collector_name(&self) -> &str;
}

impl NamedCollector for GenericCollector {
    fn collector_name(&self) -> &str {
        self.name()
    }
}

impl NamedCollector for VaultCollector {
    fn collector_name(&self) -> &str {
        "vault_status"
    }
}

/// Health of one collection pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectStats {
    pub up: bool,
    pub latency_millis: u64,
    pub samples: u64,
    pub warnings: u64,
}

impl Default for CollectStats {
    /// Identity of [`CollectStats::merge`]
    fn default() -> Self {
        Self {
            up: true,
            latency_millis: 0,
            samples: 0,
            warnings: 0,
        }
    }
}

impl CollectStats {
    /// Fold another result in: `up` is ANDed, latency is the max, counts are summed
    pub fn merge(&mut self, other: &CollectStats) {
        self.up = self.up && other.up;
        self.latency_millis = self.latency_millis.max(other.latency_millis);
        self.samples += other.samples;
        self.warnings += other.warnings;
    }
}

/// Join non-empty name parts with `_`
pub(crate) fn fq_name(parts: &[&str]) -> String {
    parts
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("_")
}

pub(crate) fn const_labels(service: &str, customer: &str) -> HashMap<String, String> {
    HashMap::from([
        (CONST_LABEL_SERVICE.to_string(), service.to_string()),
        (CONST_LABEL_CUSTOMER.to_string(), customer.to_string()),
    ])
}

/// The four gauges every collector reports about its own last pass
#[derive(Debug)]
pub(crate) struct HealthMetrics {
    up: Opts,
    warnings: Opts,
    samples: Opts,
    latency: Opts,
    descs: Vec<Desc>,
}

impl HealthMetrics {
    /// Health gauges named `{prefix}_{up,warnings,query_samples,query_latency_milliseconds}`
    pub(crate) fn new(
        prefix: &[&str],
        labels: &HashMap<String, String>,
    ) -> Result<Self, CollectorError> {
        let base = fq_name(prefix);
        let opts = |suffix: &str, help: &str| {
            Opts::new(fq_name(&[base.as_str(), suffix]), help).const_labels(labels.clone())
        };

        let up = opts("up", HELP_UP);
        let warnings = opts("warnings", HELP_WARNINGS);
        let samples = opts("query_samples", HELP_SAMPLES);
        let latency = opts("query_latency_milliseconds", HELP_LATENCY);

        let descs = [&up, &warnings, &samples, &latency]
            .into_iter()
            .map(|opts| {
                opts.describe().map_err(|source| CollectorError::Descriptor {
                    name: opts.name.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            up,
            warnings,
            samples,
            latency,
            descs,
        })
    }

    pub(crate) fn descs(&self) -> impl Iterator<Item = &Desc> {
        self.descs.iter()
    }

    /// Render `stats` as four gauge families
    pub(crate) fn families(&self, stats: &CollectStats) -> Vec<MetricFamily> {
        let up = if stats.up { 1.0 } else { 0.0 };
        [
            (&self.up, up),
            (&self.latency, stats.latency_millis as f64),
            (&self.warnings, stats.warnings as f64),
            (&self.samples, stats.samples as f64),
        ]
        .into_iter()
        .filter_map(|(opts, value)| match Gauge::with_opts(opts.clone()) {
            Ok(gauge) => {
                gauge.set(value);
                Some(gauge.collect())
            }
            Err(e) => {
                tracing::error!(metric = %opts.name, error = %e, "Failed to create health gauge");
                None
            }
        })
        .flatten()
        .collect()
    }
}

/// Build one collector per enabled collector definition
///
/// The document is expected to be normalised (see [`crate::document::load`]). Any
/// metric whose type is neither `Counter` nor `Gauge` rejects the whole document.
pub fn build_collectors(
    document: &ConfigDocument,
    customer: &str,
) -> Result<Vec<GenericCollector>, CollectorError> {
    let labels = const_labels(&document.namespace, customer);
    let scope = document.source.tenant_scope.as_str();

    let mut collectors = Vec::new();
    for spec in document.collectors.iter().filter(|c| c.enabled) {
        let client = QueryClient::new(&document.source.query_endpoint, scope).map_err(|source| {
            CollectorError::Client {
                collector: spec.name.clone(),
                source,
            }
        })?;
        collectors.push(GenericCollector::new(
            client,
            &document.namespace,
            &labels,
            spec,
        )?);
    }

    tracing::info!(
        namespace = %document.namespace,
        configured = document.collectors.len(),
        enabled = collectors.len(),
        "Collectors built from configuration document"
    );

    Ok(collectors)
}

/// Run an async scrape from the synchronous [`Collector::collect`] entry point
pub(crate) fn block_on_scrape<F>(name: &str, scrape: F) -> Option<Vec<MetricFamily>>
where
    F: std::future::Future<Output = Vec<MetricFamily>>,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => Some(handle.block_on(scrape)),
        Err(e) => {
            tracing::error!(
                collector = %name,
                error = %e,
                "Collector invoked outside a Tokio runtime, skipping collection"
            );
            None
        }
    }
}
