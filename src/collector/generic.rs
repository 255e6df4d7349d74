//! Collector that re-exports the results of configured upstream queries

use super::query::{QueryClient, Sample};
use super::{
    CollectStats, CollectorError, HealthMetrics, MetricKind, block_on_scrape, fq_name,
};
use crate::document::{CollectorSpec, MetricSpec};
use futures::future::join_all;
use prometheus::core::{Collector, Desc, Describer};
use prometheus::proto::MetricFamily;
use prometheus::{CounterVec, GaugeVec, Opts};
use std::collections::HashMap;
use std::time::Instant;

/// One configured query and the descriptor it is exported under
#[derive(Debug)]
pub struct MetricDescriptor {
    name: String,
    query: String,
    kind: MetricKind,
    source_labels: Vec<String>,
    dest_labels: Vec<String>,
    opts: Opts,
    desc: Desc,
}

impl MetricDescriptor {
    fn new(
        namespace: &str,
        collector: &str,
        spec: &MetricSpec,
        const_labels: &HashMap<String, String>,
    ) -> Result<Self, CollectorError> {
        let kind = spec
            .metric_type
            .parse::<MetricKind>()
            .map_err(|kind| CollectorError::UnsupportedMetricType {
                collector: collector.to_string(),
                metric: spec.name.clone(),
                kind,
            })?;

        let fq = fq_name(&[namespace, collector, spec.id.as_str()]);
        // Empty help is rejected by the registry
        let help = if spec.help.is_empty() {
            fq.clone()
        } else {
            spec.help.clone()
        };
        let dest_labels = spec.effective_dest_labels().to_vec();
        let opts = Opts::new(fq.clone(), help).const_labels(const_labels.clone());
        let desc = opts
            .clone()
            .variable_labels(dest_labels.clone())
            .describe()
            .map_err(|source| CollectorError::Descriptor { name: fq, source })?;

        Ok(Self {
            name: spec.name.clone(),
            query: spec.query.clone(),
            kind,
            source_labels: spec.labels.clone(),
            dest_labels,
            opts,
            desc,
        })
    }

    /// Exported metric name
    pub fn fq_name(&self) -> &str {
        &self.desc.fq_name
    }

    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    pub fn dest_labels(&self) -> &[String] {
        &self.dest_labels
    }
}

/// Per-pass metric vector holding the data points of one query
enum PointSet {
    Counter(CounterVec),
    Gauge(GaugeVec),
}

impl PointSet {
    fn new(metric: &MetricDescriptor) -> Result<Self, prometheus::Error> {
        let labels: Vec<&str> = metric.dest_labels.iter().map(String::as_str).collect();
        Ok(match metric.kind {
            MetricKind::Counter => Self::Counter(CounterVec::new(metric.opts.clone(), &labels)?),
            MetricKind::Gauge => Self::Gauge(GaugeVec::new(metric.opts.clone(), &labels)?),
        })
    }

    /// Record one point; a repeated label set keeps the last value
    fn record(&self, label_values: &[&str], value: f64) -> Result<(), prometheus::Error> {
        match self {
            Self::Counter(vec) => {
                if value.is_nan() || value < 0.0 {
                    return Err(prometheus::Error::Msg(format!(
                        "counter value {value} is not a non-negative number"
                    )));
                }
                let counter = vec.get_metric_with_label_values(label_values)?;
                counter.reset();
                counter.inc_by(value);
            }
            Self::Gauge(vec) => vec.get_metric_with_label_values(label_values)?.set(value),
        }
        Ok(())
    }

    fn collect(&self) -> Vec<MetricFamily> {
        match self {
            Self::Counter(vec) => vec.collect(),
            Self::Gauge(vec) => vec.collect(),
        }
    }
}

/// Exports every metric of one collector definition plus its health gauges
#[derive(Debug)]
pub struct GenericCollector {
    name: String,
    namespace: String,
    client: QueryClient,
    metrics: Vec<MetricDescriptor>,
    health: HealthMetrics,
}

impl GenericCollector {
    pub fn new(
        client: QueryClient,
        namespace: &str,
        const_labels: &HashMap<String, String>,
        spec: &CollectorSpec,
    ) -> Result<Self, CollectorError> {
        let metrics = spec
            .metrics
            .iter()
            .map(|metric| MetricDescriptor::new(namespace, &spec.name, metric, const_labels))
            .collect::<Result<Vec<_>, _>>()?;
        let health = HealthMetrics::new(&[namespace, spec.name.as_str()], const_labels)?;

        tracing::debug!(
            namespace = %namespace,
            collector = %spec.name,
            endpoint = %client.endpoint(),
            metrics = metrics.len(),
            "Generic collector created"
        );

        Ok(Self {
            name: spec.name.clone(),
            namespace: namespace.to_string(),
            client,
            metrics,
            health,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn metrics(&self) -> &[MetricDescriptor] {
        &self.metrics
    }

    pub fn client(&self) -> &QueryClient {
        &self.client
    }

    /// Run every query once and render the results with the health gauges
    ///
    /// Queries run concurrently. A failing query only clears `up`; the others
    /// still export their points.
    pub async fn scrape(&self) -> (Vec<MetricFamily>, CollectStats) {
        let results = join_all(self.metrics.iter().map(|m| self.scrape_metric(m))).await;

        let mut stats = CollectStats::default();
        let mut families = Vec::new();
        for (metric_families, metric_stats) in results {
            stats.merge(&metric_stats);
            families.extend(metric_families);
        }
        families.extend(self.health.families(&stats));

        tracing::debug!(
            namespace = %self.namespace,
            collector = %self.name,
            up = stats.up,
            samples = stats.samples,
            warnings = stats.warnings,
            latency_ms = stats.latency_millis,
            "Collection pass finished"
        );

        (families, stats)
    }

    async fn scrape_metric(&self, metric: &MetricDescriptor) -> (Vec<MetricFamily>, CollectStats) {
        let start = Instant::now();
        let result = self.client.query(&metric.query).await;
        let mut stats = CollectStats {
            latency_millis: start.elapsed().as_millis() as u64,
            ..CollectStats::default()
        };

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(
                    collector = %self.name,
                    metric = %metric.name,
                    error = %e,
                    "Upstream query failed"
                );
                stats.up = false;
                return (Vec::new(), stats);
            }
        };

        stats.samples = outcome.samples.len() as u64;
        stats.warnings = outcome.warnings.len() as u64;
        if !outcome.warnings.is_empty() {
            tracing::warn!(
                collector = %self.name,
                metric = %metric.name,
                warnings = ?outcome.warnings,
                "Upstream query returned warnings"
            );
        }

        let points = match PointSet::new(metric) {
            Ok(points) => points,
            Err(e) => {
                tracing::error!(metric = %metric.fq_name(), error = %e, "Failed to create metric vector");
                stats.up = false;
                return (Vec::new(), stats);
            }
        };

        for sample in &outcome.samples {
            if !self.record_sample(&points, metric, sample) {
                stats.up = false;
            }
        }

        (points.collect(), stats)
    }

    /// Rename labels positionally and record one point; `false` if the sample is unusable
    fn record_sample(&self, points: &PointSet, metric: &MetricDescriptor, sample: &Sample) -> bool {
        let value = match sample.value {
            Some(value) if sample.is_valid() => value,
            _ => {
                tracing::debug!(
                    metric = %metric.fq_name(),
                    labels = ?sample.labels,
                    "Skipping sample without timestamp or value"
                );
                return false;
            }
        };

        let label_values: Vec<&str> = metric
            .source_labels
            .iter()
            .map(|label| sample.labels.get(label).map(String::as_str).unwrap_or(""))
            .collect();

        match points.record(&label_values, value) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(metric = %metric.fq_name(), error = %e, "Failed to record sample");
                false
            }
        }
    }
}

impl Collector for GenericCollector {
    fn desc(&self) -> Vec<&Desc> {
        self.metrics
            .iter()
            .map(|metric| &metric.desc)
            .chain(self.health.descs())
            .collect()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        block_on_scrape(&self.name, async { self.scrape().await.0 }).unwrap_or_default()
    }
}
