//! Self-monitoring of the local telemetry collector agent
//!
//! A background task fetches the agent's exposition endpoint on a fixed
//! interval, reads the first sample of each watched family and logs when a
//! watched value or its change since the last pass crosses a threshold.

use prometheus_parse::{Scrape, Value};
use reqwest::Client;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

/// Errors raised by one scrape pass
#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("Failed to create HTTP client: {0}")]
    ClientBuild(#[source] reqwest::Error),

    #[error("Failed to fetch {endpoint}: {source}")]
    Fetch {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Failed to parse exposition: {0}")]
    Parse(#[source] std::io::Error),
}

/// How a watched metric is compared with its threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckType {
    /// The change since the previous pass
    RateThreshold,
    /// The value itself
    ValueThreshold,
}

/// Declared type of a watched family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FamilyKind {
    Counter,
    Gauge,
}

impl FamilyKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
        }
    }
}

/// One watched metric family
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrapeCondition {
    pub metric: &'static str,
    pub check: CheckType,
    pub threshold: f64,
    pub kind: FamilyKind,
}

/// Families watched on the collector agent
pub const OTEL_CONDITIONS: [ScrapeCondition; 5] = [
    ScrapeCondition {
        metric: "otelcol_exporter_send_failed_metric_points",
        check: CheckType::RateThreshold,
        threshold: 0.0,
        kind: FamilyKind::Counter,
    },
    ScrapeCondition {
        metric: "otelcol_exporter_sent_metric_points",
        check: CheckType::RateThreshold,
        threshold: 0.0,
        kind: FamilyKind::Counter,
    },
    ScrapeCondition {
        metric: "otelcol_receiver_accepted_metric_points",
        check: CheckType::RateThreshold,
        threshold: 0.0,
        kind: FamilyKind::Counter,
    },
    ScrapeCondition {
        metric: "otelcol_receiver_refused_metric_points",
        check: CheckType::RateThreshold,
        threshold: 0.0,
        kind: FamilyKind::Counter,
    },
    // 2 GiB
    ScrapeCondition {
        metric: "otelcol_process_memory_rss",
        check: CheckType::ValueThreshold,
        threshold: 2_147_483_648.0,
        kind: FamilyKind::Gauge,
    },
];

/// Direction of a threshold crossing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Crossing {
    Above,
    Below,
}

/// A watched value that moved across its threshold
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdEvent {
    pub metric: &'static str,
    pub check: CheckType,
    pub crossing: Crossing,
    /// Previous value or rate
    pub previous: f64,
    /// Current value or rate
    pub current: f64,
}

/// Samples of one family in an exposition document
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedFamily {
    /// Declared type; `None` for untyped families
    pub kind: Option<String>,
    /// Scalar sample values in document order
    pub samples: Vec<f64>,
}

/// Parse the text exposition format into families keyed by name
///
/// Labels and timestamps are dropped. Lines that are not comments or samples are
/// skipped, as are samples whose value does not parse.
pub fn parse_exposition(text: &str) -> Result<HashMap<String, ParsedFamily>, ScrapeError> {
    let lines = text.lines().map(|line| Ok(line.to_string()));
    let scrape = Scrape::parse(lines).map_err(ScrapeError::Parse)?;

    let mut families: HashMap<String, ParsedFamily> = HashMap::new();
    for sample in scrape.samples {
        let family = families.entry(sample.metric).or_default();
        let (kind, value) = match sample.value {
            Value::Counter(value) => (Some("counter"), Some(value)),
            Value::Gauge(value) => (Some("gauge"), Some(value)),
            Value::Untyped(value) => (None, Some(value)),
            Value::Histogram(_) => (Some("histogram"), None),
            Value::Summary(_) => (Some("summary"), None),
        };
        family.kind = kind.map(str::to_string);
        family.samples.extend(value);
    }

    Ok(families)
}

#[derive(Debug, Clone, Copy, Default)]
struct ConditionState {
    value: f64,
    rate: f64,
}

/// Threshold evaluation state across scrape passes
#[derive(Debug)]
pub struct ScrapeMonitor {
    client: Client,
    endpoint: String,
    conditions: Vec<ScrapeCondition>,
    states: Vec<ConditionState>,
}

impl ScrapeMonitor {
    pub fn new(
        endpoint: impl Into<String>,
        conditions: &[ScrapeCondition],
    ) -> Result<Self, ScrapeError> {
        let endpoint = endpoint.into();
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(ScrapeError::ClientBuild)?;

        for condition in conditions {
            tracing::info!(
                endpoint = %endpoint,
                metric = condition.metric,
                check = ?condition.check,
                threshold = condition.threshold,
                kind = condition.kind.as_str(),
                "Watching collector agent metric"
            );
        }

        Ok(Self {
            client,
            endpoint,
            conditions: conditions.to_vec(),
            states: vec![ConditionState::default(); conditions.len()],
        })
    }

    /// Fetch the endpoint once and evaluate every condition
    pub async fn scrape_once(&mut self) -> Result<Vec<ThresholdEvent>, ScrapeError> {
        let fetch_error = |source| ScrapeError::Fetch {
            endpoint: self.endpoint.clone(),
            source,
        };
        let body = self
            .client
            .get(&self.endpoint)
            .send()
            .await
            .map_err(fetch_error)?
            .text()
            .await
            .map_err(fetch_error)?;

        let families = parse_exposition(&body)?;
        Ok(self.observe(&families))
    }

    /// Evaluate every condition against one parsed document
    ///
    /// A missing or empty family leaves that condition's state untouched.
    pub fn observe(&mut self, families: &HashMap<String, ParsedFamily>) -> Vec<ThresholdEvent> {
        let mut events = Vec::new();

        for (condition, state) in self.conditions.iter().zip(self.states.iter_mut()) {
            let Some(family) = families.get(condition.metric) else {
                continue;
            };
            if let Some(kind) = &family.kind
                && kind != condition.kind.as_str()
            {
                tracing::warn!(
                    metric = condition.metric,
                    expected = condition.kind.as_str(),
                    declared = %kind,
                    "Watched metric has unexpected type, skipping"
                );
                continue;
            }
            let Some(&value) = family.samples.first() else {
                continue;
            };

            if let Some(event) = evaluate(condition, *state, value) {
                log_event(&event);
                events.push(event);
            }

            *state = ConditionState {
                value,
                rate: value - state.value,
            };
        }

        events
    }

    /// Run [`ScrapeMonitor::scrape_once`] every `interval`, starting one interval from now
    pub fn spawn(mut self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            loop {
                ticker.tick().await;
                if let Err(e) = self.scrape_once().await {
                    tracing::warn!(error = %e, "Failed to scrape collector agent metrics");
                }
            }
        })
    }
}

fn evaluate(condition: &ScrapeCondition, state: ConditionState, value: f64) -> Option<ThresholdEvent> {
    let (previous, current) = match condition.check {
        CheckType::ValueThreshold => (state.value, value),
        CheckType::RateThreshold => (state.rate, value - state.value),
    };

    let crossing = if current > condition.threshold && previous <= condition.threshold {
        Crossing::Above
    } else if current <= condition.threshold && previous > condition.threshold {
        Crossing::Below
    } else {
        return None;
    };

    Some(ThresholdEvent {
        metric: condition.metric,
        check: condition.check,
        crossing,
        previous,
        current,
    })
}

fn log_event(event: &ThresholdEvent) {
    let subject = match event.check {
        CheckType::ValueThreshold => "value",
        CheckType::RateThreshold => "rate",
    };
    match event.crossing {
        Crossing::Above => tracing::warn!(
            metric = event.metric,
            previous = event.previous,
            current = event.current,
            "Metric {} went above the threshold",
            subject
        ),
        Crossing::Below => tracing::info!(
            metric = event.metric,
            previous = event.previous,
            current = event.current,
            "Metric {} went below the threshold",
            subject
        ),
    }
}
