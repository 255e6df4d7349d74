//! Tenant-scoped instant-query client for the upstream time-series API
//!
//! Every outbound request passes through [`ScopedTransport`], which stamps the
//! tenant scope header unless the caller already set one.

use reqwest::header::{HeaderMap, HeaderValue};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Header carrying the `|`-joined tenant scope on every upstream query
pub const SCOPE_HEADER: &str = "X-Scope-OrgID";

/// Fixed per-query timeout, sent upstream and enforced locally
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

const QUERY_PATH: &str = "/api/v1/query";

/// Errors returned by a single upstream query
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("Failed to create HTTP client for query endpoint: {0}")]
    ClientBuild(#[source] reqwest::Error),

    #[error("Invalid tenant scope header value '{0}'")]
    InvalidScope(String),

    #[error("Query request to {endpoint} failed: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Query endpoint {endpoint} returned HTTP {status}: {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("Query rejected by upstream ({error_type}): {message}")]
    Api { error_type: String, message: String },

    #[error("Failed to decode query response from {endpoint}: {source}")]
    Decode {
        endpoint: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Unsupported query result type '{0}' (expected vector)")]
    UnsupportedResultType(&'static str),
}

/// Insert the scope header unless the request already carries one
///
/// Header names are case-insensitive, so `x-scope-orgid` set by a caller counts as
/// present. Returns whether the header was added.
pub fn inject_scope_header(headers: &mut HeaderMap, scope: &HeaderValue) -> bool {
    if headers.contains_key(SCOPE_HEADER) {
        return false;
    }
    headers.insert(SCOPE_HEADER, scope.clone());
    true
}

/// Request-decorating transport bound to one tenant scope
#[derive(Debug, Clone)]
pub struct ScopedTransport {
    client: reqwest::Client,
    scope: HeaderValue,
}

impl ScopedTransport {
    pub fn new(client: reqwest::Client, scope: &str) -> Result<Self, QueryError> {
        let scope =
            HeaderValue::from_str(scope).map_err(|_| QueryError::InvalidScope(scope.to_string()))?;
        Ok(Self { client, scope })
    }

    /// Scope value sent on requests that do not carry their own
    pub fn scope(&self) -> &HeaderValue {
        &self.scope
    }

    /// Stamp the scope header if missing, then send
    pub async fn execute(
        &self,
        mut request: reqwest::Request,
    ) -> Result<reqwest::Response, reqwest::Error> {
        inject_scope_header(request.headers_mut(), &self.scope);
        self.client.execute(request).await
    }
}

/// One sample of an instant vector as returned by the query API
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub labels: HashMap<String, String>,
    /// Unix seconds; `0.0` when the API omitted the value pair
    pub timestamp: f64,
    /// `None` when the value was absent or not a number
    pub value: Option<f64>,
}

impl Sample {
    /// A sample is usable only with a non-zero timestamp and a parsed value
    pub fn is_valid(&self) -> bool {
        self.timestamp != 0.0 && self.value.is_some()
    }
}

/// Samples and warnings of one successful query
#[derive(Debug, Clone, Default)]
pub struct QueryOutcome {
    pub samples: Vec<Sample>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
    #[serde(default)]
    warnings: Option<Vec<String>>,
    #[serde(rename = "errorType", default)]
    error_type: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "resultType", content = "result", rename_all = "lowercase")]
enum QueryData {
    Vector(Vec<RawSample>),
    Matrix(serde_json::Value),
    Scalar(serde_json::Value),
    String(serde_json::Value),
}

#[derive(Debug, Deserialize)]
struct RawSample {
    #[serde(default)]
    metric: HashMap<String, String>,
    #[serde(default)]
    value: Option<(f64, String)>,
}

impl From<RawSample> for Sample {
    fn from(raw: RawSample) -> Self {
        match raw.value {
            Some((timestamp, value)) => Sample {
                labels: raw.metric,
                timestamp,
                value: value.parse().ok(),
            },
            None => Sample {
                labels: raw.metric,
                timestamp: 0.0,
                value: None,
            },
        }
    }
}

/// Instant-query client for one query endpoint and tenant scope
#[derive(Debug, Clone)]
pub struct QueryClient {
    endpoint: String,
    transport: ScopedTransport,
}

impl QueryClient {
    /// Create a client for `endpoint` (the API prefix, e.g. `http://mimir:8181/prometheus`)
    pub fn new(endpoint: &str, scope: &str) -> Result<Self, QueryError> {
        let client = reqwest::Client::builder()
            .timeout(QUERY_TIMEOUT)
            .build()
            .map_err(QueryError::ClientBuild)?;

        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            transport: ScopedTransport::new(client, scope)?,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Tenant scope sent with every query
    pub fn scope(&self) -> &HeaderValue {
        self.transport.scope()
    }

    /// Evaluate `query` at the current time
    pub async fn query(&self, query: &str) -> Result<QueryOutcome, QueryError> {
        let url = format!("{}{}", self.endpoint, QUERY_PATH);
        let evaluation_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();

        let request = self
            .transport
            .client
            .get(&url)
            .query(&[
                ("query", query.to_string()),
                ("time", format!("{evaluation_time:.3}")),
                ("timeout", format!("{}s", QUERY_TIMEOUT.as_secs())),
            ])
            .timeout(QUERY_TIMEOUT)
            .build()
            .map_err(|source| self.transport_error(source))?;

        let response = self
            .transport
            .execute(request)
            .await
            .map_err(|source| self.transport_error(source))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|source| self.transport_error(source))?;

        let parsed: QueryResponse = match serde_json::from_str(&body) {
            Ok(parsed) => parsed,
            Err(_) if !status.is_success() => {
                return Err(QueryError::Status {
                    endpoint: self.endpoint.clone(),
                    status: status.as_u16(),
                    body,
                });
            }
            Err(source) => {
                return Err(QueryError::Decode {
                    endpoint: self.endpoint.clone(),
                    source,
                });
            }
        };

        if parsed.status != "success" {
            return Err(QueryError::Api {
                error_type: parsed.error_type.unwrap_or_else(|| "unknown".to_string()),
                message: parsed.error.unwrap_or_else(|| parsed.status.clone()),
            });
        }
        if !status.is_success() {
            return Err(QueryError::Status {
                endpoint: self.endpoint.clone(),
                status: status.as_u16(),
                body,
            });
        }

        let samples = match parsed.data {
            None => Vec::new(),
            Some(QueryData::Vector(raw)) => raw.into_iter().map(Sample::from).collect(),
            Some(QueryData::Matrix(_)) => return Err(QueryError::UnsupportedResultType("matrix")),
            Some(QueryData::Scalar(_)) => return Err(QueryError::UnsupportedResultType("scalar")),
            Some(QueryData::String(_)) => return Err(QueryError::UnsupportedResultType("string")),
        };

        Ok(QueryOutcome {
            samples,
            warnings: parsed.warnings.unwrap_or_default(),
        })
    }

    fn transport_error(&self, source: reqwest::Error) -> QueryError {
        QueryError::Transport {
            endpoint: self.endpoint.clone(),
            source,
        }
    }
}
