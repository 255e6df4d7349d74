//! Configuration document model
//!
//! The document is the JSON file shared by the control plane (which mutates the
//! tenant scope) and the data plane (which builds its collectors from it). Keys
//! follow the deployed format, so the struct field names differ from the JSON keys.
//!
//! Two read paths exist:
//! - [`ConfigDocument::from_json`] parses the document as persisted. The control
//!   plane uses it because it writes the document back and must never persist the
//!   load-time label normalisation.
//! - [`load`] reads a file, hashes the persisted content, then normalises
//!   `destLabels` for collection.

pub mod hash;
pub mod tenant;

pub use hash::{ConfigHash, digest};
pub use tenant::{TenantId, TenantIdError, TenantScope};

use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;
use thiserror::Error;

/// Errors raised while reading, parsing or serialising a configuration document
#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("Failed to read configuration document '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration document '{origin}': {source}")]
    Parse {
        origin: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize configuration document: {0}")]
    Serialize(#[source] serde_json::Error),
}

/// Persisted configuration: namespace, query source and collector definitions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigDocument {
    #[serde(default, deserialize_with = "null_as_default")]
    pub namespace: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub source: QuerySource,
    #[serde(default, deserialize_with = "null_as_default")]
    pub collectors: Vec<CollectorSpec>,
}

/// Upstream query API and the tenants whose data it may read
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuerySource {
    #[serde(rename = "queryURI", default, deserialize_with = "null_as_default")]
    pub query_endpoint: String,
    #[serde(rename = "mimirOrg", default, deserialize_with = "null_as_default")]
    pub tenant_scope: TenantScope,
}

/// A named group of metrics exported together with shared health metrics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectorSpec {
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub enabled: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub metrics: Vec<MetricSpec>,
}

/// One upstream query re-exported as one metric
///
/// `labels` names the labels read from each returned sample; `dest_labels` gives
/// their exported names by position. An empty or mismatched `dest_labels` means
/// "export under the source names" (see [`ConfigDocument::normalize_dest_labels`]).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricSpec {
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    /// Persisted and hashed with the document; collection does not consult it
    #[serde(default, deserialize_with = "null_as_default")]
    pub enabled: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub query: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub help: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub labels: Vec<String>,
    #[serde(rename = "destLabels", default, deserialize_with = "null_as_default")]
    pub dest_labels: Vec<String>,
    /// Declared value type, `Counter` or `Gauge`. Checked when collectors are built.
    #[serde(rename = "Type", default, deserialize_with = "null_as_default")]
    pub metric_type: String,
}

impl MetricSpec {
    /// Exported label names: `dest_labels` when it maps every source label, else `labels`
    pub fn effective_dest_labels(&self) -> &[String] {
        if self.dest_labels.len() == self.labels.len() {
            &self.dest_labels
        } else {
            &self.labels
        }
    }
}

impl ConfigDocument {
    /// Parse a document exactly as persisted (no normalisation)
    pub fn from_json(origin: &str, contents: &str) -> Result<Self, DocumentError> {
        serde_json::from_str(contents).map_err(|source| DocumentError::Parse {
            origin: origin.to_string(),
            source,
        })
    }

    /// Render the document in the indented form written to the store
    pub fn to_persisted_json(&self) -> Result<String, DocumentError> {
        serde_json::to_string_pretty(self).map_err(DocumentError::Serialize)
    }

    /// Replace every `destLabels` whose length differs from `labels` with a copy of `labels`
    pub fn normalize_dest_labels(&mut self) {
        for collector in &mut self.collectors {
            for metric in &mut collector.metrics {
                if metric.dest_labels.len() != metric.labels.len() {
                    metric.dest_labels = metric.labels.clone();
                }
            }
        }
    }
}

/// Load a document from disk for collection
///
/// The returned hash covers the document as persisted, before `destLabels`
/// normalisation, so it can be compared with the hash the control plane computes
/// from the store.
pub fn load<P: AsRef<Path>>(path: P) -> Result<(ConfigDocument, ConfigHash), DocumentError> {
    let path_display = path.as_ref().display().to_string();

    let contents =
        std::fs::read_to_string(path.as_ref()).map_err(|source| DocumentError::Read {
            path: path_display.clone(),
            source,
        })?;

    let mut document = ConfigDocument::from_json(&path_display, &contents)?;
    let hash = digest(&document)?;
    document.normalize_dest_labels();

    tracing::info!(
        path = %path_display,
        namespace = %document.namespace,
        collectors = document.collectors.len(),
        tenants = document.source.tenant_scope.tenants().len(),
        config_hash = %hash,
        "Configuration document loaded"
    );

    Ok((document, hash))
}

/// Accept `null` wherever a value has a natural empty default
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
