//! Per-namespace metric registries and the manager that serves them
//!
//! A [`Pipeline`] owns one isolated registry and renders it in the text
//! exposition format. The [`PipelineManager`] binds pipelines and control
//! endpoints to a swappable router and replaces it wholesale on reload.

pub mod manager;

pub use manager::{ControlSignal, PipelineManager, RouteBatch};

use crate::collector::NamedCollector;
use axum::{
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{Encoder, Registry, TextEncoder};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;

/// Errors raised by pipelines and the pipeline manager
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Failed to register collector '{collector}' in pipeline '{namespace}': {source}")]
    Register {
        namespace: String,
        collector: String,
        #[source]
        source: prometheus::Error,
    },

    #[error("Failed to unregister collector '{collector}' from pipeline '{namespace}': {source}")]
    Unregister {
        namespace: String,
        collector: String,
        #[source]
        source: prometheus::Error,
    },

    #[error("Failed to encode metrics of pipeline '{namespace}': {reason}")]
    Encode { namespace: String, reason: String },

    #[error("Pipeline clean-up did not complete: {0}")]
    CleanUpAborted(String),

    #[error("Route '{0}' is already registered")]
    DuplicateRoute(String),

    #[error("Invalid route '{path}': {reason}")]
    InvalidRoute { path: String, reason: &'static str },

    #[error("Failed to bind listener on {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Server is already running")]
    AlreadyStarted,

    #[error("Graceful shutdown did not complete within {0:?}")]
    ShutdownTimeout(Duration),

    #[error("Server terminated with error: {0}")]
    Server(#[source] std::io::Error),
}

/// Registry wrapper that lets one shared collector be registered and unregistered
struct Registered(Arc<dyn NamedCollector>);

impl Collector for Registered {
    fn desc(&self) -> Vec<&Desc> {
        self.0.desc()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        self.0.collect()
    }
}

/// One namespace's isolated registry and the collectors registered in it
pub struct Pipeline {
    namespace: String,
    registry: Registry,
    collectors: Mutex<Vec<Arc<dyn NamedCollector>>>,
}

impl Pipeline {
    /// Namespaces must be unique across the pipelines of one manager
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            registry: Registry::new(),
            collectors: Mutex::new(Vec::new()),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Number of collectors currently registered
    pub fn collector_count(&self) -> usize {
        self.collectors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Register collectors in order, stopping at the first failure
    ///
    /// Collectors registered before the failing one stay registered.
    pub fn add_collectors(
        &self,
        collectors: Vec<Arc<dyn NamedCollector>>,
    ) -> Result<(), PipelineError> {
        let mut registered = self
            .collectors
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        for collector in collectors {
            self.registry
                .register(Box::new(Registered(collector.clone())))
                .map_err(|source| PipelineError::Register {
                    namespace: self.namespace.clone(),
                    collector: collector.collector_name().to_string(),
                    source,
                })?;
            registered.push(collector);
        }

        tracing::debug!(
            namespace = %self.namespace,
            collectors = registered.len(),
            "Collectors registered in pipeline"
        );
        Ok(())
    }

    /// Unregister every collector, reporting the first one that fails
    pub fn unregister_collectors(&self) -> Result<(), PipelineError> {
        let mut registered = self
            .collectors
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        while let Some(collector) = registered.pop() {
            if let Err(source) = self
                .registry
                .unregister(Box::new(Registered(collector.clone())))
            {
                let name = collector.collector_name().to_string();
                registered.push(collector);
                return Err(PipelineError::Unregister {
                    namespace: self.namespace.clone(),
                    collector: name,
                    source,
                });
            }
        }

        tracing::debug!(namespace = %self.namespace, "Pipeline collectors unregistered");
        Ok(())
    }

    /// Collect every registered collector and encode the result
    ///
    /// Collection drives async scrapes on the current runtime, so this must not be
    /// called from an async worker thread.
    pub fn gather(&self) -> Result<String, PipelineError> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|e| PipelineError::Encode {
                namespace: self.namespace.clone(),
                reason: e.to_string(),
            })?;

        String::from_utf8(buffer).map_err(|e| PipelineError::Encode {
            namespace: self.namespace.clone(),
            reason: format!("invalid UTF-8 at byte {}", e.utf8_error().valid_up_to()),
        })
    }
}

/// Scrape endpoint of one pipeline
pub async fn metrics_handler(State(pipeline): State<Arc<Pipeline>>) -> Response {
    let namespace = pipeline.namespace().to_string();
    let gathered = tokio::task::spawn_blocking(move || pipeline.gather()).await;

    match gathered {
        Ok(Ok(body)) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
            body,
        )
            .into_response(),
        Ok(Err(e)) => {
            tracing::error!(namespace = %namespace, error = %e, "Failed to gather pipeline metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
        Err(e) => {
            tracing::error!(namespace = %namespace, error = %e, "Metrics gathering task failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to gather metrics".to_string(),
            )
                .into_response()
        }
    }
}
