//! Tenant mutation and convergence verification
//!
//! The [`Reconciler`] is the control-plane half of the configuration protocol. A
//! request validates the tenant, takes the reconciler lock, applies an idempotent
//! set operation to the persisted tenant scope, then compares the hash of the
//! stored document with the hash the exporter reports. On mismatch it annotates
//! the exporter's identity record, forces a reload and reports a retryable error.
//! Success is only reported once a verification observes matching hashes.
//!
//! Every step runs against the request deadline, including the wait for the lock.

pub mod exporter_client;
pub mod store;

pub use exporter_client::{ExporterClient, ExporterClientError};
pub use store::{ConfigStore, FileStore, InMemoryStore, StoreError};

use crate::document::{DocumentError, TenantId, TenantIdError, digest};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Annotation key carrying the hash of the stored document
pub const EXPECTED_HASH_ANNOTATION: &str = "configMapHash";
/// Annotation key carrying the hash the exporter reported
pub const OBSERVED_HASH_ANNOTATION: &str = "observedConfigHash";

/// Tenant membership change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TenantOp {
    Add,
    Remove,
}

impl fmt::Display for TenantOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add => f.write_str("initialize"),
            Self::Remove => f.write_str("cleanup"),
        }
    }
}

/// Why a mutation needed no write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoftReason {
    AlreadyExists,
    NotFound,
}

/// Result of a verified mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOutcome {
    /// The document was changed and persisted
    Applied,
    /// The document already had the requested membership; nothing was written
    AlreadyInDesiredState(SoftReason),
}

impl MutationOutcome {
    /// Status code reported to control-API callers
    pub fn code(&self) -> &'static str {
        match self {
            Self::Applied => "OK",
            Self::AlreadyInDesiredState(SoftReason::AlreadyExists) => "AlreadyExists",
            Self::AlreadyInDesiredState(SoftReason::NotFound) => "NotFound",
        }
    }
}

/// Caller-facing classification of a failed mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcCode {
    InvalidArgument,
    Internal,
    Unavailable,
}

impl RpcCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidArgument => "InvalidArgument",
            Self::Internal => "Internal",
            Self::Unavailable => "Unavailable",
        }
    }
}

/// Errors raised by [`Reconciler::mutate`]
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("invalid tenant name: {0}")]
    InvalidTenant(#[from] TenantIdError),

    #[error("configuration store failure: {0}")]
    Store(#[from] StoreError),

    #[error("failed to hash configuration document: {0}")]
    Document(#[from] DocumentError),

    #[error("failed to acquire hash from metrics exporter: {0}")]
    HashUnavailable(#[source] ExporterClientError),

    #[error("failed to reload metrics exporter: {0}")]
    ReloadFailed(#[source] ExporterClientError),

    #[error(
        "metrics exporter reloaded because it did not use the latest configuration (expected {expected}, observed {observed})"
    )]
    ConvergencePending { expected: String, observed: String },

    #[error("request deadline exceeded while waiting to {0}")]
    DeadlineExceeded(&'static str),
}

impl ReconcileError {
    pub fn code(&self) -> RpcCode {
        match self {
            Self::InvalidTenant(_) => RpcCode::InvalidArgument,
            Self::Store(_) | Self::Document(_) => RpcCode::Internal,
            Self::HashUnavailable(_)
            | Self::ReloadFailed(_)
            | Self::ConvergencePending { .. }
            | Self::DeadlineExceeded(_) => RpcCode::Unavailable,
        }
    }
}

/// Serialises tenant mutations on one stored document and verifies convergence
pub struct Reconciler {
    store: Arc<dyn ConfigStore>,
    exporter: ExporterClient,
    request_timeout: Duration,
    lock: Mutex<()>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        exporter: ExporterClient,
        request_timeout: Duration,
    ) -> Self {
        Self {
            store,
            exporter,
            request_timeout,
            lock: Mutex::new(()),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Apply `op` for `tenant` and verify that the exporter serves the result
    pub async fn mutate(
        &self,
        tenant: &str,
        op: TenantOp,
    ) -> Result<MutationOutcome, ReconcileError> {
        tracing::info!(tenant = %tenant, action = %op, "Received tenant request");
        let result = self.mutate_inner(tenant, op).await;

        match &result {
            Ok(outcome) => tracing::info!(
                tenant = %tenant,
                action = %op,
                code = outcome.code(),
                "Tenant request completed"
            ),
            Err(e) => tracing::warn!(
                tenant = %tenant,
                action = %op,
                code = e.code().as_str(),
                error = %e,
                "Tenant request failed"
            ),
        }
        result
    }

    async fn mutate_inner(
        &self,
        tenant: &str,
        op: TenantOp,
    ) -> Result<MutationOutcome, ReconcileError> {
        let tenant = TenantId::parse(tenant)?;
        let deadline = Instant::now() + self.request_timeout;

        let _guard = within(deadline, "acquire the tenant lock", self.lock.lock()).await?;
        tracing::debug!(tenant = %tenant, "Tenant lock acquired");

        let mut document =
            within(deadline, "fetch the document", self.store.fetch_document()).await??;

        let scope = &mut document.source.tenant_scope;
        let outcome = match op {
            TenantOp::Add if !scope.insert(&tenant) => {
                MutationOutcome::AlreadyInDesiredState(SoftReason::AlreadyExists)
            }
            TenantOp::Remove if !scope.remove(&tenant) => {
                MutationOutcome::AlreadyInDesiredState(SoftReason::NotFound)
            }
            _ => MutationOutcome::Applied,
        };

        if outcome == MutationOutcome::Applied {
            within(
                deadline,
                "persist the document",
                self.store.persist_document(&document),
            )
            .await??;
            tracing::info!(
                tenant = %tenant,
                tenant_scope = %document.source.tenant_scope.as_str(),
                "Tenant scope persisted"
            );
        } else {
            tracing::info!(tenant = %tenant, code = outcome.code(), "Tenant already in desired state");
        }

        let expected = digest(&document)?;
        let observed = within(
            deadline,
            "query the exporter hash",
            self.exporter.active_config_hash(remaining(deadline)),
        )
        .await?
        .map_err(ReconcileError::HashUnavailable)?;

        if expected.matches(&observed) {
            tracing::info!(config_hash = %expected, "Exporter serves the stored configuration");
            return Ok(outcome);
        }

        tracing::warn!(
            expected = %expected,
            observed = %observed,
            "Exporter configuration hash does not match the stored document, forcing reload"
        );
        self.annotate_mismatch(deadline, expected.as_str(), &observed)
            .await;

        within(
            deadline,
            "reload the exporter",
            self.exporter.force_reload(remaining(deadline)),
        )
        .await?
        .map_err(ReconcileError::ReloadFailed)?;

        Err(ReconcileError::ConvergencePending {
            expected: expected.to_string(),
            observed,
        })
    }

    /// Best effort; failures only get logged
    async fn annotate_mismatch(&self, deadline: Instant, expected: &str, observed: &str) {
        let annotations = BTreeMap::from([
            (EXPECTED_HASH_ANNOTATION.to_string(), expected.to_string()),
            (OBSERVED_HASH_ANNOTATION.to_string(), observed.to_string()),
        ]);

        match within(
            deadline,
            "annotate the exporter identity",
            self.store.annotate_identity(annotations),
        )
        .await
        {
            Ok(Ok(())) => tracing::debug!("Exporter identity annotated with hash mismatch"),
            Ok(Err(e)) => tracing::warn!(error = %e, "Failed to annotate exporter identity"),
            Err(e) => tracing::warn!(error = %e, "Failed to annotate exporter identity"),
        }
    }
}

async fn within<F: Future>(
    deadline: Instant,
    step: &'static str,
    future: F,
) -> Result<F::Output, ReconcileError> {
    tokio::time::timeout_at(deadline, future)
        .await
        .map_err(|_| ReconcileError::DeadlineExceeded(step))
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}
