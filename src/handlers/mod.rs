//! HTTP handlers of the config-reloader control API

use crate::middleware::request_id_middleware;
use crate::reconciler::Reconciler;
use axum::{
    Router, middleware,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub mod health;
pub mod tenants;

/// State shared across control-API handlers
#[derive(Clone)]
pub struct ReloaderState {
    reconciler: Arc<Reconciler>,
}

impl ReloaderState {
    pub fn new(reconciler: Reconciler) -> Self {
        Self {
            reconciler: Arc::new(reconciler),
        }
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }
}

/// Build the control-API router
pub fn router(state: ReloaderState) -> Router {
    Router::new()
        .route("/v1/tenants/initialize", post(tenants::initialize))
        .route("/v1/tenants/cleanup", post(tenants::cleanup))
        .route("/health", get(health::handler))
        .with_state(state)
        .layer(middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
}
