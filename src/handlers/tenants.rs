//! Tenant initialize and cleanup endpoints
//!
//! Both endpoints take `{"tenant": "<id>"}` and answer `200` with the outcome
//! code when the exporter is verified to serve the resulting document. Soft
//! outcomes (`AlreadyExists`, `NotFound`) are successes.

use crate::error::{AppError, AppResult};
use crate::handlers::ReloaderState;
use crate::middleware::RequestId;
use crate::reconciler::TenantOp;
use axum::{
    Extension, Json,
    extract::{State, rejection::JsonRejection},
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantRequest {
    pub tenant: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantResponse {
    pub tenant: String,
    pub code: String,
}

pub async fn initialize(
    State(state): State<ReloaderState>,
    Extension(request_id): Extension<RequestId>,
    payload: Result<Json<TenantRequest>, JsonRejection>,
) -> AppResult<Json<TenantResponse>> {
    handle(&state, request_id, payload, TenantOp::Add).await
}

pub async fn cleanup(
    State(state): State<ReloaderState>,
    Extension(request_id): Extension<RequestId>,
    payload: Result<Json<TenantRequest>, JsonRejection>,
) -> AppResult<Json<TenantResponse>> {
    handle(&state, request_id, payload, TenantOp::Remove).await
}

async fn handle(
    state: &ReloaderState,
    request_id: RequestId,
    payload: Result<Json<TenantRequest>, JsonRejection>,
    op: TenantOp,
) -> AppResult<Json<TenantResponse>> {
    let Json(request) = payload.map_err(|rejection| AppError::Validation(rejection.body_text()))?;

    tracing::debug!(request_id = %request_id, tenant = %request.tenant, action = %op, "Dispatching tenant request");
    let outcome = state.reconciler().mutate(&request.tenant, op).await?;

    Ok(Json(TenantResponse {
        tenant: request.tenant,
        code: outcome.code().to_string(),
    }))
}
