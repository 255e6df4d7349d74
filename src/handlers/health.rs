//! Liveness endpoint of the control API

/// Health check handler
pub async fn handler() -> &'static str {
    "OK"
}
