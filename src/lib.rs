//! SRE metrics exporter and its tenant control plane
//!
//! The data plane ([`exporter`]) serves one metrics pipeline per configuration
//! document and hot-reloads them on request. The control plane ([`reconciler`],
//! [`handlers`]) mutates the tenant scope of the shared document and verifies by
//! content hash that the data plane converged to it.

pub mod cli;
pub mod collector;
pub mod config;
pub mod document;
pub mod error;
pub mod exporter;
pub mod handlers;
pub mod middleware;
pub mod pipeline;
pub mod reconciler;
pub mod scraping;
pub mod telemetry;
