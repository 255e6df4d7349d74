//! Command-line interfaces of both binaries
//!
//! Provides argument parsing and subcommand handling for `metrics-exporter` and
//! `config-reloader`.

use clap::{Parser, Subcommand};
use std::io::Write;

/// Multi-tenant SRE metrics exporter
#[derive(Parser)]
#[command(name = "metrics-exporter")]
#[command(version)]
#[command(about = "Re-exports tenant-scoped upstream metrics per namespace")]
#[command(
    long_about = "Serves one metrics endpoint per configured namespace, built from JSON \
    configuration documents. POST /reload or SIGHUP rebuilds every pipeline without \
    stopping the listener."
)]
pub struct ExporterCli {
    /// Path to settings file
    #[arg(short, long, default_value = "exporter.toml", global = true)]
    pub config: String,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Tenant control service for the metrics exporter
#[derive(Parser)]
#[command(name = "config-reloader")]
#[command(version)]
#[command(about = "Adds and removes tenants and verifies the exporter converges")]
#[command(
    long_about = "Mutates the tenant scope of the shared configuration document, then \
    compares its hash with the hash reported by the metrics exporter and forces a reload \
    when they differ."
)]
pub struct ReloaderCli {
    /// Path to settings file
    #[arg(short, long, default_value = "reloader.toml", global = true)]
    pub config: String,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Generate a template settings file
    Config {
        /// Output file path (prints to stdout if not specified)
        #[arg(short, long)]
        output: Option<String>,
    },
}

/// Print `template` or write it to `output`
pub fn write_template(template: &str, output: Option<&str>) -> std::io::Result<()> {
    match output {
        Some(path) => {
            std::fs::write(path, template)?;
            eprintln!("Settings template written to {path}");
            Ok(())
        }
        None => std::io::stdout().write_all(template.as_bytes()),
    }
}

/// Template settings of the metrics exporter
pub fn exporter_config_template() -> &'static str {
    r#"# Metrics Exporter Settings
# =========================
#
# Configures the listener, the configuration documents served as pipelines,
# the secret-store health probe and self-monitoring.

# ─────────────────────────────────────────────────────────────────────────────
# SERVER
# ─────────────────────────────────────────────────────────────────────────────

[server]
# Address serving /<namespace>/metrics, /reload, /confighash and /
listen_address = "0.0.0.0:9141"

# Graceful drain budget on SIGINT/SIGTERM (1-300)
shutdown_timeout_seconds = 30

# ─────────────────────────────────────────────────────────────────────────────
# CONFIGURATION DOCUMENTS
# ─────────────────────────────────────────────────────────────────────────────
#
# Each document becomes one pipeline served at /<namespace>/metrics.
# Namespaces must be unique across documents.

[exporter]
customer_label = "UNKNOWN_CUSTOMER"
config_files = [
    "/etc/sre-exporter/orch.json",
    "/etc/sre-exporter/orch_edgenode.json",
]

# Namespace whose document hash is served at /confighash
config_hash_namespace = "orch_edgenode"

# ─────────────────────────────────────────────────────────────────────────────
# SECRET STORE HEALTH
# ─────────────────────────────────────────────────────────────────────────────
#
# Base URIs probed at /v1/sys/health and served at /vault/metrics.
# An empty list reports the collector as down.

[vault]
uris = []

# ─────────────────────────────────────────────────────────────────────────────
# SELF-MONITORING
# ─────────────────────────────────────────────────────────────────────────────

[self_monitoring]
enabled = true
endpoint = "http://127.0.0.1:8888/metrics"
interval_seconds = 300

# ─────────────────────────────────────────────────────────────────────────────
# OBSERVABILITY
# ─────────────────────────────────────────────────────────────────────────────

[observability]
# RUST_LOG overrides this when set
log_level = "info"
"#
}

/// Template settings of the config reloader
pub fn reloader_config_template() -> &'static str {
    r#"# Config Reloader Settings
# ========================
#
# Configures the tenant control API, the shared document store and the
# metrics exporter endpoints used to verify convergence.

# ─────────────────────────────────────────────────────────────────────────────
# SERVER
# ─────────────────────────────────────────────────────────────────────────────

[server]
listen_address = "0.0.0.0:50051"

# Deadline of one tenant request, including the wait for the tenant lock (1-300)
request_timeout_seconds = 30

# Graceful drain budget on SIGINT/SIGTERM (1-300)
shutdown_timeout_seconds = 5

# ─────────────────────────────────────────────────────────────────────────────
# STORE
# ─────────────────────────────────────────────────────────────────────────────

[store]
# The configuration document whose tenant scope is mutated
document_path = "/etc/sre-exporter/orch_edgenode.json"

# Identity record of the exporter process, annotated on hash mismatch
identity_path = "/var/lib/sre-exporter/identity.json"

# ─────────────────────────────────────────────────────────────────────────────
# METRICS EXPORTER
# ─────────────────────────────────────────────────────────────────────────────

[exporter]
reload_endpoint = "http://localhost:9141/reload"
config_hash_endpoint = "http://localhost:9141/confighash"

# ─────────────────────────────────────────────────────────────────────────────
# OBSERVABILITY
# ─────────────────────────────────────────────────────────────────────────────

[observability]
log_level = "info"
"#
}
