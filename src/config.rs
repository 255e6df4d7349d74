//! Process settings for both binaries
//!
//! Parses TOML settings files and provides typed access to them.
//! [`ExporterSettings`] configures the metrics exporter and [`ReloaderSettings`]
//! configures the config reloader.

use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const TIMEOUT_RANGE: std::ops::RangeInclusive<u64> = 1..=300;

// ─────────────────────────────────────────────────────────────────────────────
// Metrics exporter
// ─────────────────────────────────────────────────────────────────────────────

/// Root settings of the metrics exporter
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExporterSettings {
    #[serde(default)]
    pub server: ExporterServerConfig,
    pub exporter: ExporterConfig,
    #[serde(default)]
    pub vault: VaultConfig,
    #[serde(default)]
    pub self_monitoring: SelfMonitoringConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Listener of the metrics exporter
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExporterServerConfig {
    #[serde(default = "default_exporter_listen_address")]
    pub listen_address: SocketAddr,
    #[serde(default = "default_exporter_shutdown_timeout")]
    pub shutdown_timeout_seconds: u64,
}

impl Default for ExporterServerConfig {
    fn default() -> Self {
        Self {
            listen_address: default_exporter_listen_address(),
            shutdown_timeout_seconds: default_exporter_shutdown_timeout(),
        }
    }
}

fn default_exporter_listen_address() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9141))
}

fn default_exporter_shutdown_timeout() -> u64 {
    30
}

/// Configuration documents served by the exporter
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExporterConfig {
    /// Value of the `customer` constant label on every exported metric
    #[serde(default = "default_customer_label")]
    pub customer_label: String,
    /// One configuration document per pipeline
    pub config_files: Vec<PathBuf>,
    /// Namespace whose document hash is served at `/confighash`
    #[serde(default = "default_config_hash_namespace")]
    pub config_hash_namespace: String,
}

fn default_customer_label() -> String {
    "UNKNOWN_CUSTOMER".to_string()
}

fn default_config_hash_namespace() -> String {
    "orch_edgenode".to_string()
}

/// Secret-store instances probed by the synthetic health collector
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct VaultConfig {
    #[serde(default)]
    pub uris: Vec<String>,
}

/// Periodic scrape of the local telemetry collector agent
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SelfMonitoringConfig {
    #[serde(default = "default_self_monitoring_enabled")]
    pub enabled: bool,
    #[serde(default = "default_self_monitoring_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_self_monitoring_interval")]
    pub interval_seconds: u64,
}

impl Default for SelfMonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: default_self_monitoring_enabled(),
            endpoint: default_self_monitoring_endpoint(),
            interval_seconds: default_self_monitoring_interval(),
        }
    }
}

impl SelfMonitoringConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }
}

fn default_self_monitoring_enabled() -> bool {
    true
}

fn default_self_monitoring_endpoint() -> String {
    "http://127.0.0.1:8888/metrics".to_string()
}

fn default_self_monitoring_interval() -> u64 {
    300
}

// ─────────────────────────────────────────────────────────────────────────────
// Config reloader
// ─────────────────────────────────────────────────────────────────────────────

/// Root settings of the config reloader
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReloaderSettings {
    #[serde(default)]
    pub server: ReloaderServerConfig,
    pub store: StoreConfig,
    #[serde(default)]
    pub exporter: ExporterEndpointsConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Listener of the control API
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReloaderServerConfig {
    #[serde(default = "default_reloader_listen_address")]
    pub listen_address: SocketAddr,
    /// Deadline of one tenant request, lock wait included
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    #[serde(default = "default_reloader_shutdown_timeout")]
    pub shutdown_timeout_seconds: u64,
}

impl Default for ReloaderServerConfig {
    fn default() -> Self {
        Self {
            listen_address: default_reloader_listen_address(),
            request_timeout_seconds: default_request_timeout(),
            shutdown_timeout_seconds: default_reloader_shutdown_timeout(),
        }
    }
}

fn default_reloader_listen_address() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 50051))
}

fn default_request_timeout() -> u64 {
    30
}

fn default_reloader_shutdown_timeout() -> u64 {
    5
}

/// Location of the shared document and the exporter identity record
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    pub document_path: PathBuf,
    pub identity_path: PathBuf,
}

/// Control endpoints of the metrics exporter
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExporterEndpointsConfig {
    #[serde(default = "default_reload_endpoint")]
    pub reload_endpoint: String,
    #[serde(default = "default_config_hash_endpoint")]
    pub config_hash_endpoint: String,
}

impl Default for ExporterEndpointsConfig {
    fn default() -> Self {
        Self {
            reload_endpoint: default_reload_endpoint(),
            config_hash_endpoint: default_config_hash_endpoint(),
        }
    }
}

fn default_reload_endpoint() -> String {
    "http://localhost:9141/reload".to_string()
}

fn default_config_hash_endpoint() -> String {
    "http://localhost:9141/confighash".to_string()
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared
// ─────────────────────────────────────────────────────────────────────────────

/// Observability configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Settings types that share the read, parse, validate loading sequence
pub trait Settings: Sized + serde::de::DeserializeOwned {
    /// Check invariants that serde cannot express
    fn validate(&self) -> AppResult<()>;

    /// Load settings from a TOML file
    fn from_file<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path_display = path.as_ref().display().to_string();

        // Phase 1: Read file (preserves io::Error context)
        let content =
            std::fs::read_to_string(path.as_ref()).map_err(|source| AppError::ConfigFileRead {
                path: path_display.clone(),
                source,
            })?;

        // Phase 2: Parse TOML (preserves toml::de::Error context)
        let settings: Self =
            toml::from_str(&content).map_err(|source| AppError::ConfigParseFailed {
                path: path_display.clone(),
                source,
            })?;

        // Phase 3: Validate parsed settings (provides contextual reason)
        settings
            .validate()
            .map_err(|e| AppError::ConfigValidationFailed {
                path: path_display,
                reason: e.to_string(),
            })?;

        Ok(settings)
    }

    /// Parse and validate settings held in a string
    fn from_toml(toml_str: &str) -> AppResult<Self> {
        let settings: Self =
            toml::from_str(toml_str).map_err(|source| AppError::ConfigParseFailed {
                path: "<string>".to_string(),
                source,
            })?;

        settings.validate()?;
        Ok(settings)
    }
}

fn check_timeout(name: &str, value: u64) -> AppResult<()> {
    if TIMEOUT_RANGE.contains(&value) {
        Ok(())
    } else {
        Err(AppError::Config(format!(
            "{name} must be between {} and {} seconds, got {value}",
            TIMEOUT_RANGE.start(),
            TIMEOUT_RANGE.end()
        )))
    }
}

fn check_http_url(name: &str, value: &str) -> AppResult<()> {
    if value.starts_with("http://") || value.starts_with("https://") {
        Ok(())
    } else {
        Err(AppError::Config(format!(
            "{name} '{value}' must start with http:// or https://"
        )))
    }
}

impl Settings for ExporterSettings {
    fn validate(&self) -> AppResult<()> {
        check_timeout(
            "server.shutdown_timeout_seconds",
            self.server.shutdown_timeout_seconds,
        )?;

        if self.exporter.config_files.is_empty() {
            return Err(AppError::Config(
                "exporter.config_files must list at least one configuration document".to_string(),
            ));
        }
        if self.exporter.customer_label.trim().is_empty() {
            return Err(AppError::Config(
                "exporter.customer_label must not be empty".to_string(),
            ));
        }

        for uri in &self.vault.uris {
            check_http_url("vault.uris entry", uri)?;
        }

        if self.self_monitoring.enabled {
            check_http_url("self_monitoring.endpoint", &self.self_monitoring.endpoint)?;
            if self.self_monitoring.interval_seconds == 0 {
                return Err(AppError::Config(
                    "self_monitoring.interval_seconds must be greater than 0".to_string(),
                ));
            }
        }

        Ok(())
    }
}

impl ExporterSettings {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_timeout_seconds)
    }
}

impl FromStr for ExporterSettings {
    type Err = AppError;

    fn from_str(toml_str: &str) -> Result<Self, Self::Err> {
        Self::from_toml(toml_str)
    }
}

impl Settings for ReloaderSettings {
    fn validate(&self) -> AppResult<()> {
        check_timeout(
            "server.request_timeout_seconds",
            self.server.request_timeout_seconds,
        )?;
        check_timeout(
            "server.shutdown_timeout_seconds",
            self.server.shutdown_timeout_seconds,
        )?;

        if self.store.document_path.as_os_str().is_empty() {
            return Err(AppError::Config(
                "store.document_path must not be empty".to_string(),
            ));
        }
        if self.store.identity_path.as_os_str().is_empty() {
            return Err(AppError::Config(
                "store.identity_path must not be empty".to_string(),
            ));
        }

        check_http_url("exporter.reload_endpoint", &self.exporter.reload_endpoint)?;
        check_http_url(
            "exporter.config_hash_endpoint",
            &self.exporter.config_hash_endpoint,
        )?;

        Ok(())
    }
}

impl ReloaderSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_seconds)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_timeout_seconds)
    }
}

impl FromStr for ReloaderSettings {
    type Err = AppError;

    fn from_str(toml_str: &str) -> Result<Self, Self::Err> {
        Self::from_toml(toml_str)
    }
}
