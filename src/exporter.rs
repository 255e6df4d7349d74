//! Data-plane lifecycle of the metrics exporter
//!
//! `Starting → Serving ⇄ Reloading → Draining → Stopped`. The listener is
//! started once; a reload only replaces the router and the pipelines behind it.

use crate::collector::{CollectorError, NamedCollector, VaultCollector, build_collectors};
use crate::config::ExporterSettings;
use crate::document::{self, ConfigHash, DocumentError};
use crate::pipeline::{ControlSignal, Pipeline, PipelineError, PipelineManager};
use crate::scraping::{OTEL_CONDITIONS, ScrapeError, ScrapeMonitor};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

pub const RELOAD_PATH: &str = "/reload";
pub const CONFIG_HASH_PATH: &str = "/confighash";
pub const VAULT_PIPELINE: &str = "vault";

/// Errors that stop the exporter
#[derive(Debug, Error)]
pub enum ExporterError {
    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error(transparent)]
    Collector(#[from] CollectorError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Scrape(#[from] ScrapeError),

    #[error("Failed to install signal handler: {0}")]
    Signal(#[source] std::io::Error),

    #[error("Pipelines could not be cleaned up; restart required")]
    RestartRequired,
}

/// Metrics exporter process state
pub struct Exporter {
    settings: ExporterSettings,
    manager: PipelineManager,
    signals: mpsc::UnboundedSender<ControlSignal>,
}

impl Exporter {
    /// Create the exporter and the receiver of its control signals
    pub fn new(settings: ExporterSettings) -> (Self, mpsc::UnboundedReceiver<ControlSignal>) {
        let (signals, receiver) = mpsc::unbounded_channel();
        let manager = PipelineManager::new(settings.server.listen_address);
        (
            Self {
                settings,
                manager,
                signals,
            },
            receiver,
        )
    }

    pub fn manager(&self) -> &PipelineManager {
        &self.manager
    }

    /// Sender for lifecycle signals, used by OS signal forwarding
    pub fn signals(&self) -> mpsc::UnboundedSender<ControlSignal> {
        self.signals.clone()
    }

    /// Load every document, build its pipeline and register all endpoints
    ///
    /// Expects an empty manager: call after construction or after a clean-up.
    /// Endpoints become reachable together, once every document has loaded.
    pub fn initialize(&self) -> Result<(), ExporterError> {
        let customer = &self.settings.exporter.customer_label;
        let mut hashes: HashMap<String, ConfigHash> = HashMap::new();
        let mut pipelines = Vec::new();

        for path in &self.settings.exporter.config_files {
            let (document, hash) = document::load(path)?;
            let collectors = build_collectors(&document, customer)?;

            let pipeline = Arc::new(Pipeline::new(document.namespace.clone()));
            pipeline.add_collectors(
                collectors
                    .into_iter()
                    .map(|c| Arc::new(c) as Arc<dyn NamedCollector>)
                    .collect(),
            )?;

            hashes.insert(document.namespace.clone(), hash);
            pipelines.push(pipeline);
        }

        let vault = VaultCollector::new(self.settings.vault.uris.clone(), customer)?;
        let vault_pipeline = Arc::new(Pipeline::new(VAULT_PIPELINE));
        vault_pipeline.add_collectors(vec![Arc::new(vault) as Arc<dyn NamedCollector>])?;
        pipelines.push(vault_pipeline);

        let namespace = &self.settings.exporter.config_hash_namespace;
        let hash = hashes.remove(namespace).unwrap_or_else(|| {
            tracing::warn!(
                namespace = %namespace,
                "No configuration document for the hash namespace, serving an empty hash"
            );
            ConfigHash::default()
        });

        let mut routes = self.manager.batch();
        for pipeline in pipelines {
            let path = format!("/{}/metrics", pipeline.namespace());
            routes.register_pipeline(&path, pipeline)?;
        }
        routes.register_health_check()?;
        routes.register_config_hash(CONFIG_HASH_PATH, hash)?;
        routes.register_reload(RELOAD_PATH, self.signals())?;
        routes.publish()?;

        tracing::info!(
            pipelines = self.manager.pipelines().len(),
            "Pipeline manager initialized"
        );
        Ok(())
    }

    /// Serve until a terminate or restart signal arrives
    ///
    /// The loop re-initializes on every [`ControlSignal::Reload`]. The HTTP
    /// reload endpoint has already cleaned up when it sends that signal; for
    /// signals from other sources the loop cleans up first. An empty manager
    /// is recognised by its pipeline list.
    pub async fn serve(
        &self,
        mut receiver: mpsc::UnboundedReceiver<ControlSignal>,
    ) -> Result<(), ExporterError> {
        self.initialize()?;
        self.manager.start().await?;

        let outcome = loop {
            match receiver.recv().await {
                Some(ControlSignal::Reload) => {
                    tracing::info!("Reloading configuration");
                    if !self.manager.pipelines().is_empty()
                        && let Err(e) = self.manager.clean_up().await
                    {
                        tracing::error!(error = %e, "Failed to clean up pipelines");
                        break Err(ExporterError::RestartRequired);
                    }
                    if let Err(e) = self.initialize() {
                        tracing::error!(error = %e, "Failed to reinitialize pipelines");
                        break Err(e);
                    }
                }
                Some(ControlSignal::Restart) => break Err(ExporterError::RestartRequired),
                Some(ControlSignal::Terminate) | None => break Ok(()),
            }
        };

        self.drain().await;
        outcome
    }

    /// Graceful shutdown bounded by the configured timeout, then a hard close
    pub async fn drain(&self) {
        tracing::info!("Server shutting down");
        match self.manager.shutdown(self.settings.shutdown_timeout()).await {
            Ok(()) => tracing::info!("Server shut down properly"),
            Err(e) => {
                tracing::warn!(error = %e, "Graceful server shutdown failed, closing");
                self.manager.close();
            }
        }
    }
}

/// Forward SIGHUP as reload and SIGINT/SIGTERM as terminate
#[cfg(unix)]
pub fn forward_os_signals(
    signals: mpsc::UnboundedSender<ControlSignal>,
) -> Result<tokio::task::JoinHandle<()>, ExporterError> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = signal(SignalKind::hangup()).map_err(ExporterError::Signal)?;
    let mut interrupt = signal(SignalKind::interrupt()).map_err(ExporterError::Signal)?;
    let mut terminate = signal(SignalKind::terminate()).map_err(ExporterError::Signal)?;

    Ok(tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = hangup.recv() => ControlSignal::Reload,
                _ = interrupt.recv() => ControlSignal::Terminate,
                _ = terminate.recv() => ControlSignal::Terminate,
            };
            tracing::info!(signal = ?event, "Received OS signal");
            if signals.send(event).is_err() {
                break;
            }
        }
    }))
}

/// Forward Ctrl-C as terminate
#[cfg(not(unix))]
pub fn forward_os_signals(
    signals: mpsc::UnboundedSender<ControlSignal>,
) -> Result<tokio::task::JoinHandle<()>, ExporterError> {
    Ok(tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = signals.send(ControlSignal::Terminate);
        }
    }))
}

/// Run the exporter until it is told to stop
pub async fn run(settings: ExporterSettings) -> Result<(), ExporterError> {
    tracing::info!(
        listen_address = %settings.server.listen_address,
        customer = %settings.exporter.customer_label,
        config_files = ?settings.exporter.config_files,
        vault_uris = ?settings.vault.uris,
        "Starting metrics exporter"
    );

    let monitor = if settings.self_monitoring.enabled {
        let monitor = ScrapeMonitor::new(settings.self_monitoring.endpoint.clone(), &OTEL_CONDITIONS)?;
        Some(monitor.spawn(settings.self_monitoring.interval()))
    } else {
        None
    };

    let (exporter, receiver) = Exporter::new(settings);
    let forwarder = forward_os_signals(exporter.signals())?;

    let result = exporter.serve(receiver).await;

    forwarder.abort();
    if let Some(monitor) = monitor {
        monitor.abort();
    }
    result
}
