//! Config reloader
//!
//! Serves the tenant control API. Each request mutates the shared configuration
//! document and verifies that the metrics exporter serves the result.

use clap::Parser;
use sre_exporter::cli::{Command, ReloaderCli, reloader_config_template, write_template};
use sre_exporter::config::{ReloaderSettings, Settings};
use sre_exporter::handlers::{self, ReloaderState};
use sre_exporter::reconciler::{ExporterClient, FileStore, Reconciler};
use sre_exporter::telemetry;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = ReloaderCli::parse();

    if let Some(Command::Config { output }) = cli.command {
        write_template(reloader_config_template(), output.as_deref())?;
        return Ok(());
    }

    let settings = ReloaderSettings::from_file(&cli.config)?;
    telemetry::init(&settings.observability.log_level);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        listen_address = %settings.server.listen_address,
        document = %settings.store.document_path.display(),
        identity = %settings.store.identity_path.display(),
        reload_endpoint = %settings.exporter.reload_endpoint,
        config_hash_endpoint = %settings.exporter.config_hash_endpoint,
        "Config reloader starting"
    );

    let store = Arc::new(FileStore::new(
        settings.store.document_path.clone(),
        settings.store.identity_path.clone(),
    ));
    let exporter = ExporterClient::new(
        settings.exporter.config_hash_endpoint.clone(),
        settings.exporter.reload_endpoint.clone(),
    )?;
    let reconciler = Reconciler::new(store, exporter, settings.request_timeout());
    let app = handlers::router(ReloaderState::new(reconciler));

    let listener = tokio::net::TcpListener::bind(settings.server.listen_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Control API listening");

    let (stopped_tx, stopped_rx) = tokio::sync::oneshot::channel::<()>();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown_signal().await;
                let _ = stopped_tx.send(());
            })
            .await
    });

    tokio::select! {
        result = &mut server => {
            result??;
            return Ok(());
        }
        _ = stopped_rx => {
            tracing::info!("Got termination signal, attempting graceful shutdown");
        }
    }

    let timeout = settings.shutdown_timeout();
    match tokio::time::timeout(timeout, &mut server).await {
        Ok(result) => result??,
        Err(_) => {
            tracing::warn!(
                timeout_seconds = timeout.as_secs(),
                "Graceful shutdown did not complete in time, stopping"
            );
            server.abort();
        }
    }

    tracing::info!("Shutdown completed");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
